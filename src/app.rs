use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream, WatchStream};
use tokio_stream::{StreamExt, StreamMap};

use crate::config::Config;
use crate::error::ElectionError;
use crate::k8s::{ElectionState, KubeStore, LeaderElector};

/// The application object for the network operator.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// A stream of leader election state changes.
    election_state: WatchStream<ElectionState>,
    /// The join handle of the leader task.
    leader: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        let elect_config = config.election_config().context("invalid leader election config")?;
        let (elector, state_rx) = LeaderElector::new(KubeStore::new(client), elect_config);
        let leader = tokio::spawn(Self::lead(elector, config.lock_name.clone(), shutdown_tx.clone(), shutdown_tx.subscribe()));

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            election_state: WatchStream::new(state_rx),
            leader,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                Some(state) = self.election_state.next() => tracing::debug!(state = ?state, "leader election state changed"),
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("network operator is shutting down");
        let res = self.leader.await.context("error joining leader task").and_then(|res| res);
        if let Err(err) = &res {
            tracing::error!(error = ?err, "error from leader task");
        }

        tracing::debug!("network operator shutdown complete");
        res
    }

    /// Acquire the leader lock, then hold it until shutdown.
    ///
    /// The lock is released implicitly when this pod is deleted, so nothing is done on shutdown.
    async fn lead(
        elector: LeaderElector<KubeStore>, lock_name: String, shutdown_tx: broadcast::Sender<()>, mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        match elector.become_leader(&lock_name, &mut shutdown_rx).await {
            Ok(()) => (),
            Err(ElectionError::Cancelled) => {
                tracing::info!("shutdown requested before leadership was acquired");
                return Ok(());
            }
            Err(err) => {
                let _ = shutdown_tx.send(());
                return Err(err).context("error acquiring leader lock");
            }
        }

        tracing::info!(lock = %lock_name, "network operator is now the primary instance");
        let _ = shutdown_rx.recv().await;
        Ok(())
    }
}
