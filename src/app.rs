use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::reconciler::Reconciler;
use crate::resolver::DriverRatioResolver;
use crate::server::{AppState, WebhookServer};
use crate::store::{KeyValueStore, RedisStore};

/// The application object for when the balancer is running as a server.
pub struct App {
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the admission HTTP server.
    server: JoinHandle<Result<()>>,
    /// The join handle of the reconciler, when enabled.
    reconciler: Option<JoinHandle<Result<()>>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client & the shared state store.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;
        let store: Arc<dyn KeyValueStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);

        // Spawn the admission server.
        let resolver = Arc::new(DriverRatioResolver::new(client.clone(), config.clone(), store.clone()));
        let state = Arc::new(AppState { config: config.clone(), store: store.clone(), resolver });
        let metrics_handle = crate::get_metrics_recorder().handle();
        let server = WebhookServer::new(state, shutdown_tx.subscribe(), metrics_handle).spawn();

        // Spawn the reconciler, when enabled.
        let reconciler = if config.reconcile_enabled {
            Some(Reconciler::new(client, config, store, shutdown_tx.subscribe()).spawn())
        } else {
            tracing::info!("reconciler disabled by config");
            None
        };

        Ok(Self {
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            server,
            reconciler,
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
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("spot balancer is shutting down");
        if let Err(err) = self.server.await.context("error joining webhook server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down webhook server");
        }
        if let Some(reconciler) = self.reconciler {
            if let Err(err) = reconciler.await.context("error joining reconciler handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down reconciler");
            }
        }

        tracing::debug!("spot balancer shutdown complete");
        Ok(())
    }
}
