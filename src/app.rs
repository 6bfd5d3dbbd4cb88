use crate::config::Config;
use crate::offload::Offload;
use crate::overlay::OverlayRenderer;
use crate::pipeline::FramePipeline;
use crate::predictor::{FullFramePredictor, TreePredictor};
use crate::prompt::PromptStore;
use crate::registry::{SessionRegistry, SERVER_SHUTDOWN};
use crate::server::{HttpServer, SharedState};
use crate::session::SessionContext;
use crate::telemetry::Metrics;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{signal, sync::broadcast};

/// A bound, not yet running server together with the handles needed to stop it.
pub struct App {
    server: HttpServer,
    registry: Arc<SessionRegistry>,
    local_addr: SocketAddr,
    shutdown_grace: Duration,
}

impl App {
    pub async fn build(config: &Config, predictor: Arc<dyn TreePredictor>) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let overlay = OverlayRenderer::new(&config.overlay)?;
        let pipeline = FramePipeline::new(predictor, overlay, config.pipeline.image_quality);

        let session_context = SessionContext {
            prompts: PromptStore::new(),
            pipeline: Arc::new(pipeline),
            offload: Offload::new(config.pipeline.max_inflight_frames),
            metrics: Arc::clone(&metrics),
        };
        let registry = Arc::new(SessionRegistry::new());

        let state = SharedState {
            session_context,
            registry: Arc::clone(&registry),
            metrics,
            index_file: Arc::new(config.server.index_file.clone()),
        };

        let server = HttpServer::new(state, &config.server.get_address()).await?;
        let local_addr = server.local_addr()?;

        Ok(Self {
            server,
            registry,
            local_addr,
            shutdown_grace: config.server.get_shutdown_grace(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Serves until `shutdown` resolves, then closes every live session
    /// before stopping the listener.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let (shutdown_tx, _) = broadcast::channel(1);
        let server_handle = self.server.run(shutdown_tx.subscribe()).await?;

        shutdown.await;
        tracing::info!("Shutdown signal received, starting graceful shutdown.");

        let closed = self
            .registry
            .broadcast_shutdown(SERVER_SHUTDOWN, self.shutdown_grace)
            .await;
        tracing::info!("Closed {} sessions", closed);

        let _ = shutdown_tx.send(());
        server_handle.await??;

        Ok(())
    }
}

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let predictor: Arc<dyn TreePredictor> =
        Arc::new(FullFramePredictor::new(config.predictor.embedding_dim));

    let app = match App::build(&config, predictor).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("Failed to initialize server: {:?}", e);
            return Err(e);
        }
    };

    app.run_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
