//! Brain MRI segmentation and tDCS simulation orchestration service.
//!
//! Accepts NIfTI uploads, fans them out across a bounded accelerator pool
//! for segmentation, and schedules ROAST/SimNIBS electrical-field
//! simulations against the resulting masks. Progress for every job streams
//! out as signed server-sent events.

mod orchestrator;
mod routes;
mod state;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use mri_core::{AppConfig, AuditSink, EventBus, InMemorySharedState, ModelRegistry, ResourceArbiter, SessionStore, SharedState, StructuredLogger};
use mri_pipeline::{FreeSurferResampler, PipelineRunner, RawVolumeStore, UnimplementedPredictor};
use mri_scheduler::{RoastRunner, SegmentationScheduler, SimNibsRunner, SimulationScheduler};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mri_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting MRI orchestration service");

    let config = Arc::new(AppConfig::from_env()?);
    std::fs::create_dir_all(&config.session_root)?;

    let shared: Arc<dyn SharedState> = Arc::new(InMemorySharedState::new());
    let logger = Arc::new(StructuredLogger::new(config.session_root.clone()));
    let audit = Arc::new(AuditSink::open(&config.audit_db_path)?);
    let events = Arc::new(EventBus::new(shared.clone(), config.hmac_secret.clone()));
    let arbiter = Arc::new(ResourceArbiter::new(shared.clone(), config.gpu_count));
    arbiter.init().await?;

    let registry = Arc::new(ModelRegistry::with_model_root(&config.model_root));
    let sessions = Arc::new(SessionStore::new(
        config.session_root.clone(),
        Arc::new(mri_core::SystemClock),
        logger.clone(),
    ));

    let volumes = Arc::new(RawVolumeStore);
    let resampler = Arc::new(FreeSurferResampler {
        mri_convert_path: config.mri_convert_path.clone(),
        mri_vol2vol_path: config.mri_vol2vol_path.clone(),
    });

    let runner = Arc::new(PipelineRunner::new(
        sessions.clone(),
        registry.clone(),
        events.clone(),
        shared.clone(),
        logger.clone(),
        volumes.clone(),
        resampler.clone(),
    ));

    let segmentation = Arc::new(SegmentationScheduler::new(
        shared.clone(),
        arbiter.clone(),
        events.clone(),
        logger.clone(),
        audit.clone(),
        runner,
        Arc::new(|| Box::new(UnimplementedPredictor) as Box<dyn mri_pipeline::Predictor>),
        config.gpu_count,
    ));

    let roast_runner = Arc::new(RoastRunner {
        sessions: sessions.clone(),
        events: events.clone(),
        logger: logger.clone(),
        build_dir: config.roast_build_dir.clone(),
        matlab_runtime_path: config.matlab_runtime_path.clone(),
        timeout: config.sim_timeout,
    });
    let roast = Arc::new(SimulationScheduler::new(
        shared.clone(),
        events.clone(),
        logger.clone(),
        audit.clone(),
        roast_runner,
        config.sim_max_workers,
    ));

    let simnibs_runner = Arc::new(SimNibsRunner {
        sessions: sessions.clone(),
        events: events.clone(),
        logger: logger.clone(),
        volumes: volumes.clone(),
        charm_bin: config.charm_bin.clone(),
        fem_solver_bin: config.simnibs_bin.clone(),
        timeout: config.sim_timeout,
    });
    let simnibs = Arc::new(SimulationScheduler::new(
        shared.clone(),
        events.clone(),
        logger.clone(),
        audit.clone(),
        simnibs_runner,
        config.sim_max_workers,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let seg_loop = segmentation.clone();
    let seg_rx = shutdown_rx.clone();
    tokio::spawn(async move { seg_loop.run(seg_rx).await });

    let roast_loop = roast.clone();
    let roast_rx = shutdown_rx.clone();
    tokio::spawn(async move { roast_loop.run(roast_rx).await });

    let simnibs_loop = simnibs.clone();
    let simnibs_rx = shutdown_rx.clone();
    tokio::spawn(async move { simnibs_loop.run(simnibs_rx).await });

    let retention_window = config.retention_window;
    let reap_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            match reap_sessions.reap(retention_window) {
                Ok(removed) if !removed.is_empty() => {
                    tracing::info!(count = removed.len(), "reaped expired sessions");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "session reap sweep failed"),
            }
        }
    });

    let state = AppState {
        config: config.clone(),
        sessions,
        registry,
        events,
        arbiter,
        shared,
        logger,
        audit,
        segmentation,
        roast,
        simnibs,
    };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/predict", post(routes::predict::predict))
        .route("/stream/:sid", get(routes::stream::stream_segmentation))
        .route("/stream/roast/:sid", get(routes::stream::stream_roast))
        .route("/stream/simnibs/:sid", get(routes::stream::stream_simnibs))
        .route("/results/:sid/input", get(routes::results::get_input))
        .route("/results/:sid/:model", get(routes::results::get_result))
        .route("/simulate", post(routes::simulate::simulate_roast))
        .route("/simulate/simnibs", post(routes::simulate::simulate_simnibs))
        .route("/simulate/results/:sid/:model/:kind", get(routes::results::get_simulation_result))
        .route("/health", get(routes::health::health))
        .route("/admin/logs/:sid", get(routes::admin::logs))
        .route("/admin/audit", get(routes::admin::audit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let port: u16 = std::env::var("SERVER_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8000);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve = axum::serve(listener, app);

    tokio::select! {
        result = serve => { result?; }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            shutdown_tx.send(true).ok();
        }
    }

    Ok(())
}
