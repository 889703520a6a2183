use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use chrono::Utc;
use ckd_sentinel::clinical::ClinicalApi;
use ckd_sentinel::config::AppConfig;
use ckd_sentinel::error::AppError;
use ckd_sentinel::telemetry;
use tracing::info;

use crate::cli::ServeArgs;
use crate::infra::{build_engine, seed_demo_population, AppState, InMemoryClinicalDirectory};
use crate::routes::with_clinical_routes;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let directory = Arc::new(InMemoryClinicalDirectory::default());
    if args.seed_demo_data {
        seed_demo_population(&directory, Utc::now());
    }
    let (snapshots, versioning) = build_engine(directory);
    let api = Arc::new(ClinicalApi {
        snapshots,
        versioning,
        preview_scan_cap: config.engine.preview_scan_cap,
    });

    let app = with_clinical_routes(api)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "clinical rule engine ready");

    axum::serve(listener, app).await?;
    Ok(())
}
