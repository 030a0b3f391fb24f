use std::sync::Arc;

use credit_risk::{
    init_logging, log_app_bind, log_app_start, log_model_loaded, logging_config_from_env,
    scoring_router, ModelRegistry, ModelSource, ServiceConfig, SharedModelSource,
    SqliteModelRegistry,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("risk_api_server", &logging_cfg);

    let cfg = ServiceConfig::from_env()?;
    let registry = SqliteModelRegistry::open(&cfg.registry_path)?;
    let model = registry.load(&cfg.model_name, cfg.model_version)?;
    log_model_loaded(&model.model_name, model.version, &model.fingerprint);

    let source: Arc<dyn ModelSource> = Arc::new(SharedModelSource::new(model));
    let app = scoring_router(source);
    let listener = tokio::net::TcpListener::bind(cfg.addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
