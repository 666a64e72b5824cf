use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use detonation_engine::config::Config;
use detonation_engine::handlers::{self, AppState};
use detonation_engine::observability::init_logging;
use detonation_engine::pipeline::DetonationPipeline;
use detonation_engine::queue::BatchDriver;
use detonation_engine::sandbox::{ControlPlane, VBoxManage};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_logging(&config.logging)?;
    config.validate()?;

    info!("Starting Detonation Engine");

    let control: Arc<dyn ControlPlane> = Arc::new(VBoxManage::new(&config.sandbox.vboxmanage_path));
    let pipeline = Arc::new(DetonationPipeline::new(&config, control.clone())?);

    info!(
        base_vm = %config.sandbox.base_vm_name,
        max_concurrent = config.sandbox.max_concurrent_sandboxes,
        results_dir = %pipeline.reports().root().display(),
        "Detonation pipeline ready"
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState {
        batch: BatchDriver::new(pipeline.clone(), config.sandbox.max_concurrent_sandboxes),
        reports: pipeline.reports().clone(),
        config: Arc::new(config),
        control,
    };
    let app = handlers::router(app_state);

    // Start the server
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Detonation Engine listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
