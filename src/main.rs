use appset_controller::{
    config::ControllerConfig, controller::run_controller, init_tracing,
};
use envconfig::Envconfig;
use kube::Client;
use tracing::info;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = ControllerConfig::init_from_env()?;
    info!(?cfg, "Starting applicationset controller");

    let client = Client::try_default().await?;
    run_controller(client, cfg).await
}
