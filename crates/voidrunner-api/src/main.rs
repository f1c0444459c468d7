use voidrunner_api::{setup, telemetry};
use voidrunner_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    telemetry::init_telemetry();

    let config = Config::from_env()?;
    let (state, background) = setup::initialize_app(config.clone()).await?;

    // Serve until SIGINT/SIGTERM, then drain the pipeline.
    let result = setup::server::start_server(&config, setup::routes::router(state)).await;
    background.shutdown().await;
    result
}
