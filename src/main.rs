use chat_gateway::GatewayConfig;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("chat-gateway: {err}");
            std::process::exit(2);
        }
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if let Err(err) = chat_gateway::run(config).await {
        error!(error = %err, "gateway stopped");
        std::process::exit(1);
    }
}
