use market_dashboard_lib::market::types::StartChartStreamArgs;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = match StartChartStreamArgs::from_env() {
        Ok(args) => args,
        Err(error) => {
            error!(error = %error, "invalid dashboard configuration");
            std::process::exit(2);
        }
    };

    if let Err(error) = market_dashboard_lib::run(args).await {
        error!(error = %error, "dashboard stopped with an error");
        std::process::exit(1);
    }
}
