use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use pricefeed_config::MetricsConfig;

#[tracing::instrument(name = "metrics", skip_all)]
pub async fn serve(config: MetricsConfig) {
    let app = Router::new().route("/metrics", get(get_metrics));

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(address = %config.listen_addr, "Cannot bind metrics server: {e}");
            return;
        }
    };

    info!(address = %config.listen_addr, "Serving metrics");

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server failed: {e}");
    }
}

async fn get_metrics() -> String {
    let mut buf = String::new();
    if let Err(e) = pricefeed_metrics::export(&mut buf) {
        error!("Cannot encode metrics: {e}");
    }
    buf
}
