use tracing::info;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "paygate_backend=info".into()),
        )
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    info!("starting paygate-backend");
    paygate_backend::serve().await;
}
