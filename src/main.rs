use log::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize the subscriber; `log` records are picked up through its
    // tracing-log bridge. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Run the application
    if let Err(e) = postbox::run().await {
        error!("Application error: {}", e);
        std::process::exit(1);
    }
}
