//! Binary entrypoint for the procrastinapp command line

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    procrastinapp_core::init_tracing();
    procrastinapp_core::cli::run().await
}
