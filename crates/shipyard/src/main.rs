#[tokio::main]
async fn main() -> shipyard::Result<()> {
    shipyard::telemetry::init_tracing();
    let mode = shipyard::parse_command()?;
    tracing::info!(version = shipyard::VERSION, mode = ?mode, "shipyard starting");
    shipyard::run(mode).await
}
