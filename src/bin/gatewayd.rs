//! machmos-gatewayd — process entry point.
//!
//! Resolves standard config/cache paths, checks the single-instance guard,
//! wires every component through [`Supervisor`], and runs until `STOP` or
//! SIGINT. Fatal startup errors (BLE enable failure, socket bind failure)
//! are logged and exit the process with a nonzero status, per SPEC_FULL §6.

use machmos_gateway::supervisor::{self, Paths, Supervisor};

#[tokio::main]
async fn main() {
    let (events_tx, _events_rx) = machmos_gateway::events::channel();
    supervisor::install_logger(events_tx.clone());

    if let Err(e) = run(events_tx).await {
        log::error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(events_tx: tokio::sync::broadcast::Sender<machmos_gateway::events::GatewayEvent>) -> anyhow::Result<()> {
    let paths = Paths::standard()?;
    let supervisor = Supervisor::bootstrap(paths, true, events_tx).await?;

    if supervisor.another_instance_is_running().await {
        log::info!("another machmos-gatewayd instance is already running; exiting");
        return Ok(());
    }

    supervisor.run().await
}
