use tokio::sync::broadcast::error::RecvError;

use sockudo_failover::cli::Cli;
use sockudo_failover::logging::init_logging;
use sockudo_failover::{Coordinator, CoordinatorEvent};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::load_config().unwrap_or_else(|e| {
        eprintln!("Error loading config: {}", e);
        std::process::exit(1);
    });

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Warning: Failed to initialize logging: {}", e);
        // Fall back to env_logger
        env_logger::init();
    }

    let coordinator = Coordinator::start(
        config.master_name.clone(),
        config.sentinels.clone(),
        config.options.clone(),
    )
    .await?;
    let mut events = coordinator.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CoordinatorEvent::MasterAvailable(address)) => {
                    log::info!("+master-available {} {}", coordinator.master_name(), address);
                }
                Ok(CoordinatorEvent::MasterUnavailable) => {
                    log::warn!("-master-available {}", coordinator.master_name());
                }
                Ok(CoordinatorEvent::HealthyChange(healthy)) => {
                    log::info!(
                        "healthy-change {} {}",
                        coordinator.master_name(),
                        if healthy { "up" } else { "down" }
                    );
                }
                Err(RecvError::Lagged(n)) => log::warn!("Dropped {} coordinator events", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received shutdown signal");
                break;
            }
        }
    }

    coordinator.stop();
    Ok(())
}
