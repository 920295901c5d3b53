//! dockhosts daemon entry point.
//!
//! Keeps a dnsmasq hosts directory in sync with the running Docker
//! containers and supervises the dnsmasq process serving it.

use log::{error, info};
use tokio_util::sync::CancellationToken;

mod config;
mod error;
mod hosts;
mod inventory;
mod reconcile;
mod runtime;
mod shutdown;
mod supervisor;
mod types;

use config::Config;
use hosts::HostsWriter;
use reconcile::Reconciler;
use runtime::DockerRuntime;
use shutdown::{ShutdownCoordinator, StopCause};
use supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting dockhosts with config: {:?}", cfg);

    std::fs::create_dir_all(&cfg.hosts_folder)?;

    let cancel = CancellationToken::new();
    let mut coordinator = ShutdownCoordinator::new(cancel.clone(), cfg.hosts_folder.clone());
    coordinator.watch_signals()?;
    let mut supervisor = Supervisor::new(&cfg);

    // Container Runtime (Docker)
    let runtime =
        match DockerRuntime::connect(&cfg.docker_socket, cfg.runtime_backoff(), &cancel).await {
            Ok(runtime) => runtime,
            Err(e) => {
                coordinator.shutdown(&mut supervisor).await?;
                return Err(anyhow::Error::new(error::Error::from(e))
                    .context("could not connect to Docker"));
            }
        };

    // Reconciliation loop
    let reconciler = Reconciler::new(
        runtime,
        supervisor.handle(),
        HostsWriter::new(&cfg.hosts_folder),
        cfg.poll_interval(),
        cfg.runtime_backoff(),
    );
    coordinator.attach_reconciler(tokio::spawn(reconciler.run(cancel.clone())));

    // dnsmasq
    if let Err(e) = supervisor.start() {
        error!("{}", e);
        coordinator.shutdown(&mut supervisor).await?;
        return Err(e.into());
    }

    let cause = tokio::select! {
        biased;
        _ = cancel.cancelled() => StopCause::Requested,
        finished = coordinator.reconciler_finished() => StopCause::WatcherEnded(finished),
        status = supervisor.wait() => StopCause::ResolverExited(status),
    };
    let outcome = cause.into_result(cancel.is_cancelled());
    if let Err(e) = &outcome {
        error!("{}", e);
    }

    coordinator.shutdown(&mut supervisor).await?;
    info!("Shutdown complete.");
    outcome
}
