//! Termination handling.
//!
//! A single [`CancellationToken`] is the stop flag. Signal delivery only
//! cancels it; the actual teardown runs later from the main task through
//! [`ShutdownCoordinator::shutdown`]. A signal arriving once the flag is
//! already set exits the process on the spot.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use anyhow::anyhow;
use log::{error, info, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::supervisor::Supervisor;

/// Sleeps for `duration` unless `cancel` fires first. Returns `true` when
/// the caller should exit.
pub async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => cancel.is_cancelled(),
    }
}

/// Sets the stop flag on the first signal. Returns `true` when a signal
/// arrives while the flag is already set, `false` once `signals` closes.
pub async fn escalate(
    signals: &mut mpsc::Receiver<&'static str>,
    cancel: &CancellationToken,
) -> bool {
    while let Some(name) = signals.recv().await {
        if cancel.is_cancelled() {
            warn!("{} received while shutting down.", name);
            return true;
        }
        warn!("{} received.", name);
        cancel.cancel();
    }
    false
}

/// Why the main task stopped waiting.
#[derive(Debug)]
pub enum StopCause {
    Requested,
    ResolverExited(Result<ExitStatus>),
    WatcherEnded(Result<()>),
}

impl StopCause {
    /// Only a requested stop is a clean exit. A resolver or watcher ending
    /// after the stop flag was set is part of that same stop.
    pub fn into_result(self, stop_requested: bool) -> anyhow::Result<()> {
        match self {
            StopCause::Requested => Ok(()),
            StopCause::ResolverExited(Ok(_)) | StopCause::WatcherEnded(Ok(()))
                if stop_requested =>
            {
                Ok(())
            }
            StopCause::ResolverExited(Ok(status)) => {
                Err(anyhow!("dnsmasq exited unexpectedly ({})", status))
            }
            StopCause::WatcherEnded(Ok(())) => Err(anyhow!("container watcher stopped unexpectedly")),
            StopCause::ResolverExited(Err(e)) | StopCause::WatcherEnded(Err(e)) => Err(e.into()),
        }
    }
}

pub struct ShutdownCoordinator {
    cancel: CancellationToken,
    hosts_folder: PathBuf,
    reconciler: Option<JoinHandle<Result<()>>>,
    completed: bool,
}

impl ShutdownCoordinator {
    pub fn new(cancel: CancellationToken, hosts_folder: PathBuf) -> Self {
        Self {
            cancel,
            hosts_folder,
            reconciler: None,
            completed: false,
        }
    }

    /// Cancels the stop flag on SIGINT or SIGTERM; a further signal exits
    /// with status 1 without waiting for cleanup.
    pub fn watch_signals(&self) -> std::io::Result<JoinHandle<()>> {
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let (tx, mut rx) = mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = interrupt.recv() => "Interrupt",
                    Some(()) = terminate.recv() => "Stop signal",
                    else => break,
                };
                if tx.send(name).await.is_err() {
                    break;
                }
            }
        });

        let cancel = self.cancel.clone();
        Ok(tokio::spawn(async move {
            if escalate(&mut rx, &cancel).await {
                error!("Forced exit, hosts folder left in place.");
                std::process::exit(1);
            }
        }))
    }

    pub fn attach_reconciler(&mut self, handle: JoinHandle<Result<()>>) {
        self.reconciler = Some(handle);
    }

    /// Resolves when the reconciliation task ends on its own, which only
    /// happens on a fatal error or after the stop flag was set. Cancel safe;
    /// pending forever if no task is attached.
    pub async fn reconciler_finished(&mut self) -> Result<()> {
        let Some(handle) = self.reconciler.as_mut() else {
            return std::future::pending().await;
        };
        let joined = handle.await;
        self.reconciler = None;
        joined?
    }

    /// Stops everything, in order: stop flag, resolver (waiting for exit),
    /// reconciliation task, hosts folder. Every step tolerates its component
    /// never having started, and calling this again does nothing.
    ///
    /// Returns the reconciliation task's error, if it had one.
    pub async fn shutdown(&mut self, supervisor: &mut Supervisor) -> Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;
        info!("Shutting down.");
        self.cancel.cancel();

        let mut outcome = supervisor.stop().await;

        if let Some(handle) = self.reconciler.take() {
            let joined = handle.await.map_err(Error::from).and_then(|r| r);
            if let Err(e) = joined {
                error!("Container watcher failed: {}", e);
                outcome = outcome.and(Err(e));
            }
        }

        match tokio::fs::remove_dir_all(&self.hosts_folder).await {
            Ok(()) => info!("Removed {}", self.hosts_folder.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                outcome = outcome.and(Err(Error::Cleanup {
                    path: self.hosts_folder.clone(),
                    source,
                }));
            }
        }
        outcome
    }
}
