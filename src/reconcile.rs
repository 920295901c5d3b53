//! The reconciliation loop.
//!
//! Each iteration polls the runtime for running container ids and compares
//! them with the last published [`Inventory`]. When membership changed, only
//! the new containers are inspected; the others reuse their cached records.
//! The new inventory is then published in two phases:
//!
//! 1. the hosts file is rewritten,
//! 2. dnsmasq is reloaded, but only when some container disappeared, since
//!    that is the only case where it could keep serving a stale answer.
//!
//! Nothing is published unless every new container resolved.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};
use crate::hosts::HostsWriter;
use crate::inventory::Inventory;
use crate::runtime::ContainerRuntime;
use crate::shutdown::pause;
use crate::supervisor::ReloadResolver;
use crate::types::ContainerRecord;

/// What one iteration did, and therefore how long to wait before the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Unchanged,
    Published {
        added: usize,
        removed: usize,
        reloaded: bool,
    },
    /// A new container failed to resolve; nothing was published.
    Aborted { runtime_down: bool },
    /// Listing containers failed.
    RuntimeDown,
}

impl PassOutcome {
    fn needs_backoff(&self) -> bool {
        matches!(
            self,
            PassOutcome::RuntimeDown | PassOutcome::Aborted { runtime_down: true }
        )
    }
}

pub struct Reconciler<R, L> {
    runtime: R,
    resolver: L,
    writer: HostsWriter,
    inventory: Inventory,
    /// Last known runtime reachability. Starts optimistic so that a runtime
    /// that is down at startup still gets an empty file published.
    runtime_up: bool,
    poll_interval: Duration,
    backoff: Duration,
}

impl<R, L> Reconciler<R, L>
where
    R: ContainerRuntime,
    L: ReloadResolver,
{
    pub fn new(
        runtime: R,
        resolver: L,
        writer: HostsWriter,
        poll_interval: Duration,
        backoff: Duration,
    ) -> Self {
        Self {
            runtime,
            resolver,
            writer,
            inventory: Inventory::default(),
            runtime_up: true,
            poll_interval,
            backoff,
        }
    }

    #[cfg(test)]
    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Runs until `cancel` fires. Only a failed publish ends it early.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Watching containers, publishing to {}",
            self.writer.path().display()
        );
        self.writer.publish(&self.inventory).await?;

        loop {
            let outcome = self.reconcile_once().await?;
            if let PassOutcome::Published {
                added,
                removed,
                reloaded,
            } = &outcome
            {
                info!(
                    "Published {} containers ({} new, {} gone{})",
                    self.inventory.len(),
                    added,
                    removed,
                    if *reloaded { ", dnsmasq reloaded" } else { "" }
                );
            }
            let wait = if outcome.needs_backoff() {
                self.backoff
            } else {
                self.poll_interval
            };
            if pause(&cancel, wait).await {
                break;
            }
        }

        info!("Container watcher stopped.");
        Ok(())
    }

    /// One iteration, without the trailing wait.
    pub async fn reconcile_once(&mut self) -> Result<PassOutcome> {
        let mut live = match self.runtime.running_container_ids().await {
            Ok(ids) => ids,
            Err(e) => return self.runtime_lost(e).await,
        };
        if !self.runtime_up {
            info!("Container runtime is reachable again.");
            self.runtime_up = true;
        }
        live.sort();
        live.dedup();

        let diff = self.inventory.diff(&live);
        if diff.is_unchanged() {
            return Ok(PassOutcome::Unchanged);
        }
        debug!("Running containers: {}", live.join(" "));

        let mut resolved = Vec::with_capacity(diff.new_ids.len());
        for id in &diff.new_ids {
            match self.runtime.inspect(id).await {
                Ok(identity) => resolved.push(ContainerRecord::new(id.as_str(), identity)),
                Err(e) => {
                    warn!("Could not resolve container {}: {}. Will retry.", id, e);
                    return Ok(PassOutcome::Aborted {
                        runtime_down: e.is_unreachable(),
                    });
                }
            }
        }

        let next = self.inventory.rebuild(&diff, resolved);
        self.writer.publish(&next).await?;
        let reloaded = !diff.missing_ids.is_empty();
        if reloaded {
            debug!("Containers gone: {}", diff.missing_ids.join(" "));
            self.resolver.reload();
        }
        self.inventory = next;

        Ok(PassOutcome::Published {
            added: diff.new_ids.len(),
            removed: diff.missing_ids.len(),
            reloaded,
        })
    }

    /// While the runtime is down, no container is considered running: the
    /// first failure withdraws every record so stale answers stop.
    async fn runtime_lost(&mut self, err: RuntimeError) -> Result<PassOutcome> {
        if self.runtime_up {
            error!("Container runtime unavailable: {}", err);
            if !self.inventory.is_empty() {
                warn!("Withdrawing {} records.", self.inventory.len());
            }
            self.runtime_up = false;
            let empty = Inventory::default();
            self.writer.publish(&empty).await?;
            self.resolver.reload();
            self.inventory = empty;
        } else {
            debug!("Container runtime still unavailable: {}", err);
        }
        Ok(PassOutcome::RuntimeDown)
    }
}
