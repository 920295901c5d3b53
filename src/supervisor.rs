//! dnsmasq process supervision.
//!
//! The [`Supervisor`] owns the child process and is driven from the main
//! task. The reconciliation loop only ever holds a [`ResolverHandle`], which
//! can ask a running resolver to reload and nothing else.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;

use crate::config::Config;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    NotStarted,
    Running(Pid),
    Stopping,
    Stopped,
}

/// Asks the resolver to drop its cache and re-read the hosts directory.
pub trait ReloadResolver: Send + Sync {
    /// Fire and forget: delivery is attempted only while the resolver is
    /// running, and its effect is never confirmed.
    fn reload(&self);
}

/// Serializes reload signals with the supervisor leaving `Running`. The
/// child is only reaped after that transition, so a signalled pid is always
/// ours (alive or a zombie), never a reused one.
type SignalGate = Arc<Mutex<()>>;

fn enter(gate: &SignalGate) -> MutexGuard<'_, ()> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Supervisor {
    executable: String,
    parameters: Vec<String>,
    hosts_folder: PathBuf,
    child: Option<Child>,
    state: watch::Sender<ResolverState>,
    gate: SignalGate,
}

impl Supervisor {
    pub fn new(config: &Config) -> Self {
        let (state, _) = watch::channel(ResolverState::NotStarted);
        Self {
            executable: config.dnsmasq_executable.clone(),
            parameters: config.dnsmasq_parameters.clone(),
            hosts_folder: config.hosts_folder.clone(),
            child: None,
            state,
            gate: SignalGate::default(),
        }
    }

    pub fn state(&self) -> ResolverState {
        *self.state.borrow()
    }

    pub fn handle(&self) -> ResolverHandle {
        ResolverHandle {
            state: self.state.subscribe(),
            gate: self.gate.clone(),
        }
    }

    /// Fixed flags followed by `--hostsdir=<folder>`.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.parameters.clone();
        args.push(format!("--hostsdir={}", self.hosts_folder.display()));
        args
    }

    pub fn start(&mut self) -> Result<()> {
        if self.state() != ResolverState::NotStarted {
            return Ok(());
        }
        let args = self.args();
        info!("Starting {} {}", self.executable, args.join(" "));

        let mut child = Command::new(&self.executable)
            .args(&args)
            .stdout(Stdio::piped())
            // Own process group: a terminal Ctrl+C reaches us, not dnsmasq.
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::ResolverStart {
                executable: self.executable.clone(),
                source,
            })?;

        let pid = child.id().and_then(|id| i32::try_from(id).ok()).ok_or_else(|| {
            Error::Resolver(std::io::Error::other("resolver exited before reporting a pid"))
        })?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }

        self.child = Some(child);
        self.state.send_replace(ResolverState::Running(Pid::from_raw(pid)));
        Ok(())
    }

    /// Waits for the resolver to exit on its own. Cancel safe; never resolves
    /// when no process was started.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if self.child.is_none() {
            return std::future::pending().await;
        }
        if let ResolverState::Running(pid) = self.state() {
            exited(pid).await;
            self.leave_running();
        }
        let Some(child) = self.child.as_mut() else {
            return std::future::pending().await;
        };
        let status = child.wait().await.map_err(Error::Resolver)?;
        self.state.send_replace(ResolverState::Stopped);
        Ok(status)
    }

    /// Moves to `Stopping` while no reload can be mid-flight.
    fn leave_running(&self) {
        let _gate = enter(&self.gate);
        if matches!(self.state(), ResolverState::Running(_)) {
            self.state.send_replace(ResolverState::Stopping);
        }
    }

    /// Kills the resolver and blocks until it has exited. No-op when it is
    /// not running.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if self.state() == ResolverState::Stopped {
            return Ok(());
        }

        warn!("Stopping dnsmasq.");
        self.leave_running();
        if let Err(e) = child.start_kill() {
            debug!("kill after exit: {}", e);
        }
        let status = child.wait().await.map_err(Error::Resolver)?;
        self.state.send_replace(ResolverState::Stopped);
        warn!("Dnsmasq exited ({}).", status);
        Ok(())
    }
}

/// Cloneable reload capability handed to the reconciliation loop.
#[derive(Clone)]
pub struct ResolverHandle {
    state: watch::Receiver<ResolverState>,
    gate: SignalGate,
}

impl ResolverHandle {
    pub fn state(&self) -> ResolverState {
        *self.state.borrow()
    }

    /// Resolves once the supervisor reports `Stopped`.
    #[cfg(test)]
    pub async fn stopped(&mut self) {
        let _ = self
            .state
            .wait_for(|s| *s == ResolverState::Stopped)
            .await;
    }
}

impl ReloadResolver for ResolverHandle {
    fn reload(&self) {
        let _gate = enter(&self.gate);
        match self.state() {
            ResolverState::Running(pid) => {
                warn!("Reloading dnsmasq.");
                if let Err(e) = kill(pid, Signal::SIGHUP) {
                    warn!("Failed to signal dnsmasq ({}): {}", pid, e);
                }
            }
            other => debug!("Skipping reload, dnsmasq is {:?}", other),
        }
    }
}

/// Returns once `pid` has exited, leaving it unreaped: until
/// [`Child::wait`] collects it, the pid stays a zombie and cannot be reused.
async fn exited(pid: Pid) {
    let waited = tokio::task::spawn_blocking(move || loop {
        match waitid(Id::Pid(pid), WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    })
    .await;
    match waited {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!("waitid({}): {}", pid, e),
        Err(e) => debug!("waitid task for {} failed: {}", pid, e),
    }
}

async fn forward_output(stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "dnsmasq", "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn shell(folder: &Path, script: &str) -> Supervisor {
        let config = Config {
            hosts_folder: folder.to_path_buf(),
            dnsmasq_executable: "/bin/sh".into(),
            dnsmasq_parameters: vec!["-c".into(), script.into()],
            ..Config::default()
        };
        Supervisor::new(&config)
    }

    #[test]
    fn args_end_with_hostsdir() {
        let config = Config {
            hosts_folder: PathBuf::from("/run/docker-hosts"),
            ..Config::default()
        };
        let args = Supervisor::new(&config).args();
        assert_eq!(args.first().map(String::as_str), Some("--no-daemon"));
        assert_eq!(
            args.last().map(String::as_str),
            Some("--hostsdir=/run/docker-hosts")
        );
    }

    #[tokio::test]
    async fn missing_executable_fails_to_start() {
        let config = Config {
            dnsmasq_executable: "/nonexistent/dnsmasq".into(),
            ..Config::default()
        };
        let mut supervisor = Supervisor::new(&config);
        let err = supervisor.start().unwrap_err();
        assert!(matches!(err, Error::ResolverStart { .. }));
        assert_eq!(supervisor.state(), ResolverState::NotStarted);
    }

    #[tokio::test]
    async fn start_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = shell(dir.path(), "sleep 30");
        let handle = supervisor.handle();

        supervisor.start().unwrap();
        assert!(matches!(handle.state(), ResolverState::Running(_)));

        tokio::time::timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(handle.state(), ResolverState::Stopped);

        // Reload after stop must not signal anything.
        handle.reload();
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn reload_delivers_sighup() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");
        let script = format!(
            "trap 'touch {}' HUP; while :; do sleep 0.05; done",
            marker.display()
        );
        let mut supervisor = shell(dir.path(), &script);
        supervisor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        supervisor.handle().reload();

        let mut seen = false;
        for _ in 0..40 {
            if marker.exists() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        supervisor.stop().await.unwrap();
        assert!(seen, "resolver never saw the reload signal");
    }

    #[tokio::test]
    async fn wait_reports_own_exit() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = shell(dir.path(), "exit 3");
        supervisor.start().unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), supervisor.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.code(), Some(3));
        assert_eq!(supervisor.state(), ResolverState::Stopped);
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exit_is_observed_before_reaping() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = shell(dir.path(), "exit 0");
        supervisor.start().unwrap();
        let ResolverState::Running(pid) = supervisor.state() else {
            panic!("resolver did not start");
        };

        tokio::time::timeout(Duration::from_secs(5), exited(pid))
            .await
            .unwrap();
        // Still a zombie: the pid cannot have been handed to anyone else.
        assert!(kill(pid, None).is_ok());

        supervisor.leave_running();
        assert_eq!(supervisor.state(), ResolverState::Stopping);
        let status = supervisor.wait().await.unwrap();
        assert!(status.success());
        assert_eq!(supervisor.state(), ResolverState::Stopped);
    }

    #[tokio::test]
    async fn reload_is_skipped_once_exit_was_seen() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = shell(dir.path(), "exit 0");
        let handle = supervisor.handle();
        supervisor.start().unwrap();
        let ResolverState::Running(pid) = supervisor.state() else {
            panic!("resolver did not start");
        };

        exited(pid).await;
        supervisor.leave_running();
        handle.reload();
        assert_eq!(handle.state(), ResolverState::Stopping);
        supervisor.wait().await.unwrap();
    }
}
