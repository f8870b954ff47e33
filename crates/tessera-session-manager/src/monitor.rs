//! Process lifecycle monitoring: a SIGCHLD-driven table of watched
//! pids and the graceful terminate helper used when sessions die.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

#[derive(Debug, Clone, Copy)]
struct WatchedProcess {
    session_id: u32,
    terminate_session_on_exit: bool,
}

type SessionExitHandler = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Default)]
pub struct ProcessMonitor {
    watched: Mutex<HashMap<u32, WatchedProcess>>,
    on_session_exit: Mutex<Option<SessionExitHandler>>,
}

impl ProcessMonitor {
    #[must_use]
    pub fn new() -> ProcessMonitor {
        ProcessMonitor::default()
    }

    /// Called when a watched process exits and its policy says the
    /// session dies with it.
    pub fn set_session_exit_handler(&self, handler: impl Fn(u32) + Send + Sync + 'static) {
        *self.on_session_exit.lock().expect("monitor lock") = Some(Box::new(handler));
    }

    pub fn watch(&self, pid: u32, session_id: u32, terminate_session_on_exit: bool) {
        tracing::debug!(pid, session_id, "watching process");
        self.watched.lock().expect("monitor lock").insert(
            pid,
            WatchedProcess {
                session_id,
                terminate_session_on_exit,
            },
        );
    }

    pub fn unwatch(&self, pid: u32) {
        self.watched.lock().expect("monitor lock").remove(&pid);
    }

    /// Reap every exited child and run the recorded policies.
    pub fn reap(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, status)) => {
                    self.handle_exit(pid.as_raw() as u32, Some(status));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    tracing::debug!(pid = pid.as_raw(), ?signal, "child terminated by signal");
                    self.handle_exit(pid.as_raw() as u32, None);
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    fn handle_exit(&self, pid: u32, status: Option<i32>) {
        let entry = self.watched.lock().expect("monitor lock").remove(&pid);
        let Some(entry) = entry else {
            return;
        };
        tracing::info!(
            pid,
            session = entry.session_id,
            status = status.unwrap_or(-1),
            "watched process exited"
        );
        if entry.terminate_session_on_exit {
            if let Some(handler) = self.on_session_exit.lock().expect("monitor lock").as_ref() {
                handler(entry.session_id);
            }
        }
    }

    /// SIGTERM, then poll every 100 ms until `grace` elapses, then
    /// SIGKILL.
    pub fn terminate_child_process(&self, pid: u32, grace: Duration) {
        let target = Pid::from_raw(pid as i32);
        if kill(target, Signal::SIGTERM).is_err() {
            return; // already gone
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            // Reap if it was our child, else probe with signal 0.
            match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return,
                _ => {}
            }
            if kill(target, None).is_err() {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        tracing::info!(pid, "grace period expired, sending SIGKILL");
        let _ = kill(target, Signal::SIGKILL);
        let _ = waitpid(target, Some(WaitPidFlag::WNOHANG));
    }
}

/// Run the SIGCHLD stream, reaping into the monitor table.
pub async fn run_sigchld_task(monitor: std::sync::Arc<ProcessMonitor>) {
    let mut sigchld = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::child()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "unable to install SIGCHLD handler");
            return;
        }
    };
    while sigchld.recv().await.is_some() {
        monitor.reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn exit_policy_fires_handler() {
        let monitor = ProcessMonitor::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        monitor.set_session_exit_handler(move |session| {
            fired_clone.store(session, Ordering::SeqCst);
        });

        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        monitor.watch(pid, 42, true);

        // Wait for the child to exit, then reap.
        std::thread::sleep(Duration::from_millis(100));
        monitor.reap();
        assert_eq!(fired.load(Ordering::SeqCst), 42);
        assert!(monitor.watched.lock().unwrap().is_empty());
    }

    #[test]
    fn unwatched_children_do_not_fire() {
        let monitor = ProcessMonitor::new();
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);
        monitor.set_session_exit_handler(move |session| {
            fired_clone.store(session, Ordering::SeqCst);
        });

        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        monitor.watch(pid, 7, false);
        std::thread::sleep(Duration::from_millis(100));
        monitor.reap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let _ = pid;
    }

    #[test]
    fn terminate_kills_stubborn_children() {
        let monitor = ProcessMonitor::new();
        // A child that ignores SIGTERM.
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();
        let start = Instant::now();
        monitor.terminate_child_process(pid, Duration::from_millis(300));
        assert!(start.elapsed() < Duration::from_secs(5));
        // After SIGKILL the process must be gone shortly.
        std::thread::sleep(Duration::from_millis(100));
        let probe = kill(Pid::from_raw(pid as i32), None);
        assert!(probe.is_err() || waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)).is_ok());
    }
}
