//! Process registry for live agent subprocesses
//!
//! Tracks one process per id ([`DEFAULT_PROCESS_ID`] for the sequential loop,
//! the task id in parallel mode), owns the abort signals and the per-id retry
//! counters, and terminates processes with SIGTERM followed by SIGKILL after a
//! grace window. Injected into runners; there is no global instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Process id used by the sequential (single agent) loop
pub const DEFAULT_PROCESS_ID: &str = "main";

/// Default window between SIGTERM and SIGKILL
pub const DEFAULT_FORCE_KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct TrackedProcess {
    pid: u32,
    created_at: Instant,
}

struct IdState {
    abort: watch::Sender<bool>,
    retry_count: u32,
}

impl IdState {
    fn new() -> Self {
        let (abort, _) = watch::channel(false);
        Self { abort, retry_count: 0 }
    }
}

/// A SIGKILL scheduled for the end of the grace window
struct ForceKill {
    timer: JoinHandle<()>,
    /// Set once the group leader is reaped; only the group is signalled then
    leader_reaped: Arc<AtomicBool>,
}

/// Registry of tracked agent processes
pub struct ProcessRegistry {
    processes: Mutex<HashMap<String, TrackedProcess>>,
    states: Mutex<HashMap<String, IdState>>,
    /// Pending SIGKILL timers by pid
    force_kills: Arc<Mutex<HashMap<u32, ForceKill>>>,
    global_abort: watch::Sender<bool>,
    grace: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessRegistry {
    pub fn new(grace: Duration) -> Self {
        debug!(?grace, "ProcessRegistry::new: called");
        let (global_abort, _) = watch::channel(false);
        Self {
            processes: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            force_kills: Arc::new(Mutex::new(HashMap::new())),
            global_abort,
            grace,
        }
    }

    /// Track `pid` under `id`
    ///
    /// A live process already tracked under the same id is terminated first.
    pub fn set_process(&self, id: &str, pid: u32) {
        debug!(%id, pid, "ProcessRegistry::set_process: called");
        let previous = lock(&self.processes).insert(
            id.to_string(),
            TrackedProcess {
                pid,
                created_at: Instant::now(),
            },
        );
        if let Some(previous) = previous.filter(|p| p.pid != pid) {
            warn!(%id, old_pid = previous.pid, "ProcessRegistry::set_process: replacing live process");
            self.terminate(previous.pid);
        }
    }

    /// Stop tracking the process under `id` without signalling it
    pub fn unregister(&self, id: &str) {
        debug!(%id, "ProcessRegistry::unregister: called");
        if let Some(process) = lock(&self.processes).remove(id) {
            debug!(%id, pid = process.pid, age_ms = process.created_at.elapsed().as_millis() as u64, "ProcessRegistry::unregister: removed");
        }
    }

    /// The process has been reaped
    ///
    /// A pending SIGKILL still fires for the rest of its process group, so
    /// children that ignored SIGTERM do not outlive a killed agent. The reaped
    /// pid itself is never signalled again.
    pub fn process_exited(&self, pid: u32) {
        debug!(pid, "ProcessRegistry::process_exited: called");
        if let Some(pending) = lock(&self.force_kills).get(&pid) {
            debug!(pid, "ProcessRegistry::process_exited: SIGKILL stays pending for the group");
            pending.leader_reaped.store(true, Ordering::SeqCst);
        }
    }

    /// True while a SIGKILL is scheduled for the group led by `pid`
    pub fn force_kill_pending(&self, pid: u32) -> bool {
        lock(&self.force_kills).contains_key(&pid)
    }

    /// Pid tracked under `id`
    pub fn pid(&self, id: &str) -> Option<u32> {
        lock(&self.processes).get(id).map(|p| p.pid)
    }

    /// Ids with a tracked process
    pub fn tracked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.processes).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// SIGTERM the process under `id` now, SIGKILL it after the grace window
    ///
    /// The id's entry is removed immediately so a new invocation under the
    /// same id is never blocked by the dying process.
    pub fn kill(&self, id: &str) -> bool {
        debug!(%id, "ProcessRegistry::kill: called");
        let process = lock(&self.processes).remove(id);
        match process {
            Some(process) => {
                info!(%id, pid = process.pid, "ProcessRegistry::kill: terminating process");
                self.terminate(process.pid);
                true
            }
            None => {
                debug!(%id, "ProcessRegistry::kill: no tracked process");
                false
            }
        }
    }

    /// Set the global abort flag and kill every tracked process
    pub fn kill_all(&self) {
        info!("ProcessRegistry::kill_all: aborting all processes");
        self.global_abort.send_replace(true);
        let drained: Vec<(String, TrackedProcess)> = lock(&self.processes).drain().collect();
        for (id, process) in drained {
            debug!(%id, pid = process.pid, "ProcessRegistry::kill_all: terminating");
            self.terminate(process.pid);
        }
    }

    /// Abort only `id` and kill its process
    pub fn abort(&self, id: &str) {
        debug!(%id, "ProcessRegistry::abort: called");
        lock(&self.states)
            .entry(id.to_string())
            .or_insert_with(IdState::new)
            .abort
            .send_replace(true);
        self.kill(id);
    }

    /// True when the global flag or the flag for `id` is set
    pub fn is_aborted(&self, id: &str) -> bool {
        *self.global_abort.borrow() || lock(&self.states).get(id).is_some_and(|s| *s.abort.borrow())
    }

    /// Clear the per-id abort flag
    pub fn reset_abort(&self, id: &str) {
        debug!(%id, "ProcessRegistry::reset_abort: called");
        if let Some(state) = lock(&self.states).get(id) {
            state.abort.send_replace(false);
        }
    }

    /// Clear the global abort flag and every per-id flag
    pub fn reset_abort_all(&self) {
        debug!("ProcessRegistry::reset_abort_all: called");
        self.global_abort.send_replace(false);
        for state in lock(&self.states).values() {
            state.abort.send_replace(false);
        }
    }

    /// Cancellation handle for `id`
    pub fn abort_signal(&self, id: &str) -> AbortSignal {
        let local = lock(&self.states)
            .entry(id.to_string())
            .or_insert_with(IdState::new)
            .abort
            .subscribe();
        AbortSignal {
            global: self.global_abort.subscribe(),
            local,
        }
    }

    pub fn increment_retry(&self, id: &str) -> u32 {
        let mut states = lock(&self.states);
        let state = states.entry(id.to_string()).or_insert_with(IdState::new);
        state.retry_count += 1;
        debug!(%id, retry_count = state.retry_count, "ProcessRegistry::increment_retry");
        state.retry_count
    }

    pub fn reset_retry(&self, id: &str) {
        debug!(%id, "ProcessRegistry::reset_retry: called");
        if let Some(state) = lock(&self.states).get_mut(id) {
            state.retry_count = 0;
        }
    }

    pub fn retry_count(&self, id: &str) -> u32 {
        lock(&self.states).get(id).map_or(0, |s| s.retry_count)
    }

    fn terminate(&self, pid: u32) {
        debug!(pid, "ProcessRegistry::terminate: sending SIGTERM");
        send_signal(pid, Signal::Term);

        let grace = self.grace;
        let timers = Arc::clone(&self.force_kills);
        let leader_reaped = Arc::new(AtomicBool::new(false));
        let reaped = Arc::clone(&leader_reaped);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            debug!(pid, "ProcessRegistry: grace window elapsed, sending SIGKILL");
            if reaped.load(Ordering::SeqCst) {
                send_group_signal(pid, Signal::Kill);
            } else {
                send_signal(pid, Signal::Kill);
            }
            lock(&timers).remove(&pid);
        });
        let pending = ForceKill { timer, leader_reaped };
        if let Some(old) = lock(&self.force_kills).insert(pid, pending) {
            old.timer.abort();
        }
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_FORCE_KILL_GRACE)
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

/// Signal the process group led by `pid`, falling back to the pid alone
#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    let pid = Pid::from_raw(pid as i32);
    if signal::killpg(pid, sig).is_ok() {
        return;
    }
    if let Err(e) = signal::kill(pid, sig) {
        debug!(%pid, ?sig, error = %e, "send_signal: process already gone");
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, signal: Signal) {
    warn!(pid, ?signal, "send_signal: signals are not supported on this platform");
}

/// Signal only the process group led by `pid`
#[cfg(unix)]
fn send_group_signal(pid: u32, signal: Signal) {
    use nix::sys::signal::{self, Signal as NixSignal};
    use nix::unistd::Pid;

    let sig = match signal {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    if let Err(e) = signal::killpg(Pid::from_raw(pid as i32), sig) {
        debug!(pid, ?sig, error = %e, "send_group_signal: group already gone");
    }
}

#[cfg(not(unix))]
fn send_group_signal(pid: u32, signal: Signal) {
    warn!(pid, ?signal, "send_group_signal: signals are not supported on this platform");
}

/// Cancellation handle combining the global and a per-id abort flag
#[derive(Clone)]
pub struct AbortSignal {
    global: watch::Receiver<bool>,
    local: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (global_tx, global) = watch::channel(false);
        let (local_tx, local) = watch::channel(false);
        // Receivers keep the last value once senders are gone
        drop((global_tx, local_tx));
        Self { global, local }
    }

    pub fn is_aborted(&self) -> bool {
        *self.global.borrow() || *self.local.borrow()
    }

    /// Resolve once either flag is set; pends forever if neither can be
    pub async fn cancelled(&self) {
        let mut global = self.global.clone();
        let mut local = self.local.clone();
        tokio::select! {
            true = async { global.wait_for(|aborted| *aborted).await.is_ok() } => {}
            true = async { local.wait_for(|aborted| *aborted).await.is_ok() } => {}
            else => std::future::pending::<()>().await,
        }
    }
}
