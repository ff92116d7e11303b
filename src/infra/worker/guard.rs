//! Exchange serialization and the force-kill escape hatch.
//!
//! [`ExchangeGuard`] is the only lock around the worker's pipes: renders wait
//! for it, shutdown waits for it only as long as its caller allows.
//! [`KillSwitch`] deliberately sits outside that lock so a shutdown that
//! cannot get the guard can still terminate a stuck worker. Killing an
//! already-dead process is harmless and the in-flight exchange then sees
//! end-of-stream, which it already handles.

use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use tokio::{process::Child, runtime::Handle, sync};
use tracing::{debug, warn};

use super::bounded;

/// Advisory lock serializing exchanges with the worker.
pub struct ExchangeGuard<T> {
    inner: sync::Mutex<T>,
}

impl<T> ExchangeGuard<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: sync::Mutex::new(value),
        }
    }

    /// Wait as long as it takes.
    pub async fn acquire(&self) -> sync::MutexGuard<'_, T> {
        self.inner.lock().await
    }

    /// Wait at most `timeout`; `None` waits indefinitely and a zero timeout
    /// makes a single attempt.
    pub async fn acquire_within(&self, timeout: Option<Duration>) -> Option<sync::MutexGuard<'_, T>> {
        match timeout {
            None => Some(self.inner.lock().await),
            Some(timeout) if timeout.is_zero() => self.inner.try_lock().ok(),
            Some(timeout) => bounded::call(timeout, self.inner.lock()).await,
        }
    }
}

/// Holder of the worker process handle, reachable without the exchange guard.
///
/// Every armed process gets a new generation so pipes opened for an earlier
/// process can be recognised after it was killed behind the guard's back.
#[derive(Default)]
pub struct KillSwitch {
    slot: Mutex<Slot>,
}

#[derive(Default)]
struct Slot {
    child: Option<Child>,
    generation: u64,
}

impl KillSwitch {
    /// Hold `child`, returning its generation.
    pub fn arm(&self, child: Child) -> u64 {
        let mut slot = self.slot();
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(previous) = slot.child.replace(child) {
            kill_and_reap(previous);
        }
        slot.generation
    }

    pub fn is_armed(&self) -> bool {
        self.slot().child.is_some()
    }

    /// Whether the process armed as `generation` is still held.
    pub fn is_current(&self, generation: u64) -> bool {
        let slot = self.slot();
        slot.child.is_some() && slot.generation == generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.slot().child.as_ref().and_then(Child::id)
    }

    /// Take the handle out, disarming the switch.
    pub fn take(&self) -> Option<Child> {
        self.slot().child.take()
    }

    /// Kill the armed process without touching the exchange guard. Returns
    /// whether there was a process to kill.
    pub fn force_kill(&self) -> bool {
        match self.take() {
            Some(child) => {
                kill_and_reap(child);
                true
            }
            None => false,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        mutex_lock(&self.slot, "infra::worker::guard", "kill_switch::slot")
    }
}

/// Lock a short-held std mutex, recovering the data if a previous holder
/// panicked.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "state may be stale after panic in another thread",
                "Recovered from poisoned worker lock"
            );
            poisoned.into_inner()
        }
    }
}

/// Send SIGKILL and collect the exit status in the background.
pub(crate) fn kill_and_reap(mut child: Child) {
    let pid = child.id();
    if let Err(err) = child.start_kill() {
        debug!(
            target = "infra::worker::guard",
            op = "kill_switch::kill",
            pid,
            error = %err,
            "Worker kill request failed; process may already be gone"
        );
    }

    // Outside a runtime the handle is dropped and tokio's orphan reaping
    // takes over.
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(async move {
            if let Ok(status) = child.wait().await {
                debug!(
                    target = "infra::worker::guard",
                    op = "kill_switch::reap",
                    pid,
                    exit_code = status.code(),
                    "Reaped killed worker"
                );
            }
        });
    }
}
