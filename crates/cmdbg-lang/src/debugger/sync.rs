use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// A one-shot signal: `wait` blocks until `fire` has been called at least once.
#[derive(Debug, Default)]
pub struct Latch {
    fired: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until the latch has been fired. Returns immediately afterwards.
    pub fn wait(&self) {
        let fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        drop(
            self.cv
                .wait_while(fired, |fired| !*fired)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    pub fn fire(&self) {
        let mut fired = self.fired.lock().unwrap_or_else(PoisonError::into_inner);
        *fired = true;
        self.cv.notify_all();
    }

    pub fn is_fired(&self) -> bool {
        *self.fired.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Value guarded by a [`Gate`], together with the gate's armed flag.
#[derive(Debug, Default)]
pub struct Gated<T> {
    armed: bool,
    value: T,
}

impl<T> Gated<T> {
    /// Arms the gate. Never blocks; the next [`Gate::wait`] does.
    pub fn arm(&mut self) {
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl<T> Deref for Gated<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Gated<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

pub type GateGuard<'a, T> = MutexGuard<'a, Gated<T>>;

/// A resettable blocking gate.
///
/// Threads calling [`Gate::wait`] block while the gate is armed and are all
/// woken once it is released. The armed flag lives under the same lock as the
/// guarded value, so state changes and arming are observed together.
#[derive(Debug, Default)]
pub struct Gate<T> {
    state: Mutex<Gated<T>>,
    released: Condvar,
}

impl<T> Gate<T> {
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(Gated {
                armed: false,
                value,
            }),
            released: Condvar::new(),
        }
    }

    pub fn lock(&self) -> GateGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks while the gate is armed. The lock is given up for the duration
    /// of the wait and reacquired before returning.
    pub fn wait<'a>(&self, guard: GateGuard<'a, T>) -> GateGuard<'a, T> {
        self.released
            .wait_while(guard, |gated| gated.armed)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Disarms the gate and wakes every waiter. Returns whether it was armed.
    pub fn release(&self, gated: &mut Gated<T>) -> bool {
        let was_armed = std::mem::replace(&mut gated.armed, false);
        if was_armed {
            self.released.notify_all();
        }
        was_armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_latch_wait_after_fire_returns() {
        let latch = Latch::new();
        assert!(!latch.is_fired());
        latch.fire();
        latch.wait();
        assert!(latch.is_fired());
    }

    #[test]
    fn test_latch_releases_waiting_thread() {
        let latch = Arc::new(Latch::new());
        let passed = Arc::new(AtomicBool::new(false));

        let waiter = {
            let latch = Arc::clone(&latch);
            let passed = Arc::clone(&passed);
            thread::spawn(move || {
                latch.wait();
                passed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!passed.load(Ordering::SeqCst));
        latch.fire();
        waiter.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_gate_wait_does_not_block_when_disarmed() {
        let gate = Gate::new(1u32);
        let guard = gate.lock();
        let guard = gate.wait(guard);
        assert_eq!(**guard, 1);
    }

    #[test]
    fn test_gate_release_wakes_waiter_and_publishes_value() {
        let gate = Arc::new(Gate::new(0u32));
        gate.lock().arm();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let guard = gate.lock();
                let guard = gate.wait(guard);
                **guard
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let mut guard = gate.lock();
            **guard = 7;
            assert!(gate.release(&mut guard));
        }
        assert_eq!(waiter.join().unwrap(), 7);
    }

    #[test]
    fn test_gate_release_when_disarmed_is_noop() {
        let gate = Gate::new(());
        let mut guard = gate.lock();
        assert!(!gate.release(&mut guard));
        guard.arm();
        assert!(guard.is_armed());
        assert!(gate.release(&mut guard));
        assert!(!guard.is_armed());
    }
}
