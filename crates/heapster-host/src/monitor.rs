//! Scoped locking over the runtime's named raw monitors.

use crate::{fatal_host_error, HostResult, HostRuntime, MonitorId};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A value guarded by one of the runtime's named raw monitors.
///
/// `lock` enters the monitor and returns a guard that releases it on
/// every exit path out of the critical section. The monitor's name
/// shows up in diagnostics when enter or exit fails; either failure
/// aborts the process, because a broken raw monitor means the host
/// runtime itself is corrupt.
///
/// Raw monitors are recursive on the runtime side, but the guard hands
/// out `&mut T`, so a thread must never lock the same `Monitor` twice.
pub struct Monitor<T> {
    host: Arc<dyn HostRuntime>,
    id: MonitorId,
    name: &'static str,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Monitor<T> {}
unsafe impl<T: Send> Sync for Monitor<T> {}

impl<T> Monitor<T> {
    /// Create the named raw monitor on the host and guard `value`
    /// with it.
    pub fn new(host: Arc<dyn HostRuntime>, name: &'static str, value: T) -> HostResult<Self> {
        let id = host.create_raw_monitor(name)?;
        Ok(Self {
            host,
            id,
            name,
            value: UnsafeCell::new(value),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lock(&self) -> MonitorGuard<'_, T> {
        if let Err(err) = self.host.raw_monitor_enter(self.id) {
            fatal_host_error(&format!("failed to enter monitor {}", self.name), &err);
        }
        MonitorGuard { monitor: self }
    }
}

pub struct MonitorGuard<'a, T> {
    monitor: &'a Monitor<T>,
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the raw monitor is held for the guard's lifetime.
        unsafe { &*self.monitor.value.get() }
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as above, and the guard is not Clone.
        unsafe { &mut *self.monitor.value.get() }
    }
}

impl<T> Drop for MonitorGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(err) = self.monitor.host.raw_monitor_exit(self.monitor.id) {
            fatal_host_error(
                &format!("failed to exit monitor {}", self.monitor.name),
                &err,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeRuntime;

    #[test]
    fn guard_releases_on_drop() {
        let host: Arc<dyn HostRuntime> = Arc::new(FakeRuntime::new());
        let counter = Monitor::new(host, "test state", 0u64).unwrap();

        *counter.lock() += 1;
        // A second lock would deadlock if the first guard leaked the
        // monitor.
        *counter.lock() += 1;
        assert_eq!(*counter.lock(), 2);
    }

    #[test]
    fn mutual_exclusion() {
        let host: Arc<dyn HostRuntime> = Arc::new(FakeRuntime::new());
        let counter = Monitor::new(host, "test state", 0u64).unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        let mut value = counter.lock();
                        let read = *value;
                        *value = read + 1;
                    }
                });
            }
        });

        assert_eq!(*counter.lock(), 4000);
    }
}
