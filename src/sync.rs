//! Mutex that disables interrupts while held, for paths that can be
//! called from an ISR. Takes the interrupt mask/restore calls from a
//! `Platform` implementation instead of a fixed architecture-specific
//! global, so the same lock works against a real kernel or a test
//! double.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::platform::Platform;

pub struct IrqSafeMutex<T> {
    inner: Mutex<T>,
}

pub struct IrqSafeGuard<'a, T> {
    irq_was_enabled: bool,
    platform: &'a dyn Platform,
    guard: MutexGuard<'a, T>,
}

impl<T> IrqSafeMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    pub fn lock<'a>(&'a self, platform: &'a dyn Platform) -> IrqSafeGuard<'a, T> {
        let irq_was_enabled = platform.disable_interrupts();
        let guard = self.inner.lock();
        IrqSafeGuard {
            irq_was_enabled,
            platform,
            guard,
        }
    }

    /// Non-blocking variant for a polled re-entry point (e.g. a
    /// kernel-debugger hook walking the transfer engine): acquire with
    /// `try_lock` first so that re-entry never blocks.
    pub fn try_lock<'a>(&'a self, platform: &'a dyn Platform) -> Option<IrqSafeGuard<'a, T>> {
        let irq_was_enabled = platform.disable_interrupts();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqSafeGuard {
                irq_was_enabled,
                platform,
                guard,
            }),
            None => {
                platform.restore_interrupts(irq_was_enabled);
                None
            }
        }
    }
}

impl<'a, T> Deref for IrqSafeGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqSafeGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<'a, T> Drop for IrqSafeGuard<'a, T> {
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.irq_was_enabled);
    }
}
