//! # Interrupt masking
//!
//! Critical sections that an interrupt handler may also enter (the frame
//! allocator, the task table, a core's run queue) must run with interrupts
//! disabled on the local core, otherwise the handler spins forever on a lock
//! its own core already holds.
//!
//! [`IrqGuard`] snapshots the interrupt flag, masks interrupts and restores
//! the previous state when dropped, on every exit path including unwinding.
//! [`Mutex::lock_irq`] pairs it with a lock acquisition.
//!
//! ## Backends
//!
//! On bare-metal `x86_64` the guard uses `pushfq`/`cli`/`sti`. Everywhere
//! else (host builds and tests) a process-wide software flag stands in for
//! `RFLAGS.IF` so the same code paths run unchanged.

use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod backend {
    /// `RFLAGS.IF`.
    const INTERRUPT_FLAG: u64 = 1 << 9;

    #[inline]
    pub fn enabled() -> bool {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags)) }
        r & INTERRUPT_FLAG != 0
    }

    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod backend {
    use core::sync::atomic::{AtomicBool, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn enabled() -> bool {
        ENABLED.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn disable() {
        ENABLED.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn enable() {
        ENABLED.store(true, Ordering::SeqCst);
    }
}

/// Whether interrupts are currently enabled on this core.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    backend::enabled()
}

/// Masks interrupts on this core.
///
/// Prefer [`IrqGuard`]; a bare call must be paired with [`enable_interrupts`].
#[inline]
pub fn disable_interrupts() {
    backend::disable();
}

/// Unmasks interrupts on this core.
#[inline]
pub fn enable_interrupts() {
    backend::enable();
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are re-enabled on drop **only** if they were enabled when the
/// guard was created, so guards nest.
///
/// The guard is `!Send`: the saved state belongs to the core that created it.
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _outer = IrqGuard::new();
///     let _inner = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    were_enabled: bool,
    _not_send: PhantomData<*mut ()>,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = backend::enabled();
        if were_enabled {
            backend::disable();
        }
        Self {
            were_enabled,
            _not_send: PhantomData,
        }
    }

    /// Whether interrupts will be re-enabled when this guard drops.
    #[inline]
    #[must_use]
    pub const fn restores_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            backend::enable();
        }
    }
}

/// A [`MutexGuard`] that also keeps interrupts masked while held.
///
/// Field order matters: the lock is released before the interrupt state is
/// restored, so no interrupt can observe the lock still held by this core.
pub struct IrqMutexGuard<'a, T, R: RawLock + RawUnlock> {
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> Deref for IrqMutexGuard<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock> DerefMut for IrqMutexGuard<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's lifetime.
    ///
    /// Interrupts are masked *before* spinning, so an interrupt arriving
    /// while this core waits cannot try to take the same lock.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutexGuard<'_, T, R> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutexGuard { guard, _irq: irq }
    }

    /// Non-blocking [`lock_irq`](Self::lock_irq); the interrupt state is
    /// untouched on failure.
    #[inline]
    pub fn try_lock_irq(&self) -> Option<IrqMutexGuard<'_, T, R>> {
        let irq = IrqGuard::new();
        self.try_lock().map(|guard| IrqMutexGuard { guard, _irq: irq })
    }
}
