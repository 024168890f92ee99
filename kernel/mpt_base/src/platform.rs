//! Services the base driver needs from the surrounding kernel:
//! time, context queries, interrupt masking, and DMA-coherent memory.

use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};
use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};

/// The kernel services the base driver runs on top of.
///
/// Every adapter holds one of these; several adapters may share the same instance.
pub trait Platform: Send + Sync {
    /// Busy-waits for `ms` milliseconds without yielding.
    fn delay_ms(&self, ms: u32);

    /// Yields the CPU for `ticks` scheduler ticks.
    fn sleep_ticks(&self, ticks: u32);

    /// The scheduler tick rate (HZ).
    fn ticks_per_second(&self) -> u32;

    /// A monotonic millisecond clock.
    fn now_ms(&self) -> u64;

    /// Whether the caller is running in interrupt or other atomic context.
    fn in_interrupt(&self) -> bool;

    /// Disables interrupts on the current CPU, returning whether they were enabled.
    fn disable_interrupts(&self) -> bool {
        let was_enabled = irq_safety::interrupts_enabled();
        irq_safety::disable_interrupts();
        was_enabled
    }

    /// Undoes a [`Platform::disable_interrupts`] that returned `was_enabled`.
    fn restore_interrupts(&self, was_enabled: bool) {
        if was_enabled {
            irq_safety::enable_interrupts();
        }
    }

    /// Allocates `len` bytes of zeroed, physically contiguous, DMA-coherent memory
    /// aligned to `align`, returning its virtual and bus addresses.
    fn alloc_dma(&self, len: usize, align: usize) -> Option<(NonNull<u8>, u64)>;

    /// Frees memory returned by [`Platform::alloc_dma`].
    ///
    /// # Safety
    /// `virt`, `len` and `align` must be exactly those of a previous allocation,
    /// and nothing may access the memory afterwards.
    unsafe fn free_dma(&self, virt: NonNull<u8>, len: usize, align: usize);
}

/// How a wait loop passes time between polls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepMode {
    /// The caller may block: yield one scheduler tick per poll.
    CanSleep,
    /// The caller is atomic: busy-wait one millisecond per poll.
    NoSleep,
}

impl SleepMode {
    /// The number of polls that make up `secs` seconds.
    pub(crate) fn polls(self, platform: &dyn Platform, secs: u32) -> u32 {
        let per_sec = match self {
            SleepMode::CanSleep => platform.ticks_per_second(),
            SleepMode::NoSleep => 1000,
        };
        per_sec.saturating_mul(secs).max(1)
    }

    /// Passes one poll interval.
    pub(crate) fn pause(self, platform: &dyn Platform) {
        match self {
            SleepMode::CanSleep => platform.sleep_ticks(1),
            SleepMode::NoSleep => platform.delay_ms(1),
        }
    }

    /// Sleeps or busy-waits for `ms` milliseconds.
    pub(crate) fn wait_ms(self, platform: &dyn Platform, ms: u32) {
        match self {
            SleepMode::CanSleep => {
                let hz = platform.ticks_per_second().max(1);
                platform.sleep_ticks(((ms * hz) / 1000).max(1));
            }
            SleepMode::NoSleep => platform.delay_ms(ms),
        }
    }
}

/// Polls `done` until it returns true, for at most `secs` seconds.
///
/// Returns the number of polls it took, or `None` on timeout.
pub(crate) fn poll_until<F: FnMut() -> bool>(
    platform: &dyn Platform,
    mode: SleepMode,
    secs: u32,
    mut done: F,
) -> Option<u32> {
    let polls = mode.polls(platform, secs);
    for count in 0..polls {
        if done() {
            return Some(count);
        }
        mode.pause(platform);
    }
    if done() { Some(polls) } else { None }
}

/// Interrupts held off on the current CPU until this is dropped.
pub struct HeldInterrupts<'p> {
    platform: &'p dyn Platform,
    was_enabled: bool,
}

impl<'p> HeldInterrupts<'p> {
    pub fn new(platform: &'p dyn Platform) -> HeldInterrupts<'p> {
        let was_enabled = platform.disable_interrupts();
        HeldInterrupts { platform, was_enabled }
    }
}

impl Drop for HeldInterrupts<'_> {
    fn drop(&mut self) {
        self.platform.restore_interrupts(self.was_enabled);
    }
}

/// A spinlock that is also taken from the interrupt path.
///
/// Interrupts stay disabled on the locking CPU for as long as the guard lives,
/// so the interrupt handler can never spin on a lock its own CPU holds.
pub struct IrqSafeMutex<T> {
    inner: Mutex<T>,
}

impl<T> IrqSafeMutex<T> {
    pub const fn new(value: T) -> IrqSafeMutex<T> {
        IrqSafeMutex { inner: Mutex::new(value) }
    }

    pub fn lock<'a>(&'a self, platform: &'a dyn Platform) -> IrqSafeGuard<'a, T> {
        let held = HeldInterrupts::new(platform);
        IrqSafeGuard { guard: self.inner.lock(), _held: held }
    }
}

/// The guard of an [`IrqSafeMutex`].
// Field order matters: the lock is released before interrupts come back on.
pub struct IrqSafeGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _held: HeldInterrupts<'a>,
}

impl<T> Deref for IrqSafeGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSafeGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A DMA-coherent memory region, freed when dropped.
pub struct DmaRegion {
    platform: Arc<dyn Platform>,
    virt: NonNull<u8>,
    phys: u64,
    len: usize,
    align: usize,
}

// Mutable access to the bytes is handed out only through `bytes_mut`, whose callers guard it (see `frames`).
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    pub fn new(platform: &Arc<dyn Platform>, len: usize, align: usize) -> Option<DmaRegion> {
        let (virt, phys) = platform.alloc_dma(len, align)?;
        unsafe { ptr::write_bytes(virt.as_ptr(), 0, len) };
        Some(DmaRegion { platform: Arc::clone(platform), virt, phys, len, align })
    }

    /// The bus address of the first byte.
    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.virt.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.virt.as_ptr(), self.len) }
    }

    /// Returns `len` bytes at `offset`, or `None` if out of bounds.
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(self.virt.as_ptr().add(offset), len) })
    }

    /// Returns `len` mutable bytes at `offset`, or `None` if out of bounds.
    ///
    /// # Safety
    /// The caller must hold exclusive ownership of that byte range
    /// for as long as the returned slice lives.
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(core::slice::from_raw_parts_mut(self.virt.as_ptr().add(offset), len))
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        unsafe { self.platform.free_dma(self.virt, self.len, self.align) };
    }
}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("phys", &format_args!("{:#X}", self.phys))
            .field("len", &self.len)
            .finish()
    }
}
