//! Collaborator contract between this crate's controllers and whatever
//! kernel embeds them: dependencies are injected through construction
//! instead of reached for as static globals.
//!
//! DMA address translation, PCI config access, interrupt masking, and a
//! monotonic clock are collected behind one object-safe trait so a
//! controller can be constructed against a real kernel or a test double
//! with identical code.

use core::fmt;

/// Everything an HCD needs from its host environment.
///
/// Implementations must be `Send + Sync`: controllers hand `Arc<dyn
/// Platform>` to worker tasks (finisher, cleanup, event dispatcher) that
/// run concurrently with the submitting thread.
pub trait Platform: Send + Sync {
    /// Translate a physical (bus) address inside the DMA region handed out
    /// by `dma_region()` into a CPU-dereferenceable pointer.
    fn phys_to_virt(&self, phys: u64) -> *mut u8;

    /// Inverse of `phys_to_virt`.
    fn virt_to_phys(&self, virt: *mut u8) -> u64;

    /// The single contiguous, ≤4 GiB-bounded region the `PhysicalMemoryAllocator`
    /// carves up. Returned once at `Stack` construction.
    fn dma_region(&self) -> DmaRegion;

    fn pci_read32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32;
    fn pci_write32(&self, bus: u8, device: u8, function: u8, offset: u8, value: u32);

    fn pci_read16(&self, bus: u8, device: u8, function: u8, offset: u8) -> u16 {
        let v = self.pci_read32(bus, device, function, offset & 0xFC);
        (v >> ((offset & 2) * 8)) as u16
    }

    fn pci_write16(&self, bus: u8, device: u8, function: u8, offset: u8, value: u16) {
        let aligned = offset & 0xFC;
        let shift = (offset & 2) * 8;
        let mut v = self.pci_read32(bus, device, function, aligned);
        v &= !(0xFFFFu32 << shift);
        v |= (value as u32) << shift;
        self.pci_write32(bus, device, function, aligned, v);
    }

    /// Microseconds since an arbitrary epoch, monotonic.
    fn now_us(&self) -> u64;

    /// Blocking delay, used for port reset, controller reset polling, and
    /// IAAD/command timeouts. A real kernel yields the current task; a
    /// polling/test harness may busy-wait.
    fn sleep_us(&self, us: u64);

    /// Disable interrupts on the current core, returning whether they were
    /// enabled beforehand (for `IrqSafeMutex`).
    fn disable_interrupts(&self) -> bool;

    /// Restore the interrupt state returned by `disable_interrupts`.
    fn restore_interrupts(&self, was_enabled: bool);
}

/// Logical/physical description of the DMA-capable region backing the PMA.
#[derive(Clone, Copy)]
pub struct DmaRegion {
    pub logical_base: *mut u8,
    pub physical_base: u64,
    pub size: usize,
}

// SAFETY: the region is a plain memory-mapped range; sharing the address
// pair across threads is sound as long as callers synchronize access to
// the memory it describes (the PMA's lock does that).
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("logical_base", &self.logical_base)
            .field("physical_base", &format_args!("{:#x}", self.physical_base))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use alloc::vec::Vec;
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use spin::Mutex;
    use std::collections::BTreeMap;

    /// A host-testable `Platform`: the DMA region is a boxed `Vec<u8>`
    /// (its logical and physical addresses coincide), PCI config space is a
    /// map, and the clock is manually advanced with `advance_us`.
    pub struct MockPlatform {
        region: UnsafeCell<Vec<u8>>,
        base_phys: u64,
        pci_cfg: Mutex<BTreeMap<(u8, u8, u8, u8), u32>>,
        clock_us: AtomicU64,
        irq_enabled: AtomicBool,
    }

    // SAFETY: the only interior-mutable field accessed from multiple
    // "threads" in tests is `region`, and tests single-thread all DMA
    // traffic through the PMA's own lock before touching it.
    unsafe impl Sync for MockPlatform {}

    impl MockPlatform {
        pub fn new(size: usize) -> Self {
            MockPlatform {
                region: UnsafeCell::new(alloc::vec![0u8; size]),
                base_phys: 0x1000_0000,
                pci_cfg: Mutex::new(BTreeMap::new()),
                clock_us: AtomicU64::new(0),
                irq_enabled: AtomicBool::new(true),
            }
        }

        pub fn advance_us(&self, delta: u64) {
            self.clock_us.fetch_add(delta, Ordering::SeqCst);
        }

        pub fn set_pci32(&self, bus: u8, device: u8, function: u8, offset: u8, value: u32) {
            self.pci_cfg
                .lock()
                .insert((bus, device, function, offset & 0xFC), value);
        }
    }

    impl Platform for MockPlatform {
        fn phys_to_virt(&self, phys: u64) -> *mut u8 {
            let region = unsafe { &mut *self.region.get() };
            let off = (phys - self.base_phys) as usize;
            assert!(off <= region.len(), "phys_to_virt out of range");
            unsafe { region.as_mut_ptr().add(off) }
        }

        fn virt_to_phys(&self, virt: *mut u8) -> u64 {
            let region = unsafe { &mut *self.region.get() };
            let base = region.as_mut_ptr();
            let off = unsafe { virt.offset_from(base) };
            assert!(off >= 0, "virt_to_phys before region base");
            self.base_phys + off as u64
        }

        fn dma_region(&self) -> DmaRegion {
            let region = unsafe { &mut *self.region.get() };
            DmaRegion {
                logical_base: region.as_mut_ptr(),
                physical_base: self.base_phys,
                size: region.len(),
            }
        }

        fn pci_read32(&self, bus: u8, device: u8, function: u8, offset: u8) -> u32 {
            *self
                .pci_cfg
                .lock()
                .get(&(bus, device, function, offset & 0xFC))
                .unwrap_or(&0xFFFF_FFFF)
        }

        fn pci_write32(&self, bus: u8, device: u8, function: u8, offset: u8, value: u32) {
            self.pci_cfg
                .lock()
                .insert((bus, device, function, offset & 0xFC), value);
        }

        fn now_us(&self) -> u64 {
            self.clock_us.load(Ordering::SeqCst)
        }

        fn sleep_us(&self, us: u64) {
            self.advance_us(us);
        }

        fn disable_interrupts(&self) -> bool {
            self.irq_enabled.swap(false, Ordering::SeqCst)
        }

        fn restore_interrupts(&self, was_enabled: bool) {
            self.irq_enabled.store(was_enabled, Ordering::SeqCst);
        }
    }
}
