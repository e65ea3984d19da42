//! Process-wide owner of the id table, the DMA allocator, and the list of
//! bus managers (one per host controller). Grounded on the `Stack` class
//! in `usb_private.h`; driver registration/notification hooks
//! (`RegisterDriver`, `InstallNotify`) and the explore thread are out of
//! scope.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KError, KResult};
use crate::platform::Platform;
use crate::pma::PhysicalMemoryAllocator;
use crate::sync::IrqSafeMutex;
use crate::{UsbId, USB_ID_NONE};

struct IdTable {
    next_id: UsbId,
    entries: BTreeMap<UsbId, ()>,
}

/// Per-process registry: hands out stable ids and owns the single
/// `PhysicalMemoryAllocator` shared by every `BusManager` built against
/// it.
pub struct Stack {
    platform: Arc<dyn Platform>,
    pma: PhysicalMemoryAllocator,
    ids: IrqSafeMutex<IdTable>,
}

impl Stack {
    pub fn new(
        platform: Arc<dyn Platform>,
        min_block: usize,
        max_block: usize,
        min_count_per_block: usize,
    ) -> KResult<Self> {
        let pma = PhysicalMemoryAllocator::new(platform.clone(), min_block, max_block, min_count_per_block)?;
        Ok(Stack {
            platform,
            pma,
            ids: IrqSafeMutex::new(IdTable {
                next_id: 0,
                entries: BTreeMap::new(),
            }),
        })
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn pma(&self) -> &PhysicalMemoryAllocator {
        &self.pma
    }

    /// Allocates a fresh id, wrapping past `USB_ID_NONE` back to zero.
    pub fn get_usb_id(&self) -> UsbId {
        let mut table = self.ids.lock(&**self.platform);
        loop {
            let candidate = table.next_id;
            table.next_id = table.next_id.wrapping_add(1);
            if table.next_id == USB_ID_NONE {
                table.next_id = 0;
            }
            if candidate == USB_ID_NONE {
                continue;
            }
            if !table.entries.contains_key(&candidate) {
                table.entries.insert(candidate, ());
                return candidate;
            }
        }
    }

    pub fn put_usb_id(&self, id: UsbId) {
        if id == USB_ID_NONE {
            return;
        }
        let mut table = self.ids.lock(&**self.platform);
        table.entries.remove(&id);
    }

    pub fn allocate_dma(&self, size: usize) -> KResult<(*mut u8, u64)> {
        self.pma.allocate(size)
    }

    pub fn free_dma(&self, size: usize, logical: *mut u8, physical: u64) -> KResult<()> {
        self.pma.deallocate(size, Some(logical), Some(physical))
    }
}

/// Registry of the bus managers this stack has instantiated, kept
/// separately from `Stack` itself so `BusManager` can hold an `Arc<Stack>`
/// without a reference cycle back through its own registration entry.
pub struct BusManagerRegistry {
    managers: IrqSafeMutex<Vec<UsbId>>,
}

impl BusManagerRegistry {
    pub fn new() -> Self {
        BusManagerRegistry {
            managers: IrqSafeMutex::new(Vec::new()),
        }
    }

    pub fn add(&self, platform: &dyn Platform, id: UsbId) {
        self.managers.lock(platform).push(id);
    }

    pub fn remove(&self, platform: &dyn Platform, id: UsbId) {
        self.managers.lock(platform).retain(|&x| x != id);
    }

    pub fn len(&self, platform: &dyn Platform) -> usize {
        self.managers.lock(platform).len()
    }
}

impl Default for BusManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPlatform;

    fn stack() -> Stack {
        let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(1 << 20));
        Stack::new(platform, 64, 4096, 4).unwrap()
    }

    #[test]
    fn ids_are_unique_until_released() {
        let s = stack();
        let a = s.get_usb_id();
        let b = s.get_usb_id();
        assert_ne!(a, b);
        s.put_usb_id(a);
        let c = s.get_usb_id();
        // Not guaranteed to equal `a` (monotonic counter), but must not
        // collide with the still-live `b`.
        assert_ne!(c, b);
    }

    #[test]
    fn bad_pma_config_is_rejected() {
        let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(16));
        assert_eq!(
            Stack::new(platform, 64, 4096, 4).unwrap_err(),
            KError::NoMemory
        );
    }
}
