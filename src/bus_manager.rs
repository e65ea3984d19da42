//! Per-controller bus manager: owns the device address space and forwards
//! transfer submission/cancellation to whichever `Hcd` backs it. Grounded
//! on the `BusManager` class in `usb_private.h` (`AllocateAddress`,
//! `FreeAddress`, `SubmitTransfer`, `CancelQueuedTransfers`,
//! `NotifyPipeChange`). Root-hub emulation and the device-explore thread
//! the original drives from here are out of scope.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::device::Device;
use crate::error::{KError, KResult};
use crate::hcd::Hcd;
use crate::object::{Object, ObjectState};
use crate::pipe::Pipe;
use crate::platform::Platform;
use crate::stack::Stack;
use crate::sync::IrqSafeMutex;
use crate::transfer::Transfer;

/// USB addresses run 1..=127; 0 is reserved for the default address a
/// device answers on before `SET_ADDRESS` (`USB_MAX_DEVICES` in the
/// original, matching `fDeviceMap[128]`).
const MAX_DEVICE_ADDRESS: u8 = 127;

struct AddressMap {
    /// One bit per address 1..=127; bit 0 is unused so the index matches
    /// the USB address directly.
    used: [bool; 128],
}

impl AddressMap {
    fn new() -> Self {
        AddressMap { used: [false; 128] }
    }

    fn allocate(&mut self) -> KResult<u8> {
        for addr in 1..=MAX_DEVICE_ADDRESS {
            if !self.used[addr as usize] {
                self.used[addr as usize] = true;
                return Ok(addr);
            }
        }
        Err(KError::NoMemory)
    }

    fn free(&mut self, addr: u8) {
        if addr != 0 && addr <= MAX_DEVICE_ADDRESS {
            self.used[addr as usize] = false;
        }
    }
}

pub struct BusManager {
    object: ObjectState,
    stack: Arc<Stack>,
    hcd: Arc<dyn Hcd>,
    addresses: IrqSafeMutex<AddressMap>,
    devices: IrqSafeMutex<Vec<Arc<Device>>>,
}

impl BusManager {
    pub fn new(stack: Arc<Stack>, hcd: Arc<dyn Hcd>) -> Self {
        BusManager {
            object: ObjectState::new(stack.clone()),
            stack,
            hcd,
            addresses: IrqSafeMutex::new(AddressMap::new()),
            devices: IrqSafeMutex::new(Vec::new()),
        }
    }

    fn platform(&self) -> &dyn Platform {
        &**self.stack.platform()
    }

    pub fn hcd(&self) -> &Arc<dyn Hcd> {
        &self.hcd
    }

    pub fn start(&self) -> KResult<()> {
        self.hcd.start()
    }

    pub fn stop(&self) -> KResult<()> {
        self.hcd.stop()
    }

    pub fn allocate_address(&self) -> KResult<u8> {
        self.addresses.lock(self.platform()).allocate()
    }

    pub fn free_address(&self, addr: u8) {
        self.addresses.lock(self.platform()).free(addr);
    }

    pub fn add_device(&self, device: Arc<Device>) {
        self.devices.lock(self.platform()).push(device);
    }

    pub fn remove_device(&self, addr: u8) {
        self.devices.lock(self.platform()).retain(|d| d.address() != addr);
        self.free_address(addr);
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock(self.platform()).len()
    }

    pub fn submit_transfer(&self, pipe: &Pipe, transfer: Transfer) -> KResult<()> {
        self.hcd.submit_transfer(pipe, transfer)
    }

    pub fn cancel_queued_transfers(&self, pipe: &Pipe, force: bool) -> KResult<()> {
        self.hcd.cancel_queued_transfers(pipe, force)
    }
}

impl Object for BusManager {
    fn object_state(&self) -> &ObjectState {
        &self.object
    }
}
