//! Exercises `BusManager` against a trivial in-test `Hcd` the way an
//! embedder would wire a real EHCI/xHCI controller: address allocation,
//! device bookkeeping, and transfer submission/cancellation delegating
//! through the `Hcd` trait object.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use usb_core::bus_manager::BusManager;
use usb_core::device::Device;
use usb_core::error::{KError, KResult, TransferError};
use usb_core::hcd::Hcd;
use usb_core::pipe::{Pipe, PipeDirection, PipeKind};
use usb_core::platform::mock::MockPlatform;
use usb_core::platform::Platform;
use usb_core::stack::Stack;
use usb_core::transfer::{Transfer, TransferData};
use usb_core::UsbSpeed;

struct RecordingHcd {
    last_status: AtomicU8,
}

impl Hcd for RecordingHcd {
    fn start(&self) -> KResult<()> {
        Ok(())
    }
    fn stop(&self) -> KResult<()> {
        Ok(())
    }
    fn submit_transfer(&self, _pipe: &Pipe, mut transfer: Transfer) -> KResult<()> {
        let len = transfer.total_length();
        transfer.finished(TransferError::Ok, len);
        self.last_status.store(1, Ordering::SeqCst);
        Ok(())
    }
    fn cancel_queued_transfers(&self, _pipe: &Pipe, _force: bool) -> KResult<()> {
        self.last_status.store(2, Ordering::SeqCst);
        Ok(())
    }
    fn port_count(&self) -> u8 {
        2
    }
}

fn setup() -> (Arc<Stack>, BusManager) {
    let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(1 << 20));
    let stack = Arc::new(Stack::new(platform, 64, 20480, 8).unwrap());
    let hcd = Arc::new(RecordingHcd { last_status: AtomicU8::new(0) });
    let manager = BusManager::new(stack.clone(), hcd);
    (stack, manager)
}

#[test]
fn device_count_tracks_add_and_remove() {
    let (stack, manager) = setup();
    let addr = manager.allocate_address().unwrap();
    let pipe = Arc::new(Pipe::new(
        stack.clone(),
        PipeKind::Control,
        addr,
        UsbSpeed::High,
        PipeDirection::Default,
        0,
        64,
        0,
    ));
    let device = Arc::new(Device::new(stack.clone(), addr, UsbSpeed::High, 1, None, pipe));
    manager.add_device(device);
    assert_eq!(manager.device_count(), 1);

    manager.remove_device(addr);
    assert_eq!(manager.device_count(), 0);

    // The address must be reusable once freed.
    let reused = manager.allocate_address().unwrap();
    assert_eq!(reused, addr);
}

#[test]
fn submit_and_cancel_delegate_to_hcd() {
    let (stack, manager) = setup();
    let addr = manager.allocate_address().unwrap();
    let pipe = Pipe::new(
        stack.clone(),
        PipeKind::Bulk,
        addr,
        UsbSpeed::High,
        PipeDirection::Out,
        1,
        512,
        0,
    );
    let (_, phys) = stack.allocate_dma(512).unwrap();
    let transfer = Transfer::new(
        TransferData::Buffer { physical: phys, length: 512 },
        Box::new(|_, _| {}),
    );
    manager.submit_transfer(&pipe, transfer).unwrap();
    manager.cancel_queued_transfers(&pipe, false).unwrap();
}

#[test]
fn exhausting_127_addresses_errors_with_no_memory() {
    let (_stack, manager) = setup();
    for _ in 1..=127 {
        manager.allocate_address().unwrap();
    }
    assert_eq!(manager.allocate_address().unwrap_err(), KError::NoMemory);
}
