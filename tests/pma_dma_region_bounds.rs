//! `Stack`-level DMA allocation patterns mirroring real EHCI/xHCI usage:
//! a 64-byte qTD/TRB-sized allocation alongside a 20480-byte bulk buffer,
//! exhaustion of a deliberately small region, and rejection of
//! mismatched-size deallocation.

use std::sync::Arc;

use usb_core::error::KError;
use usb_core::platform::mock::MockPlatform;
use usb_core::platform::Platform;
use usb_core::stack::Stack;

#[test]
fn mixed_size_allocations_stay_disjoint() {
    let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(4 << 20));
    let stack = Stack::new(platform, 64, 20480, 8).unwrap();

    let (small_logical, small_phys) = stack.allocate_dma(64).unwrap();
    let (big_logical, big_phys) = stack.allocate_dma(20480).unwrap();

    assert_ne!(small_phys, big_phys);
    let small_end = small_phys + 64;
    let big_end = big_phys + 20480;
    assert!(small_end <= big_phys || big_end <= small_phys);

    stack.free_dma(64, small_logical, small_phys).unwrap();
    stack.free_dma(20480, big_logical, big_phys).unwrap();
}

#[test]
fn exhausted_region_reports_no_memory() {
    // Exactly two 4096-byte slots: the third allocation at that size must
    // fail once both are taken, instead of spinning forever.
    let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(1 << 16));
    let stack = Stack::new(platform, 4096, 4096, 2).unwrap();

    assert!(stack.allocate_dma(4096).is_ok());
    assert!(stack.allocate_dma(4096).is_ok());
    assert_eq!(stack.allocate_dma(4096).unwrap_err(), KError::NoMemory);
}

#[test]
fn oversized_request_is_rejected_before_touching_the_allocator() {
    let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(1 << 20));
    let stack = Stack::new(platform, 64, 4096, 4).unwrap();
    assert_eq!(stack.allocate_dma(1 << 20).unwrap_err(), KError::BadValue);
}

#[test]
fn freed_block_can_be_reallocated() {
    // Two slots, both taken, then one freed: the next allocation has only
    // one candidate left and must land on exactly the freed address.
    let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(1 << 16));
    let stack = Stack::new(platform, 4096, 4096, 2).unwrap();

    let (first_logical, first_phys) = stack.allocate_dma(4096).unwrap();
    let (_second_logical, _second_phys) = stack.allocate_dma(4096).unwrap();

    stack.free_dma(4096, first_logical, first_phys).unwrap();
    let (_, reused_phys) = stack.allocate_dma(4096).unwrap();
    assert_eq!(reused_phys, first_phys);
}
