//! Data-toggle bookkeeping and setup-packet encoding, exercised through
//! `Pipe`'s public API the way a control-transfer caller would.

use std::sync::Arc;

use usb_core::pipe::{PipeDirection, PipeKind, SetupPacket};
use usb_core::platform::mock::MockPlatform;
use usb_core::platform::Platform;
use usb_core::stack::Stack;
use usb_core::{Pipe, UsbSpeed};

fn stack() -> Arc<Stack> {
    let platform: Arc<dyn Platform> = Arc::new(MockPlatform::new(1 << 16));
    Arc::new(Stack::new(platform, 64, 4096, 4).unwrap())
}

#[test]
fn new_pipe_starts_at_data0() {
    let pipe = Pipe::new(
        stack(),
        PipeKind::Bulk,
        5,
        UsbSpeed::High,
        PipeDirection::In,
        1,
        512,
        0,
    );
    assert!(!pipe.data_toggle());
}

#[test]
fn toggle_flips_independently_of_reset() {
    let pipe = Pipe::new(
        stack(),
        PipeKind::Bulk,
        5,
        UsbSpeed::High,
        PipeDirection::Out,
        1,
        512,
        0,
    );
    pipe.set_data_toggle(true);
    assert!(pipe.data_toggle());
    pipe.reset_data_toggle();
    assert!(!pipe.data_toggle());
}

#[test]
fn controller_cookie_round_trips() {
    let pipe = Pipe::new(
        stack(),
        PipeKind::Interrupt,
        5,
        UsbSpeed::High,
        PipeDirection::In,
        2,
        64,
        8,
    );
    assert_eq!(pipe.controller_cookie(), 0);
    pipe.set_controller_cookie(17);
    assert_eq!(pipe.controller_cookie(), 17);
}

#[test]
fn setup_packet_direction_bit_and_byte_layout() {
    let get_descriptor = SetupPacket {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0x0000,
        length: 18,
    };
    assert!(get_descriptor.is_device_to_host());
    assert_eq!(
        get_descriptor.to_bytes(),
        [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0]
    );

    let set_address = SetupPacket {
        request_type: 0x00,
        request: 0x05,
        value: 7,
        index: 0,
        length: 0,
    };
    assert!(!set_address.is_device_to_host());
}
