//! Host-side USB bus manager core: EHCI (USB 2.0) and xHCI (USB 3.x)
//! transfer engines sharing one DMA buddy allocator and USB object model.
//!
//! This crate does not enumerate devices, emulate root-hub class requests,
//! or bind drivers — those are external collaborators (see `Stack::driver
//! hooks` and the `Hcd` trait). It owns the parts where concurrency,
//! ordering against hardware, and DMA safety actually live: submitting and
//! retiring transfers through the controllers' ring/queue structures.

#![no_std]
#![allow(dead_code)]

extern crate alloc;
#[cfg(any(test, feature = "test-utils"))]
extern crate std;

pub mod bus_manager;
pub mod device;
pub mod ehci;
pub mod error;
pub mod hcd;
pub mod object;
pub mod pci;
pub mod pipe;
pub mod pma;
pub mod platform;
pub mod stack;
pub mod sync;
pub mod transfer;
pub mod xhci;

pub use bus_manager::BusManager;
pub use device::Device;
pub use error::{KError, KResult, TransferError};
pub use hcd::Hcd;
pub use object::Object;
pub use pipe::{Pipe, PipeDirection, PipeKind};
pub use platform::Platform;
pub use stack::Stack;
pub use transfer::Transfer;

/// USB signaling speed, shared by EHCI (Low/Full/High) and xHCI (adds
/// Super/SuperPlus).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl UsbSpeed {
    /// Decode an xHCI port-speed-ID (PORTSC bits 13:10, protocol-specific).
    pub fn from_xhci_speed(speed: u8) -> Self {
        match speed {
            1 => UsbSpeed::Full,
            2 => UsbSpeed::Low,
            3 => UsbSpeed::High,
            4 => UsbSpeed::Super,
            5 => UsbSpeed::SuperPlus,
            _ => UsbSpeed::Full,
        }
    }

    /// EP0 max packet size mandated by the USB specification for this
    /// speed (used at `AddressDevice` time before the real descriptor is
    /// read back).
    pub fn default_control_max_packet(self) -> u16 {
        match self {
            UsbSpeed::Low => 8,
            UsbSpeed::Full => 8,
            UsbSpeed::High => 64,
            UsbSpeed::Super | UsbSpeed::SuperPlus => 512,
        }
    }
}

/// A stable 32-bit USB object id, issued by `Stack::get_usb_id`.
pub type UsbId = u32;

/// Sentinel returned once an id has been released.
pub const USB_ID_NONE: UsbId = u32::MAX;
