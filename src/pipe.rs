//! Pipe hierarchy: `Control`/`Bulk`/`Interrupt`/`Isochronous`, grounded on
//! the `Pipe`/`ControlPipe`/`BulkPipe`/`InterruptPipe`/`IsochronousPipe`
//! classes in `usb_private.h`, collapsed into a closed `enum` of pipe
//! kinds rather than a class hierarchy, since every concrete kind is
//! known up front and an `Hcd` needs to match on it to pick a ring/
//! queue-head layout.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::error::{KError, KResult, TransferError};
use crate::hcd::Hcd;
use crate::object::{Object, ObjectState};
use crate::stack::Stack;
use crate::sync::IrqSafeMutex;
use crate::transfer::{Transfer, TransferCallback, TransferData};
use crate::UsbSpeed;

/// How long `send_request` waits before rescanning the completion slot
/// `queue_request`'s callback fills — the same bounded-poll substitute for
/// a blocking wait primitive the PMA's allocator uses (see DESIGN.md).
const SEND_REQUEST_POLL_US: u64 = 200;
const SEND_REQUEST_MAX_POLLS: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    Out,
    In,
    /// Control pipes carry both directions; the direction is taken from
    /// each request's `bmRequestType` instead of being fixed per pipe.
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeKind {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// Per-endpoint scheduling/addressing info shared by every pipe kind.
pub struct Pipe {
    object: ObjectState,
    kind: PipeKind,
    device_address: u8,
    speed: UsbSpeed,
    direction: PipeDirection,
    endpoint_address: u8,
    max_packet_size: u16,
    /// Max Burst Size from the endpoint companion descriptor (USB3 bulk/
    /// interrupt only); 0 means a burst of one packet. Set via
    /// `with_max_burst` since only SuperSpeed endpoints carry one.
    max_burst: u8,
    /// Polling interval in frames (EHCI) or 125us units (xHCI), as handed
    /// to the HCD; the HCD is responsible for converting to its own units.
    interval: u8,
    data_toggle: AtomicBool,
    /// Opaque handle the owning `Hcd` stashes its ring/queue-head index in
    /// (e.g. an EHCI `QueueHead` slot or an xHCI endpoint number). Never
    /// interpreted by this module.
    controller_cookie: AtomicU8,
}

impl Pipe {
    pub fn new(
        stack: Arc<Stack>,
        kind: PipeKind,
        device_address: u8,
        speed: UsbSpeed,
        direction: PipeDirection,
        endpoint_address: u8,
        max_packet_size: u16,
        interval: u8,
    ) -> Self {
        Pipe {
            object: ObjectState::new(stack),
            kind,
            device_address,
            speed,
            direction,
            endpoint_address,
            max_packet_size,
            max_burst: 0,
            interval,
            data_toggle: AtomicBool::new(false),
            controller_cookie: AtomicU8::new(0),
        }
    }

    pub fn with_max_burst(mut self, max_burst: u8) -> Self {
        self.max_burst = max_burst;
        self
    }

    pub fn kind(&self) -> PipeKind {
        self.kind
    }

    pub fn device_address(&self) -> u8 {
        self.device_address
    }

    pub fn speed(&self) -> UsbSpeed {
        self.speed
    }

    pub fn direction(&self) -> PipeDirection {
        self.direction
    }

    pub fn endpoint_address(&self) -> u8 {
        self.endpoint_address
    }

    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub fn max_burst(&self) -> u8 {
        self.max_burst
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }

    pub fn data_toggle(&self) -> bool {
        self.data_toggle.load(Ordering::SeqCst)
    }

    pub fn set_data_toggle(&self, value: bool) {
        self.data_toggle.store(value, Ordering::SeqCst);
    }

    /// A control transfer's status stage and a cleared STALL both reset
    /// the toggle to DATA0 (`Pipe::SetDataToggle(false)` call sites in
    /// Haiku's `ControlPipe::SendRequest`/`ClearStall` paths).
    pub fn reset_data_toggle(&self) {
        self.set_data_toggle(false);
    }

    pub fn controller_cookie(&self) -> u8 {
        self.controller_cookie.load(Ordering::SeqCst)
    }

    pub fn set_controller_cookie(&self, value: u8) {
        self.controller_cookie.store(value, Ordering::SeqCst);
    }

    /// Builds and submits a control transfer for one request, mirroring
    /// `ControlPipe::QueueRequest`. `data` is `(physical address, length)`
    /// for a request that moves a payload, `None` for a no-data request.
    /// `callback` runs exactly once, from whatever context the owning
    /// `Hcd` retires the transfer in.
    pub fn queue_request(
        &self,
        hcd: &dyn Hcd,
        setup: SetupPacket,
        data: Option<(u64, usize)>,
        callback: TransferCallback,
    ) -> KResult<()> {
        let (physical, length) = data.unwrap_or((0, 0));
        let transfer = Transfer::new(TransferData::Buffer { physical, length }, callback).with_setup(setup);
        hcd.submit_transfer(self, transfer)
    }

    /// Blocking wrapper over `queue_request`, mirroring
    /// `ControlPipe::SendRequest`'s semaphore-wait-for-callback pattern:
    /// Haiku blocks on a `sem_id` that `SendRequestCallback` releases,
    /// this polls a shared slot the callback fills, driven by
    /// `Platform::sleep_us` like the PMA's own wait loop.
    pub fn send_request(
        &self,
        hcd: &dyn Hcd,
        setup: SetupPacket,
        data: Option<(u64, usize)>,
    ) -> KResult<(TransferError, usize)> {
        let outcome: Arc<IrqSafeMutex<Option<(TransferError, usize)>>> = Arc::new(IrqSafeMutex::new(None));
        let outcome_cb = outcome.clone();
        let platform = self.object.stack().platform().clone();
        self.queue_request(
            hcd,
            setup,
            data,
            Box::new(move |status, actual_length| {
                *outcome_cb.lock(&*platform) = Some((status, actual_length));
            }),
        )?;

        let platform = self.object.stack().platform().clone();
        for _ in 0..SEND_REQUEST_MAX_POLLS {
            if let Some(result) = *outcome.lock(&*platform) {
                return Ok(result);
            }
            platform.sleep_us(SEND_REQUEST_POLL_US);
        }
        Err(KError::Timeout)
    }
}

impl Object for Pipe {
    fn object_state(&self) -> &ObjectState {
        &self.object
    }
}

/// A single USB "setup packet" for control transfers.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0] = self.request_type;
        b[1] = self.request;
        b[2..4].copy_from_slice(&self.value.to_le_bytes());
        b[4..6].copy_from_slice(&self.index.to_le_bytes());
        b[6..8].copy_from_slice(&self.length.to_le_bytes());
        b
    }
}

/// One packet description within an isochronous transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsoPacketDescriptor {
    pub request_length: u32,
    pub actual_length: u32,
    pub status: crate::error::TransferError,
}
