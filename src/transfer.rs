//! The unit of work submitted to an `Hcd`: a buffer plus a completion
//! callback. Grounded on the `Transfer` class in `usb_private.h`
//! (`SetData`/`SetPhysical`/`SetVector`/`Bandwidth`/`IsFragmented`/
//! `AdvanceByFragment`/`Finished`).

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::TransferError;
use crate::pipe::{IsoPacketDescriptor, SetupPacket};

/// Called exactly once when a transfer retires, successfully or not.
/// `actual_length` is the number of bytes actually moved (may be less
/// than requested on a short packet, which is not itself an error).
pub type TransferCallback = Box<dyn FnOnce(TransferError, usize) + Send>;

pub enum TransferData {
    /// A single logical buffer, already DMA-mapped by the caller.
    Buffer { physical: u64, length: usize },
    /// A scatter/gather list, used for bulk transfers whose
    /// caller-provided buffer isn't physically contiguous.
    Vector(Vec<(u64, usize)>),
    /// One descriptor per isochronous packet plus the contiguous backing
    /// buffer they all draw from.
    Isochronous { physical: u64, packets: Vec<IsoPacketDescriptor> },
}

pub struct Transfer {
    pub setup: Option<SetupPacket>,
    pub data: TransferData,
    /// Byte offset already consumed by earlier fragments of this same
    /// transfer — an EHCI qTD or xHCI TRB chain may need several hardware
    /// descriptors per `Transfer` when the payload crosses a
    /// max-transfer-size boundary.
    fragment_offset: usize,
    callback: Option<TransferCallback>,
}

impl Transfer {
    pub fn new(data: TransferData, callback: TransferCallback) -> Self {
        Transfer {
            setup: None,
            data,
            fragment_offset: 0,
            callback: Some(callback),
        }
    }

    pub fn with_setup(mut self, setup: SetupPacket) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn total_length(&self) -> usize {
        match &self.data {
            TransferData::Buffer { length, .. } => *length,
            TransferData::Vector(chunks) => chunks.iter().map(|(_, l)| *l).sum(),
            TransferData::Isochronous { packets, .. } => {
                packets.iter().map(|p| p.request_length as usize).sum()
            }
        }
    }

    pub fn is_fragmented(&self, max_hw_transfer: usize) -> bool {
        self.total_length() > max_hw_transfer
    }

    pub fn fragment_offset(&self) -> usize {
        self.fragment_offset
    }

    pub fn advance_by_fragment(&mut self, consumed: usize) {
        self.fragment_offset += consumed;
    }

    /// Invokes the completion callback. An `Hcd` must call this exactly
    /// once per `Transfer`, whether from its interrupt/finisher path or
    /// from `CancelQueuedTransfers`.
    pub fn finished(&mut self, status: TransferError, actual_length: usize) {
        if let Some(cb) = self.callback.take() {
            cb(status, actual_length);
        }
    }
}
