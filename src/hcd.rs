//! Common surface both the EHCI and xHCI controllers present to
//! `BusManager`: a small trait, used as a `&dyn` object, matching how
//! `Platform` is used elsewhere in this crate.

use crate::error::KResult;
use crate::pipe::Pipe;
use crate::transfer::Transfer;

pub trait Hcd: Send + Sync {
    /// Brings the controller out of reset and starts the async/periodic
    /// schedules (EHCI) or the command/event rings (xHCI).
    fn start(&self) -> KResult<()>;

    /// Halts the controller. Queued transfers are canceled as if
    /// `cancel_queued_transfers` had been called on every pipe.
    fn stop(&self) -> KResult<()>;

    /// Enqueues `transfer` onto `pipe`'s hardware schedule. Returns once
    /// the transfer has been linked; completion is asynchronous via
    /// `transfer.finished`.
    fn submit_transfer(&self, pipe: &Pipe, transfer: Transfer) -> KResult<()>;

    /// Unlinks every transfer queued on `pipe` and retires each with
    /// `TransferError::Canceled`. If `force` is set the HCD does not wait
    /// for in-flight hardware completion before retiring (used when the
    /// pipe's device has already been disconnected).
    fn cancel_queued_transfers(&self, pipe: &Pipe, force: bool) -> KResult<()>;

    /// Number of root-hub ports this controller exposes. Port status and
    /// reset sequencing beyond what `AddressDevice`/enumeration needs is
    /// out of scope (root-hub class emulation is an external
    /// collaborator).
    fn port_count(&self) -> u8;
}
