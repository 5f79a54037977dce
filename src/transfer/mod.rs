//! Transfer objects and related types.
//!
//! A [`Transfer`] describes one USB transfer: endpoint, buffer, timeout, and
//! completion callback. Submit it with [`Transfer::submit`], then drive the
//! context's event loop ([`Context::handle_events`][crate::Context::handle_events])
//! until the callback fires with the terminal status.

use std::{
    any::Any,
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use once_cell::sync::OnceCell;

use crate::{
    deadline::Deadline,
    device::DeviceHandle,
    Context, Error, ErrorKind,
};

mod control;
pub use control::{ControlSetup, Direction, SETUP_PACKET_SIZE};
pub(crate) use control::normalize_setup;

/// Endpoint transfer type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EndpointType {
    /// Control endpoint; the buffer starts with the 8-byte SETUP packet.
    Control,

    /// Isochronous endpoint.
    Isochronous,

    /// Bulk endpoint.
    Bulk,

    /// Interrupt endpoint.
    Interrupt,
}

/// Terminal outcome of a transfer, reported through the completion callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer completed without error. For a transfer without
    /// [`TransferFlags::SHORT_NOT_OK`], fewer bytes than requested may have
    /// been transferred.
    Completed,

    /// Transfer failed, or completed short with
    /// [`TransferFlags::SHORT_NOT_OK`] set.
    Error,

    /// Transfer timed out and its cancellation has completed.
    TimedOut,

    /// Transfer was cancelled.
    Cancelled,

    /// Endpoint halted (control request not supported, or bulk/interrupt
    /// endpoint in a STALL condition).
    Stall,

    /// Device was disconnected.
    NoDevice,

    /// The device sent more data than requested.
    Overflow,
}

/// Terminal outcome as reported by the backend: either a user-visible status
/// or the silent sentinel that suppresses callback delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum CompletionStatus {
    Done(TransferStatus),
    Silent,
}

bitflags::bitflags! {
    /// User-settable transfer flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransferFlags: u8 {
        /// Treat a transfer that completes with fewer bytes than requested as
        /// an error: the callback observes [`TransferStatus::Error`] instead
        /// of [`TransferStatus::Completed`].
        const SHORT_NOT_OK = 0x01;
    }
}

/// Per-packet length and result of an isochronous transfer.
#[derive(Copy, Clone, Debug, Default)]
pub struct IsoPacket {
    /// Requested length of this packet's slice of the buffer.
    pub length: u32,

    /// Bytes actually transferred in this packet.
    pub actual_length: u32,

    /// Packet outcome, once the transfer is terminal.
    pub status: Option<TransferStatus>,
}

pub(crate) type Callback = Box<dyn FnMut(&Transfer) + Send>;

pub(crate) struct TransferState {
    pub(crate) flags: TransferFlags,
    pub(crate) timeout: Duration,
    pub(crate) buffer: Vec<u8>,
    pub(crate) actual_length: usize,
    pub(crate) status: Option<TransferStatus>,
    pub(crate) callback: Option<Callback>,
    pub(crate) iso_packets: Vec<IsoPacket>,

    /// Engine-private state: deadline for the current submission and the
    /// scheduler slot. `slot` is `Some` iff the transfer is in flight.
    pub(crate) deadline: Deadline,
    pub(crate) slot: Option<usize>,
    pub(crate) sync_cancel: bool,
}

pub(crate) struct TransferInner {
    pub(crate) handle: DeviceHandle,
    pub(crate) endpoint: u8,
    pub(crate) ep_type: EndpointType,
    pub(crate) state: Mutex<TransferState>,
    pub(crate) backend_data: OnceCell<Box<dyn Any + Send + Sync>>,
}

/// One USB transfer: user-visible description plus the engine's private
/// submission state.
///
/// `Transfer` is a cheaply-cloneable shared handle. The transfer owns its
/// buffer; buffer and transfer are released when the last clone is dropped
/// and the transfer is not in flight.
#[derive(Clone)]
pub struct Transfer {
    pub(crate) inner: Arc<TransferInner>,
}

impl Transfer {
    fn new(
        handle: &DeviceHandle,
        endpoint: u8,
        ep_type: EndpointType,
        buffer: Vec<u8>,
        timeout: Duration,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) -> Transfer {
        Transfer {
            inner: Arc::new(TransferInner {
                handle: handle.clone(),
                endpoint,
                ep_type,
                state: Mutex::new(TransferState {
                    flags: TransferFlags::default(),
                    timeout,
                    buffer,
                    actual_length: 0,
                    status: None,
                    callback: Some(Box::new(callback)),
                    iso_packets: Vec::new(),
                    deadline: Deadline::NONE,
                    slot: None,
                    sync_cancel: false,
                }),
                backend_data: OnceCell::new(),
            }),
        }
    }

    /// Create a control transfer on endpoint 0.
    ///
    /// `buffer` must start with the 8-byte SETUP packet; build it with
    /// [`ControlSetup::buffer_in`] or [`ControlSetup::buffer_out`]. The
    /// SETUP fields are converted to wire byte order by [`submit`][`Self::submit`],
    /// so re-submitting the same transfer requires re-initializing them.
    pub fn control(
        handle: &DeviceHandle,
        buffer: Vec<u8>,
        timeout: Duration,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) -> Transfer {
        Transfer::new(handle, 0, EndpointType::Control, buffer, timeout, callback)
    }

    /// Create a bulk transfer. Direction is taken from bit 7 of `endpoint`.
    pub fn bulk(
        handle: &DeviceHandle,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) -> Transfer {
        Transfer::new(handle, endpoint, EndpointType::Bulk, buffer, timeout, callback)
    }

    /// Create an interrupt transfer. Direction is taken from bit 7 of
    /// `endpoint`.
    pub fn interrupt(
        handle: &DeviceHandle,
        endpoint: u8,
        buffer: Vec<u8>,
        timeout: Duration,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) -> Transfer {
        Transfer::new(
            handle,
            endpoint,
            EndpointType::Interrupt,
            buffer,
            timeout,
            callback,
        )
    }

    /// Create an isochronous transfer with `num_packets` packets of
    /// `packet_length` bytes each. The buffer must hold
    /// `num_packets * packet_length` bytes.
    pub fn isochronous(
        handle: &DeviceHandle,
        endpoint: u8,
        buffer: Vec<u8>,
        num_packets: usize,
        packet_length: u32,
        timeout: Duration,
        callback: impl FnMut(&Transfer) + Send + 'static,
    ) -> Transfer {
        let t = Transfer::new(
            handle,
            endpoint,
            EndpointType::Isochronous,
            buffer,
            timeout,
            callback,
        );
        t.inner.state.lock().unwrap().iso_packets = vec![
            IsoPacket {
                length: packet_length,
                ..IsoPacket::default()
            };
            num_packets
        ];
        t
    }

    pub(crate) fn context(&self) -> Context {
        self.inner.handle.context()
    }

    /// The device handle this transfer targets.
    pub fn device_handle(&self) -> &DeviceHandle {
        &self.inner.handle
    }

    /// Endpoint address, including the direction bit.
    pub fn endpoint(&self) -> u8 {
        self.inner.endpoint
    }

    /// Endpoint transfer type.
    pub fn endpoint_type(&self) -> EndpointType {
        self.inner.ep_type
    }

    /// Transfer direction, from bit 7 of the endpoint address. For control
    /// transfers, the data-stage direction lives in the SETUP packet instead.
    pub fn direction(&self) -> Direction {
        Direction::from_address(self.inner.endpoint)
    }

    /// Terminal status of the most recent submission, or `None` while idle
    /// or in flight.
    pub fn status(&self) -> Option<TransferStatus> {
        self.inner.state.lock().unwrap().status
    }

    /// Bytes transferred by the most recent submission.
    pub fn actual_length(&self) -> usize {
        self.inner.state.lock().unwrap().actual_length
    }

    /// User flags applied to the next submission.
    pub fn flags(&self) -> TransferFlags {
        self.inner.state.lock().unwrap().flags
    }

    /// Set the user flags.
    pub fn set_flags(&self, flags: TransferFlags) {
        self.inner.state.lock().unwrap().flags = flags;
    }

    /// Set the relative timeout for subsequent submissions. Zero means no
    /// timeout.
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.state.lock().unwrap().timeout = timeout;
    }

    /// Number of isochronous packets.
    pub fn num_iso_packets(&self) -> usize {
        self.inner.state.lock().unwrap().iso_packets.len()
    }

    /// Length and result of isochronous packet `index`.
    pub fn iso_packet(&self, index: usize) -> Option<IsoPacket> {
        self.inner.state.lock().unwrap().iso_packets.get(index).copied()
    }

    /// Access the transfer buffer.
    ///
    /// Panics if the transfer is in flight: the kernel owns the buffer from
    /// a successful [`submit`][`Self::submit`] until the completion callback
    /// has run.
    pub fn buffer(&self) -> TransferBuffer<'_> {
        let st = self.inner.state.lock().unwrap();
        assert!(st.slot.is_none(), "transfer buffer accessed while in flight");
        TransferBuffer { st }
    }

    /// Whether the transfer has been accepted by the backend and has not yet
    /// reached a terminal state.
    pub fn is_in_flight(&self) -> bool {
        self.inner.state.lock().unwrap().slot.is_some()
    }

    /// Submit the transfer.
    ///
    /// Resets the transferred-byte count, computes the timeout deadline, and
    /// (for control transfers) converts the SETUP fields to wire byte order
    /// before handing the transfer to the backend. The completion callback
    /// fires exactly once per successful submission, from the thread driving
    /// the event loop.
    pub fn submit(&self) -> Result<(), Error> {
        let ctx = self.context();
        // The scheduler lock spans both the insert and the backend call, so
        // the expiry sweep cannot latch and cancel an entry the backend has
        // not accepted yet.
        let mut inflight = ctx.inner.inflight.lock().unwrap();
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.slot.is_some() {
                return Err(
                    Error::new(ErrorKind::Busy, "transfer is already in flight").log_debug()
                );
            }
            st.actual_length = 0;
            st.status = None;
            for pkt in &mut st.iso_packets {
                pkt.actual_length = 0;
                pkt.status = None;
            }
            if self.inner.ep_type == EndpointType::Control {
                normalize_setup(&mut st.buffer)?;
            }
            let deadline = Deadline::after(st.timeout);
            st.deadline = deadline;
            let slot = inflight.insert(self.clone(), deadline);
            st.slot = Some(slot);
        }

        if let Err(e) = ctx.inner.backend.submit_transfer(self) {
            let mut st = self.inner.state.lock().unwrap();
            if let Some(slot) = st.slot.take() {
                inflight.remove(slot);
            }
            st.deadline = Deadline::NONE;
            return Err(e);
        }
        log::debug!(
            "Submitted {:?} transfer on ep {:02x}",
            self.inner.ep_type,
            self.inner.endpoint
        );
        Ok(())
    }

    /// Request cancellation of an in-flight transfer and return immediately.
    ///
    /// The transfer still completes exactly once through its callback; the
    /// status reported depends on the race between the cancellation and the
    /// transfer's natural completion.
    pub fn cancel(&self) -> Result<(), Error> {
        if self.inner.state.lock().unwrap().slot.is_none() {
            return Err(Error::new(ErrorKind::NotFound, "transfer is not in flight"));
        }
        self.context().inner.backend.cancel_transfer(self)
    }

    /// Cancel an in-flight transfer and block until its terminal state is
    /// reached, driving the event loop from the calling thread.
    ///
    /// The user callback is suppressed for a cancellation that completes
    /// through this call.
    pub fn cancel_sync(&self) -> Result<(), Error> {
        let ctx = self.context();
        {
            let mut st = self.inner.state.lock().unwrap();
            if st.slot.is_none() {
                return Err(Error::new(ErrorKind::NotFound, "transfer is not in flight"));
            }
            st.sync_cancel = true;
        }
        if let Err(e) = ctx.inner.backend.cancel_transfer(self) {
            self.inner.state.lock().unwrap().sync_cancel = false;
            return Err(e);
        }
        while self.inner.state.lock().unwrap().sync_cancel {
            ctx.handle_events()?;
        }
        Ok(())
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.state.lock().unwrap();
        f.debug_struct("Transfer")
            .field("endpoint", &self.inner.endpoint)
            .field("ep_type", &self.inner.ep_type)
            .field("status", &st.status)
            .field("actual_length", &st.actual_length)
            .field("in_flight", &st.slot.is_some())
            .finish()
    }
}

/// Guard providing access to a transfer's buffer while it is not in flight.
pub struct TransferBuffer<'a> {
    st: MutexGuard<'a, TransferState>,
}

impl Deref for TransferBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.st.buffer
    }
}

impl DerefMut for TransferBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.st.buffer
    }
}
