//! URB construction, submission, and reaping.
//!
//! Each submission allocates a URB block (the URB header plus the trailing
//! isochronous packet descriptors) that the kernel owns until the URB is
//! reaped or the submit fails. The URB's `usercontext` carries a raw `Arc`
//! reference to the transfer, keeping it alive while the kernel holds the
//! URB and recovering it at reap time.

use std::{
    ffi::{c_int, c_void},
    mem::size_of,
    sync::{Arc, Mutex},
};

use log::debug;
use rustix::io::Errno;

use super::{usbfs, with_fd};
use super::usbfs::{
    IsoPacketDesc, Urb, USBDEVFS_URB_ISO_ASAP, USBDEVFS_URB_TYPE_BULK, USBDEVFS_URB_TYPE_CONTROL,
    USBDEVFS_URB_TYPE_INTERRUPT, USBDEVFS_URB_TYPE_ISO,
};
use crate::{
    transfer::{CompletionStatus, EndpointType, Transfer, TransferInner, TransferStatus},
    Context, Error, ErrorKind,
};

/// Heap allocation holding a URB followed by its isochronous packet
/// descriptors. `u64` storage keeps the URB's pointer fields aligned. The
/// backing memory is stable for the life of the block, so the kernel may hold
/// the pointer while the block sits in the transfer's backend slot.
pub(super) struct UrbBlock {
    mem: Vec<u64>,
    num_iso: usize,
}

impl UrbBlock {
    fn new(num_iso: usize) -> UrbBlock {
        let bytes = size_of::<Urb>() + num_iso * size_of::<IsoPacketDesc>();
        UrbBlock {
            mem: vec![0u64; bytes.div_ceil(size_of::<u64>())],
            num_iso,
        }
    }

    fn urb_ptr(&self) -> *mut Urb {
        self.mem.as_ptr() as *mut Urb
    }

    /// SAFETY: the kernel must not be mutating the block concurrently.
    unsafe fn iso_descs(&self) -> *mut IsoPacketDesc {
        unsafe { self.urb_ptr().add(1) as *mut IsoPacketDesc }
    }
}

type UrbSlot = Mutex<Option<UrbBlock>>;

fn urb_slot(transfer: &Transfer) -> &UrbSlot {
    transfer
        .inner
        .backend_data
        .get_or_init(|| Box::new(UrbSlot::new(None)))
        .downcast_ref::<UrbSlot>()
        .expect("transfer backend slot holds the URB block")
}

pub(super) fn submit(transfer: &Transfer) -> Result<(), Error> {
    let ep_type = match transfer.inner.ep_type {
        EndpointType::Control => USBDEVFS_URB_TYPE_CONTROL,
        EndpointType::Isochronous => USBDEVFS_URB_TYPE_ISO,
        EndpointType::Bulk => USBDEVFS_URB_TYPE_BULK,
        EndpointType::Interrupt => USBDEVFS_URB_TYPE_INTERRUPT,
    };

    let (buffer_ptr, buffer_len, iso_lengths) = {
        let st = transfer.inner.state.lock().unwrap();
        let lengths: Vec<u32> = st.iso_packets.iter().map(|p| p.length).collect();
        (st.buffer.as_ptr() as *mut u8, st.buffer.len(), lengths)
    };
    let buffer_length: c_int = buffer_len
        .try_into()
        .map_err(|_| Error::new(ErrorKind::InvalidParam, "buffer too large for a URB"))?;

    let block = UrbBlock::new(iso_lengths.len());
    let urb = block.urb_ptr();

    // One reference travels with the URB through the kernel.
    let usercontext = Arc::into_raw(transfer.inner.clone()) as *mut c_void;

    // SAFETY: the block was just allocated and is not yet shared with the
    // kernel. The buffer pointer stays valid while the transfer is in
    // flight: the engine blocks buffer access and re-submission until the
    // terminal state is reported.
    unsafe {
        *urb = Urb {
            ep_type,
            endpoint: transfer.inner.endpoint,
            status: 0,
            flags: if iso_lengths.is_empty() {
                0
            } else {
                USBDEVFS_URB_ISO_ASAP
            },
            buffer: buffer_ptr,
            buffer_length,
            actual_length: 0,
            start_frame: 0,
            number_of_packets_or_stream_id: iso_lengths.len() as u32,
            error_count: 0,
            signr: 0,
            usercontext,
        };
        let descs = block.iso_descs();
        for (i, len) in iso_lengths.iter().enumerate() {
            *descs.add(i) = IsoPacketDesc {
                length: *len,
                actual_length: 0,
                status: 0,
            };
        }
    }

    *urb_slot(transfer).lock().unwrap() = Some(block);

    let submitted = with_fd(
        &transfer.inner.handle.inner,
        "failed to submit transfer",
        // SAFETY: urb points into the block now held by the transfer's
        // backend slot, which outlives the submission
        |fd| unsafe { usbfs::submit_urb(fd, urb) },
    );

    if let Err(e) = submitted {
        // The kernel never saw the URB; take back its reference and the block.
        *urb_slot(transfer).lock().unwrap() = None;
        // SAFETY: reclaims the reference taken above
        drop(unsafe { Arc::from_raw(usercontext as *const TransferInner) });
        debug!(
            "Failed to submit URB on ep {:02x}: {e}",
            transfer.inner.endpoint
        );
        return Err(e);
    }
    debug!("Submitted URB {urb:?} on ep {:02x}", transfer.inner.endpoint);
    Ok(())
}

pub(super) fn cancel(transfer: &Transfer) -> Result<(), Error> {
    let slot = urb_slot(transfer).lock().unwrap();
    let Some(block) = slot.as_ref() else {
        return Err(Error::new(ErrorKind::NotFound, "transfer is not submitted"));
    };
    let urb = block.urb_ptr();
    with_fd(
        &transfer.inner.handle.inner,
        "failed to cancel transfer",
        // SAFETY: the block stays alive until the URB is reaped
        |fd| unsafe { usbfs::discard_urb(fd, urb) },
    )
}

/// Dispatch a URB returned by `REAPURBNDELAY`.
///
/// SAFETY: `urb` must be a pointer previously passed to `submit`, and the
/// kernel must no longer dereference it or its buffer.
pub(super) unsafe fn complete_reaped_urb(ctx: &Context, urb: *mut Urb) {
    // SAFETY: usercontext carries the reference taken at submit
    let transfer = Transfer {
        inner: unsafe { Arc::from_raw((*urb).usercontext as *const TransferInner) },
    };

    let (status, actual_length, iso_results) = {
        // SAFETY: the kernel is done with the URB; the block is still held
        // by the transfer's backend slot
        let urb = unsafe { &*urb };
        debug!(
            "URB for ep {:02x} completed, status={} actual_length={}",
            urb.endpoint, urb.status, urb.actual_length
        );
        let iso_results = if urb.ep_type == USBDEVFS_URB_TYPE_ISO {
            let slot = urb_slot(&transfer).lock().unwrap();
            let block = slot.as_ref().expect("reaped URB has a live block");
            // SAFETY: reaped, so the kernel no longer writes the descriptors
            let descs = unsafe {
                std::slice::from_raw_parts(block.iso_descs() as *const IsoPacketDesc, block.num_iso)
            };
            descs.to_vec()
        } else {
            Vec::new()
        };
        (urb.status, urb.actual_length.max(0) as usize, iso_results)
    };

    {
        let mut st = transfer.inner.state.lock().unwrap();
        st.actual_length = actual_length;
        if !iso_results.is_empty() {
            for (pkt, desc) in st.iso_packets.iter_mut().zip(&iso_results) {
                pkt.actual_length = desc.actual_length;
                pkt.status = Some(urb_status(desc.status as c_int));
            }
            st.actual_length = iso_results.iter().map(|d| d.actual_length as usize).sum();
        }
    }

    // Release the URB block before reporting, so the callback may resubmit.
    *urb_slot(&transfer).lock().unwrap() = None;

    if status != 0
        && matches!(
            Errno::from_raw_os_error(status.abs()),
            Errno::NOENT | Errno::CONNRESET
        )
    {
        ctx.handle_transfer_cancellation(&transfer);
    } else {
        ctx.handle_transfer_completion(&transfer, CompletionStatus::Done(urb_status(status)));
    }
}

fn urb_status(status: c_int) -> TransferStatus {
    if status == 0 {
        return TransferStatus::Completed;
    }

    // It's sometimes positive, sometimes negative, but rustix panics if negative.
    match Errno::from_raw_os_error(status.abs()) {
        Errno::NODEV | Errno::SHUTDOWN => TransferStatus::NoDevice,
        Errno::PIPE => TransferStatus::Stall,
        Errno::OVERFLOW => TransferStatus::Overflow,
        Errno::NOENT | Errno::CONNRESET => TransferStatus::Cancelled,
        _ => TransferStatus::Error,
    }
}
