use std::{
    collections::HashMap,
    sync::{atomic::AtomicBool, Arc, Mutex, Weak},
};

use log::debug;
use once_cell::sync::OnceCell;

use crate::{
    backend::Backend,
    deadline::Deadline,
    descriptors::{DeviceDescriptor, MAX_CONFIGURATIONS},
    device::{Device, DeviceHandle, DeviceInner, WeakHandle},
    events::{PollFd, PollFdNotifiers},
    inflight::InflightQueue,
    transfer::{
        CompletionStatus, EndpointType, Transfer, TransferFlags, TransferStatus, SETUP_PACKET_SIZE,
    },
    Error, ErrorKind,
};

// Lock ordering: the `inflight` scheduler lock may be taken before a
// transfer's state lock, never the reverse; `devices` and `handles` nest
// inside nothing. `inflight` is the one lock held across a backend call
// (submit, so the expiry sweep cannot see an unaccepted entry); no lock is
// held across the poll syscall or a user callback.
pub(crate) struct ContextInner {
    pub(crate) backend: Arc<dyn Backend>,

    /// Device registry: weak membership keyed by backend session ID. Strong
    /// references live in user code and in open handles.
    pub(crate) devices: Mutex<HashMap<u64, Weak<DeviceInner>>>,

    /// Table of open handles, for diagnostics; handles delink on close.
    pub(crate) handles: Mutex<Vec<WeakHandle>>,

    /// Transfers accepted by the backend and not yet terminal, ordered by
    /// deadline.
    pub(crate) inflight: Mutex<InflightQueue>,

    /// File descriptors the event loop must watch.
    pub(crate) poll_fds: Mutex<Vec<PollFd>>,
    pub(crate) notifiers: Mutex<PollFdNotifiers>,

    /// Set while a thread is inside `handle_events_timeout`; a second driver
    /// fails with `Busy` instead of racing the first.
    pub(crate) driving: AtomicBool,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.backend.exit();
        debug!("Context released");
    }
}

/// Library context: the root object owning the device registry, the transfer
/// engine, and the OS backend.
///
/// `Context` is a cheaply-cloneable handle; devices, device handles, and
/// transfers keep their context alive, so the backend is torn down only after
/// everything created from it is gone.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    /// Create a context backed by the platform's USB transport.
    pub fn new() -> Result<Context, Error> {
        Context::with_backend(crate::platform::default_backend())
    }

    pub(crate) fn with_backend(backend: Arc<dyn Backend>) -> Result<Context, Error> {
        let ctx = Context {
            inner: Arc::new(ContextInner {
                backend,
                devices: Mutex::new(HashMap::new()),
                handles: Mutex::new(Vec::new()),
                inflight: Mutex::new(InflightQueue::new()),
                poll_fds: Mutex::new(Vec::new()),
                notifiers: Mutex::new(PollFdNotifiers::default()),
                driving: AtomicBool::new(false),
            }),
        };
        ctx.inner.backend.clone().init(&ctx)?;
        Ok(ctx)
    }

    /// Enumerate the USB devices currently attached.
    ///
    /// Each entry holds one reference; drop the vector to release them. A
    /// device that was returned by an earlier enumeration and is still
    /// referenced is returned as the same shared [`Device`].
    pub fn devices(&self) -> Result<Vec<Device>, Error> {
        let found = self.inner.backend.clone().scan_devices(self)?;
        debug!("Enumerated {} devices", found.len());
        Ok(found.into_iter().map(|inner| Device { inner }).collect())
    }

    /// Find the first device with the given vendor and product IDs and open
    /// it.
    pub fn open_device_with_vid_pid(
        &self,
        vendor_id: u16,
        product_id: u16,
    ) -> Result<DeviceHandle, Error> {
        self.devices()?
            .into_iter()
            .find(|d| d.vendor_id() == vendor_id && d.product_id() == product_id)
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    "no attached device matches the given vendor and product IDs",
                )
            })?
            .open()
    }

    /// Create a device with one reference and publish it in the registry
    /// under its session ID.
    pub(crate) fn alloc_device(
        &self,
        session_id: u64,
        bus_number: u8,
        device_address: u8,
    ) -> Arc<DeviceInner> {
        let dev = Arc::new(DeviceInner {
            ctx: self.inner.clone(),
            session_id,
            bus_number,
            device_address,
            descriptor: OnceCell::new(),
            backend_data: OnceCell::new(),
        });
        self.inner
            .devices
            .lock()
            .unwrap()
            .insert(session_id, Arc::downgrade(&dev));
        debug!("New device bus {bus_number} addr {device_address} (session {session_id:#x})");
        dev
    }

    /// Look up a registered device by session ID, taking a new reference.
    pub(crate) fn device_by_session_id(&self, session_id: u64) -> Option<Arc<DeviceInner>> {
        self.inner
            .devices
            .lock()
            .unwrap()
            .get(&session_id)
            .and_then(Weak::upgrade)
    }

    /// Validate a freshly allocated device before it is published to users:
    /// read its descriptor through the backend and reject devices reporting
    /// an out-of-spec number of configurations.
    pub(crate) fn sanitize_device(&self, dev: &Arc<DeviceInner>) -> Result<(), Error> {
        let raw = self.inner.backend.device_descriptor(dev)?;
        let desc = DeviceDescriptor::new(&raw)
            .ok_or_else(|| Error::new(ErrorKind::Io, "malformed device descriptor"))?;
        let configs = desc.num_configurations();
        if configs == 0 || configs > MAX_CONFIGURATIONS {
            return Err(Error::new(
                ErrorKind::Io,
                "device reports an invalid number of configurations",
            )
            .log_debug());
        }
        dev.descriptor.set(desc).ok();
        Ok(())
    }

    /// Report a submitted transfer as terminal. Delinks it from the
    /// scheduler, publishes status and length, and fires the user callback
    /// (unless the status is the silent sentinel).
    pub(crate) fn handle_transfer_completion(&self, transfer: &Transfer, status: CompletionStatus) {
        let callback = {
            let mut inflight = self.inner.inflight.lock().unwrap();
            let mut st = transfer.inner.state.lock().unwrap();
            if let Some(slot) = st.slot.take() {
                inflight.remove(slot);
            }
            drop(inflight);
            st.deadline = Deadline::NONE;
            st.sync_cancel = false;

            let (final_status, silent) = match status {
                CompletionStatus::Silent => (TransferStatus::Cancelled, true),
                CompletionStatus::Done(mut s) => {
                    if s == TransferStatus::Completed
                        && st.flags.contains(TransferFlags::SHORT_NOT_OK)
                    {
                        let requested = match transfer.inner.ep_type {
                            EndpointType::Control => {
                                st.buffer.len().saturating_sub(SETUP_PACKET_SIZE)
                            }
                            _ => st.buffer.len(),
                        };
                        if st.actual_length < requested {
                            debug!(
                                "Transfer on ep {:02x} completed short: {} of {} bytes",
                                transfer.inner.endpoint, st.actual_length, requested
                            );
                            s = TransferStatus::Error;
                        }
                    }
                    (s, false)
                }
            };
            st.status = Some(final_status);
            debug!(
                "Transfer on ep {:02x} finished: {:?}, {} bytes",
                transfer.inner.endpoint, final_status, st.actual_length
            );
            if silent {
                None
            } else {
                st.callback.take()
            }
        };

        if let Some(mut callback) = callback {
            callback(transfer);
            // Put the callback back for a potential re-submit, unless the
            // callback itself installed a new one.
            let mut st = transfer.inner.state.lock().unwrap();
            if st.callback.is_none() {
                st.callback = Some(callback);
            }
        }
    }

    /// Report that an in-flight transfer's cancellation has completed. The
    /// status delivered depends on why the transfer was cancelled: silently
    /// for a synchronous cancel, `TimedOut` for a deadline-induced cancel,
    /// `Cancelled` otherwise.
    pub(crate) fn handle_transfer_cancellation(&self, transfer: &Transfer) {
        let status = {
            let inflight = self.inner.inflight.lock().unwrap();
            let st = transfer.inner.state.lock().unwrap();
            let timed_out = st.slot.is_some_and(|slot| inflight.is_timed_out(slot));
            if st.sync_cancel {
                CompletionStatus::Silent
            } else if timed_out {
                CompletionStatus::Done(TransferStatus::TimedOut)
            } else {
                CompletionStatus::Done(TransferStatus::Cancelled)
            }
        };
        self.handle_transfer_completion(transfer, status);
    }
}
