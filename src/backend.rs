//! The capability set the engine requires from an OS backend.

use std::sync::Arc;

use crate::{
    descriptors::DESCRIPTOR_LEN_DEVICE,
    device::{DeviceInner, HandleInner},
    events::PollFd,
    transfer::Transfer,
    Context, Error, ErrorKind,
};

/// Operations the engine delegates to the OS transport.
///
/// One backend implementation is selected per [`Context`]. The backend calls
/// back into the engine through the `Context` helpers: `alloc_device`,
/// `device_by_session_id`, and `sanitize_device` during enumeration;
/// `handle_transfer_completion` and `handle_transfer_cancellation` when a
/// submitted transfer reaches a terminal state; `add_poll_fd` and
/// `remove_poll_fd` to maintain the descriptor set the event loop watches.
///
/// Backend-private state hangs off the `backend_data` slot of devices,
/// handles, and transfers.
pub(crate) trait Backend: Send + Sync {
    /// Called once when the context is created.
    fn init(&self, _ctx: &Context) -> Result<(), Error> {
        Ok(())
    }

    /// Called when the context is released.
    fn exit(&self) {}

    /// Enumerate devices currently on the buses. Known devices are looked up
    /// by session ID so re-scans return the same shared device; new devices
    /// are allocated, populated, and sanitized before being returned.
    fn scan_devices(&self, ctx: &Context) -> Result<Vec<Arc<DeviceInner>>, Error>;

    /// Open the OS transport for a device, storing what is needed in the
    /// handle's `backend_data`.
    fn open(&self, handle: &Arc<HandleInner>) -> Result<(), Error>;

    /// Close the OS transport. Invoked exactly once per successfully opened
    /// handle.
    fn close(&self, handle: &HandleInner);

    /// Raw device descriptor in wire (little-endian) byte order.
    fn device_descriptor(&self, device: &DeviceInner)
        -> Result<[u8; DESCRIPTOR_LEN_DEVICE], Error>;

    /// Raw bytes of the active configuration descriptor.
    fn active_config_descriptor(&self, device: &DeviceInner) -> Result<Vec<u8>, Error>;

    /// Set the device configuration; `None` puts the device in the
    /// unconfigured state.
    fn set_configuration(&self, handle: &HandleInner, config: Option<u8>) -> Result<(), Error>;

    fn claim_interface(&self, handle: &HandleInner, interface: u8) -> Result<(), Error>;

    fn release_interface(&self, handle: &HandleInner, interface: u8) -> Result<(), Error>;

    fn set_interface_alt_setting(
        &self,
        handle: &HandleInner,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), Error>;

    fn clear_halt(&self, handle: &HandleInner, endpoint: u8) -> Result<(), Error>;

    fn reset_device(&self, handle: &HandleInner) -> Result<(), Error>;

    /// Whether a kernel driver is bound to the interface. Optional.
    fn kernel_driver_active(&self, _handle: &HandleInner, _interface: u8) -> Result<bool, Error> {
        Err(Error::new(
            ErrorKind::NotSupported,
            "kernel driver queries are not supported by this backend",
        ))
    }

    /// Unbind the kernel driver from the interface. Optional.
    fn detach_kernel_driver(&self, _handle: &HandleInner, _interface: u8) -> Result<(), Error> {
        Err(Error::new(
            ErrorKind::NotSupported,
            "kernel driver detach is not supported by this backend",
        ))
    }

    /// Hand a prepared transfer to the OS. On error the engine unwinds the
    /// submission; on success the transfer stays in flight until reported
    /// terminal through the completion helpers.
    fn submit_transfer(&self, transfer: &Transfer) -> Result<(), Error>;

    /// Request cancellation of an in-flight transfer. The cancellation
    /// completes asynchronously: the backend reports it from `handle_events`,
    /// never from within this call.
    fn cancel_transfer(&self, transfer: &Transfer) -> Result<(), Error>;

    /// Process I/O readiness on the given descriptors, reporting terminal
    /// transfers through the completion helpers.
    fn handle_events(&self, ctx: &Context, ready: &[PollFd]) -> Result<(), Error>;

    /// Release backend resources for a device. Invoked exactly once, when the
    /// last reference to the device is dropped.
    fn destroy_device(&self, device: &DeviceInner);
}
