//! Backend for the Linux/Android usbfs interface.
//!
//! Devices appear as character device nodes under `/dev/bus/usb/BBB/DDD`.
//! Reading a node yields the device's descriptors; ioctls on an opened node
//! claim interfaces and submit URBs. URB completion readiness is signalled
//! as `POLLOUT` on the node's descriptor.

mod transfer;
mod usbfs;

use std::{
    fs,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use log::{debug, error, warn};
use rustix::{
    fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    fs::{Mode, OFlags},
    io::Errno,
};

use crate::{
    backend::Backend,
    descriptors::{config_total_length, DESCRIPTOR_LEN_DEVICE},
    device::{DeviceInner, HandleInner},
    events::{PollEvents, PollFd},
    transfer::Transfer,
    Context, Error, ErrorKind,
};

const USB_DEV_DIR: &str = "/dev/bus/usb";

pub(crate) fn default_backend() -> Arc<dyn Backend> {
    Arc::new(UsbfsBackend)
}

pub(crate) fn errno_to_error(errno: Errno, message: &'static str) -> Error {
    let kind = match errno {
        Errno::ACCESS | Errno::PERM => ErrorKind::Access,
        Errno::NODEV | Errno::NXIO => ErrorKind::NoDevice,
        Errno::NOENT => ErrorKind::NotFound,
        Errno::BUSY => ErrorKind::Busy,
        Errno::TIMEDOUT => ErrorKind::Timeout,
        Errno::OVERFLOW => ErrorKind::Overflow,
        Errno::PIPE => ErrorKind::Pipe,
        Errno::INTR => ErrorKind::Interrupted,
        Errno::NOMEM => ErrorKind::NoMem,
        Errno::NOSYS | Errno::NOTTY => ErrorKind::NotSupported,
        Errno::INVAL => ErrorKind::InvalidParam,
        Errno::IO => ErrorKind::Io,
        _ => ErrorKind::Other,
    };
    Error::with_os_code(kind, message, errno.raw_os_error() as u32)
}

/// Per-device state: the device node and the descriptors read from it at
/// enumeration time.
struct UsbfsDevice {
    path: PathBuf,
    descriptors: Vec<u8>,
}

/// Per-handle state: the opened device node. Taken on close so later
/// operations on a stale handle fail instead of touching a reused fd.
struct UsbfsHandle {
    fd: Mutex<Option<OwnedFd>>,
}

fn device_data(device: &DeviceInner) -> Result<&UsbfsDevice, Error> {
    device
        .backend_data
        .get()
        .and_then(|d| d.downcast_ref())
        .ok_or_else(|| Error::new(ErrorKind::Other, "device has no usbfs state"))
}

fn with_fd<R>(
    handle: &HandleInner,
    message: &'static str,
    f: impl FnOnce(BorrowedFd<'_>) -> rustix::io::Result<R>,
) -> Result<R, Error> {
    let data: &UsbfsHandle = handle
        .backend_data
        .get()
        .and_then(|d| d.downcast_ref())
        .ok_or_else(|| Error::new(ErrorKind::Other, "handle has no usbfs state"))?;
    let guard = data.fd.lock().unwrap();
    let fd = guard
        .as_ref()
        .ok_or_else(|| Error::new(ErrorKind::NoDevice, "device handle is closed"))?;
    f(fd.as_fd()).map_err(|e| errno_to_error(e, message))
}

pub(crate) struct UsbfsBackend;

impl Backend for UsbfsBackend {
    fn scan_devices(&self, ctx: &Context) -> Result<Vec<Arc<DeviceInner>>, Error> {
        let buses = fs::read_dir(USB_DEV_DIR).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::new(ErrorKind::NotFound, "/dev/bus/usb not found")
            }
            std::io::ErrorKind::PermissionDenied => {
                Error::new(ErrorKind::Access, "/dev/bus/usb permission denied")
            }
            _ => Error::new(ErrorKind::Io, "failed to open /dev/bus/usb"),
        })?;

        let mut discovered = Vec::new();
        for bus_entry in buses.flatten() {
            let Ok(bus_number) = bus_entry.file_name().to_string_lossy().parse::<u8>() else {
                continue;
            };
            let Ok(devices) = fs::read_dir(bus_entry.path()) else {
                continue;
            };
            for dev_entry in devices.flatten() {
                let Ok(device_address) = dev_entry.file_name().to_string_lossy().parse::<u8>()
                else {
                    continue;
                };

                // Session IDs must stay stable across re-scans so a known
                // device is recognized rather than re-allocated.
                let session_id = u64::from(bus_number) << 8 | u64::from(device_address);
                if let Some(dev) = ctx.device_by_session_id(session_id) {
                    discovered.push(dev);
                    continue;
                }

                let path = dev_entry.path();
                let descriptors = match fs::read(&path) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("Failed to read descriptors from {path:?}: {e}; ignoring device");
                        continue;
                    }
                };

                let dev = ctx.alloc_device(session_id, bus_number, device_address);
                dev.backend_data
                    .set(Box::new(UsbfsDevice { path, descriptors }))
                    .ok();
                match ctx.sanitize_device(&dev) {
                    Ok(()) => discovered.push(dev),
                    Err(e) => {
                        warn!("Ignoring device {bus_number:03}/{device_address:03}: {e}");
                    }
                }
            }
        }
        Ok(discovered)
    }

    fn open(&self, handle: &Arc<HandleInner>) -> Result<(), Error> {
        let data = device_data(&handle.device.inner)?;
        let fd = rustix::fs::open(&data.path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())
            .map_err(|e| {
                warn!("Failed to open device {:?}: {e}", data.path);
                errno_to_error(e, "failed to open device node")
            })?;
        let raw = fd.as_raw_fd();
        handle
            .backend_data
            .set(Box::new(UsbfsHandle {
                fd: Mutex::new(Some(fd)),
            }))
            .ok();
        // usbfs signals URB completion readiness as write readiness
        handle.context().add_poll_fd(raw, PollEvents::OUT);
        Ok(())
    }

    fn close(&self, handle: &HandleInner) {
        let Some(data) = handle
            .backend_data
            .get()
            .and_then(|d| d.downcast_ref::<UsbfsHandle>())
        else {
            return;
        };
        if let Some(fd) = data.fd.lock().unwrap().take() {
            handle.context().remove_poll_fd(fd.as_raw_fd());
        }
    }

    fn device_descriptor(
        &self,
        device: &DeviceInner,
    ) -> Result<[u8; DESCRIPTOR_LEN_DEVICE], Error> {
        let data = device_data(device)?;
        data.descriptors
            .get(..DESCRIPTOR_LEN_DEVICE)
            .and_then(|d| d.try_into().ok())
            .ok_or_else(|| Error::new(ErrorKind::Io, "device node holds no device descriptor"))
    }

    fn active_config_descriptor(&self, device: &DeviceInner) -> Result<Vec<u8>, Error> {
        // Without sysfs the active configuration is not knowable from the
        // node alone; the first configuration is reported, as it is the one
        // the kernel selects for almost every device.
        let data = device_data(device)?;
        let configs = &data.descriptors[DESCRIPTOR_LEN_DEVICE.min(data.descriptors.len())..];
        let len = config_total_length(configs).ok_or_else(|| {
            Error::new(ErrorKind::NotFound, "device node holds no configuration descriptor")
        })?;
        Ok(configs[..len].to_vec())
    }

    fn set_configuration(&self, handle: &HandleInner, config: Option<u8>) -> Result<(), Error> {
        with_fd(handle, "failed to set configuration", |fd| {
            usbfs::set_configuration(fd, config.map_or(-1, i32::from))
        })
    }

    fn claim_interface(&self, handle: &HandleInner, interface: u8) -> Result<(), Error> {
        with_fd(handle, "failed to claim interface", |fd| {
            usbfs::claim_interface(fd, interface)
        })
    }

    fn release_interface(&self, handle: &HandleInner, interface: u8) -> Result<(), Error> {
        with_fd(handle, "failed to release interface", |fd| {
            usbfs::release_interface(fd, interface)
        })
    }

    fn set_interface_alt_setting(
        &self,
        handle: &HandleInner,
        interface: u8,
        alt_setting: u8,
    ) -> Result<(), Error> {
        with_fd(handle, "failed to set alternate setting", |fd| {
            usbfs::set_interface(fd, interface, alt_setting)
        })
    }

    fn clear_halt(&self, handle: &HandleInner, endpoint: u8) -> Result<(), Error> {
        with_fd(handle, "failed to clear halt", |fd| {
            usbfs::clear_halt(fd, endpoint)
        })
    }

    fn reset_device(&self, handle: &HandleInner) -> Result<(), Error> {
        with_fd(handle, "failed to reset device", |fd| usbfs::reset(fd))
    }

    fn kernel_driver_active(&self, handle: &HandleInner, interface: u8) -> Result<bool, Error> {
        match with_fd(handle, "failed to query interface driver", |fd| {
            usbfs::get_driver(fd, interface)
        }) {
            Ok(name) => {
                let len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
                Ok(&name[..len] != b"usbfs")
            }
            Err(e) if e.os_error() == Some(Errno::NODATA.raw_os_error() as u32) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn detach_kernel_driver(&self, handle: &HandleInner, interface: u8) -> Result<(), Error> {
        with_fd(handle, "failed to detach kernel driver", |fd| {
            usbfs::detach_kernel_driver(fd, interface)
        })
    }

    fn submit_transfer(&self, transfer: &Transfer) -> Result<(), Error> {
        transfer::submit(transfer)
    }

    fn cancel_transfer(&self, transfer: &Transfer) -> Result<(), Error> {
        transfer::cancel(transfer)
    }

    fn handle_events(&self, ctx: &Context, ready: &[PollFd]) -> Result<(), Error> {
        for pollfd in ready {
            // SAFETY: descriptors in the watched set are held open by their
            // handle while registered
            let fd = unsafe { BorrowedFd::borrow_raw(pollfd.fd) };
            loop {
                match usbfs::reap_urb_ndelay(fd) {
                    // SAFETY: pointer came from submit via the kernel and
                    // we're now done with it
                    Ok(urb) => unsafe { transfer::complete_reaped_urb(ctx, urb) },
                    Err(Errno::AGAIN) => break,
                    Err(Errno::NODEV) => {
                        // Readiness keeps firing on a disconnected device
                        // even once every URB has been reaped; stop watching
                        // so the loop doesn't spin.
                        debug!("Device on fd {} disconnected", pollfd.fd);
                        ctx.remove_poll_fd(pollfd.fd);
                        break;
                    }
                    Err(e) => {
                        error!("Unexpected error {e} from REAPURBNDELAY");
                        return Err(errno_to_error(e, "failed to reap completed transfers"));
                    }
                }
            }
        }
        Ok(())
    }

    fn destroy_device(&self, device: &DeviceInner) {
        debug!(
            "Released usbfs device {:03}/{:03}",
            device.bus_number, device.device_address
        );
    }
}
