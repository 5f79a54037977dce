use std::{
    any::Any,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
};

use log::debug;
use once_cell::sync::OnceCell;

use crate::{
    bitset::InterfaceBitSet,
    context::ContextInner,
    descriptors::{endpoint_max_packet_size, DeviceDescriptor},
    Context, Error, ErrorKind,
};

pub(crate) struct DeviceInner {
    pub(crate) ctx: Arc<ContextInner>,
    pub(crate) session_id: u64,
    pub(crate) bus_number: u8,
    pub(crate) device_address: u8,

    /// Cached raw device descriptor, read during enumeration sanitizing.
    pub(crate) descriptor: OnceCell<DeviceDescriptor>,

    pub(crate) backend_data: OnceCell<Box<dyn Any + Send + Sync>>,
}

impl DeviceInner {
    pub(crate) fn context(&self) -> Context {
        Context {
            inner: self.ctx.clone(),
        }
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        // Delink from the registry unless the session has already been
        // re-allocated to a live device.
        let mut registry = self.ctx.devices.lock().unwrap();
        if let Some(entry) = registry.get(&self.session_id) {
            if entry.strong_count() == 0 {
                registry.remove(&self.session_id);
            }
        }
        drop(registry);

        debug!(
            "Destroying device bus {} addr {}",
            self.bus_number, self.device_address
        );
        self.ctx.backend.destroy_device(self);
    }
}

/// A USB device currently (or, after unplug, previously) seen on a bus.
///
/// Obtained from [`Context::devices`]. `Device` is a cheaply-cloneable
/// reference; a physical device keeps its identity across re-scans, so
/// enumerating twice yields references to the same underlying device. The
/// device is released when the last reference (including those held by open
/// handles) is dropped.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

impl Device {
    /// Number of the bus the device is attached to.
    pub fn bus_number(&self) -> u8 {
        self.inner.bus_number
    }

    /// Address of the device on its bus.
    pub fn device_address(&self) -> u8 {
        self.inner.device_address
    }

    /// The device descriptor, cached at enumeration time.
    pub fn device_descriptor(&self) -> DeviceDescriptor {
        *self
            .inner
            .descriptor
            .get()
            .expect("descriptor is read before a device is published")
    }

    /// Number of configurations the device supports.
    pub fn num_configurations(&self) -> u8 {
        self.device_descriptor().num_configurations()
    }

    /// 16-bit vendor ID from the device descriptor.
    pub fn vendor_id(&self) -> u16 {
        self.device_descriptor().vendor_id()
    }

    /// 16-bit product ID from the device descriptor.
    pub fn product_id(&self) -> u16 {
        self.device_descriptor().product_id()
    }

    /// `wMaxPacketSize` of the endpoint with address `endpoint` in the active
    /// configuration.
    pub fn max_packet_size(&self, endpoint: u8) -> Result<u16, Error> {
        let config = self.inner.ctx.backend.active_config_descriptor(&self.inner)?;
        endpoint_max_packet_size(&config, endpoint).ok_or_else(|| {
            Error::new(
                ErrorKind::NotFound,
                "endpoint not found in the active configuration",
            )
        })
    }

    /// Open the device for I/O.
    pub fn open(&self) -> Result<DeviceHandle, Error> {
        let inner = Arc::new(HandleInner {
            device: self.clone(),
            claimed: Mutex::new(InterfaceBitSet::default()),
            backend_data: OnceCell::new(),
            closed: AtomicBool::new(true),
        });
        self.inner.ctx.backend.open(&inner)?;
        inner.closed.store(false, Ordering::SeqCst);
        self.inner
            .ctx
            .handles
            .lock()
            .unwrap()
            .push(Arc::downgrade(&inner));
        debug!(
            "Opened device bus {} addr {}",
            self.inner.bus_number, self.inner.device_address
        );
        Ok(DeviceHandle { inner })
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("bus_number", &self.inner.bus_number)
            .field("device_address", &self.inner.device_address)
            .finish()
    }
}

pub(crate) struct HandleInner {
    pub(crate) device: Device,

    /// One bit per interface number the handle has claimed.
    pub(crate) claimed: Mutex<InterfaceBitSet>,

    pub(crate) backend_data: OnceCell<Box<dyn Any + Send + Sync>>,

    /// False only between a successful backend open and the close on drop,
    /// so a handle whose backend open failed is never backend-closed.
    closed: AtomicBool,
}

impl HandleInner {
    pub(crate) fn context(&self) -> Context {
        self.device.inner.context()
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = self.device.inner.ctx.clone();
        let self_ptr = self as *const HandleInner;
        ctx.handles
            .lock()
            .unwrap()
            .retain(|w| w.as_ptr() != self_ptr);
        ctx.backend.close(self);
        debug!(
            "Closed device bus {} addr {}",
            self.device.inner.bus_number, self.device.inner.device_address
        );
    }
}

/// An open session on a [`Device`].
///
/// `DeviceHandle` is a cheaply-cloneable reference; the session is closed
/// when the last clone is dropped. The handle holds a strong reference to its
/// device for as long as it is open.
#[derive(Clone)]
pub struct DeviceHandle {
    pub(crate) inner: Arc<HandleInner>,
}

impl DeviceHandle {
    /// The device this handle is a session on.
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub(crate) fn context(&self) -> Context {
        self.inner.context()
    }

    /// Claim an interface for exclusive userspace use.
    ///
    /// Claiming an interface this handle has already claimed succeeds without
    /// touching the OS.
    pub fn claim_interface(&self, interface: u8) -> Result<(), Error> {
        if interface >= InterfaceBitSet::WIDTH {
            return Err(Error::new(ErrorKind::InvalidParam, "interface number out of range"));
        }
        let mut claimed = self.inner.claimed.lock().unwrap();
        if claimed.is_set(interface) {
            return Ok(());
        }
        self.context()
            .inner
            .backend
            .claim_interface(&self.inner, interface)?;
        claimed.set(interface);
        debug!("Claimed interface {interface}");
        Ok(())
    }

    /// Release a previously claimed interface.
    pub fn release_interface(&self, interface: u8) -> Result<(), Error> {
        let mut claimed = self.inner.claimed.lock().unwrap();
        if !claimed.is_set(interface) {
            return Err(Error::new(
                ErrorKind::NotFound,
                "interface is not claimed by this handle",
            ));
        }
        self.context()
            .inner
            .backend
            .release_interface(&self.inner, interface)?;
        claimed.clear(interface);
        debug!("Released interface {interface}");
        Ok(())
    }

    /// Select an alternate setting on a claimed interface. Blocks on a kernel
    /// round-trip.
    pub fn set_interface_alt_setting(&self, interface: u8, alt_setting: u8) -> Result<(), Error> {
        let claimed = self.inner.claimed.lock().unwrap();
        if !claimed.is_set(interface) {
            return Err(Error::new(
                ErrorKind::NotFound,
                "interface is not claimed by this handle",
            ));
        }
        self.context()
            .inner
            .backend
            .set_interface_alt_setting(&self.inner, interface, alt_setting)
    }

    /// Clear a halt/stall condition on an endpoint. Blocks on a kernel
    /// round-trip.
    pub fn clear_halt(&self, endpoint: u8) -> Result<(), Error> {
        self.context().inner.backend.clear_halt(&self.inner, endpoint)
    }

    /// Perform a USB port reset of the device. Blocks on a kernel round-trip.
    pub fn reset(&self) -> Result<(), Error> {
        self.context().inner.backend.reset_device(&self.inner)
    }

    /// Set the active configuration; `None` puts the device in the
    /// unconfigured state. Blocks on a kernel round-trip.
    pub fn set_configuration(&self, config: Option<u8>) -> Result<(), Error> {
        self.context()
            .inner
            .backend
            .set_configuration(&self.inner, config)
    }

    /// Whether a kernel driver is bound to the interface.
    ///
    /// Fails with [`ErrorKind::NotSupported`] if the backend cannot tell.
    pub fn kernel_driver_active(&self, interface: u8) -> Result<bool, Error> {
        self.context()
            .inner
            .backend
            .kernel_driver_active(&self.inner, interface)
    }

    /// Unbind the kernel driver from an interface so it can be claimed.
    ///
    /// Fails with [`ErrorKind::NotSupported`] if the backend cannot detach
    /// drivers.
    pub fn detach_kernel_driver(&self, interface: u8) -> Result<(), Error> {
        self.context()
            .inner
            .backend
            .detach_kernel_driver(&self.inner, interface)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.inner.device)
            .finish()
    }
}

/// Type alias used by the handle table.
pub(crate) type WeakHandle = Weak<HandleInner>;
