#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux_usbfs;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use linux_usbfs::{default_backend, errno_to_error};
