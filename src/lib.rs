#![warn(missing_docs)]
//! Userspace USB device I/O over the kernel's raw USB filesystem interface.
//!
//! `rawusb` enumerates USB devices and performs control, bulk, interrupt, and
//! isochronous transfers against them from userspace, with an asynchronous
//! transfer engine at the core and blocking convenience calls layered on top.
//!
//! ## Usage overview
//!
//! Create a [`Context`], enumerate devices with [`Context::devices`], and
//! [`open`][`Device::open`] the one you want. Claim an interface with
//! [`DeviceHandle::claim_interface`] before transferring on its endpoints.
//!
//! For one-shot I/O, use the blocking calls
//! [`DeviceHandle::control_transfer`], [`DeviceHandle::bulk_transfer`], and
//! [`DeviceHandle::interrupt_transfer`].
//!
//! For asynchronous I/O, build a [`Transfer`], [`submit`][`Transfer::submit`]
//! it, and drive the event loop with [`Context::handle_events`] (or
//! [`Context::handle_events_timeout`]): completion callbacks fire on the
//! thread driving the loop. Applications with their own poll loop can watch
//! the descriptors from [`Context::poll_fds`] instead, bounded by
//! [`Context::next_timeout`], and call `handle_events_timeout` with a zero
//! timeout when one becomes ready.
//!
//! Only one thread at a time may drive the event loop; a concurrent driver
//! fails with [`ErrorKind::Busy`]. Every other call is safe from any thread.
//!
//! ## Logging
//!
//! `rawusb` uses the [`log`](https://docs.rs/log) crate to log debug and
//! error information. Use a `log` backend like
//! [`env_logger`](https://docs.rs/env_logger) and enable log output for this
//! crate (for `env_logger`, set the environment variable
//! `RUST_LOG=rawusb=debug`).
//!
//! ## Platform support
//!
//! `rawusb` is built on the kernel's [usbfs] API and supports Linux and
//! Android.
//!
//! A user must have write access on the `/dev/bus/usb/XXX/YYY` nodes to
//! successfully open a device. Use [udev rules] to configure these
//! permissions.
//!
//! [usbfs]:
//!     https://www.kernel.org/doc/html/latest/driver-api/usb/usb.html#the-usb-character-device-nodes
//! [udev rules]: https://www.reactivated.net/writing_udev_rules.html

mod backend;
mod bitset;
mod blocking;
mod context;
mod deadline;
mod device;
mod error;
mod events;
mod inflight;
mod platform;

pub mod descriptors;
pub mod transfer;

pub use context::Context;
pub use device::{Device, DeviceHandle};
pub use error::{Error, ErrorKind};
pub use events::{PollEvents, PollFd};
pub use transfer::Transfer;

#[cfg(test)]
mod tests;
