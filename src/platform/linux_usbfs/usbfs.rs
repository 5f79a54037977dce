//! Wrappers for the [usbfs] character device ioctls, translated from the
//! [C structures and ioctl definitions][uapi].
//!
//! [usbfs]: https://www.kernel.org/doc/html/latest/driver-api/usb/usb.html#the-usb-character-device-nodes
//! [uapi]: https://github.com/torvalds/linux/blob/master/tools/include/uapi/linux/usbdevice_fs.h
#![allow(dead_code)]
use std::ffi::{c_int, c_uchar, c_uint, c_void};

use linux_raw_sys::ioctl::{
    USBDEVFS_CLAIMINTERFACE, USBDEVFS_CLEAR_HALT, USBDEVFS_DISCARDURB, USBDEVFS_DISCONNECT,
    USBDEVFS_GETDRIVER, USBDEVFS_IOCTL, USBDEVFS_REAPURBNDELAY, USBDEVFS_RELEASEINTERFACE,
    USBDEVFS_RESET, USBDEVFS_SETCONFIGURATION, USBDEVFS_SETINTERFACE, USBDEVFS_SUBMITURB,
};
use rustix::{
    fd::AsFd,
    io,
    ioctl::{self, Ioctl, IoctlOutput, Opcode},
};

/// `-1` puts the device in the unconfigured state.
pub fn set_configuration<Fd: AsFd>(fd: Fd, configuration: c_int) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::Setter::<{ USBDEVFS_SETCONFIGURATION as _ }, c_int>::new(configuration);
        ioctl::ioctl(fd, ctl)
    }
}

pub fn claim_interface<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::Setter::<{ USBDEVFS_CLAIMINTERFACE as _ }, c_uint>::new(interface.into());
        ioctl::ioctl(fd, ctl)
    }
}

pub fn release_interface<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<()> {
    unsafe {
        let ctl =
            ioctl::Setter::<{ USBDEVFS_RELEASEINTERFACE as _ }, c_uint>::new(interface.into());
        ioctl::ioctl(fd, ctl)
    }
}

#[repr(C)]
struct UsbFsIoctl {
    interface: c_uint,
    ioctl_code: c_uint,
    data: *mut c_void,
}

pub fn detach_kernel_driver<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<()> {
    let command = UsbFsIoctl {
        interface: interface.into(),
        // NOTE: cast needed since on android this type is i32 vs u32 on linux
        ioctl_code: USBDEVFS_DISCONNECT as _,
        data: std::ptr::null_mut(),
    };
    unsafe {
        let ctl = ioctl::Setter::<{ USBDEVFS_IOCTL as _ }, UsbFsIoctl>::new(command);
        ioctl::ioctl(fd, ctl)
    }
}

#[repr(C)]
struct SetAltSetting {
    interface: c_int,
    alt_setting: c_int,
}

pub fn set_interface<Fd: AsFd>(fd: Fd, interface: u8, alt_setting: u8) -> io::Result<()> {
    unsafe {
        let ctl =
            ioctl::Setter::<{ USBDEVFS_SETINTERFACE as _ }, SetAltSetting>::new(SetAltSetting {
                interface: interface.into(),
                alt_setting: alt_setting.into(),
            });
        ioctl::ioctl(fd, ctl)
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct GetDriver {
    interface: c_uint,
    driver: [u8; 256],
}

/// Updater-style `ioctl` object: pass a struct to the kernel and read it
/// back mutated.
struct InOut<const OPCODE: Opcode, Input> {
    input: Input,
}

impl<const OPCODE: Opcode, Input> InOut<OPCODE, Input> {
    /// # Safety
    ///
    /// - `OPCODE` must provide a valid opcode.
    /// - For this opcode, `Input` must be the type that the kernel expects.
    #[inline]
    unsafe fn new(input: Input) -> Self {
        Self { input }
    }
}

unsafe impl<const OPCODE: Opcode, Input: Copy> Ioctl for InOut<OPCODE, Input> {
    type Output = Input;

    const IS_MUTATING: bool = true;

    fn opcode(&self) -> ioctl::Opcode {
        OPCODE
    }

    fn as_ptr(&mut self) -> *mut c_void {
        &mut self.input as *mut Input as *mut c_void
    }

    unsafe fn output_from_ptr(_: IoctlOutput, ptr: *mut c_void) -> io::Result<Self::Output> {
        Ok(unsafe { (ptr as *const Input).read() })
    }
}

/// Name of the kernel driver bound to an interface, NUL-terminated. Fails
/// with `ENODATA` when no driver is bound.
pub fn get_driver<Fd: AsFd>(fd: Fd, interface: u8) -> io::Result<[u8; 256]> {
    unsafe {
        let ctl = InOut::<{ USBDEVFS_GETDRIVER as _ }, GetDriver>::new(GetDriver {
            interface: interface.into(),
            driver: [0; 256],
        });
        ioctl::ioctl(fd, ctl).map(|out| out.driver)
    }
}

struct PassPtr<const OPCODE: Opcode, Input> {
    input: *mut Input,
}

impl<const OPCODE: Opcode, Input> PassPtr<OPCODE, Input> {
    /// # Safety
    ///
    /// - `OPCODE` must provide a valid opcode.
    /// - For this opcode, `Input` must be the type that the kernel expects.
    #[inline]
    unsafe fn new(input: *mut Input) -> Self {
        Self { input }
    }
}

unsafe impl<const OPCODE: Opcode, Input> Ioctl for PassPtr<OPCODE, Input> {
    type Output = ();

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> ioctl::Opcode {
        OPCODE
    }

    fn as_ptr(&mut self) -> *mut c_void {
        self.input as *mut c_void
    }

    unsafe fn output_from_ptr(_: IoctlOutput, _: *mut c_void) -> io::Result<Self::Output> {
        Ok(())
    }
}

pub unsafe fn submit_urb<Fd: AsFd>(fd: Fd, urb: *mut Urb) -> io::Result<()> {
    unsafe {
        let ctl = PassPtr::<{ USBDEVFS_SUBMITURB as _ }, Urb>::new(urb);
        ioctl::ioctl(fd, ctl)
    }
}

pub fn reap_urb_ndelay<Fd: AsFd>(fd: Fd) -> io::Result<*mut Urb> {
    unsafe {
        let ctl = ioctl::Getter::<{ USBDEVFS_REAPURBNDELAY as _ }, *mut Urb>::new();
        ioctl::ioctl(fd, ctl)
    }
}

pub unsafe fn discard_urb<Fd: AsFd>(fd: Fd, urb: *mut Urb) -> io::Result<()> {
    unsafe {
        let ctl = PassPtr::<{ USBDEVFS_DISCARDURB as _ }, Urb>::new(urb);
        ioctl::ioctl(fd, ctl)
    }
}

pub fn reset<Fd: AsFd>(fd: Fd) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::NoArg::<{ USBDEVFS_RESET as _ }>::new();
        ioctl::ioctl(fd, ctl)
    }
}

pub fn clear_halt<Fd: AsFd>(fd: Fd, endpoint: u8) -> io::Result<()> {
    unsafe {
        let ctl = ioctl::Setter::<{ USBDEVFS_CLEAR_HALT as _ }, c_uint>::new(endpoint.into());
        ioctl::ioctl(fd, ctl)
    }
}

pub const USBDEVFS_URB_ISO_ASAP: c_uint = 0x02;

pub const USBDEVFS_URB_TYPE_ISO: c_uchar = 0;
pub const USBDEVFS_URB_TYPE_INTERRUPT: c_uchar = 1;
pub const USBDEVFS_URB_TYPE_CONTROL: c_uchar = 2;
pub const USBDEVFS_URB_TYPE_BULK: c_uchar = 3;

#[repr(C)]
#[derive(Debug)]
pub struct Urb {
    pub ep_type: c_uchar,
    pub endpoint: c_uchar,
    pub status: c_int,
    pub flags: c_uint,
    pub buffer: *mut u8,
    pub buffer_length: c_int,
    pub actual_length: c_int,
    pub start_frame: c_int,
    pub number_of_packets_or_stream_id: c_uint, // a union in C
    pub error_count: c_int,
    pub signr: c_uint,
    pub usercontext: *mut c_void,
    // + variable size array of iso_packet_desc
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IsoPacketDesc {
    pub length: c_uint,
    pub actual_length: c_uint,
    pub status: c_uint,
}
