//! The slices of USB descriptor parsing the engine needs: the first-level
//! device descriptor and an endpoint lookup over a configuration descriptor.

use std::ops::Deref;

use log::warn;

pub(crate) const DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub(crate) const DESCRIPTOR_LEN_DEVICE: usize = 18;

pub(crate) const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub(crate) const DESCRIPTOR_LEN_CONFIGURATION: usize = 9;

pub(crate) const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub(crate) const DESCRIPTOR_LEN_ENDPOINT: usize = 7;

/// Maximum value of `bNumConfigurations` permitted by the USB specification.
pub(crate) const MAX_CONFIGURATIONS: u8 = 8;

/// A raw USB descriptor: a byte slice exposing the length and type fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor<'a>(&'a [u8]);

impl Descriptor<'_> {
    /// Create a `Descriptor` from a buffer.
    ///
    /// Returns `None` if the slice is shorter than 2 bytes or shorter than
    /// its `bLength` field.
    pub fn new(buf: &[u8]) -> Option<Descriptor> {
        if buf.len() >= 2 && buf.len() >= buf[0] as usize {
            Some(Descriptor(buf))
        } else {
            None
        }
    }

    /// Get the `bLength` field of the descriptor.
    pub fn descriptor_len(&self) -> usize {
        self.0[0] as usize
    }

    /// Get the `bDescriptorType` field of the descriptor.
    pub fn descriptor_type(&self) -> u8 {
        self.0[1]
    }
}

impl Deref for Descriptor<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0
    }
}

/// An iterator over a sequence of concatenated USB descriptors.
#[derive(Clone)]
pub struct DescriptorIter<'a>(&'a [u8]);

impl<'a> DescriptorIter<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> DescriptorIter<'a> {
        DescriptorIter(buf)
    }

    fn split_first(&self) -> Option<(&'a [u8], &'a [u8])> {
        if self.0.len() < 2 {
            return None;
        }

        if self.0[0] < 2 {
            warn!(
                "descriptor with bLength {} can't point to next descriptor",
                self.0[0]
            );
            return None;
        }

        if self.0[0] as usize > self.0.len() {
            warn!(
                "descriptor with bLength {} exceeds remaining buffer length {}",
                self.0[0],
                self.0.len()
            );
            return None;
        }

        Some(self.0.split_at(self.0[0] as usize))
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Descriptor<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((cur, next)) = self.split_first() {
            self.0 = next;
            Some(Descriptor(cur))
        } else {
            None
        }
    }
}

macro_rules! descriptor_fields {
    (impl $tname:ident {
        $(
            $(#[$attr:meta])*
            $vis:vis fn $name:ident at $pos:literal -> $ty:ty;
        )*
    }) => {
        impl $tname {
            $(
                $(#[$attr])*
                #[inline]
                $vis fn $name(&self) -> $ty { <$ty>::from_le_bytes(self.0[$pos..$pos + std::mem::size_of::<$ty>()].try_into().unwrap()) }
            )*
        }
    }
}

/// The device descriptor: the first-level description of a USB device.
#[derive(Clone, Copy)]
pub struct DeviceDescriptor([u8; DESCRIPTOR_LEN_DEVICE]);

impl DeviceDescriptor {
    /// Create a `DeviceDescriptor` from a buffer beginning with a device
    /// descriptor. Trailing data after `bLength` is ignored.
    pub fn new(buf: &[u8]) -> Option<Self> {
        let Some(buf) = buf.get(0..DESCRIPTOR_LEN_DEVICE) else {
            if !buf.is_empty() {
                warn!(
                    "device descriptor buffer is {} bytes, need {}",
                    buf.len(),
                    DESCRIPTOR_LEN_DEVICE
                );
            }
            return None;
        };
        let buf: [u8; DESCRIPTOR_LEN_DEVICE] = buf.try_into().ok()?;
        if (buf[0] as usize) < DESCRIPTOR_LEN_DEVICE {
            warn!("invalid device descriptor bLength {}", buf[0]);
            None
        } else if buf[1] != DESCRIPTOR_TYPE_DEVICE {
            warn!(
                "device bDescriptorType is {}, not a device descriptor",
                buf[1]
            );
            None
        } else {
            Some(Self(buf))
        }
    }

    /// Get the bytes of the descriptor.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

descriptor_fields! {
    impl DeviceDescriptor {
        /// 16-bit vendor ID.
        pub fn vendor_id at 8 -> u16;

        /// 16-bit product ID.
        pub fn product_id at 10 -> u16;

        /// Maximum packet size of endpoint 0.
        pub fn max_packet_size_0 at 7 -> u8;

        /// Number of configurations the device supports.
        pub fn num_configurations at 17 -> u8;
    }
}

/// Find `wMaxPacketSize` of the endpoint with address `endpoint` in a
/// configuration descriptor (the 9-byte header followed by interface and
/// endpoint descriptors).
pub(crate) fn endpoint_max_packet_size(config: &[u8], endpoint: u8) -> Option<u16> {
    DescriptorIter::new(config)
        .filter(|d| {
            d.descriptor_type() == DESCRIPTOR_TYPE_ENDPOINT
                && d.descriptor_len() >= DESCRIPTOR_LEN_ENDPOINT
        })
        .find(|d| d[2] == endpoint)
        .map(|d| u16::from_le_bytes([d[4], d[5]]))
}

/// Total length of the configuration descriptor starting at `buf`, from its
/// `wTotalLength` field, bounded by the buffer.
pub(crate) fn config_total_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < DESCRIPTOR_LEN_CONFIGURATION || buf[1] != DESCRIPTOR_TYPE_CONFIGURATION {
        return None;
    }
    let total = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
    Some(total.min(buf.len()).max(DESCRIPTOR_LEN_CONFIGURATION))
}
