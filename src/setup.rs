//! USB control Setup packet decoding.

use usb_device::UsbDirection;

/// Recipient field of `bmRequestType`, bits 4..0.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Recipient {
    /// Request addressed to the device.
    Device = 0,
    /// Request addressed to an interface.
    Interface = 1,
    /// Request addressed to an endpoint.
    Endpoint = 2,
    /// Any other recipient value. Always stalled by the device core.
    Other = 3,
}

/// Type field of `bmRequestType`, bits 6..5.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum RequestType {
    /// Standard request defined by USB 2.0 chapter 9.
    Standard = 0,
    /// Class-specific request.
    Class = 1,
    /// Vendor-specific request.
    Vendor = 2,
    /// Reserved type value.
    Reserved = 3,
}

/// Decoded USB Setup packet.
///
/// A field-for-field mirror of the 8-byte packet the hardware delivers with
/// every control transfer: `bmRequestType`, `bRequest` and the three
/// little-endian 16-bit words. One value is decoded per Setup event and it is
/// copied wherever multi-stage handling needs to retain it (`DFU_DNLOAD` and
/// `DFU_UPLOAD` keep the triggering request across the data stage).
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct SetupRequest {
    /// Request characteristics: recipient, type and direction.
    pub bm_request_type: u8,
    /// Request code.
    pub b_request: u8,
    /// Request-specific value parameter.
    pub w_value: u16,
    /// Request-specific index parameter.
    pub w_index: u16,
    /// Length of the data stage in bytes.
    pub w_length: u16,
}

impl SetupRequest {
    /// Wire size of a Setup packet.
    pub const SIZE: usize = 8;

    /// `GET_STATUS` standard request code.
    pub const REQUEST_GET_STATUS: u8 = 0x00;
    /// `CLEAR_FEATURE` standard request code.
    pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;
    /// `SET_FEATURE` standard request code.
    pub const REQUEST_SET_FEATURE: u8 = 0x03;
    /// `SET_ADDRESS` standard request code.
    pub const REQUEST_SET_ADDRESS: u8 = 0x05;
    /// `GET_DESCRIPTOR` standard request code.
    pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
    /// `SET_DESCRIPTOR` standard request code.
    pub const REQUEST_SET_DESCRIPTOR: u8 = 0x07;
    /// `GET_CONFIGURATION` standard request code.
    pub const REQUEST_GET_CONFIGURATION: u8 = 0x08;
    /// `SET_CONFIGURATION` standard request code.
    pub const REQUEST_SET_CONFIGURATION: u8 = 0x09;
    /// `GET_INTERFACE` standard request code.
    pub const REQUEST_GET_INTERFACE: u8 = 0x0a;
    /// `SET_INTERFACE` standard request code.
    pub const REQUEST_SET_INTERFACE: u8 = 0x0b;

    /// Decodes a raw Setup packet.
    ///
    /// Returns `None` if `raw` is shorter than [`SetupRequest::SIZE`]; extra
    /// trailing bytes are ignored.
    pub fn parse(raw: &[u8]) -> Option<SetupRequest> {
        if raw.len() < Self::SIZE {
            return None;
        }
        Some(SetupRequest {
            bm_request_type: raw[0],
            b_request: raw[1],
            w_value: u16::from_le_bytes([raw[2], raw[3]]),
            w_index: u16::from_le_bytes([raw[4], raw[5]]),
            w_length: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }

    /// Recipient this request is addressed to.
    pub fn recipient(&self) -> Recipient {
        match self.bm_request_type & 0x1f {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        }
    }

    /// Standard, class or vendor request.
    pub fn request_type(&self) -> RequestType {
        match (self.bm_request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// Direction of the data stage.
    pub fn direction(&self) -> UsbDirection {
        if self.bm_request_type & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }
}
