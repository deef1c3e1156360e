//! USB descriptor byte tables and related constants.
//!
//! Everything here is static data: the device descriptor template, the fixed
//! string descriptor indices and the Microsoft WCID descriptor set that lets
//! Windows bind WinUSB to the device without an INF file.

/// DEVICE descriptor type.
pub const DESCRIPTOR_DEVICE: u8 = 0x01;
/// CONFIGURATION descriptor type.
pub const DESCRIPTOR_CONFIGURATION: u8 = 0x02;
/// STRING descriptor type.
pub const DESCRIPTOR_STRING: u8 = 0x03;
/// INTERFACE descriptor type.
pub const DESCRIPTOR_INTERFACE: u8 = 0x04;
/// DFU FUNCTIONAL descriptor type.
pub const DESCRIPTOR_DFU_FUNCTIONAL: u8 = 0x21;

/// String descriptor index of the language id table.
pub const STRING_IDX_LANGID: u8 = 0;
/// String descriptor index of the manufacturer name.
pub const STRING_IDX_MANUFACTURER: u8 = 1;
/// String descriptor index of the product name.
pub const STRING_IDX_PRODUCT: u8 = 2;
/// String descriptor index of the serial number.
pub const STRING_IDX_SERIAL: u8 = 3;
/// String descriptor index of the configuration description.
pub const STRING_IDX_CONFIG: u8 = 4;
/// String descriptor index of the interface description.
///
/// Indices above this one are resolved through the class driver; the DFU
/// class maps them to the layout strings of its registered storage backends.
pub const STRING_IDX_INTERFACE: u8 = 5;
/// Reserved string descriptor index of the Microsoft OS string descriptor.
pub const STRING_IDX_MSFT: u8 = 0xee;

/// Vendor control code advertised in the MS OS string descriptor.
pub const MSFT_VENDOR_CODE: u8 = 0xee;

/// Builds the 18-byte device descriptor.
///
/// `bDeviceClass`/`bDeviceSubClass`/`bDeviceProtocol` are zero: in DFU mode
/// the class is declared per interface, not per device.
pub fn device_descriptor(
    vendor_id: u16,
    product_id: u16,
    bcd_device: u16,
    max_packet_size_0: u8,
) -> [u8; 18] {
    [
        0x12,                      /* bLength */
        DESCRIPTOR_DEVICE,         /* bDescriptorType */
        0x00, 0x02,                /* bcdUSB 2.00 */
        0x00,                      /* bDeviceClass */
        0x00,                      /* bDeviceSubClass */
        0x00,                      /* bDeviceProtocol */
        max_packet_size_0,         /* bMaxPacketSize0 */
        vendor_id as u8,           /* idVendor */
        (vendor_id >> 8) as u8,
        product_id as u8,          /* idProduct */
        (product_id >> 8) as u8,
        bcd_device as u8,          /* bcdDevice */
        (bcd_device >> 8) as u8,
        STRING_IDX_MANUFACTURER,   /* iManufacturer */
        STRING_IDX_PRODUCT,        /* iProduct */
        STRING_IDX_SERIAL,         /* iSerialNumber */
        0x01,                      /* bNumConfigurations */
    ]
}

/// LANGID string descriptor: U.S. English only.
pub const LANGID_DESCRIPTOR: [u8; 4] = [0x04, DESCRIPTOR_STRING, 0x09, 0x04];

/// MS OS string descriptor, returned for string index 0xEE.
///
/// The `"MSFT100"` signature tells Windows that the device understands the
/// vendor request carrying the WCID descriptors, and the byte after the
/// signature is the vendor control code to use for it.
pub const MSFT_STRING_DESCRIPTOR: [u8; 18] = [
    0x12,                          /* bLength */
    DESCRIPTOR_STRING,             /* bDescriptorType */
    b'M', 0x00, b'S', 0x00, b'F', 0x00, b'T', 0x00, /* qwSignature "MSFT100" */
    b'1', 0x00, b'0', 0x00, b'0', 0x00,
    MSFT_VENDOR_CODE,              /* bMS_VendorCode */
    0x00,                          /* bPad */
];

/// WCID Extended Compat ID OS descriptor (`wIndex` 0x0004).
///
/// One function section binding interface 0 to the `WINUSB` compatible id.
pub const MSFT_EXT_COMPAT_ID_DESCRIPTOR: [u8; 40] = [
    /* Header */
    0x28, 0x00, 0x00, 0x00,        /* dwLength: 40 */
    0x00, 0x01,                    /* bcdVersion: 1.00 */
    0x04, 0x00,                    /* wIndex: extended compat ID */
    0x01,                          /* bCount: one function section */
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* reserved */
    /* Function section */
    0x00,                          /* bFirstInterfaceNumber */
    0x01,                          /* reserved */
    b'W', b'I', b'N', b'U', b'S', b'B', 0x00, 0x00, /* compatibleID */
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* subCompatibleID */
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* reserved */
];

/// WCID Extended Properties OS descriptor (`wIndex` 0x0005).
///
/// Carries a single `DeviceInterfaceGUID` registry property (REG_SZ) with the
/// GUID host tooling uses to open the device through WinUSB.
pub const MSFT_EXT_PROPERTIES_DESCRIPTOR: [u8; 142] = [
    /* Header */
    0x8e, 0x00, 0x00, 0x00,        /* dwLength: 142 */
    0x00, 0x01,                    /* bcdVersion: 1.00 */
    0x05, 0x00,                    /* wIndex: extended properties */
    0x01, 0x00,                    /* wCount: one property section */
    /* Property section */
    0x84, 0x00, 0x00, 0x00,        /* dwSize: 132 */
    0x01, 0x00, 0x00, 0x00,        /* dwPropertyDataType: REG_SZ */
    0x28, 0x00,                    /* wPropertyNameLength: 40 */
    /* bPropertyName: "DeviceInterfaceGUID" */
    b'D', 0x00, b'e', 0x00, b'v', 0x00, b'i', 0x00, b'c', 0x00,
    b'e', 0x00, b'I', 0x00, b'n', 0x00, b't', 0x00, b'e', 0x00,
    b'r', 0x00, b'f', 0x00, b'a', 0x00, b'c', 0x00, b'e', 0x00,
    b'G', 0x00, b'U', 0x00, b'I', 0x00, b'D', 0x00, 0x00, 0x00,
    0x4e, 0x00, 0x00, 0x00,        /* dwPropertyDataLength: 78 */
    /* bPropertyData: "{37fb5f90-1a34-4929-933b-8a27e1850033}" */
    b'{', 0x00, b'3', 0x00, b'7', 0x00, b'f', 0x00, b'b', 0x00,
    b'5', 0x00, b'f', 0x00, b'9', 0x00, b'0', 0x00, b'-', 0x00,
    b'1', 0x00, b'a', 0x00, b'3', 0x00, b'4', 0x00, b'-', 0x00,
    b'4', 0x00, b'9', 0x00, b'2', 0x00, b'9', 0x00, b'-', 0x00,
    b'9', 0x00, b'3', 0x00, b'3', 0x00, b'b', 0x00, b'-', 0x00,
    b'8', 0x00, b'a', 0x00, b'2', 0x00, b'7', 0x00, b'e', 0x00,
    b'1', 0x00, b'8', 0x00, b'5', 0x00, b'0', 0x00, b'0', 0x00,
    b'3', 0x00, b'3', 0x00, b'}', 0x00, 0x00, 0x00,
];
