//! USB device core: chapter-9 enumeration and control-transfer routing.
//!
//! [`DeviceCore`] owns the bus and the EP0 pipe, decodes every Setup packet
//! and routes it by recipient: standard device requests are handled here,
//! class/vendor and interface requests are forwarded to the registered
//! [`ClassDriver`]. It knows nothing about DFU.

use core::cmp::min;

use usb_device::bus::{PollResult, UsbBus};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::{UsbDirection, UsbError};

use crate::class::ClassDriver;
use crate::control::{Control, ControlPipe, PipeEvent};
use crate::descriptor;
use crate::setup::{Recipient, RequestType, SetupRequest};

const FEATURE_ENDPOINT_HALT: u16 = 0;
const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// Configuration index reported while the device is only addressed.
const DEFAULT_CONFIG_INDEX: u8 = 1;

/// USB device state, USB 2.0 section 9.1.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DeviceState {
    /// Attached and powered, not yet addressed.
    Default,
    /// Responding to a unique address, not yet configured.
    Addressed,
    /// Enumeration complete, a configuration is active.
    Configured,
    /// Bus is suspended.
    Suspended,
}

/// Identity and descriptor data of the device.
///
/// The string fields are expected to be ASCII; the serial number string is
/// derived from `device_id` by lowercase hex encoding.
#[derive(Clone, Copy)]
pub struct DeviceConfig<'a> {
    /// USB vendor id.
    pub vendor_id: u16,
    /// USB product id.
    pub product_id: u16,
    /// BCD device release number.
    pub bcd_device: u16,
    /// EP0 maximum packet size.
    pub max_packet_size_0: u8,
    /// Manufacturer string.
    pub manufacturer: &'a str,
    /// Product string.
    pub product: &'a str,
    /// Configuration description string.
    pub configuration: &'a str,
    /// Interface description string.
    pub interface: &'a str,
    /// Stable unique device id, hex-encoded into the serial number string.
    pub device_id: &'a [u8],
}

/// USB device core bound to a bus.
pub struct DeviceCore<'a, B: UsbBus> {
    bus: B,
    pipe: ControlPipe,
    state: DeviceState,
    resume_state: DeviceState,
    config_index: u8,
    /// GET_STATUS(device) reply word; bit 1 tracks DEVICE_REMOTE_WAKEUP.
    device_status: u16,
    device_descriptor: [u8; 18],
    config: DeviceConfig<'a>,
    string_buf: [u8; 256],
}

impl<'a, B: UsbBus> DeviceCore<'a, B> {
    /// Allocates EP0 in both directions and enables the bus.
    pub fn new(mut bus: B, config: DeviceConfig<'a>) -> Result<Self, UsbError> {
        let max_packet = config.max_packet_size_0 as u16;
        let ep_out = bus.alloc_ep(
            UsbDirection::Out,
            Some(EndpointAddress::from_parts(0, UsbDirection::Out)),
            EndpointType::Control,
            max_packet,
            0,
        )?;
        let ep_in = bus.alloc_ep(
            UsbDirection::In,
            Some(EndpointAddress::from_parts(0, UsbDirection::In)),
            EndpointType::Control,
            max_packet,
            0,
        )?;
        bus.enable();

        let device_descriptor = descriptor::device_descriptor(
            config.vendor_id,
            config.product_id,
            config.bcd_device,
            config.max_packet_size_0,
        );

        Ok(DeviceCore {
            bus,
            pipe: ControlPipe::new(ep_out, ep_in, max_packet as usize),
            state: DeviceState::Default,
            resume_state: DeviceState::Default,
            config_index: 0,
            device_status: 0,
            device_descriptor,
            config,
            string_buf: [0; 256],
        })
    }

    /// Current device state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Active configuration index, 0 when not configured.
    pub fn configuration(&self) -> u8 {
        self.config_index
    }

    /// Drains one bus event.
    ///
    /// Must be called from the USB interrupt handler, and again until it
    /// returns `false` when the hardware signals multiple pending events.
    pub fn poll<C: ClassDriver<B>>(&mut self, class: &mut C) -> bool {
        match self.bus.poll() {
            PollResult::None => false,
            PollResult::Reset => {
                self.bus.reset();
                self.pipe.bus_reset();
                self.state = DeviceState::Default;
                self.config_index = 0;
                class.usb_reset();
                true
            }
            PollResult::Suspend => {
                self.bus.suspend();
                if self.state != DeviceState::Suspended {
                    self.resume_state = self.state;
                    self.state = DeviceState::Suspended;
                }
                true
            }
            PollResult::Resume => {
                self.bus.resume();
                self.state = self.resume_state;
                true
            }
            PollResult::Data {
                ep_out,
                ep_in_complete,
                ep_setup,
            } => {
                if ep_setup & 0x01 != 0 {
                    let ev = self.pipe.handle_setup(&self.bus);
                    self.dispatch(class, ev);
                } else if ep_out & 0x01 != 0 {
                    let ev = self.pipe.handle_out(&self.bus);
                    self.dispatch(class, ev);
                }
                if ep_in_complete & 0x01 != 0 {
                    let ev = self.pipe.handle_in_complete(&self.bus);
                    self.dispatch(class, ev);
                }
                true
            }
        }
    }

    fn dispatch<C: ClassDriver<B>>(&mut self, class: &mut C, ev: PipeEvent) {
        match ev {
            PipeEvent::None => {}
            PipeEvent::Setup(req) => self.setup(class, &req),
            PipeEvent::OutDone(req) => {
                if self.pipe.class_routed() {
                    match class.data_out_done(&req, self.pipe.out_data()) {
                        Ok(()) => self.pipe.send_status(&self.bus),
                        Err(()) => self.pipe.stall(&self.bus),
                    }
                } else {
                    // No standard OUT request with a data stage is accepted.
                    self.pipe.stall(&self.bus);
                }
            }
            PipeEvent::InDone(req) => {
                if self.pipe.class_routed() {
                    let mut ctl = Control::new(&self.bus, &mut self.pipe);
                    if class.data_in_done(&mut ctl, &req).is_err() {
                        self.pipe.stall(&self.bus);
                    }
                }
            }
        }
    }

    /// Dispatches a decoded Setup packet by recipient.
    fn setup<C: ClassDriver<B>>(&mut self, class: &mut C, req: &SetupRequest) {
        match req.recipient() {
            Recipient::Device => self.setup_device(class, req),
            Recipient::Interface => self.setup_interface(class, req),
            Recipient::Endpoint => self.setup_endpoint(req),
            Recipient::Other => self.pipe.stall(&self.bus),
        }
    }

    fn setup_device<C: ClassDriver<B>>(&mut self, class: &mut C, req: &SetupRequest) {
        match req.request_type() {
            RequestType::Standard => match req.b_request {
                SetupRequest::REQUEST_GET_STATUS => self.get_status(req),
                SetupRequest::REQUEST_CLEAR_FEATURE => self.clear_feature(req),
                SetupRequest::REQUEST_SET_FEATURE => self.set_feature(req),
                SetupRequest::REQUEST_SET_ADDRESS => self.set_address(req),
                SetupRequest::REQUEST_GET_DESCRIPTOR => self.get_descriptor(class, req),
                SetupRequest::REQUEST_SET_DESCRIPTOR => self.pipe.stall(&self.bus),
                SetupRequest::REQUEST_GET_CONFIGURATION => self.get_configuration(req),
                SetupRequest::REQUEST_SET_CONFIGURATION => self.set_configuration(class, req),
                _ => self.pipe.stall(&self.bus),
            },
            RequestType::Class | RequestType::Vendor => self.forward_to_class(class, req),
            RequestType::Reserved => self.pipe.stall(&self.bus),
        }
    }

    fn setup_interface<C: ClassDriver<B>>(&mut self, class: &mut C, req: &SetupRequest) {
        match self.state {
            DeviceState::Configured => self.forward_to_class(class, req),
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn forward_to_class<C: ClassDriver<B>>(&mut self, class: &mut C, req: &SetupRequest) {
        self.pipe.set_class_routed(true);
        let mut ctl = Control::new(&self.bus, &mut self.pipe);
        class.setup(&mut ctl, req);
    }

    fn get_status(&mut self, req: &SetupRequest) {
        match self.state {
            DeviceState::Addressed | DeviceState::Configured => {
                let status = self.device_status.to_le_bytes();
                self.pipe.reply(&self.bus, req, &status);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn clear_feature(&mut self, req: &SetupRequest) {
        match self.state {
            DeviceState::Addressed | DeviceState::Configured
                if req.w_value == FEATURE_DEVICE_REMOTE_WAKEUP =>
            {
                self.device_status &= !0x0002;
                self.pipe.send_status(&self.bus);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn set_feature(&mut self, req: &SetupRequest) {
        match self.state {
            DeviceState::Addressed | DeviceState::Configured
                if req.w_value == FEATURE_DEVICE_REMOTE_WAKEUP =>
            {
                self.device_status |= 0x0002;
                self.pipe.send_status(&self.bus);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn set_address(&mut self, req: &SetupRequest) {
        match self.state {
            DeviceState::Default | DeviceState::Addressed => {
                let addr = (req.w_value & 0x7f) as u8;
                self.bus.set_device_address(addr);
                self.state = if addr == 0 {
                    DeviceState::Default
                } else {
                    DeviceState::Addressed
                };
                self.pipe.send_status(&self.bus);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn get_descriptor<C: ClassDriver<B>>(&mut self, class: &mut C, req: &SetupRequest) {
        if req.w_length == 0 {
            self.pipe.stall(&self.bus);
            return;
        }

        match (req.w_value >> 8) as u8 {
            descriptor::DESCRIPTOR_DEVICE => {
                self.pipe.reply(&self.bus, req, &self.device_descriptor);
            }
            descriptor::DESCRIPTOR_CONFIGURATION => {
                let desc = class.config_descriptor();
                self.pipe.reply(&self.bus, req, desc);
            }
            descriptor::DESCRIPTOR_STRING => match self.build_string(class, req.w_value as u8) {
                Some(len) => self.pipe.reply(&self.bus, req, &self.string_buf[..len]),
                None => self.pipe.stall(&self.bus),
            },
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn get_configuration(&mut self, req: &SetupRequest) {
        match self.state {
            DeviceState::Addressed => {
                self.pipe.reply(&self.bus, req, &[DEFAULT_CONFIG_INDEX]);
            }
            DeviceState::Configured => {
                let idx = self.config_index;
                self.pipe.reply(&self.bus, req, &[idx]);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn set_configuration<C: ClassDriver<B>>(&mut self, class: &mut C, req: &SetupRequest) {
        match self.state {
            DeviceState::Addressed => {
                if req.w_value != 0 {
                    // Deliberately stays Configured when the class driver
                    // fails to initialize; only the transfer reports failure.
                    self.state = DeviceState::Configured;
                    let cfg = req.w_value as u8;
                    if class.init(cfg).is_err() {
                        self.pipe.stall(&self.bus);
                        return;
                    }
                    self.config_index = cfg;
                }
                self.pipe.send_status(&self.bus);
            }
            DeviceState::Configured => {
                let cfg = req.w_value as u8;
                if cfg == 0 {
                    self.state = DeviceState::Addressed;
                    let prev = self.config_index;
                    self.config_index = 0;
                    class.deinit(prev);
                } else if cfg != self.config_index {
                    if class.init(cfg).is_err() {
                        self.pipe.stall(&self.bus);
                        return;
                    }
                    self.config_index = cfg;
                }
                self.pipe.send_status(&self.bus);
            }
            _ => self.pipe.stall(&self.bus),
        }
    }

    fn setup_endpoint(&mut self, req: &SetupRequest) {
        let ep_index = (req.w_index & 0x0f) as usize;
        let ep_dir = if req.w_index & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        };
        let ep = EndpointAddress::from_parts(ep_index, ep_dir);

        match req.b_request {
            SetupRequest::REQUEST_GET_STATUS => match self.state {
                DeviceState::Addressed if ep_index != 0 => {
                    // Hardware stall on the endpoint itself, then fail the
                    // control transfer.
                    self.bus.set_stalled(ep, true);
                    self.pipe.stall(&self.bus);
                }
                DeviceState::Addressed | DeviceState::Configured => {
                    let halted: u16 = if self.bus.is_stalled(ep) { 1 } else { 0 };
                    self.pipe.reply(&self.bus, req, &halted.to_le_bytes());
                }
                _ => self.pipe.stall(&self.bus),
            },
            SetupRequest::REQUEST_CLEAR_FEATURE => match self.state {
                DeviceState::Addressed => {
                    if ep_index != 0 {
                        self.bus.set_stalled(ep, true);
                    }
                    self.pipe.send_status(&self.bus);
                }
                DeviceState::Configured => {
                    if req.w_value == FEATURE_ENDPOINT_HALT && ep_index != 0 {
                        self.bus.set_stalled(ep, false);
                    }
                    self.pipe.send_status(&self.bus);
                }
                _ => self.pipe.stall(&self.bus),
            },
            SetupRequest::REQUEST_SET_FEATURE => match self.state {
                DeviceState::Addressed => {
                    if ep_index != 0 {
                        self.bus.set_stalled(ep, true);
                    }
                    self.pipe.send_status(&self.bus);
                }
                DeviceState::Configured => {
                    if req.w_value == FEATURE_ENDPOINT_HALT && ep_index != 0 {
                        self.bus.set_stalled(ep, true);
                    }
                    self.pipe.send_status(&self.bus);
                }
                _ => self.pipe.stall(&self.bus),
            },
            _ => self.pipe.stall(&self.bus),
        }
    }

    /// Synthesizes a string descriptor into the scratch buffer.
    fn build_string<C: ClassDriver<B>>(&mut self, class: &mut C, index: u8) -> Option<usize> {
        match index {
            descriptor::STRING_IDX_LANGID => {
                let n = descriptor::LANGID_DESCRIPTOR.len();
                self.string_buf[..n].copy_from_slice(&descriptor::LANGID_DESCRIPTOR);
                Some(n)
            }
            descriptor::STRING_IDX_MANUFACTURER => {
                let s = self.config.manufacturer;
                self.ascii_string(s)
            }
            descriptor::STRING_IDX_PRODUCT => {
                let s = self.config.product;
                self.ascii_string(s)
            }
            descriptor::STRING_IDX_SERIAL => self.serial_string(),
            descriptor::STRING_IDX_CONFIG => {
                let s = self.config.configuration;
                self.ascii_string(s)
            }
            descriptor::STRING_IDX_INTERFACE => {
                let s = self.config.interface;
                self.ascii_string(s)
            }
            descriptor::STRING_IDX_MSFT => {
                let n = descriptor::MSFT_STRING_DESCRIPTOR.len();
                self.string_buf[..n].copy_from_slice(&descriptor::MSFT_STRING_DESCRIPTOR);
                Some(n)
            }
            _ => {
                let s = class.string(index)?;
                self.ascii_string(s)
            }
        }
    }

    /// Converts an ASCII string into a UTF-16LE string descriptor.
    fn ascii_string(&mut self, s: &str) -> Option<usize> {
        let bytes = s.as_bytes();
        if bytes.is_empty() {
            return None;
        }
        let n = min(bytes.len(), (self.string_buf.len() - 2) / 2);
        let total = n * 2 + 2;
        self.string_buf[0] = total as u8;
        self.string_buf[1] = descriptor::DESCRIPTOR_STRING;
        for (i, b) in bytes[..n].iter().enumerate() {
            self.string_buf[2 + i * 2] = *b;
            self.string_buf[2 + i * 2 + 1] = 0x00;
        }
        Some(total)
    }

    /// Builds the serial number descriptor: lowercase hex of the device id.
    fn serial_string(&mut self) -> Option<usize> {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let id = self.config.device_id;
        if id.is_empty() {
            return None;
        }
        let n = min(id.len(), (self.string_buf.len() - 2) / 4);
        let total = n * 4 + 2;
        self.string_buf[0] = total as u8;
        self.string_buf[1] = descriptor::DESCRIPTOR_STRING;
        for (i, &b) in id[..n].iter().enumerate() {
            self.string_buf[2 + i * 4] = HEX[(b >> 4) as usize];
            self.string_buf[2 + i * 4 + 1] = 0x00;
            self.string_buf[2 + i * 4 + 2] = HEX[(b & 0x0f) as usize];
            self.string_buf[2 + i * 4 + 3] = 0x00;
        }
        Some(total)
    }
}
