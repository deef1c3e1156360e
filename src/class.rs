//! DFU 1.1a protocol state machine with the DfuSe vendor extension.

use core::cmp::min;

use usb_device::bus::UsbBus;

use crate::control::Control;
use crate::descriptor::{
    DESCRIPTOR_CONFIGURATION, DESCRIPTOR_DFU_FUNCTIONAL, DESCRIPTOR_INTERFACE,
    MSFT_EXT_COMPAT_ID_DESCRIPTOR, MSFT_EXT_PROPERTIES_DESCRIPTOR, MSFT_VENDOR_CODE,
    STRING_IDX_CONFIG, STRING_IDX_INTERFACE,
};
use crate::mal::{MalError, MediaAccessLayer};
use crate::setup::{RequestType, SetupRequest};
use crate::watchdog::ResetWatchdog;
use crate::TRANSFER_SIZE;

const USB_CLASS_APPLICATION_SPECIFIC: u8 = 0xfe;
const USB_SUBCLASS_DFU: u8 = 0x01;
const USB_PROTOCOL_DFU_MODE: u8 = 0x02;

const DFU_DETACH: u8 = 0x00;
const DFU_DNLOAD: u8 = 0x01;
const DFU_UPLOAD: u8 = 0x02;
const DFU_GETSTATUS: u8 = 0x03;
const DFU_CLRSTATUS: u8 = 0x04;
const DFU_GETSTATE: u8 = 0x05;
const DFU_ABORT: u8 = 0x06;

/// Number of selectable storage backends, one per USB alternate setting.
pub const MAX_ALT_SETTINGS: usize = 3;

const CONFIG_DESCRIPTOR_LEN: usize = 9 + MAX_ALT_SETTINGS * 9 + 9;

/// DFU device state, USB DFU 1.1 section 6.1.2.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuState {
    /// Device is running its normal application.
    AppIdle = 0,
    /// Device has received DFU_DETACH and is waiting for a USB reset.
    AppDetach = 1,
    /// Device is operating in DFU mode and is waiting for requests.
    DfuIdle = 2,
    /// Device has received a block and is waiting for DFU_GETSTATUS.
    DfuDnloadSync = 3,
    /// Device is programming a block into its nonvolatile memories.
    DfuDnBusy = 4,
    /// Device is processing a download operation, expecting DFU_DNLOAD.
    DfuDnloadIdle = 5,
    /// Device has received the final block and is waiting for DFU_GETSTATUS
    /// to begin the manifestation phase.
    DfuManifestSync = 6,
    /// Device is in the manifestation phase.
    DfuManifest = 7,
    /// Device has programmed its memories and is waiting for a reset.
    DfuManifestWaitReset = 8,
    /// Device is processing an upload operation, expecting DFU_UPLOAD.
    DfuUploadIdle = 9,
    /// An error has occurred, awaiting DFU_CLRSTATUS.
    DfuError = 10,
}

/// DFU status byte, USB DFU 1.1 section 6.1.2.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuStatusCode {
    /// No error condition is present.
    Ok = 0x00,
    /// File is not targeted for use by this device.
    ErrTarget = 0x01,
    /// File is for this device but fails a vendor-specific test.
    ErrFile = 0x02,
    /// Device is unable to write memory.
    ErrWrite = 0x03,
    /// Memory erase function failed.
    ErrErase = 0x04,
    /// Memory erase check failed.
    ErrCheckErased = 0x05,
    /// Program memory function failed.
    ErrProg = 0x06,
    /// Programmed memory failed verification.
    ErrVerify = 0x07,
    /// Received address is out of range.
    ErrAddress = 0x08,
    /// Received DFU_DNLOAD with wLength = 0 before all data arrived.
    ErrNotdone = 0x09,
    /// Device firmware is corrupt, cannot return to run-time operations.
    ErrFirmware = 0x0a,
    /// iString indicates a vendor-specific error.
    ErrVendor = 0x0b,
    /// Device detected unexpected USB reset signaling.
    ErrUsbr = 0x0c,
    /// Device detected unexpected power-on reset.
    ErrPor = 0x0d,
    /// Something went wrong, but the device does not know what it was.
    ErrUnknown = 0x0e,
    /// Device stalled an unexpected request.
    ErrStalledPkt = 0x0f,
}

impl From<MalError> for DfuStatusCode {
    fn from(e: MalError) -> Self {
        match e {
            MalError::Target => DfuStatusCode::ErrTarget,
            MalError::File => DfuStatusCode::ErrFile,
            MalError::Write => DfuStatusCode::ErrWrite,
            MalError::Erase => DfuStatusCode::ErrErase,
            MalError::CheckErased => DfuStatusCode::ErrCheckErased,
            MalError::Prog => DfuStatusCode::ErrProg,
            MalError::Verify => DfuStatusCode::ErrVerify,
            MalError::Address => DfuStatusCode::ErrAddress,
            MalError::Vendor => DfuStatusCode::ErrVendor,
            MalError::Unknown => DfuStatusCode::ErrUnknown,
        }
    }
}

/// DfuSe command carried in byte 0 of a `wValue == 0` download payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DfuseCommand {
    /// No command pending.
    None,
    /// Report the supported command opcodes through upload.
    GetCommand,
    /// Set the address pointer for subsequent block transfers.
    SetAddressPointer,
    /// Erase one sector.
    Erase,
    /// Remove read protection. Never supported by this implementation.
    ReadUnprotect,
    /// Unrecognized opcode.
    Other(u8),
}

impl DfuseCommand {
    /// `Get Command` opcode.
    pub const GET_COMMAND: u8 = 0x00;
    /// `Set Address Pointer` opcode.
    pub const SET_ADDRESS_POINTER: u8 = 0x21;
    /// `Erase` opcode.
    pub const ERASE: u8 = 0x41;
    /// `Read Unprotect` opcode.
    pub const READ_UNPROTECT: u8 = 0x92;

    /// Maps a wire opcode to a command.
    pub fn from_byte(op: u8) -> Self {
        match op {
            Self::GET_COMMAND => DfuseCommand::GetCommand,
            Self::SET_ADDRESS_POINTER => DfuseCommand::SetAddressPointer,
            Self::ERASE => DfuseCommand::Erase,
            Self::READ_UNPROTECT => DfuseCommand::ReadUnprotect,
            other => DfuseCommand::Other(other),
        }
    }
}

/// The DFU_GETSTATUS payload: status byte, 24-bit poll timeout, state byte
/// and status description string index.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct DfuStatus {
    status: DfuStatusCode,
    /// Milliseconds the host must wait before the next request. Storage
    /// backends set this from [`get_status()`](MediaAccessLayer::get_status)
    /// to advertise program/erase duration; zero by default.
    pub poll_timeout: u32,
    state: DfuState,
    i_string: u8,
}

impl DfuStatus {
    fn new() -> Self {
        DfuStatus {
            status: DfuStatusCode::Ok,
            poll_timeout: 0,
            state: DfuState::DfuIdle,
            i_string: 0,
        }
    }

    /// Current DFU state.
    pub fn state(&self) -> DfuState {
        self.state
    }

    /// Current DFU status code.
    pub fn status(&self) -> DfuStatusCode {
        self.status
    }
}

impl From<DfuStatus> for [u8; 6] {
    fn from(dfu: DfuStatus) -> Self {
        [
            // bStatus
            dfu.status as u8,
            // bwPollTimeout
            (dfu.poll_timeout & 0xff) as u8,
            ((dfu.poll_timeout >> 8) & 0xff) as u8,
            ((dfu.poll_timeout >> 16) & 0xff) as u8,
            // bState
            dfu.state as u8,
            // iString
            dfu.i_string,
        ]
    }
}

/// Class driver interface consumed by [`DeviceCore`](crate::DeviceCore).
///
/// Class/vendor requests and, once the device is configured, every
/// interface-recipient request are forwarded to
/// [`setup()`](ClassDriver::setup) verbatim; the remaining hooks report the
/// progress of the transaction it started.
pub trait ClassDriver<B: UsbBus> {
    /// Activates configuration `cfg_idx`. Failure stalls the
    /// SET_CONFIGURATION transfer.
    fn init(&mut self, cfg_idx: u8) -> Result<(), ()>;

    /// Deactivates configuration `cfg_idx`.
    fn deinit(&mut self, cfg_idx: u8);

    /// Handles a forwarded Setup packet. The implementation must reply,
    /// arm reception, or stall through `ctl`.
    fn setup(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest);

    /// The OUT data stage armed by [`setup()`](ClassDriver::setup) has
    /// completed. `Err` stalls the status stage.
    fn data_out_done(&mut self, req: &SetupRequest, data: &[u8]) -> Result<(), ()> {
        let _ = (req, data);
        Ok(())
    }

    /// The IN data stage of a reply was fully transmitted. `Err` stalls EP0.
    fn data_in_done(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) -> Result<(), ()> {
        let _ = (ctl, req);
        Ok(())
    }

    /// Configuration descriptor of the active class.
    fn config_descriptor(&self) -> &[u8];

    /// String descriptor content for indices the device core does not own.
    fn string(&self, index: u8) -> Option<&str> {
        let _ = index;
        None
    }

    /// A bus reset was detected.
    fn usb_reset(&mut self) {}
}

/// USB DFU mode class driver.
///
/// Implements the DFU 1.1 state machine plus the DfuSe address-pointer and
/// erase sub-protocol on top of [`DeviceCore`](crate::DeviceCore). Up to
/// [`MAX_ALT_SETTINGS`] storage backends can be registered; the host selects
/// one with SET_INTERFACE and addresses it through block downloads and
/// uploads relative to the DfuSe address pointer.
pub struct DfuClassDriver<'a> {
    alt_setting: u8,
    status: DfuStatus,
    /// DfuSe address pointer; block addresses are relative to it.
    address: u32,
    dfuse_cmd: DfuseCommand,
    /// Request that started the transfer pending in `transfer_buf`.
    req: Option<SetupRequest>,
    transfer_buf: [u8; TRANSFER_SIZE],
    transfer_len: usize,
    mal: [Option<&'a mut dyn MediaAccessLayer>; MAX_ALT_SETTINGS],
    watchdog: &'a ResetWatchdog,
    config_descriptor: [u8; CONFIG_DESCRIPTOR_LEN],
}

impl<'a> DfuClassDriver<'a> {
    /// Creates the class driver. `watchdog` is armed when a completed
    /// download session parks the state machine in `dfuMANIFEST_WAIT_RESET`.
    pub fn new(watchdog: &'a ResetWatchdog) -> Self {
        DfuClassDriver {
            alt_setting: 0,
            status: DfuStatus::new(),
            address: 0,
            dfuse_cmd: DfuseCommand::None,
            req: None,
            transfer_buf: [0; TRANSFER_SIZE],
            transfer_len: 0,
            mal: core::array::from_fn(|_| None),
            watchdog,
            config_descriptor: build_config_descriptor(),
        }
    }

    /// Registers a storage backend under alternate setting `index`.
    pub fn register_mal(&mut self, index: usize, mal: &'a mut dyn MediaAccessLayer) -> bool {
        if index < MAX_ALT_SETTINGS {
            self.mal[index] = Some(mal);
            true
        } else {
            false
        }
    }

    /// Current DFU state.
    pub fn state(&self) -> DfuState {
        self.status.state()
    }

    /// Current DFU status code.
    pub fn status_code(&self) -> DfuStatusCode {
        self.status.status()
    }

    /// Current DfuSe address pointer.
    pub fn address_pointer(&self) -> u32 {
        self.address
    }

    /// Selected alternate setting.
    pub fn alt_setting(&self) -> u8 {
        self.alt_setting
    }

    fn set_state(&mut self, state: DfuState) {
        self.status.state = state;
    }

    fn set_status(&mut self, status: DfuStatusCode) {
        self.status.status = status;
    }

    /// Enters `dfuERROR`. The caller stalls the transfer.
    fn enter_error(&mut self, status: DfuStatusCode) {
        // Leaving the wait-for-reset state cancels the pending reset.
        if self.state() == DfuState::DfuManifestWaitReset {
            self.watchdog.disarm();
        }
        self.set_status(status);
        self.set_state(DfuState::DfuError);
    }

    /// Clears the per-session transfer state. The address pointer survives
    /// until the next `init()`.
    fn reset_session(&mut self) {
        self.dfuse_cmd = DfuseCommand::None;
        self.req = None;
        self.transfer_len = 0;
        self.watchdog.disarm();
    }

    /// Absolute address of block `w_value`: `(wBlockNum - 2) * wTransferSize
    /// + address pointer`.
    fn block_address(&self, w_value: u16) -> Option<u32> {
        ((w_value - 2) as u32)
            .checked_mul(TRANSFER_SIZE as u32)?
            .checked_add(self.address)
    }

    fn handle_msft_request<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) {
        if req.w_index == 0x0004 {
            ctl.reply(req, &MSFT_EXT_COMPAT_ID_DESCRIPTOR);
        } else if req.w_index == 0x0005 {
            if req.w_value & 0xff == 0 {
                ctl.reply(req, &MSFT_EXT_PROPERTIES_DESCRIPTOR);
            } else {
                // Dummy reply for unrecognized property page indices.
                ctl.reply(req, &[0u8; 10]);
            }
        } else {
            ctl.stall();
        }
    }

    fn handle_standard_request<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) {
        match req.b_request {
            SetupRequest::REQUEST_GET_DESCRIPTOR
                if (req.w_value >> 8) as u8 == DESCRIPTOR_DFU_FUNCTIONAL =>
            {
                // The functional descriptor is the tail of the configuration
                // descriptor.
                let off = self.config_descriptor.len() - 9;
                ctl.reply(req, &self.config_descriptor[off..]);
            }
            SetupRequest::REQUEST_GET_INTERFACE => {
                ctl.reply(req, &[self.alt_setting]);
            }
            SetupRequest::REQUEST_SET_INTERFACE => {
                if (req.w_value as usize) < MAX_ALT_SETTINGS {
                    self.alt_setting = req.w_value as u8;
                    ctl.accept();
                } else {
                    ctl.stall();
                }
            }
            _ => ctl.stall(),
        }
    }

    fn handle_dfu_request<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) {
        match req.b_request {
            DFU_DETACH => self.detach(ctl, req),
            DFU_DNLOAD => self.download(ctl, req),
            DFU_UPLOAD => self.upload(ctl, req),
            DFU_GETSTATUS => self.get_status(ctl, req),
            DFU_CLRSTATUS => self.clear_status(ctl, req),
            DFU_GETSTATE => self.get_state(ctl, req),
            DFU_ABORT => self.abort(ctl, req),
            _ => ctl.stall(),
        }
    }

    fn detach<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, _req: &SetupRequest) {
        match self.state() {
            DfuState::DfuIdle
            | DfuState::DfuDnloadSync
            | DfuState::DfuDnloadIdle
            | DfuState::DfuManifestSync
            | DfuState::DfuUploadIdle => {
                self.set_state(DfuState::DfuIdle);
                ctl.accept();
                // bitWillDetach is always advertised, so the detach-attach
                // cycle happens here regardless of wTimeout.
                ctl.detach_reattach();
            }
            _ => {
                self.enter_error(DfuStatusCode::ErrUnknown);
                ctl.stall();
            }
        }
    }

    fn download<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) {
        match self.state() {
            DfuState::DfuIdle | DfuState::DfuDnloadIdle => {
                self.req = Some(*req);
                if req.w_length > 0 {
                    self.set_state(DfuState::DfuDnloadSync);
                    ctl.receive(req);
                } else {
                    // Leave request: all blocks received, manifest next.
                    self.set_state(DfuState::DfuManifestSync);
                    ctl.accept();
                }
            }
            _ => {
                self.enter_error(DfuStatusCode::ErrUnknown);
                ctl.stall();
            }
        }
    }

    fn upload<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) {
        match self.state() {
            DfuState::DfuIdle | DfuState::DfuUploadIdle => {
                self.req = Some(*req);
                if req.w_value == 0 {
                    // DfuSe command list.
                    let commands = [
                        DfuseCommand::GET_COMMAND,
                        DfuseCommand::SET_ADDRESS_POINTER,
                        DfuseCommand::ERASE,
                    ];
                    self.set_state(DfuState::DfuIdle);
                    ctl.reply(req, &commands);
                } else if req.w_value > 1 {
                    let len = min(req.w_length as usize, TRANSFER_SIZE);
                    let result = match self.block_address(req.w_value) {
                        Some(addr) => {
                            let Self {
                                mal,
                                transfer_buf,
                                alt_setting,
                                ..
                            } = self;
                            match mal.get_mut(*alt_setting as usize) {
                                Some(Some(m)) if m.validate(addr, len) => {
                                    m.read(addr, &mut transfer_buf[..len])
                                }
                                _ => Err(MalError::Unknown),
                            }
                        }
                        None => Err(MalError::Address),
                    };
                    match result {
                        Ok(()) => {
                            self.set_state(DfuState::DfuUploadIdle);
                            ctl.reply(req, &self.transfer_buf[..len]);
                        }
                        Err(_) => {
                            self.enter_error(DfuStatusCode::ErrUnknown);
                            ctl.stall();
                        }
                    }
                } else {
                    self.enter_error(DfuStatusCode::ErrUnknown);
                    ctl.stall();
                }
            }
            _ => {
                self.enter_error(DfuStatusCode::ErrUnknown);
                ctl.stall();
            }
        }
    }

    fn get_status<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) {
        let state = self.state();
        self.status.poll_timeout = 0;

        match state {
            DfuState::DfuDnloadSync => {
                if self.req.map_or(false, |r| r.w_length > 0) {
                    // Data pending: programming starts once this reply is on
                    // the wire. Let the backend advertise how long it takes.
                    self.set_state(DfuState::DfuDnBusy);
                    let cmd = self.dfuse_cmd;
                    let Self {
                        mal,
                        status,
                        alt_setting,
                        ..
                    } = self;
                    if let Some(Some(m)) = mal.get_mut(*alt_setting as usize) {
                        m.get_status(status, cmd);
                    }
                } else {
                    // Block complete.
                    self.set_state(DfuState::DfuDnloadIdle);
                }
            }
            DfuState::DfuManifestSync => {
                self.set_state(DfuState::DfuManifest);
                self.set_status(DfuStatusCode::Ok);
            }
            DfuState::DfuManifest => {
                self.set_state(DfuState::DfuManifestWaitReset);
            }
            _ => {}
        }

        match state {
            DfuState::DfuDnloadSync
            | DfuState::DfuManifestSync
            | DfuState::DfuManifest
            | DfuState::AppIdle
            | DfuState::AppDetach
            | DfuState::DfuIdle
            | DfuState::DfuDnloadIdle
            | DfuState::DfuUploadIdle
            | DfuState::DfuError => {
                let bytes: [u8; 6] = self.status.into();
                ctl.reply(req, &bytes);
            }
            _ => {
                // No GETSTATUS transition from dfuDNBUSY or WAIT_RESET.
                self.enter_error(DfuStatusCode::ErrUnknown);
                ctl.stall();
            }
        }
    }

    fn clear_status<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, _req: &SetupRequest) {
        if self.state() == DfuState::DfuError {
            self.set_state(DfuState::DfuIdle);
            self.set_status(DfuStatusCode::Ok);
            ctl.accept();
        } else {
            self.enter_error(DfuStatusCode::ErrUnknown);
            ctl.stall();
        }
    }

    fn get_state<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) {
        match self.state() {
            DfuState::DfuDnBusy | DfuState::DfuManifest | DfuState::DfuManifestWaitReset => {
                self.enter_error(DfuStatusCode::ErrUnknown);
                ctl.stall();
            }
            state => ctl.reply(req, &[state as u8]),
        }
    }

    fn abort<B: UsbBus>(&mut self, ctl: &mut Control<'_, B>, _req: &SetupRequest) {
        match self.state() {
            DfuState::DfuIdle
            | DfuState::DfuDnloadSync
            | DfuState::DfuDnloadIdle
            | DfuState::DfuManifestSync
            | DfuState::DfuUploadIdle => {
                self.set_state(DfuState::DfuIdle);
                self.set_status(DfuStatusCode::Ok);
                self.reset_session();
                ctl.accept();
            }
            _ => {
                self.enter_error(DfuStatusCode::ErrUnknown);
                ctl.stall();
            }
        }
    }

    /// Executes the command whose DFU_GETSTATUS reply just went out.
    fn execute_pending(&mut self) -> Result<(), ()> {
        let req = match self.req {
            Some(r) => r,
            None => {
                self.enter_error(DfuStatusCode::ErrUnknown);
                return Err(());
            }
        };

        if req.w_value == 0 && req.w_length > 0 {
            self.execute_dfuse_command(&req)
        } else if req.w_value > 1 {
            let len = self.transfer_len;
            let result = match self.block_address(req.w_value) {
                Some(addr) => {
                    let Self {
                        mal,
                        transfer_buf,
                        alt_setting,
                        ..
                    } = self;
                    match mal.get_mut(*alt_setting as usize) {
                        Some(Some(m)) if m.validate(addr, len) => {
                            m.write(addr, &transfer_buf[..len])
                        }
                        _ => Err(MalError::Unknown),
                    }
                }
                None => Err(MalError::Address),
            };
            match result {
                Ok(()) => {
                    self.set_state(DfuState::DfuDnloadIdle);
                    self.set_status(DfuStatusCode::Ok);
                    Ok(())
                }
                Err(_) => {
                    self.enter_error(DfuStatusCode::ErrUnknown);
                    Err(())
                }
            }
        } else {
            // wBlockNum 1 is reserved.
            self.enter_error(DfuStatusCode::ErrTarget);
            self.reset_session();
            Err(())
        }
    }

    fn execute_dfuse_command(&mut self, req: &SetupRequest) -> Result<(), ()> {
        match self.dfuse_cmd {
            DfuseCommand::GetCommand => {
                self.set_state(DfuState::DfuDnloadIdle);
                self.set_status(DfuStatusCode::Ok);
                Ok(())
            }
            DfuseCommand::SetAddressPointer => {
                if req.w_length == 5 {
                    self.address = u32::from_le_bytes([
                        self.transfer_buf[1],
                        self.transfer_buf[2],
                        self.transfer_buf[3],
                        self.transfer_buf[4],
                    ]);
                    self.set_state(DfuState::DfuDnloadIdle);
                    self.set_status(DfuStatusCode::Ok);
                    Ok(())
                } else {
                    self.enter_error(DfuStatusCode::ErrUnknown);
                    Err(())
                }
            }
            DfuseCommand::Erase => {
                if req.w_length == 5 {
                    let addr = u32::from_le_bytes([
                        self.transfer_buf[1],
                        self.transfer_buf[2],
                        self.transfer_buf[3],
                        self.transfer_buf[4],
                    ]);
                    let result = {
                        let Self {
                            mal, alt_setting, ..
                        } = self;
                        match mal.get_mut(*alt_setting as usize) {
                            Some(Some(m)) if m.validate(addr, 0) => m.erase(addr, 0),
                            _ => Err(MalError::Unknown),
                        }
                    };
                    match result {
                        Ok(()) => {
                            self.set_state(DfuState::DfuDnloadIdle);
                            self.set_status(DfuStatusCode::Ok);
                            Ok(())
                        }
                        Err(_) => {
                            self.enter_error(DfuStatusCode::ErrUnknown);
                            Err(())
                        }
                    }
                } else if req.w_length == 1 {
                    // Mass erase is deliberately unsupported.
                    self.enter_error(DfuStatusCode::ErrTarget);
                    Err(())
                } else {
                    self.enter_error(DfuStatusCode::ErrUnknown);
                    Err(())
                }
            }
            DfuseCommand::ReadUnprotect => {
                // Unsupported.
                self.enter_error(DfuStatusCode::ErrUnknown);
                Err(())
            }
            DfuseCommand::None | DfuseCommand::Other(_) => {
                self.enter_error(DfuStatusCode::ErrStalledPkt);
                Err(())
            }
        }
    }
}

impl<'a, B: UsbBus> ClassDriver<B> for DfuClassDriver<'a> {
    fn init(&mut self, _cfg_idx: u8) -> Result<(), ()> {
        self.set_state(DfuState::DfuIdle);
        self.set_status(DfuStatusCode::Ok);
        self.reset_session();
        self.address = 0;
        for m in self.mal.iter_mut().flatten() {
            let _ = m.init();
        }
        Ok(())
    }

    fn deinit(&mut self, _cfg_idx: u8) {
        for m in self.mal.iter_mut().flatten() {
            let _ = m.deinit();
        }
    }

    fn setup(&mut self, ctl: &mut Control<'_, B>, req: &SetupRequest) {
        // The Microsoft OS descriptor side channel bypasses every other
        // dispatch rule.
        if req.b_request == MSFT_VENDOR_CODE
            && ((req.bm_request_type == 0xc1 && req.w_index == 0x0005)
                || (req.bm_request_type == 0xc0 && req.w_index == 0x0004))
        {
            self.handle_msft_request(ctl, req);
            return;
        }

        match req.request_type() {
            RequestType::Standard => self.handle_standard_request(ctl, req),
            RequestType::Class => self.handle_dfu_request(ctl, req),
            _ => ctl.stall(),
        }
    }

    fn data_out_done(&mut self, _req: &SetupRequest, data: &[u8]) -> Result<(), ()> {
        let n = min(data.len(), TRANSFER_SIZE);
        self.transfer_buf[..n].copy_from_slice(&data[..n]);
        self.transfer_len = n;
        // Parse the DfuSe opcode now so the backend can time the right
        // operation when DFU_GETSTATUS asks for a poll timeout.
        self.dfuse_cmd = match self.req {
            Some(r) if r.w_value == 0 && n > 0 => DfuseCommand::from_byte(data[0]),
            _ => DfuseCommand::None,
        };
        Ok(())
    }

    fn data_in_done(&mut self, _ctl: &mut Control<'_, B>, _req: &SetupRequest) -> Result<(), ()> {
        match self.state() {
            // The DFU_GETSTATUS reply that announced dfuDNBUSY is on the
            // wire; perform the DfuSe command or block write now.
            DfuState::DfuDnBusy => self.execute_pending(),
            DfuState::DfuManifest => {
                self.set_state(DfuState::DfuManifestWaitReset);
                self.watchdog.arm();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn config_descriptor(&self) -> &[u8] {
        &self.config_descriptor
    }

    fn string(&self, index: u8) -> Option<&str> {
        // Layout strings of the registered backends live right above the
        // fixed string indices.
        let base = STRING_IDX_INTERFACE + 1;
        if index >= base && index < base + MAX_ALT_SETTINGS as u8 {
            match &self.mal[(index - base) as usize] {
                Some(m) => Some(m.info_string()),
                None => None,
            }
        } else {
            None
        }
    }

    fn usb_reset(&mut self) {
        // Flag an unexpected reset to the host if a session was in progress.
        match self.state() {
            DfuState::DfuUploadIdle
            | DfuState::DfuDnloadIdle
            | DfuState::DfuDnloadSync
            | DfuState::DfuDnBusy
            | DfuState::DfuError
            | DfuState::DfuManifest
            | DfuState::DfuManifestSync => {
                self.set_status(DfuStatusCode::ErrUsbr);
                self.set_state(DfuState::DfuError);
            }
            DfuState::DfuIdle
            | DfuState::AppDetach
            | DfuState::AppIdle
            | DfuState::DfuManifestWaitReset => {}
        }
    }
}

/// Builds the configuration descriptor: one configuration, one interface
/// with an alternate setting per backend slot, one DFU functional descriptor.
fn build_config_descriptor() -> [u8; CONFIG_DESCRIPTOR_LEN] {
    let mut desc = [0u8; CONFIG_DESCRIPTOR_LEN];
    let total = CONFIG_DESCRIPTOR_LEN as u16;

    desc[..9].copy_from_slice(&[
        0x09,                      /* bLength */
        DESCRIPTOR_CONFIGURATION,  /* bDescriptorType */
        total as u8,               /* wTotalLength */
        (total >> 8) as u8,
        0x01,                      /* bNumInterfaces */
        0x01,                      /* bConfigurationValue */
        STRING_IDX_CONFIG,         /* iConfiguration */
        0xc0,                      /* bmAttributes: self powered */
        0x32,                      /* bMaxPower: 100 mA */
    ]);

    for alt in 0..MAX_ALT_SETTINGS {
        let off = 9 + alt * 9;
        desc[off..off + 9].copy_from_slice(&[
            0x09,                          /* bLength */
            DESCRIPTOR_INTERFACE,          /* bDescriptorType */
            0x00,                          /* bInterfaceNumber */
            alt as u8,                     /* bAlternateSetting */
            0x00,                          /* bNumEndpoints: control only */
            USB_CLASS_APPLICATION_SPECIFIC,/* bInterfaceClass */
            USB_SUBCLASS_DFU,              /* bInterfaceSubClass */
            USB_PROTOCOL_DFU_MODE,         /* bInterfaceProtocol */
            STRING_IDX_INTERFACE + 1 + alt as u8, /* iInterface */
        ]);
    }

    let off = 9 + MAX_ALT_SETTINGS * 9;
    desc[off..off + 9].copy_from_slice(&[
        0x09,                          /* bLength */
        DESCRIPTOR_DFU_FUNCTIONAL,     /* bDescriptorType */
        0x0b,                          /* bmAttributes: bitWillDetach |
                                        * bitCanUpload | bitCanDnload */
        0xff, 0x00,                    /* wDetachTimeOut */
        (TRANSFER_SIZE & 0xff) as u8,  /* wTransferSize */
        (TRANSFER_SIZE >> 8) as u8,
        0x1a, 0x01,                    /* bcdDFUVersion 1.1a (DfuSe) */
    ]);

    desc
}
