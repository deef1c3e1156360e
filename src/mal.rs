//! Media Access Layer: the storage backend abstraction of the DFU class.
//!
//! One backend is registered per USB alternate setting; the host picks the
//! region it wants to touch with SET_INTERFACE and every subsequent
//! read/write/erase lands on that backend. A backend describes its own
//! partition layout to host tooling through
//! [`info_string()`](MediaAccessLayer::info_string).

use crate::class::{DfuStatus, DfuseCommand};

/// Errors reported by a storage backend.
///
/// Values match the DFU status byte they would map to on the wire, though the
/// class driver reports every backend failure as `errUNKNOWN` and only a
/// subsequent `DFU_CLRSTATUS` recovers the session.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum MalError {
    /// Operation is not supported by this backend.
    Target = 0x01,
    /// Content fails a backend-specific verification test.
    File = 0x02,
    /// Backend is unable to write memory.
    Write = 0x03,
    /// Erase function failed.
    Erase = 0x04,
    /// Erase check failed.
    CheckErased = 0x05,
    /// Program function failed.
    Prog = 0x06,
    /// Programmed memory failed verification.
    Verify = 0x07,
    /// Address is out of range for this backend.
    Address = 0x08,
    /// Backend-specific error.
    Vendor = 0x0b,
    /// Something went wrong, but the backend does not know what it was.
    Unknown = 0x0e,
}

/// Storage backend interface.
///
/// Implementations are expected to run from USB interrupt context and must
/// not block longer than the poll timeout they advertise through
/// [`get_status()`](MediaAccessLayer::get_status).
pub trait MediaAccessLayer {
    /// Brings the backend up. Called when the device is configured.
    fn init(&mut self) -> Result<(), MalError> {
        Ok(())
    }

    /// Shuts the backend down. Called when the configuration is cleared.
    fn deinit(&mut self) -> Result<(), MalError> {
        Ok(())
    }

    /// Bounds check. Must reject a region that is not fully inside the
    /// backend rather than letting the underlying driver fault.
    fn validate(&self, address: u32, length: usize) -> bool;

    /// Reads `buf.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), MalError>;

    /// Writes `data` starting at `address`.
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), MalError>;

    /// Erases the sector containing `address`. A zero `length` means one
    /// sector, the only granularity the DfuSe erase command can request.
    fn erase(&mut self, address: u32, length: usize) -> Result<(), MalError>;

    /// Lets the backend fill in `bwPollTimeout` for the operation whose
    /// completion the host is about to wait for. The default leaves it zero.
    fn get_status(&mut self, status: &mut DfuStatus, cmd: DfuseCommand) {
        let _ = (status, cmd);
    }

    /// DfuSe layout string for this backend, e.g.
    /// `"@Internal Flash /0x00000000/3*004Ka,48*004Kg,197*004Kg,8*004Ka"`.
    fn info_string(&self) -> &str;
}

/// Backend for an alternate setting with no storage behind it.
///
/// Keeps a slot (and its layout string) enumerable while every operation
/// fails with [`MalError::Unknown`].
pub struct PlaceholderMal<'a> {
    info: &'a str,
}

impl<'a> PlaceholderMal<'a> {
    /// Creates a placeholder advertising `info` as its layout string.
    pub const fn new(info: &'a str) -> Self {
        PlaceholderMal { info }
    }
}

impl MediaAccessLayer for PlaceholderMal<'_> {
    fn init(&mut self) -> Result<(), MalError> {
        Err(MalError::Unknown)
    }

    fn deinit(&mut self) -> Result<(), MalError> {
        Err(MalError::Unknown)
    }

    fn validate(&self, _address: u32, _length: usize) -> bool {
        false
    }

    fn read(&mut self, _address: u32, _buf: &mut [u8]) -> Result<(), MalError> {
        Err(MalError::Unknown)
    }

    fn write(&mut self, _address: u32, _data: &[u8]) -> Result<(), MalError> {
        Err(MalError::Unknown)
    }

    fn erase(&mut self, _address: u32, _length: usize) -> Result<(), MalError> {
        Err(MalError::Unknown)
    }

    fn info_string(&self) -> &str {
        self.info
    }
}

/// Wrapper that exposes a backend read-only.
///
/// Reads pass through; write and erase report unsupported. Used for regions
/// the bootloader must never let the host touch (MBR, bootloader itself).
pub struct ReadOnlyMal<M: MediaAccessLayer> {
    inner: M,
}

impl<M: MediaAccessLayer> ReadOnlyMal<M> {
    /// Wraps `inner`, keeping only its read path reachable.
    pub const fn new(inner: M) -> Self {
        ReadOnlyMal { inner }
    }
}

impl<M: MediaAccessLayer> MediaAccessLayer for ReadOnlyMal<M> {
    fn init(&mut self) -> Result<(), MalError> {
        self.inner.init()
    }

    fn deinit(&mut self) -> Result<(), MalError> {
        self.inner.deinit()
    }

    fn validate(&self, address: u32, length: usize) -> bool {
        self.inner.validate(address, length)
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), MalError> {
        self.inner.read(address, buf)
    }

    fn write(&mut self, _address: u32, _data: &[u8]) -> Result<(), MalError> {
        Err(MalError::Unknown)
    }

    fn erase(&mut self, _address: u32, _length: usize) -> Result<(), MalError> {
        Err(MalError::Unknown)
    }

    fn get_status(&mut self, status: &mut DfuStatus, cmd: DfuseCommand) {
        self.inner.get_status(status, cmd)
    }

    fn info_string(&self) -> &str {
        self.inner.info_string()
    }
}
