//! EP0 control pipe state machine.
//!
//! The pipe owns the staging buffer every control transfer passes through and
//! tracks the stage of the one transaction that can be in flight on EP0. The
//! device core feeds it the per-interrupt endpoint events and dispatches the
//! events it emits.

use core::cmp::min;

use usb_device::bus::UsbBus;
use usb_device::endpoint::EndpointAddress;

use crate::setup::SetupRequest;
use crate::TRANSFER_SIZE;

#[derive(Clone, Copy, PartialEq, Eq)]
enum PipeState {
    Idle,
    /// IN data stage in progress, more packets to send.
    DataIn,
    /// IN data sent, a terminating ZLP still to send.
    DataInZlp,
    /// Last IN packet queued, waiting for it to go out on the bus.
    DataInLast,
    /// Waiting for the host's zero-length OUT status stage.
    StatusOut,
    /// OUT data stage in progress.
    DataOut,
    /// Zero-length IN status stage queued.
    StatusIn,
    /// Transaction ended in a protocol stall.
    Stalled,
}

/// Event emitted by the pipe for the device core to dispatch.
pub(crate) enum PipeEvent {
    /// Nothing to dispatch.
    None,
    /// A Setup packet was decoded.
    Setup(SetupRequest),
    /// The OUT data stage of the current request completed.
    OutDone(SetupRequest),
    /// The IN data stage of the current request was fully transmitted.
    InDone(SetupRequest),
}

pub(crate) struct ControlPipe {
    state: PipeState,
    req: Option<SetupRequest>,
    buf: [u8; TRANSFER_SIZE],
    /// Total data stage length: staged reply size or expected OUT size.
    len: usize,
    /// Data stage progress in bytes.
    pos: usize,
    need_zlp: bool,
    /// Current request was forwarded to the class driver.
    class_routed: bool,
    max_packet: usize,
    ep_out: EndpointAddress,
    ep_in: EndpointAddress,
}

impl ControlPipe {
    pub fn new(ep_out: EndpointAddress, ep_in: EndpointAddress, max_packet: usize) -> Self {
        ControlPipe {
            state: PipeState::Idle,
            req: None,
            buf: [0; TRANSFER_SIZE],
            len: 0,
            pos: 0,
            need_zlp: false,
            class_routed: false,
            max_packet,
            ep_out,
            ep_in,
        }
    }

    pub fn bus_reset(&mut self) {
        self.state = PipeState::Idle;
        self.req = None;
        self.class_routed = false;
    }

    pub fn set_class_routed(&mut self, routed: bool) {
        self.class_routed = routed;
    }

    pub fn class_routed(&self) -> bool {
        self.class_routed
    }

    /// Data received in the completed OUT data stage.
    pub fn out_data(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    /// Decodes a Setup packet from EP0. Aborts any transaction in flight.
    pub fn handle_setup<B: UsbBus>(&mut self, bus: &B) -> PipeEvent {
        let mut raw = [0u8; SetupRequest::SIZE];
        let n = match bus.read(self.ep_out, &mut raw) {
            Ok(n) => n,
            Err(_) => return PipeEvent::None,
        };

        // A new Setup unconditionally supersedes whatever was in flight.
        self.state = PipeState::Idle;
        self.req = None;
        self.class_routed = false;
        bus.set_stalled(self.ep_out, false);
        bus.set_stalled(self.ep_in, false);

        match SetupRequest::parse(&raw[..n]) {
            Some(req) => {
                self.req = Some(req);
                PipeEvent::Setup(req)
            }
            None => {
                self.stall(bus);
                PipeEvent::None
            }
        }
    }

    /// Handles an OUT transfer event on EP0.
    pub fn handle_out<B: UsbBus>(&mut self, bus: &B) -> PipeEvent {
        match self.state {
            PipeState::DataOut => {
                let end = min(self.pos + self.max_packet, self.len);
                let n = match bus.read(self.ep_out, &mut self.buf[self.pos..end]) {
                    Ok(n) => n,
                    Err(_) => return PipeEvent::None,
                };
                self.pos += n;
                // A short packet terminates the data stage early.
                if self.pos >= self.len || n < self.max_packet {
                    self.len = self.pos;
                    match self.req {
                        Some(req) => return PipeEvent::OutDone(req),
                        None => self.stall(bus),
                    }
                }
                PipeEvent::None
            }
            PipeState::StatusOut => {
                let _ = bus.read(self.ep_out, &mut []);
                self.state = PipeState::Idle;
                PipeEvent::None
            }
            _ => PipeEvent::None,
        }
    }

    /// Handles an IN-transfer-complete event on EP0.
    pub fn handle_in_complete<B: UsbBus>(&mut self, bus: &B) -> PipeEvent {
        match self.state {
            PipeState::DataIn => {
                self.next_in_packet(bus);
                PipeEvent::None
            }
            PipeState::DataInZlp => {
                let _ = bus.write(self.ep_in, &[]);
                self.state = PipeState::DataInLast;
                PipeEvent::None
            }
            PipeState::DataInLast => {
                self.state = PipeState::StatusOut;
                match self.req {
                    Some(req) => PipeEvent::InDone(req),
                    None => PipeEvent::None,
                }
            }
            PipeState::StatusIn => {
                self.state = PipeState::Idle;
                PipeEvent::None
            }
            _ => PipeEvent::None,
        }
    }

    /// Stages the IN data stage of a reply, clipped to `wLength`.
    ///
    /// The reply is terminated with a zero-length packet when it is shorter
    /// than the host asked for and an exact multiple of the EP0 packet size.
    /// With `wLength == 0` this degenerates to the zero-length status stage.
    pub fn reply<B: UsbBus>(&mut self, bus: &B, req: &SetupRequest, data: &[u8]) {
        if req.w_length == 0 {
            self.send_status(bus);
            return;
        }

        let len = min(min(data.len(), req.w_length as usize), TRANSFER_SIZE);
        self.buf[..len].copy_from_slice(&data[..len]);
        self.len = len;
        self.pos = 0;
        self.need_zlp = len < req.w_length as usize && len % self.max_packet == 0;
        self.state = PipeState::DataIn;
        self.next_in_packet(bus);
    }

    /// Arms reception of the OUT data stage, clipped to the staging buffer.
    pub fn receive<B: UsbBus>(&mut self, _bus: &B, req: &SetupRequest) {
        self.len = min(req.w_length as usize, TRANSFER_SIZE);
        self.pos = 0;
        self.state = PipeState::DataOut;
    }

    /// Queues the zero-length IN status stage that closes an OUT transaction.
    pub fn send_status<B: UsbBus>(&mut self, bus: &B) {
        let _ = bus.write(self.ep_in, &[]);
        self.state = PipeState::StatusIn;
    }

    /// Protocol-stalls EP0 in both directions.
    pub fn stall<B: UsbBus>(&mut self, bus: &B) {
        bus.set_stalled(self.ep_out, true);
        bus.set_stalled(self.ep_in, true);
        self.state = PipeState::Stalled;
    }

    fn next_in_packet<B: UsbBus>(&mut self, bus: &B) {
        let chunk = min(self.max_packet, self.len - self.pos);
        let _ = bus.write(self.ep_in, &self.buf[self.pos..self.pos + chunk]);
        self.pos += chunk;
        if self.pos >= self.len {
            self.state = if self.need_zlp && chunk != 0 {
                PipeState::DataInZlp
            } else {
                PipeState::DataInLast
            };
        }
    }
}

/// Control transaction handle passed to the class driver.
///
/// Borrows the bus and the EP0 pipe for the duration of one dispatch, letting
/// the class stage a reply, arm an OUT data stage, or stall the transfer.
pub struct Control<'a, B: UsbBus> {
    bus: &'a B,
    pipe: &'a mut ControlPipe,
}

impl<'a, B: UsbBus> Control<'a, B> {
    pub(crate) fn new(bus: &'a B, pipe: &'a mut ControlPipe) -> Self {
        Control { bus, pipe }
    }

    /// Replies to an IN request, or acknowledges a request without data.
    pub fn reply(&mut self, req: &SetupRequest, data: &[u8]) {
        self.pipe.reply(self.bus, req, data);
    }

    /// Acknowledges a request with a zero-length status stage.
    pub fn accept(&mut self) {
        self.pipe.send_status(self.bus);
    }

    /// Arms reception of the request's OUT data stage.
    pub fn receive(&mut self, req: &SetupRequest) {
        self.pipe.receive(self.bus, req);
    }

    /// Stalls the control transfer.
    pub fn stall(&mut self) {
        self.pipe.stall(self.bus);
    }

    /// Generates a bus detach/attach cycle, forcing re-enumeration.
    pub fn detach_reattach(&mut self) {
        let _ = self.bus.force_reset();
    }
}
