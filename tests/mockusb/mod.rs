#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::cmp::min;
use std::rc::Rc;

use usb_device::bus::{PollResult, UsbBus};
use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::{Result, UsbDirection, UsbError};

use usbd_dfu_device::{ClassDriver, DeviceConfig, DeviceCore};

/// EP0 max packet size used by the test device.
pub const EP0_SIZE: u8 = 64;

pub const TEST_VID: u16 = 0x2b04;
pub const TEST_PID: u16 = 0xd006;
pub const TEST_DEVICE_ID: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];

const EP_BUF_SIZE: usize = 8192;

#[derive(Debug, PartialEq, Eq)]
pub enum EPErr {
    Stalled,
}

#[derive(Clone, Copy)]
pub enum BusEvent {
    Reset,
    Suspend,
    Resume,
}

struct EP {
    alloc: bool,
    stall: bool,
    read_len: usize,
    read: [u8; EP_BUF_SIZE],
    read_ready: bool,
    write_len: usize,
    write: [u8; EP_BUF_SIZE],
    write_done: bool,
    setup: bool,
    max_size: usize,
    /// Sizes of the individual `write()` calls, for ZLP assertions.
    writes: Vec<usize>,
}

impl EP {
    fn new() -> Self {
        EP {
            alloc: false,
            stall: false,
            read_len: 0,
            read: [0; EP_BUF_SIZE],
            read_ready: false,
            write_len: 0,
            write: [0; EP_BUF_SIZE],
            write_done: false,
            setup: false,
            max_size: 0,
            writes: Vec::new(),
        }
    }

    fn set_read(&mut self, data: &[u8], setup: bool) {
        self.read_len = data.len();
        self.read[..data.len()].copy_from_slice(data);
        self.setup = setup;
        self.read_ready = true;
    }

    fn get_write(&mut self, data: &mut [u8]) -> usize {
        let res = self.write_len;
        self.write_len = 0;
        data[..res].clone_from_slice(&self.write[..res]);
        self.write_done = true;
        res
    }
}

struct TestBusIO {
    ep_i: [RefCell<EP>; 4],
    ep_o: [RefCell<EP>; 4],
    bus_event: Cell<Option<BusEvent>>,
    forced_resets: Cell<usize>,
    device_address: Cell<u8>,
}

unsafe impl Sync for TestBusIO {}

impl TestBusIO {
    fn new() -> Self {
        Self {
            ep_i: [
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
            ],
            ep_o: [
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
                RefCell::new(EP::new()),
            ],
            bus_event: Cell::new(None),
            forced_resets: Cell::new(0),
            device_address: Cell::new(0),
        }
    }

    fn epidx(&self, ep_addr: EndpointAddress) -> &RefCell<EP> {
        match ep_addr.direction() {
            UsbDirection::In => self.ep_i.get(ep_addr.index()).unwrap(),
            UsbDirection::Out => self.ep_o.get(ep_addr.index()).unwrap(),
        }
    }

    fn get_write(&self, ep_addr: EndpointAddress, data: &mut [u8]) -> usize {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        ep.get_write(data)
    }

    fn set_read(&self, ep_addr: EndpointAddress, data: &[u8], setup: bool) {
        let mut ep = self.epidx(ep_addr).borrow_mut();
        if setup && ep_addr.index() == 0 && ep_addr.direction() == UsbDirection::Out {
            // setup packet on EP0OUT removes stall condition
            ep.stall = false;
            let mut ep0in = self.ep_i.get(0).unwrap().borrow_mut();
            ep0in.stall = false;
        }
        ep.set_read(data, setup)
    }

    fn stalled0(&self) -> bool {
        let in0 = EndpointAddress::from_parts(0, UsbDirection::In);
        let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);
        self.epidx(in0).borrow().stall || self.epidx(out0).borrow().stall
    }
}

pub struct TestBus {
    rrio: Rc<RefCell<TestBusIO>>,
}

unsafe impl Sync for TestBus {}

impl TestBus {
    fn new(rrio: &Rc<RefCell<TestBusIO>>) -> Self {
        Self { rrio: rrio.clone() }
    }

    fn io(&self) -> &RefCell<TestBusIO> {
        self.rrio.as_ref()
    }
}

impl UsbBus for TestBus {
    fn alloc_ep(
        &mut self,
        _ep_dir: UsbDirection,
        ep_addr: Option<EndpointAddress>,
        _ep_type: EndpointType,
        max_packet_size: u16,
        _interval: u8,
    ) -> Result<EndpointAddress> {
        if let Some(ea) = ep_addr {
            let io = self.io().borrow();
            let mut sep = io.epidx(ea).borrow_mut();
            assert!(!sep.alloc);
            sep.alloc = true;
            sep.stall = false;
            sep.max_size = max_packet_size as usize;

            Ok(ea)
        } else {
            panic!("ep_addr is required, endpoint allocation is not implemented");
        }
    }

    fn enable(&mut self) {}

    fn force_reset(&self) -> Result<()> {
        let io = self.io().borrow();
        io.forced_resets.set(io.forced_resets.get() + 1);
        Ok(())
    }

    fn poll(&self) -> PollResult {
        let io = self.io().borrow();

        if let Some(ev) = io.bus_event.take() {
            return match ev {
                BusEvent::Reset => PollResult::Reset,
                BusEvent::Suspend => PollResult::Suspend,
                BusEvent::Resume => PollResult::Resume,
            };
        }

        let in0 = EndpointAddress::from_parts(0, UsbDirection::In);
        let out0 = EndpointAddress::from_parts(0, UsbDirection::Out);

        let ep0out = io.epidx(out0).borrow();
        let mut ep0in = io.epidx(in0).borrow_mut();

        let ep0_write_done = ep0in.write_done;
        let ep0_can_read = ep0out.read_ready;
        let ep0_setup = ep0out.setup;

        ep0in.write_done = false;

        if ep0_write_done || ep0_can_read || ep0_setup {
            PollResult::Data {
                ep_in_complete: if ep0_write_done { 1 } else { 0 },
                ep_out: if ep0_can_read { 1 } else { 0 },
                ep_setup: if ep0_setup { 1 } else { 0 },
            }
        } else {
            PollResult::None
        }
    }

    fn read(&self, ep_addr: EndpointAddress, buf: &mut [u8]) -> Result<usize> {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        let len = min(buf.len(), min(ep.read_len, ep.max_size));

        if len == 0 {
            return Err(UsbError::WouldBlock);
        }

        buf[..len].clone_from_slice(&ep.read[..len]);

        ep.read_len -= len;
        ep.read.copy_within(len.., 0);

        if ep.read_len == 0 {
            ep.setup = false;
        }

        ep.read_ready = ep.read_len > 0;

        Ok(len)
    }

    fn reset(&self) {}
    fn resume(&self) {}
    fn suspend(&self) {}

    fn set_device_address(&self, addr: u8) {
        self.io().borrow().device_address.set(addr);
    }

    fn is_stalled(&self, ep_addr: EndpointAddress) -> bool {
        let io = self.io().borrow();
        let ep = io.epidx(ep_addr).borrow();
        ep.stall
    }

    fn set_stalled(&self, ep_addr: EndpointAddress, stalled: bool) {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        ep.stall = stalled;
    }

    fn write(&self, ep_addr: EndpointAddress, buf: &[u8]) -> Result<usize> {
        let io = self.io().borrow();
        let mut ep = io.epidx(ep_addr).borrow_mut();
        let offset = ep.write_len;

        if buf.len() > ep.max_size {
            return Err(UsbError::BufferOverflow);
        }

        ep.write[offset..offset + buf.len()].copy_from_slice(buf);
        ep.write_len += buf.len();
        ep.write_done = false;
        ep.writes.push(buf.len());
        Ok(buf.len())
    }
}

fn test_config() -> DeviceConfig<'static> {
    DeviceConfig {
        vendor_id: TEST_VID,
        product_id: TEST_PID,
        bcd_device: 0x0251,
        max_packet_size_0: EP0_SIZE,
        manufacturer: "Example Industries DFU Platform",
        product: "Example DFU Mode",
        configuration: "Example DFU Mode",
        interface: "Example DFU Mode",
        device_id: &TEST_DEVICE_ID,
    }
}

/// Host side of the mock bus.
pub struct TestUsb {
    io: Rc<RefCell<TestBusIO>>,
}

#[allow(dead_code)]
impl TestUsb {
    fn out0() -> EndpointAddress {
        EndpointAddress::from_parts(0, UsbDirection::Out)
    }

    fn in0() -> EndpointAddress {
        EndpointAddress::from_parts(0, UsbDirection::In)
    }

    /// Queues a Setup packet on EP0 OUT.
    pub fn push_setup(&self, setup: &[u8]) {
        self.io.borrow().set_read(Self::out0(), setup, true);
    }

    /// Queues OUT data stage bytes on EP0.
    pub fn push_data(&self, data: &[u8]) {
        self.io.borrow().set_read(Self::out0(), data, false);
    }

    /// Reads whatever the device has written to EP0 IN since the last call.
    pub fn read_in(&self, out: &mut [u8]) -> usize {
        self.io.borrow().get_write(Self::in0(), out)
    }

    pub fn stalled0(&self) -> bool {
        self.io.borrow().stalled0()
    }

    pub fn is_ep_stalled(&self, index: usize, dir: UsbDirection) -> bool {
        let io = self.io.borrow();
        let ep = io.epidx(EndpointAddress::from_parts(index, dir)).borrow();
        ep.stall
    }

    /// Injects a bus-level event for the next poll.
    pub fn push_bus_event(&self, ev: BusEvent) {
        self.io.borrow().bus_event.set(Some(ev));
    }

    /// Number of detach/attach cycles the device requested.
    pub fn forced_resets(&self) -> usize {
        self.io.borrow().forced_resets.get()
    }

    /// Last address set through SET_ADDRESS.
    pub fn device_address(&self) -> u8 {
        self.io.borrow().device_address.get()
    }

    /// Drains the per-call write size log of EP0 IN.
    pub fn take_ep0_writes(&self) -> Vec<usize> {
        let io = self.io.borrow();
        let mut ep = io.epidx(Self::in0()).borrow_mut();
        std::mem::take(&mut ep.writes)
    }

    /// Runs one full control transaction against the device.
    ///
    /// `setup` is the raw 8-byte Setup packet, `data` an optional OUT data
    /// stage; any IN data the device replies with lands in `out`. Returns the
    /// reply length, or `EPErr::Stalled` if the device stalled any stage.
    pub fn transact<C: ClassDriver<TestBus>>(
        &self,
        dev: &mut DeviceCore<'_, TestBus>,
        cls: &mut C,
        setup: &[u8],
        data: Option<&[u8]>,
        out: &mut [u8],
    ) -> std::result::Result<usize, EPErr> {
        self.push_setup(setup);
        dev.poll(cls);
        if self.stalled0() {
            return Err(EPErr::Stalled);
        }

        if let Some(val) = data {
            self.push_data(val);
            for i in 1..200 {
                let res = dev.poll(cls);
                if !res {
                    break;
                }
                if i >= 199 {
                    panic!("read too much");
                }
            }
            if self.stalled0() {
                return Err(EPErr::Stalled);
            }
        }

        let mut len = 0;

        loop {
            let one = self.read_in(&mut out[len..]);
            dev.poll(cls);
            if self.stalled0() {
                return Err(EPErr::Stalled);
            }

            len += one;
            if one < EP0_SIZE as usize {
                // short read - last block
                break;
            }
        }

        Ok(len)
    }

    /// Basic device bring-up: SET_ADDRESS then SET_CONFIGURATION(1).
    pub fn enumerate<C: ClassDriver<TestBus>>(
        &self,
        dev: &mut DeviceCore<'_, TestBus>,
        cls: &mut C,
    ) {
        let mut buf = [0u8; 8];

        let len = self
            .transact(dev, cls, &[0x00, 0x05, 5, 0, 0, 0, 0, 0], None, &mut buf)
            .expect("set address");
        assert_eq!(len, 0);
        assert_eq!(self.device_address(), 5);

        let len = self
            .transact(dev, cls, &[0x00, 0x09, 1, 0, 0, 0, 0, 0], None, &mut buf)
            .expect("set configuration");
        assert_eq!(len, 0);
    }
}

/// Creates a mock bus and a device core bound to it, and runs `case`.
pub fn with_usb<F>(case: F)
where
    F: FnOnce(TestUsb, DeviceCore<'static, TestBus>),
{
    let io = Rc::new(RefCell::new(TestBusIO::new()));
    let bus = TestBus::new(&io);

    let dev = DeviceCore::new(bus, test_config()).expect("device init");

    case(TestUsb { io }, dev);
}
