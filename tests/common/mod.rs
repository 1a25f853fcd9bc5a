#![allow(dead_code)]

mod sync;

pub use sync::{BusInterface, RS485Bus};

use std::cell::RefCell;
use std::cmp::min;
use std::collections::{BTreeMap, VecDeque};
use std::io::{Error, ErrorKind};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use osdp_master::checksum::ChecksumMode;
use osdp_master::frame::{self, function, Envelope, FrameBuf, Padding, SOM};
use osdp_master::link::{Link, LinkConfig};
use osdp_master::addr;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Link settings with short timeouts, so failing polls don't slow the tests down.
pub fn test_link_config() -> LinkConfig {
    LinkConfig {
        device: "/dev/ttySIM0".into(),
        timeout_us: 20_000,
        delay_us: 0,
        idle_us: 1_000,
        ..LinkConfig::default()
    }
}

/// How a simulated peripheral reacts to a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// ACK polls, echo other commands back in a manufacturer reply.
    Answer,
    Silent,
    Nak,
    Busy,
    /// Answer with a broken checksum.
    Corrupt,
    /// Answer as the next address up.
    WrongAddress,
    /// Answer with a sequence number other than the one polled.
    StaleSequence,
}

#[derive(Debug)]
pub struct SimDevice {
    pub behavior: Behavior,
    /// Replies (function code first) sent to polls instead of a plain ACK.
    pub replies: VecDeque<Vec<u8>>,
    /// Payloads of every command received, in order.
    pub received: Vec<Vec<u8>>,
    /// Sequence numbers of every command received.
    pub sequences: Vec<u8>,
}

impl SimDevice {
    fn new() -> Self {
        SimDevice {
            behavior: Behavior::Answer,
            replies: VecDeque::new(),
            received: Vec::new(),
            sequences: Vec::new(),
        }
    }
}

/// A set of simulated peripherals sharing one line.
#[derive(Debug)]
pub struct SimBus {
    pub devices: BTreeMap<u8, SimDevice>,
    /// Addresses of every command seen, in order.
    pub polled: Vec<u8>,
    pub mode: ChecksumMode,
}

impl SimBus {
    pub fn new(addresses: &[u8]) -> Self {
        SimBus {
            devices: addresses.iter().map(|a| (*a, SimDevice::new())).collect(),
            polled: Vec::new(),
            mode: ChecksumMode::Crc16,
        }
    }

    pub fn device(&mut self, address: u8) -> &mut SimDevice {
        self.devices.get_mut(&address).expect("no such simulated device")
    }

    /// Handle one transmission from the master and return the bytes put on the line in reply.
    pub fn respond(&mut self, bytes: &[u8]) -> Vec<u8> {
        let Some(start) = bytes.iter().position(|b| *b == SOM) else {
            return Vec::new();
        };
        let bytes = &bytes[start..];
        let Ok(header) = frame::header(bytes) else {
            return Vec::new();
        };
        let Ok(command) = frame::decode(&bytes[..header.length.min(bytes.len())]) else {
            return Vec::new();
        };
        self.polled.push(*command.address());
        let Some(device) = self.devices.get_mut(&*command.address()) else {
            return Vec::new();
        };
        device.received.push(command.payload.to_vec());
        device.sequences.push(command.sequence().bits());

        let mut address = command.address();
        let mut sequence = command.sequence();
        let payload = match device.behavior {
            Behavior::Silent => return Vec::new(),
            Behavior::Nak => vec![function::NAK, 0x01],
            Behavior::Busy => vec![function::BUSY],
            _ => match device.replies.pop_front() {
                Some(reply) => reply,
                None if command.function() == Some(function::POLL) => vec![function::ACK],
                None => {
                    let mut echo = vec![function::MFGREP];
                    echo.extend_from_slice(&command.payload);
                    echo
                }
            },
        };
        if device.behavior == Behavior::WrongAddress {
            address = addr(*address + 1);
        }
        if device.behavior == Behavior::StaleSequence {
            sequence = sequence.next();
        }

        let mut out = FrameBuf::new();
        frame::encode(
            &mut out,
            Envelope::reply(address, sequence, self.mode),
            &payload,
            Padding::default(),
        )
        .unwrap();
        let mut out = out.to_vec();
        if device.behavior == Behavior::Corrupt {
            let last = out.len() - 1;
            out[last] ^= 0x01;
        }
        out
    }
}

/// Scripted serial line. Bytes to read are queued up front or produced by a [`SimBus`]
/// in reply to each write.
pub struct SerialInterface {
    rx: Vec<u8>,
    rx_pos: usize,
    pub tx: Vec<u8>,
    /// Every write call, as written.
    pub writes: Vec<Vec<u8>>,
    pub sim: Option<SimBus>,
    /// Largest number of bytes returned by a single read.
    pub max_chunk: usize,
    pub discards: usize,
    read_timeout: Duration,
    do_read_error: bool,
    do_write_error: bool,
}

pub struct SerialIOPlane(Rc<RefCell<SerialInterface>>);

impl SerialIOPlane {
    pub fn new(serial_if: &Rc<RefCell<SerialInterface>>) -> SerialIOPlane {
        SerialIOPlane(serial_if.clone())
    }
}

impl SerialInterface {
    pub fn new(rx: &[u8]) -> Rc<RefCell<SerialInterface>> {
        Rc::new(RefCell::new(SerialInterface {
            rx: rx.to_vec(),
            rx_pos: 0,
            tx: Vec::new(),
            writes: Vec::new(),
            sim: None,
            max_chunk: usize::MAX,
            discards: 0,
            read_timeout: Duration::from_millis(1),
            do_read_error: false,
            do_write_error: false,
        }))
    }

    pub fn with_sim(sim: SimBus) -> Rc<RefCell<SerialInterface>> {
        let serial_if = Self::new(&[]);
        serial_if.borrow_mut().sim = Some(sim);
        serial_if
    }

    pub fn sim(&mut self) -> &mut SimBus {
        self.sim.as_mut().expect("no simulated bus attached")
    }

    pub fn push_rx(&mut self, data: &[u8]) {
        self.rx.extend_from_slice(data);
    }

    pub fn unread(&self) -> usize {
        self.rx.len() - self.rx_pos
    }

    pub fn trigger_write_error(&mut self) {
        self.do_write_error = true;
    }

    pub fn trigger_read_error(&mut self) {
        self.do_read_error = true;
    }
}

impl std::io::Read for SerialIOPlane {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut inner = self.0.borrow_mut();
        if inner.do_read_error {
            inner.do_read_error = false;
            return Err(Error::new(ErrorKind::PermissionDenied, "IO read error"));
        }
        if inner.unread() == 0 {
            let timeout = inner.read_timeout;
            drop(inner);
            thread::sleep(timeout);
            return Err(Error::new(ErrorKind::TimedOut, "IO read timeout"));
        }
        let old_pos = inner.rx_pos;
        inner.rx_pos = min(old_pos + min(buf.len(), inner.max_chunk), inner.rx.len());
        let len = inner.rx_pos - old_pos;
        buf[..len].copy_from_slice(&inner.rx[old_pos..inner.rx_pos]);
        Ok(len)
    }
}

impl std::io::Write for SerialIOPlane {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut inner = self.0.borrow_mut();
        if inner.do_write_error {
            inner.do_write_error = false;
            return Err(Error::new(ErrorKind::PermissionDenied, "IO write error"));
        }
        inner.tx.extend_from_slice(buf);
        inner.writes.push(buf.to_vec());
        if let Some(sim) = inner.sim.as_mut() {
            let reply = sim.respond(buf);
            inner.push_rx(&reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Link for SerialIOPlane {
    fn set_read_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.0.borrow_mut().read_timeout = timeout;
        Ok(())
    }

    fn discard_input(&mut self) -> std::io::Result<()> {
        let mut inner = self.0.borrow_mut();
        inner.rx_pos = inner.rx.len();
        inner.discards += 1;
        Ok(())
    }
}

/// Encode a reply frame the way a peripheral would send it.
pub fn reply_frame(address: u8, sequence: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = FrameBuf::new();
    frame::encode(
        &mut out,
        Envelope::reply(
            addr(address),
            osdp_master::Sequence::new(sequence).unwrap(),
            ChecksumMode::Crc16,
        ),
        payload,
        Padding::default(),
    )
    .unwrap();
    out.to_vec()
}
