mod common;

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use osdp_master::bridge::Event;
use osdp_master::frame::{self, function, SOM};
use osdp_master::link::{self, Connector, LinkConfig};
use osdp_master::master::PollConfig;
use osdp_master::{addr, Master, Status};

use common::{init_logging, test_link_config, BusInterface, RS485Bus, SimBus};

struct BusConnector(Arc<RS485Bus>);

impl Connector for BusConnector {
    type Link = BusInterface;

    fn connect(
        &mut self,
        _path: &str,
        _config: &LinkConfig,
    ) -> Result<BusInterface, link::Error> {
        Ok(self.0.new_master_interface())
    }
}

/// Answer every complete command frame on the line until the bus is disconnected.
fn peripheral_main_loop(mut serial: BusInterface, mut sim: SimBus) -> SimBus {
    let mut pending = Vec::new();
    let mut buf = [0; 64];
    loop {
        match serial.read(&mut buf) {
            Ok(0) => break,
            Ok(len) => pending.extend_from_slice(&buf[..len]),
            Err(err) if err.kind() == ErrorKind::TimedOut => continue,
            Err(err) => panic!("peripheral read failed: {}", err),
        }
        while let Some(start) = pending.iter().position(|b| *b == SOM) {
            pending.drain(..start);
            let Ok(header) = frame::header(&pending) else {
                break;
            };
            if pending.len() < header.length {
                break;
            }
            let command: Vec<u8> = pending.drain(..header.length).collect();
            let reply = sim.respond(&command);
            if !reply.is_empty() {
                serial.write_all(&reply).unwrap();
            }
        }
    }
    sim
}

fn expect_event(events: &Receiver<Event>, deadline: Instant) -> Event {
    let remaining = deadline.saturating_duration_since(Instant::now());
    events
        .recv_timeout(remaining)
        .expect("no event from the poll thread in time")
}

#[test]
fn chat1() {
    init_logging();
    let bus = RS485Bus::new();
    let stop = Arc::new(AtomicBool::new(false));

    let mut peripheral_if = bus.new_peripheral_interface();
    peripheral_if.timeout = Duration::from_millis(50);
    let peripheral =
        thread::spawn(move || peripheral_main_loop(peripheral_if, SimBus::new(&[1, 2])));

    let (sender, events) = mpsc::channel();
    let mut master = Master::with_addresses([addr(1), addr(2)], PollConfig::default(), sender);
    let handle = master.handle();
    let master_thread = {
        let stop = Arc::clone(&stop);
        let mut connector = BusConnector(Arc::clone(&bus));
        thread::spawn(move || {
            master.run(&mut connector, &test_link_config(), &stop);
            master
        })
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut offline = Vec::new();
    let mut online = Vec::new();
    while online.len() < 2 {
        match expect_event(&events, deadline) {
            // Announced before the first poll.
            Event::Status {
                address,
                status: Status::Offline,
                ..
            } => {
                assert!(online.is_empty());
                offline.push(address);
            }
            Event::Status {
                address,
                status: Status::Online,
                ..
            } => online.push(address),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(offline, [addr(1), addr(2)]);
    online.sort();
    assert_eq!(online, [addr(1), addr(2)]);

    let messages: [&[u8]; 3] = [
        &[function::LED, b'A'],
        &[function::LED, b'B'],
        &[function::LED, b'C'],
    ];
    let producer = {
        let handle = handle.clone();
        thread::spawn(move || {
            for message in messages {
                handle.deliver(addr(1), message).unwrap();
            }
        })
    };
    producer.join().expect("Producer panicked");

    for message in messages {
        match expect_event(&events, deadline) {
            Event::Reply {
                address,
                function,
                data,
            } => {
                assert_eq!(address, addr(1));
                assert_eq!(function, function::MFGREP);
                assert_eq!(&data[..], message);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(handle.queued(addr(1)), Some(0));

    stop.store(true, SeqCst);
    bus.disconnect();
    let master = master_thread.join().expect("Master panicked");
    let mut sim = peripheral.join().expect("Peripheral panicked");

    // Device 2 was polled all along, and only ever with POLL.
    let polls = &sim.device(2).received;
    assert!(!polls.is_empty());
    assert!(polls.iter().all(|p| p[..] == [function::POLL]));
    let commands: Vec<_> = sim
        .device(1)
        .received
        .iter()
        .filter(|p| p[0] != function::POLL)
        .cloned()
        .collect();
    assert_eq!(commands, messages);
    assert_eq!(master.counters().crc(), 0);
}
