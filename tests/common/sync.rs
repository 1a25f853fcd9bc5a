use std::collections::VecDeque;
use std::io::{Error, ErrorKind};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use osdp_master::link::Link;

type BusT = Arc<Mutex<VecDeque<u8>>>;

/// Half-duplex bus between threads. Bytes written by the master reach every
/// peripheral interface and the other way around.
#[derive(Default)]
pub struct RS485Bus {
    masters: Mutex<Vec<Weak<BusInterfaceLink>>>,
    peripherals: Mutex<Vec<Weak<BusInterfaceLink>>>,
    master_data_available: Arc<Condvar>,
    peripheral_data_available: Arc<Condvar>,
    eof: AtomicBool,
}

impl RS485Bus {
    pub fn new() -> Arc<RS485Bus> {
        Default::default()
    }

    /// Wake every blocked reader and make further empty reads return end of file.
    pub fn disconnect(&self) {
        self.eof.store(true, SeqCst);
        self.peripheral_data_available.notify_all();
        self.master_data_available.notify_all();
    }

    pub fn is_disconnected(&self) -> bool {
        self.eof.load(SeqCst)
    }

    pub fn new_master_interface(self: &Arc<Self>) -> BusInterface {
        let link = Arc::new(BusInterfaceLink {
            is_master: true,
            rx: Default::default(),
            rx_condvar: Arc::clone(&self.master_data_available),
        });
        self.masters.lock().unwrap().push(Arc::downgrade(&link));
        BusInterface::new(Arc::clone(self), link)
    }

    pub fn new_peripheral_interface(self: &Arc<Self>) -> BusInterface {
        let link = Arc::new(BusInterfaceLink {
            is_master: false,
            rx: Default::default(),
            rx_condvar: Arc::clone(&self.peripheral_data_available),
        });
        self.peripherals.lock().unwrap().push(Arc::downgrade(&link));
        BusInterface::new(Arc::clone(self), link)
    }

    fn send(&self, targets: &Mutex<Vec<Weak<BusInterfaceLink>>>, condvar: &Condvar, data: &[u8]) {
        let targets = targets.lock().unwrap();
        for weak in targets.iter() {
            if let Some(target) = weak.upgrade() {
                target.rx.lock().unwrap().extend(data);
            }
        }
        condvar.notify_all();
    }
}

pub struct BusInterface {
    bus: Arc<RS485Bus>,
    link: Arc<BusInterfaceLink>,
    pub timeout: Duration,
    pub do_read_error: bool,
    pub do_write_error: bool,
}

struct BusInterfaceLink {
    is_master: bool,
    rx: BusT,
    rx_condvar: Arc<Condvar>,
}

impl BusInterface {
    fn new(bus: Arc<RS485Bus>, link: Arc<BusInterfaceLink>) -> BusInterface {
        BusInterface {
            bus,
            link,
            timeout: Duration::from_millis(100),
            do_read_error: false,
            do_write_error: false,
        }
    }
}

impl std::io::Read for BusInterface {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            panic!("Testsuite called read with zero length buffer.")
        }
        if self.do_read_error {
            self.do_read_error = false;
            return Err(Error::new(ErrorKind::PermissionDenied, "IO read error"));
        }

        let mut rx = self.link.rx.lock().expect("Read mutex is poisoned");
        if rx.is_empty() && !self.bus.is_disconnected() {
            rx = self
                .link
                .rx_condvar
                .wait_timeout(rx, self.timeout)
                .expect("Mutex lock failed")
                .0;
        }
        if rx.is_empty() {
            return if self.bus.is_disconnected() {
                Ok(0)
            } else {
                Err(Error::new(ErrorKind::TimedOut, "IO read timeout"))
            };
        }
        let len = buf.len().min(rx.len());
        for (slot, byte) in buf.iter_mut().zip(rx.drain(..len)) {
            *slot = byte;
        }
        Ok(len)
    }
}

impl std::io::Write for BusInterface {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.do_write_error {
            self.do_write_error = false;
            return Err(Error::new(ErrorKind::PermissionDenied, "IO write error"));
        }
        if self.link.is_master {
            self.bus.send(
                &self.bus.peripherals,
                &self.bus.peripheral_data_available,
                buf,
            );
        } else {
            self.bus
                .send(&self.bus.masters, &self.bus.master_data_available, buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Link for BusInterface {
    fn set_read_timeout(&mut self, timeout: Duration) -> std::io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn discard_input(&mut self) -> std::io::Result<()> {
        self.link.rx.lock().unwrap().clear();
        Ok(())
    }
}
