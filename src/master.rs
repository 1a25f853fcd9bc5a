//! The poll scheduler.
//!
//! [`Master`] owns the device registry and is the only writer of device state.
//! It polls one device per call to [`Master::poll_once`], round robin, and hands
//! replies and status changes to a [`Bridge`]. Other threads talk to it through a
//! [`BusHandle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, error, info, warn};
use snafu::{OptionExt, Snafu};

use crate::bridge::Bridge;
use crate::frame::{function, Reply};
use crate::link::{Connector, Link, LinkConfig};
use crate::mailbox::Mailbox;
use crate::slave::{Device, Pending, Status};
use crate::transport::{self, Transport};
use crate::types::Address;

/// Longest uninterrupted sleep while waiting to reconnect, so a stop request is noticed.
const STOP_CHECK: Duration = Duration::from_millis(100);

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("No device with address {address} on this bus"))]
    UnknownDevice { address: Address },
}

/// Scheduler timing.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Consecutive failed polls that take a device offline.
    pub max_retry: u32,
    /// Pause before polling a device again after a failed poll.
    pub backoff_ms: u64,
    /// Interval between polls of an offline device.
    pub reacquire_ms: u64,
    /// Interval between attempts to reopen the port.
    pub reconnect_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_retry: 10,
            backoff_ms: 10,
            reacquire_ms: 5000,
            reconnect_ms: 5000,
        }
    }
}

impl PollConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn reacquire(&self) -> Duration {
        Duration::from_millis(self.reacquire_ms)
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }
}

/// Process-wide error tallies.
#[derive(Debug, Default)]
pub struct Counters {
    crc: AtomicU64,
    timeout: AtomicU64,
    fly_by: AtomicU64,
}

impl Counters {
    /// Replies that failed their checksum.
    pub fn crc(&self) -> u64 {
        self.crc.load(Ordering::Relaxed)
    }

    /// Polls that got no reply in time.
    pub fn timeouts(&self) -> u64 {
        self.timeout.load(Ordering::Relaxed)
    }

    /// Frames for other stations that were checked in passing.
    pub fn fly_by(&self) -> u64 {
        self.fly_by.load(Ordering::Relaxed)
    }

    fn count(&self, err: &transport::Error) {
        let counter = match err {
            transport::Error::Checksum => &self.crc,
            transport::Error::Timeout => &self.timeout,
            transport::Error::FlyBy { .. } | transport::Error::FlyByChecksum { .. } => {
                &self.fly_by
            }
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Outcome of one scheduler step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Polled {
    /// A frame was sent and a reply awaited.
    DidPoll,
    /// Nothing was due: no eligible device, or the selected one is throttled.
    DidNotPoll,
}

#[derive(Debug)]
enum Control {
    SetEnabled { address: Address, enabled: bool },
}

/// The fixed set of devices on the bus, with a round-robin cursor.
#[derive(Debug)]
pub struct Registry {
    devices: Vec<Device>,
    cursor: usize,
}

impl Registry {
    pub fn new(devices: Vec<Device>) -> Self {
        // The first advance lands on the first device.
        let cursor = devices.len().saturating_sub(1);
        Self { devices, cursor }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn get(&self, address: Address) -> Option<&Device> {
        self.devices.iter().find(|d| d.address() == Some(address))
    }

    pub fn get_mut(&mut self, address: Address) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.address() == Some(address))
    }

    /// Move the cursor to the next defined and enabled device, wrapping around.
    /// After a full pass without one the cursor is back where it started.
    pub fn advance(&mut self) -> Option<&mut Device> {
        let len = self.devices.len();
        for _ in 0..len {
            self.cursor = (self.cursor + 1) % len;
            let device = &self.devices[self.cursor];
            if device.is_defined() && device.is_enabled() {
                return Some(&mut self.devices[self.cursor]);
            }
        }
        None
    }
}

/// Cloneable access to a running [`Master`] from other threads.
#[derive(Debug, Clone)]
pub struct BusHandle {
    mailboxes: Arc<HashMap<Address, Arc<Mailbox<Bytes>>>>,
    control: Arc<Mailbox<Control>>,
    counters: Arc<Counters>,
}

impl BusHandle {
    /// Queue `payload` (function code first) for the device at `address`.
    /// # Errors
    /// [`Error::UnknownDevice`] if no such device was configured.
    pub fn deliver(&self, address: Address, payload: impl Into<Bytes>) -> Result<(), Error> {
        let mailbox = self
            .mailboxes
            .get(&address)
            .context(UnknownDeviceSnafu { address })?;
        mailbox.push(payload.into());
        Ok(())
    }

    /// Ask the poll thread to enable or disable a device.
    pub fn set_enabled(&self, address: Address, enabled: bool) -> Result<(), Error> {
        if !self.mailboxes.contains_key(&address) {
            return UnknownDeviceSnafu { address }.fail();
        }
        self.control.push(Control::SetEnabled { address, enabled });
        Ok(())
    }

    /// Messages waiting for the device at `address`.
    pub fn queued(&self, address: Address) -> Option<usize> {
        self.mailboxes.get(&address).map(|mailbox| mailbox.len())
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}

/// The bus master.
#[derive(Debug)]
pub struct Master<B> {
    registry: Registry,
    bridge: B,
    config: PollConfig,
    handle: BusHandle,
    announced: bool,
}

impl<B: Bridge> Master<B> {
    pub fn new(devices: Vec<Device>, config: PollConfig, bridge: B) -> Self {
        let mailboxes = devices
            .iter()
            .filter_map(|d| Some((d.address()?, Arc::clone(d.mailbox()))))
            .collect();
        let handle = BusHandle {
            mailboxes: Arc::new(mailboxes),
            control: Arc::new(Mailbox::new()),
            counters: Arc::new(Counters::default()),
        };
        Self {
            registry: Registry::new(devices),
            bridge,
            config,
            handle,
            announced: false,
        }
    }

    /// Convenience constructor for one device per address.
    pub fn with_addresses(
        addresses: impl IntoIterator<Item = Address>,
        config: PollConfig,
        bridge: B,
    ) -> Self {
        let devices = addresses
            .into_iter()
            .map(|address| Device::new(address, &config))
            .collect();
        Self::new(devices, config, bridge)
    }

    pub fn handle(&self) -> BusHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn device(&self, address: Address) -> Option<&Device> {
        self.registry.get(address)
    }

    pub fn counters(&self) -> &Counters {
        &self.handle.counters
    }

    pub fn bridge(&self) -> &B {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn into_bridge(self) -> B {
        self.bridge
    }

    /// Publish the current status of every configured device, once.
    /// [`run`](Self::run) does this before the first poll.
    pub fn announce(&mut self) {
        if self.announced {
            return;
        }
        self.announced = true;
        for device in self.registry.iter() {
            publish(&mut self.bridge, device, Some(device.status()));
        }
    }

    /// Poll the next device in turn and process its reply.
    /// # Errors
    /// Only fatal transport errors; the connection has to be reopened.
    pub fn poll_once<L: Link>(
        &mut self,
        transport: &mut Transport<L>,
    ) -> Result<Polled, transport::Error> {
        self.apply_control();
        let Some(device) = self.registry.advance() else {
            return Ok(Polled::DidNotPoll);
        };
        poll_device(device, transport, &mut self.bridge, &self.handle.counters)
    }

    /// Open the port and poll until `stop` is set, reopening it after I/O errors.
    ///
    /// A failed reopen switches to the other configured device path and waits the
    /// reconnect interval before the next attempt.
    pub fn run<C: Connector>(&mut self, connector: &mut C, link: &LinkConfig, stop: &AtomicBool) {
        self.announce();
        let mut paths = link.paths().cycle();
        let mut path = paths.next().unwrap_or_default();
        let mut outage = false;
        while !stop.load(Ordering::Relaxed) {
            let port = match connector.connect(path, link) {
                Ok(port) => port,
                Err(err) => {
                    if !outage {
                        error!("{}", err);
                        outage = true;
                    }
                    path = paths.next().unwrap_or(path);
                    self.pause(self.config.reconnect(), stop);
                    continue;
                }
            };
            if outage {
                error!("port {} reopened", path);
                outage = false;
            } else {
                info!("port {} opened", path);
            }

            let mut transport = Transport::new(port, link);
            match self.poll_until(&mut transport, stop) {
                Ok(()) => break,
                Err(err) => {
                    error!("Error while polling, {}", err);
                    outage = true;
                }
            }
        }
    }

    fn poll_until<L: Link>(
        &mut self,
        transport: &mut Transport<L>,
        stop: &AtomicBool,
    ) -> Result<(), transport::Error> {
        transport.wait_idle()?;
        let mut idle = 0;
        while !stop.load(Ordering::Relaxed) {
            match self.poll_once(transport)? {
                Polled::DidPoll => idle = 0,
                Polled::DidNotPoll => idle += 1,
            }
            // A whole pass without traffic: rest until the next backoff could expire.
            if idle >= self.registry.len().max(1) {
                idle = 0;
                self.handle.control.wait(self.config.backoff());
            }
        }
        Ok(())
    }

    fn pause(&self, duration: Duration, stop: &AtomicBool) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline || stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep((deadline - now).min(STOP_CHECK));
        }
    }

    fn apply_control(&mut self) {
        while let Some(control) = self.handle.control.try_pop() {
            match control {
                Control::SetEnabled { address, enabled } => {
                    if let Some(device) = self.registry.get_mut(address) {
                        let status = device.set_enabled(enabled);
                        publish(&mut self.bridge, device, Some(status));
                    }
                }
            }
        }
        for device in self.registry.devices.iter().filter(|d| !d.is_enabled()) {
            let dropped = device.mailbox().purge();
            if dropped > 0 {
                info!("device {} disabled, {} message(s) dropped", device, dropped);
            }
        }
    }
}

fn publish<B: Bridge>(bridge: &mut B, device: &Device, status: Option<Status>) {
    if let (Some(address), Some(status)) = (device.address(), status) {
        bridge.status(address, device.identifier(), status);
    }
}

/// What to send to an online device: the unanswered frame again, else the oldest
/// queued message, else a bare poll.
fn next_frame(device: &Device) -> Pending {
    if let Some(pending) = device.pending() {
        return pending.clone();
    }
    match device.mailbox().peek() {
        Some(payload) => Pending {
            payload,
            queued: true,
        },
        None => Pending {
            payload: Bytes::from_static(&[function::POLL]),
            queued: false,
        },
    }
}

fn poll_device<L: Link, B: Bridge>(
    device: &mut Device,
    transport: &mut Transport<L>,
    bridge: &mut B,
    counters: &Counters,
) -> Result<Polled, transport::Error> {
    let Some(address) = device.address() else {
        return Ok(Polled::DidNotPoll);
    };
    let now = Instant::now();
    let mut sent_message = false;

    if device.is_offline() {
        device.mailbox().purge();
        if !device.take_tickle(now) {
            return Ok(Polled::DidNotPoll);
        }
        transport.flush_input()?;
        transport.write_frame(address, device.tx_seq(), &[function::POLL])?;
    } else {
        if device.backing_off(now) {
            return Ok(Polled::DidNotPoll);
        }
        transport.flush_input()?;
        let frame = next_frame(device);
        match transport.write_frame(address, device.tx_seq(), &frame.payload) {
            Ok(_) => {}
            Err(transport::Error::PayloadTooLarge { length }) => {
                warn!(
                    "dropping {} byte message for device {}: too large to send",
                    length, address
                );
                device.mailbox().try_pop();
                return Ok(Polled::DidNotPoll);
            }
            Err(err) => return Err(err),
        }
        sent_message = frame.queued;
        device.set_pending(frame);
    }
    let sent_seq = device.tx_seq();

    let reply = match transport.read_frame() {
        Ok(reply) => reply,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            debug!("poll of device {} failed: {}", address, err);
            counters.count(&err);
            if !matches!(
                err,
                transport::Error::FlyBy { .. } | transport::Error::FlyByChecksum { .. }
            ) {
                let status = device.nak();
                publish(bridge, device, status);
            }
            return Ok(Polled::DidPoll);
        }
    };

    if reply.address() != address {
        debug!(
            "ignoring reply from device {} while polling {}",
            reply.address(),
            address
        );
        return Ok(Polled::DidPoll);
    }

    let seq = reply.sequence();
    device.received(seq);
    let status = match reply.reply_kind() {
        None => {
            debug!("empty reply from device {}", address);
            device.nak()
        }
        Some(Reply::Nak) => {
            debug!("device {} sent NAK {:02X?}", address, reply.data());
            device.refused(seq, true)
        }
        Some(Reply::Busy) => device.refused(seq, false),
        Some(_) if seq != sent_seq => {
            debug!(
                "stale reply from device {}: sequence {} instead of {}",
                address,
                seq.bits(),
                sent_seq.bits()
            );
            device.nak()
        }
        Some(kind) => {
            let status = device.ack();
            publish(bridge, device, status);
            if sent_message {
                device.mailbox().try_pop();
            }
            if let Reply::Data(function) = kind {
                bridge.reply(address, function, reply.data());
            }
            None
        }
    };
    publish(bridge, device, status);
    Ok(Polled::DidPoll)
}
