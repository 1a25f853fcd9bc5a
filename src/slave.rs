//! Per-device protocol state, as seen from the bus master.
//!
//! A device is Online while fewer than `max_retry` consecutive polls have failed and
//! Offline from then on, until it answers again. Every device starts Offline.
//! Only the poll thread mutates a [`Device`]; producers reach it through its mailbox.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::info;

use crate::mailbox::Mailbox;
use crate::master::PollConfig;
use crate::types::{Address, Sequence};

/// Reachability as published to the bridge.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Online,
    Offline,
    /// Administratively switched off, never polled.
    Disabled,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Online => "ONLINE",
            Status::Offline => "OFFLINE",
            Status::Disabled => "DISABLED",
        })
    }
}

/// A frame sent to a device and not acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    /// Function code first.
    pub payload: Bytes,
    /// Taken from the mailbox, which still holds it until the ack.
    pub queued: bool,
}

#[derive(Debug)]
pub struct Device {
    /// `None` for a registry slot that was never configured.
    address: Option<Address>,
    identifier: Option<[u8; 16]>,
    tx_seq: Sequence,
    rx_seq: Sequence,
    /// Consecutive failed polls. 0 means the last poll was answered.
    retry: u32,
    max_retry: u32,
    backoff: Duration,
    reacquire: Duration,
    enabled: bool,
    next_tickle: Option<Instant>,
    next_poll: Option<Instant>,
    /// Repeated as is until answered, the sequence number doesn't move meanwhile.
    pending: Option<Pending>,
    mailbox: Arc<Mailbox<Bytes>>,
}

impl Device {
    pub fn new(address: Address, config: &PollConfig) -> Self {
        Self {
            address: Some(address),
            ..Self::undefined(config)
        }
    }

    /// An empty registry slot.
    pub fn undefined(config: &PollConfig) -> Self {
        let max_retry = config.max_retry.max(1);
        Self {
            address: None,
            identifier: None,
            tx_seq: Sequence::RESYNC,
            rx_seq: Sequence::RESYNC,
            retry: max_retry + 1,
            max_retry,
            backoff: config.backoff(),
            reacquire: config.reacquire(),
            enabled: true,
            next_tickle: None,
            next_poll: None,
            pending: None,
            mailbox: Arc::new(Mailbox::new()),
        }
    }

    /// Attach the long-form identifier the peripheral reports about itself.
    pub fn with_identifier(mut self, identifier: [u8; 16]) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Start out administratively disabled or enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn address(&self) -> Option<Address> {
        self.address
    }

    pub fn identifier(&self) -> Option<&[u8; 16]> {
        self.identifier.as_ref()
    }

    pub fn is_defined(&self) -> bool {
        self.address.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tx_seq(&self) -> Sequence {
        self.tx_seq
    }

    pub fn rx_seq(&self) -> Sequence {
        self.rx_seq
    }

    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn is_offline(&self) -> bool {
        self.retry >= self.max_retry
    }

    pub fn status(&self) -> Status {
        if !self.enabled {
            Status::Disabled
        } else if self.is_offline() {
            Status::Offline
        } else {
            Status::Online
        }
    }

    pub fn mailbox(&self) -> &Arc<Mailbox<Bytes>> {
        &self.mailbox
    }

    /// The last frame sent under the current sequence number, if unanswered.
    pub fn pending(&self) -> Option<&Pending> {
        self.pending.as_ref()
    }

    /// Remember what was just sent, so a retry repeats it.
    pub fn set_pending(&mut self, pending: Pending) {
        self.pending = Some(pending);
    }

    /// Switch polling on or off. Anything queued so far is dropped either way.
    /// Returns the status to publish.
    pub fn set_enabled(&mut self, enabled: bool) -> Status {
        self.enabled = enabled;
        self.pending = None;
        let dropped = self.mailbox.purge();
        info!(
            "device {} {}, {} queued message(s) dropped",
            self,
            if enabled { "enabled" } else { "disabled" },
            dropped
        );
        self.status()
    }

    /// The device answered. Returns the new status if it just came online.
    pub fn ack(&mut self) -> Option<Status> {
        self.tx_seq = self.tx_seq.next();
        self.pending = None;
        let was_offline = self.is_offline();
        self.retry = 0;
        self.next_poll = None;
        if was_offline {
            info!("device {} online", self);
            Some(self.status())
        } else {
            None
        }
    }

    /// A poll failed. Returns the new status if the device just went offline.
    pub fn nak(&mut self) -> Option<Status> {
        if self.is_offline() {
            return None;
        }
        self.retry += 1;
        if self.is_offline() {
            self.pending = None;
            let dropped = self.mailbox.purge();
            info!("device {} offline, {} queued message(s) dropped", self, dropped);
            Some(self.status())
        } else {
            self.next_poll = Some(Instant::now() + self.backoff);
            None
        }
    }

    /// The device rejected the frame outright: fail the poll and restart the sequence.
    pub fn nak_resync(&mut self) -> Option<Status> {
        self.tx_seq = Sequence::RESYNC;
        self.pending = None;
        self.nak()
    }

    /// Track the sequence number of an accepted reply.
    pub fn received(&mut self, seq: Sequence) {
        if self.rx_seq.is_resync() || seq.is_resync() {
            self.rx_seq = seq.next();
        }
    }

    /// Track the sequence number of a NAK or BUSY reply and fail the poll.
    pub fn refused(&mut self, seq: Sequence, resync: bool) -> Option<Status> {
        self.rx_seq = seq.next();
        if resync {
            self.nak_resync()
        } else {
            self.nak()
        }
    }

    /// True if an online device is still waiting out the backoff after a failed poll.
    pub fn backing_off(&self, now: Instant) -> bool {
        self.retry > 0 && self.next_poll.map_or(false, |next| now < next)
    }

    /// Claim the next reacquisition poll of an offline device.
    /// Returns false if the last one was less than the reacquisition interval ago.
    pub fn take_tickle(&mut self, now: Instant) -> bool {
        if self.next_tickle.map_or(false, |next| now < next) {
            return false;
        }
        self.next_tickle = Some(now + self.reacquire);
        true
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(address) => write!(f, "{}", address),
            None => f.write_str("<undefined>"),
        }
    }
}
