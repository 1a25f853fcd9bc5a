//! Where the poll loop sends what it hears from the bus.

use std::sync::mpsc::Sender;

use bytes::Bytes;

use crate::slave::Status;
use crate::types::Address;

/// Receives replies and status changes from the poll thread.
///
/// Calls are made from inside the poll loop, so implementations should hand the
/// data off rather than block.
pub trait Bridge {
    /// A reply other than a plain ACK, NAK or BUSY. `data` follows the function code.
    fn reply(&mut self, address: Address, function: u8, data: &[u8]);

    /// A device changed status. `identifier` is the device's configured 16 byte
    /// identifier, if it has one; consumers key status by it rather than the address.
    fn status(&mut self, address: Address, identifier: Option<&[u8; 16]>, status: Status);
}

impl<B: Bridge + ?Sized> Bridge for &mut B {
    fn reply(&mut self, address: Address, function: u8, data: &[u8]) {
        (**self).reply(address, function, data);
    }

    fn status(&mut self, address: Address, identifier: Option<&[u8; 16]>, status: Status) {
        (**self).status(address, identifier, status);
    }
}

/// One bridge notification, for passing around by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Reply {
        address: Address,
        function: u8,
        data: Bytes,
    },
    Status {
        address: Address,
        identifier: Option<[u8; 16]>,
        status: Status,
    },
}

impl Bridge for Vec<Event> {
    fn reply(&mut self, address: Address, function: u8, data: &[u8]) {
        self.push(Event::Reply {
            address,
            function,
            data: Bytes::copy_from_slice(data),
        });
    }

    fn status(&mut self, address: Address, identifier: Option<&[u8; 16]>, status: Status) {
        self.push(Event::Status {
            address,
            identifier: identifier.copied(),
            status,
        });
    }
}

/// Forwards events to another thread. Events are dropped once the receiver is gone.
impl Bridge for Sender<Event> {
    fn reply(&mut self, address: Address, function: u8, data: &[u8]) {
        let _ = self.send(Event::Reply {
            address,
            function,
            data: Bytes::copy_from_slice(data),
        });
    }

    fn status(&mut self, address: Address, identifier: Option<&[u8; 16]>, status: Status) {
        let _ = self.send(Event::Status {
            address,
            identifier: identifier.copied(),
            status,
        });
    }
}
