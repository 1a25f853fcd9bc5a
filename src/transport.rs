//! Frame transport over a [`Link`]: framing, checksums and bus timing.
//!
//! Every read runs against a deadline computed from the monotonic clock when the
//! read starts, so a silent or babbling line never blocks the caller for longer
//! than the configured reply timeout. Every transmission waits until the
//! post-receive delay has passed since the last read finished, which gives
//! RS-485 transceivers on the bus time to turn around.

use std::io::{self, ErrorKind};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, log_enabled, trace, Level};
use snafu::{ensure, ResultExt, Snafu};

use crate::buffer::Buffer;
use crate::checksum::{ChecksumMode, Digest};
use crate::frame::{
    self, Envelope, Frame, FrameBuf, Header, Padding, FRAME_CAPACITY, HEADER_LEN, SOM,
};
use crate::link::{Link, LinkConfig};
use crate::types::{Address, Sequence};

/// Longest single wait inside a read, so deadlines are re-checked at least this often.
const MAX_WAIT: Duration = Duration::from_secs(1);
const MIN_WAIT: Duration = Duration::from_millis(1);
/// Pause before retrying a write the line couldn't accept.
const WRITE_RETRY: Duration = Duration::from_millis(1);

/// Error type for this module
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// No complete frame before the deadline.
    #[snafu(display("Timed out waiting for a frame"))]
    Timeout,
    /// A frame addressed to us failed its integrity check.
    #[snafu(display("Checksum mismatch"))]
    Checksum,
    /// The declared length doesn't fit the receive buffer.
    #[snafu(display("Declared frame length {length} exceeds buffer capacity"))]
    Overflow { length: usize },
    /// The declared length is smaller than the envelope.
    #[snafu(display("Declared frame length {length} is too short"))]
    TooShort { length: usize },
    /// Any other malformed frame.
    #[snafu(display("Malformed frame: {source}"))]
    Framing { source: frame::Error },
    /// A valid frame for another station went by.
    #[snafu(display("Frame for address {address} passed by"))]
    FlyBy { address: Address },
    /// A frame for another station went by and failed its integrity check.
    #[snafu(display("Corrupted frame for address {address} passed by"))]
    FlyByChecksum { address: Address },
    /// The payload can't be framed.
    #[snafu(display("Payload of {length} bytes doesn't fit into a frame"))]
    PayloadTooLarge { length: usize },
    /// [`Transport::resend`] before anything was sent.
    #[snafu(display("Nothing to resend"))]
    NothingToResend,
    /// The line failed. The connection is unusable.
    #[snafu(display("Serial I/O error: {source}"))]
    Io { source: io::Error },
}

impl Error {
    /// True if the connection has to be closed and reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io { .. })
    }
}

impl From<frame::Error> for Error {
    fn from(err: frame::Error) -> Self {
        match err {
            frame::Error::Checksum => Error::Checksum,
            frame::Error::Overflow { length } => Error::Overflow { length },
            frame::Error::TooShort { length } => Error::TooShort { length },
            frame::Error::PayloadTooLarge { length } => Error::PayloadTooLarge { length },
            source => Error::Framing { source },
        }
    }
}

/// Sends and receives frames on one open line.
#[derive(Debug)]
pub struct Transport<L> {
    link: L,
    /// Own address. `None` accepts every frame, which is what a bus master does.
    station: Option<Address>,
    padding: Padding,
    mode: ChecksumMode,
    timeout: Duration,
    delay: Duration,
    idle: Duration,
    rx: Buffer,
    tx: FrameBuf,
    next_write: Option<Instant>,
    deadline: Instant,
}

impl<L: Link> Transport<L> {
    pub fn new(link: L, config: &LinkConfig) -> Self {
        Self {
            link,
            station: None,
            padding: config.padding(),
            mode: config.checksum,
            timeout: config.timeout(),
            delay: config.delay(),
            idle: config.idle(),
            rx: Buffer::new(),
            tx: FrameBuf::new(),
            next_write: None,
            deadline: Instant::now(),
        }
    }

    /// Only accept frames for `address`, the configuration address and broadcasts.
    /// Everything else is validated in passing and reported as a fly-by.
    pub fn with_station(mut self, address: Address) -> Self {
        self.station = Some(address);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Change the reply timeout, returning the old one.
    pub fn set_timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.timeout, timeout)
    }

    pub fn get_ref(&self) -> &L {
        &self.link
    }

    pub fn get_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Close the transport, giving back the line.
    pub fn into_inner(self) -> L {
        self.link
    }

    /// The bytes of the last transmission, padding included.
    pub fn last_sent(&self) -> &[u8] {
        &self.tx
    }

    /// Frame `payload` for `address` and transmit it once the bus turnaround delay has passed.
    /// Returns the number of bytes put on the line.
    /// # Errors
    /// [`Error::PayloadTooLarge`] leaves the previous transmission untouched.
    /// [`Error::Io`] is fatal to the connection.
    pub fn write_frame(
        &mut self,
        address: Address,
        sequence: Sequence,
        payload: &[u8],
    ) -> Result<usize, Error> {
        let envelope = Envelope::command(address, sequence, self.mode);
        frame::encode(&mut self.tx, envelope, payload, self.padding)?;
        self.delay_wait();
        self.send()
    }

    /// Transmit the last frame again, byte for byte.
    pub fn resend(&mut self) -> Result<usize, Error> {
        ensure!(!self.tx.is_empty(), NothingToResendSnafu);
        self.delay_wait();
        self.send()
    }

    /// Receive one frame, waiting at most the reply timeout.
    ///
    /// Bytes before the next start of message are skipped. The receive time is
    /// recorded whatever the outcome, to pace the next transmission.
    pub fn read_frame(&mut self) -> Result<Frame, Error> {
        self.deadline = Instant::now() + self.timeout;
        let result = self.read_cooked();
        self.stamp();
        result
    }

    /// Read and discard until the line stays silent for the idle time.
    pub fn wait_idle(&mut self) -> Result<(), Error> {
        loop {
            self.deadline = Instant::now() + self.idle;
            self.rx.clear();
            match self.read_some(HEADER_LEN) {
                Ok(_) => continue,
                Err(Error::Timeout) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Discard anything received but not read yet.
    pub fn flush_input(&mut self) -> Result<(), Error> {
        self.rx.clear();
        self.link.discard_input().context(IoSnafu)
    }

    fn stamp(&mut self) {
        self.next_write = Some(Instant::now() + self.delay);
    }

    fn delay_wait(&mut self) {
        // Nothing received yet: assume something just was.
        let next_write = *self
            .next_write
            .get_or_insert_with(|| Instant::now() + self.delay);
        let now = Instant::now();
        if next_write > now {
            thread::sleep(next_write - now);
        }
    }

    fn send(&mut self) -> Result<usize, Error> {
        log_bytes("TX", &self.tx);
        let mut offset = 0;
        while offset < self.tx.len() {
            match self.link.write(&self.tx[offset..]) {
                Ok(0) => thread::sleep(WRITE_RETRY),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(WRITE_RETRY),
                Err(err) => return Err(err).context(IoSnafu),
            }
        }
        self.link.flush().context(IoSnafu)?;
        Ok(self.tx.len())
    }

    fn read_cooked(&mut self) -> Result<Frame, Error> {
        let header = self.read_header()?;
        let address = header.envelope.address;
        if let Some(station) = self.station {
            if address != station
                && address != Address::CONFIGURATION
                && address != Address::BROADCAST
            {
                return self.fly_by(header);
            }
        }

        let length = header.length;
        ensure!(length <= FRAME_CAPACITY, OverflowSnafu { length });
        ensure!(length >= header.envelope.min_length(), TooShortSnafu { length });
        while self.rx.len() < length {
            self.read_some(length - self.rx.len())?;
        }
        Ok(frame::decode(self.rx.as_ref())?)
    }

    /// Skip to the next start of message and read the rest of the header.
    fn read_header(&mut self) -> Result<Header, Error> {
        loop {
            self.rx.clear();
            self.read_some(HEADER_LEN)?;
            if self.rx.discard_until(SOM) {
                break;
            }
        }
        while self.rx.len() < HEADER_LEN {
            self.read_some(HEADER_LEN - self.rx.len())?;
        }
        Ok(frame::header(self.rx.as_ref())?)
    }

    /// Read and check a frame addressed to someone else without keeping it.
    /// Such frames may be longer than our own buffer.
    fn fly_by(&mut self, header: Header) -> Result<Frame, Error> {
        let address = header.envelope.address;
        let mode = header.envelope.mode;
        ensure!(
            header.length >= header.envelope.min_length(),
            TooShortSnafu {
                length: header.length
            }
        );

        let mut digest = Digest::new(mode);
        digest.update(self.rx.as_ref());
        let body = header.length - mode.trailer_len();
        let mut seen = self.rx.len();
        while seen < body {
            self.rx.clear();
            let count = self.read_some((body - seen).min(FRAME_CAPACITY))?;
            digest.update(self.rx.as_ref());
            seen += count;
        }

        self.rx.clear();
        while self.rx.len() < mode.trailer_len() {
            self.read_some(mode.trailer_len() - self.rx.len())?;
        }
        if digest.verify(self.rx.as_ref()) {
            FlyBySnafu { address }.fail()
        } else {
            FlyByChecksumSnafu { address }.fail()
        }
    }

    /// Append up to `max` bytes to the receive buffer, waiting until the deadline.
    fn read_some(&mut self, max: usize) -> Result<usize, Error> {
        loop {
            let now = Instant::now();
            ensure!(now < self.deadline, TimeoutSnafu);
            let wait = (self.deadline - now).clamp(MIN_WAIT, MAX_WAIT);
            self.link.set_read_timeout(wait).context(IoSnafu)?;

            let result = self.link.read(self.rx.spare(max));
            match result {
                Ok(0) => thread::sleep(MIN_WAIT),
                Ok(count) => {
                    let start = self.rx.len();
                    self.rx.commit(count);
                    log_bytes("RX", &self.rx.as_ref()[start..]);
                    return Ok(count);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
                    ) => {}
                Err(err) => {
                    debug!("read failed: {}", err);
                    return Err(err).context(IoSnafu);
                }
            }
        }
    }
}

fn log_bytes(prefix: &str, bytes: &[u8]) {
    if log_enabled!(Level::Trace) {
        for line in bytes.chunks(16) {
            trace!("{}: {:02X?}", prefix, line);
        }
    }
}
