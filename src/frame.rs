//! The OSDP wire envelope.
//!
//! ```text
//! [0xFF..]  0x53  addr  len_lo len_hi  ctrl  payload..  check(1 or 2)  [0xFF..]
//! ```
//!
//! `len` counts every byte from the introducer through the check bytes, but not the
//! sync padding. Bit 7 of `addr` is set on replies from a peripheral.

use arrayvec::ArrayVec;
use bytes::Bytes;
use nom::combinator::verify;
use nom::number::complete::{be_u8, le_u16};
use nom::sequence::tuple;
use nom::IResult;
use snafu::{ensure, Snafu};

use crate::checksum::{ChecksumMode, Digest};
use crate::types::{Address, Sequence};

/// Start of message.
pub const SOM: u8 = 0x53;
/// Sync byte used for leading and trailing padding.
pub const SYNC: u8 = 0xFF;
/// Introducer, address, two length bytes and the control byte.
pub const HEADER_LEN: usize = 5;
/// Largest frame held in a transmit or receive buffer: a 256 byte payload plus envelope,
/// a manufacturer reply header, check bytes and some sync padding.
pub const FRAME_CAPACITY: usize = 256 + 5 + HEADER_LEN + 2 + 1 + 2;

const REPLY_FLAG: u8 = 0x80;

/// Command and reply function codes, the first payload byte.
pub mod function {
    pub const POLL: u8 = 0x60;
    pub const ID: u8 = 0x61;
    pub const CAP: u8 = 0x62;
    pub const LSTAT: u8 = 0x64;
    pub const OUT: u8 = 0x68;
    pub const LED: u8 = 0x69;
    pub const BUZ: u8 = 0x6A;

    pub const ACK: u8 = 0x40;
    pub const NAK: u8 = 0x41;
    pub const PDID: u8 = 0x45;
    pub const PDCAP: u8 = 0x46;
    pub const LSTATR: u8 = 0x48;
    pub const RAW: u8 = 0x50;
    pub const KEYPAD: u8 = 0x53;
    pub const BUSY: u8 = 0x79;
    pub const MFGREP: u8 = 0x90;
}

/// Error type for this module
#[derive(Debug, Snafu, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Fewer bytes than the smallest possible frame.
    #[snafu(display("Frame of {length} bytes is too short"))]
    TooShort { length: usize },
    /// The declared length doesn't fit the frame buffer.
    #[snafu(display("Declared frame length {length} exceeds buffer capacity"))]
    Overflow { length: usize },
    /// The length field disagrees with the number of bytes given.
    #[snafu(display("Length field says {declared} bytes, got {actual}"))]
    LengthMismatch { declared: usize, actual: usize },
    /// The frame doesn't start with [`SOM`].
    #[snafu(display("Missing start of message"))]
    BadIntroducer,
    /// The check bytes don't match the frame contents.
    #[snafu(display("Checksum mismatch"))]
    Checksum,
    /// The payload doesn't fit into a frame buffer.
    #[snafu(display("Payload of {length} bytes doesn't fit into a frame"))]
    PayloadTooLarge { length: usize },
}

/// Everything in a frame except the length and the payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub address: Address,
    /// Set on frames sent by a peripheral.
    pub reply: bool,
    pub sequence: Sequence,
    pub mode: ChecksumMode,
}

impl Envelope {
    /// Envelope of a frame sent by the bus master.
    pub const fn command(address: Address, sequence: Sequence, mode: ChecksumMode) -> Self {
        Self {
            address,
            reply: false,
            sequence,
            mode,
        }
    }

    /// Envelope of a frame sent by a peripheral.
    pub const fn reply(address: Address, sequence: Sequence, mode: ChecksumMode) -> Self {
        Self {
            address,
            reply: true,
            sequence,
            mode,
        }
    }

    fn address_byte(&self) -> u8 {
        if self.reply {
            *self.address | REPLY_FLAG
        } else {
            *self.address
        }
    }

    fn control_byte(&self) -> u8 {
        self.sequence.bits() | self.mode.control_bits()
    }

    /// Smallest valid total length for this envelope, an empty payload.
    pub fn min_length(&self) -> usize {
        HEADER_LEN + self.mode.trailer_len()
    }
}

/// The decoded fixed-size start of a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    pub envelope: Envelope,
    /// Total frame length from the length field.
    pub length: usize,
}

/// Number of leading and trailing sync bytes around an encoded frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Padding {
    pub lead: usize,
    pub trail: usize,
}

pub type FrameBuf = ArrayVec<u8, FRAME_CAPACITY>;

/// Encode a frame into `out`, replacing its contents.
/// # Errors
/// Returns [`Error::PayloadTooLarge`] if the padded frame exceeds [`FRAME_CAPACITY`].
pub fn encode(
    out: &mut FrameBuf,
    envelope: Envelope,
    payload: &[u8],
    padding: Padding,
) -> Result<(), Error> {
    let length = HEADER_LEN + payload.len() + envelope.mode.trailer_len();
    ensure!(
        padding.lead + length + padding.trail <= FRAME_CAPACITY,
        PayloadTooLargeSnafu {
            length: payload.len()
        }
    );

    out.clear();
    out.extend(core::iter::repeat(SYNC).take(padding.lead));
    let start = out.len();
    let len_bytes = (length as u16).to_le_bytes();
    out.extend([
        SOM,
        envelope.address_byte(),
        len_bytes[0],
        len_bytes[1],
        envelope.control_byte(),
    ]);
    out.extend(payload.iter().copied());

    let mut digest = Digest::new(envelope.mode);
    digest.update(&out[start..]);
    out.extend(digest.finish());
    out.extend(core::iter::repeat(SYNC).take(padding.trail));
    Ok(())
}

/// Parse the fixed-size header at the start of `buf`.
pub(crate) fn parse_header(buf: &[u8]) -> IResult<&[u8], Header> {
    let (buf, (_som, address, length, control)) =
        tuple((verify(be_u8, |b: &u8| *b == SOM), be_u8, le_u16, be_u8))(buf)?;
    let envelope = Envelope {
        address: Address::from_wire(address),
        reply: address & REPLY_FLAG != 0,
        sequence: Sequence::from_control(control),
        mode: ChecksumMode::from_control(control),
    };
    Ok((
        buf,
        Header {
            envelope,
            length: length.into(),
        },
    ))
}

/// Parse the header of a frame, requiring exactly [`HEADER_LEN`] or more bytes.
/// # Errors
/// [`Error::TooShort`] for partial headers, [`Error::BadIntroducer`] if `buf` doesn't
/// begin with [`SOM`].
pub fn header(buf: &[u8]) -> Result<Header, Error> {
    ensure!(buf.len() >= HEADER_LEN, TooShortSnafu { length: buf.len() });
    match parse_header(buf) {
        Ok((_rest, header)) => Ok(header),
        Err(_) => BadIntroducerSnafu.fail(),
    }
}

/// A validated frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub envelope: Envelope,
    pub payload: Bytes,
}

impl Frame {
    pub fn address(&self) -> Address {
        self.envelope.address
    }

    pub fn sequence(&self) -> Sequence {
        self.envelope.sequence
    }

    /// The function code, or `None` for an empty payload.
    pub fn function(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// The payload after the function code.
    pub fn data(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or_default()
    }

    pub fn reply_kind(&self) -> Option<Reply> {
        self.function().map(Reply::classify)
    }
}

/// Validate and decode one complete frame without padding.
/// # Errors
/// Any framing problem, including [`Error::Checksum`] for corrupted frames.
pub fn decode(buf: &[u8]) -> Result<Frame, Error> {
    let header = header(buf)?;
    ensure!(
        header.length <= FRAME_CAPACITY,
        OverflowSnafu {
            length: header.length
        }
    );
    ensure!(
        header.length == buf.len(),
        LengthMismatchSnafu {
            declared: header.length,
            actual: buf.len()
        }
    );
    ensure!(
        header.length >= header.envelope.min_length(),
        TooShortSnafu {
            length: header.length
        }
    );

    let body_end = buf.len() - header.envelope.mode.trailer_len();
    let mut digest = Digest::new(header.envelope.mode);
    digest.update(&buf[..body_end]);
    ensure!(digest.verify(&buf[body_end..]), ChecksumSnafu);

    Ok(Frame {
        envelope: header.envelope,
        payload: Bytes::copy_from_slice(&buf[HEADER_LEN..body_end]),
    })
}

/// How the scheduler treats a reply, by function code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Plain acknowledgement, nothing to forward.
    Ack,
    /// The peripheral rejected the command.
    Nak,
    /// The peripheral can't process the command right now.
    Busy,
    /// Any other reply, forwarded with its function code.
    Data(u8),
}

impl Reply {
    pub const fn classify(code: u8) -> Self {
        match code {
            function::ACK => Self::Ack,
            function::NAK => Self::Nak,
            function::BUSY => Self::Busy,
            other => Self::Data(other),
        }
    }
}
