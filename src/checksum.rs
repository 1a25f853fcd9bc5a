//! Frame integrity checks: the OSDP CRC-16 and the legacy 8-bit additive checksum.
//!
//! Both algorithms share the same three-step interface (create, [`update`](Digest::update)
//! with any number of byte ranges, [`finish`](Digest::finish)), so the encoder and the
//! decoder can feed them the exact same bytes.

use arrayvec::ArrayVec;

/// Selects the integrity check of a frame. Carried in bit 2 of the control byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    /// Two byte CRC, little endian on the wire.
    Crc16,
    /// One byte modulo-256 sum.
    Sum8,
}

const CRC_FLAG: u8 = 0x04;

impl ChecksumMode {
    /// Decode the checksum mode from a control byte.
    pub const fn from_control(control: u8) -> Self {
        if control & CRC_FLAG != 0 {
            Self::Crc16
        } else {
            Self::Sum8
        }
    }

    /// The bits this mode contributes to the control byte.
    pub const fn control_bits(self) -> u8 {
        match self {
            Self::Crc16 => CRC_FLAG,
            Self::Sum8 => 0,
        }
    }

    /// Number of trailing check bytes on the wire.
    pub const fn trailer_len(self) -> usize {
        match self {
            Self::Crc16 => 2,
            Self::Sum8 => 1,
        }
    }
}

impl Default for ChecksumMode {
    fn default() -> Self {
        Self::Crc16
    }
}

/// CRC-16 accumulator, CCITT polynomial, not reflected, seed 0x1D0F, no final xor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Crc16(u16);

impl Crc16 {
    pub const SEED: u16 = 0x1D0F;

    pub const fn new() -> Self {
        Self(Self::SEED)
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.0;
        for byte in data {
            let mut x = (crc >> 8) as u8 ^ *byte;
            x ^= x >> 4;
            let x = u16::from(x);
            crc = (crc << 8) ^ (x << 12) ^ (x << 5) ^ x;
        }
        self.0 = crc;
    }

    pub const fn finish(self) -> u16 {
        self.0
    }
}

impl Default for Crc16 {
    fn default() -> Self {
        Self::new()
    }
}

/// Modulo-256 sum of every byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Sum8(u8);

impl Sum8 {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0 = data.iter().fold(self.0, |sum, b| sum.wrapping_add(*b));
    }

    pub const fn finish(self) -> u8 {
        self.0
    }
}

/// The on-wire check bytes of a frame.
pub type Trailer = ArrayVec<u8, 2>;

/// A running checksum in either mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Digest {
    Crc16(Crc16),
    Sum8(Sum8),
}

impl Digest {
    pub const fn new(mode: ChecksumMode) -> Self {
        match mode {
            ChecksumMode::Crc16 => Self::Crc16(Crc16::new()),
            ChecksumMode::Sum8 => Self::Sum8(Sum8::new()),
        }
    }

    pub fn mode(&self) -> ChecksumMode {
        match self {
            Self::Crc16(_) => ChecksumMode::Crc16,
            Self::Sum8(_) => ChecksumMode::Sum8,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Crc16(crc) => crc.update(data),
            Self::Sum8(sum) => sum.update(data),
        }
    }

    /// Returns the check bytes in wire order.
    pub fn finish(self) -> Trailer {
        let mut trailer = Trailer::new();
        match self {
            Self::Crc16(crc) => trailer.extend(crc.finish().to_le_bytes()),
            Self::Sum8(sum) => trailer.push(sum.finish()),
        }
        trailer
    }

    /// Compare the accumulated checksum with the received check bytes.
    pub fn verify(self, received: &[u8]) -> bool {
        self.finish().as_slice() == received
    }
}

/// CRC-16 of `data` in one call.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = Crc16::new();
    crc.update(data);
    crc.finish()
}

/// Additive checksum of `data` in one call.
pub fn sum8(data: &[u8]) -> u8 {
    let mut sum = Sum8::new();
    sum.update(data);
    sum.finish()
}
