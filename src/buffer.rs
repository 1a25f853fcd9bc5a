use crate::frame::FRAME_CAPACITY;

/// Fixed-size receive buffer. Bytes are appended at the end and only ever
/// dropped from the front.
#[derive(Debug)]
pub(crate) struct Buffer {
    data: [u8; FRAME_CAPACITY],
    len: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: [0; FRAME_CAPACITY],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Free space after the stored bytes, at most `max` long.
    pub fn spare(&mut self, max: usize) -> &mut [u8] {
        let end = FRAME_CAPACITY.min(self.len + max);
        &mut self.data[self.len..end]
    }

    /// Mark `count` bytes of [`spare`](Self::spare) as filled.
    pub fn commit(&mut self, count: usize) {
        assert!(self.len + count <= FRAME_CAPACITY);
        self.len += count;
    }

    /// Drop everything before the first `byte` and slide the rest to the front.
    /// Returns false, with the buffer emptied, if `byte` isn't present.
    pub fn discard_until(&mut self, byte: u8) -> bool {
        match self.as_ref().iter().position(|b| *b == byte) {
            Some(pos) => {
                self.consume(pos);
                true
            }
            None => {
                self.clear();
                false
            }
        }
    }

    /// Drop `len` bytes from the front.
    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.len);
        self.data.copy_within(len..self.len, 0);
        self.len -= len;
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}
