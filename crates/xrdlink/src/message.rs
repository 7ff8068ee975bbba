//! Framed protocol messages in flight.
//!
//! A `Message` is a contiguous byte buffer with a cursor. On the send
//! side the cursor tracks how many bytes have reached the socket; on
//! the receive side it tracks how many bytes of the frame have arrived.
//! The transport plug-in owns the framing; the stream treats the
//! contents as opaque.

/// A single framed protocol message plus its transfer cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    data: Vec<u8>,
    cursor: usize,
}

impl Message {
    /// Creates an empty message. Receive paths grow it once the frame
    /// header announces the body length.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a message holding `data`, cursor at zero.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, cursor: 0 }
    }

    /// Creates a zero-filled message of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self { data: vec![0; size], cursor: 0 }
    }

    /// Total size of the message in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the message holds no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the cursor to an absolute position, clamped to the buffer.
    pub fn set_cursor(&mut self, pos: usize) {
        self.cursor = pos.min(self.data.len());
    }

    /// Advances the cursor by `n`, clamped to the buffer.
    pub fn advance_cursor(&mut self, n: usize) {
        self.set_cursor(self.cursor + n);
    }

    /// Bytes not yet transferred, starting at the cursor.
    pub fn bytes_at_cursor(&self) -> &[u8] {
        &self.data[self.cursor..]
    }

    /// Mutable view of the untransferred tail, for receive paths.
    pub fn bytes_at_cursor_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.cursor..]
    }

    /// Number of bytes between the cursor and the end of the buffer.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Grows the buffer to exactly `size` bytes, zero-filling the tail.
    /// Used when a frame header announces the body length. The cursor
    /// is left in place.
    pub fn grow_to(&mut self, size: usize) {
        if size > self.data.len() {
            self.data.resize(size, 0);
        }
    }

    /// The whole buffer.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the message, returning the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}
