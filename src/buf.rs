//! Internal data structures

use std::io::{Error, ErrorKind, Write};

use circbuf::CircBuf;

/// Outbound bytes waiting to be accepted by a transport.
///
/// Small writes are staged in a fixed-capacity [`CircBuf`].
/// A write larger than the capacity is only accepted when the buffer is empty and is held in a one-time buffer until drained.
pub struct SendBuffer {
    circbuf: CircBuf,
    one_time_buffer: Vec<u8>,
    one_time_offset: usize,
}
impl SendBuffer {
    pub fn new(capacity: usize) -> Result<Self, Error> {
        Ok(Self {
            circbuf: CircBuf::with_capacity(capacity)
                .map_err(|err| Error::new(ErrorKind::Other, err))?,
            one_time_buffer: Vec::new(),
            one_time_offset: 0,
        })
    }

    /// return true if unsent data size is 0
    pub fn is_empty(&self) -> bool {
        self.circbuf.is_empty() && self.one_time_buffer.is_empty()
    }

    /// return size of unsent data
    pub fn len(&self) -> usize {
        self.circbuf.len() + self.one_time_buffer.len() - self.one_time_offset
    }

    /// Stage `data`, returning false when it does not fit yet.
    pub fn try_write(&mut self, data: &[u8]) -> Result<bool, Error> {
        if data.len() > self.circbuf.cap() {
            if !self.is_empty() {
                return Ok(false);
            }
            self.one_time_offset = 0;
            self.one_time_buffer.extend_from_slice(data);
            return Ok(true);
        }
        if !self.one_time_buffer.is_empty() || data.len() > self.circbuf.avail() {
            return Ok(false);
        }
        self.circbuf.write_all(data)?;
        Ok(true)
    }

    /// peek at the next contiguous unsent bytes
    pub fn peek(&self) -> &[u8] {
        if self.one_time_buffer.is_empty() {
            let avail = self.circbuf.get_bytes();
            if avail[0].is_empty() {
                avail[1]
            } else {
                avail[0]
            }
        } else {
            &self.one_time_buffer[self.one_time_offset..]
        }
    }

    /// advance bytes that the transport accepted
    pub fn advance(&mut self, size: usize) -> Result<(), Error> {
        if self.one_time_buffer.is_empty() {
            return self
                .circbuf
                .advance_read(size)
                .map_err(|x| Error::new(ErrorKind::Other, x));
        }
        let remaining = self.one_time_buffer.len() - self.one_time_offset;
        if size == remaining {
            self.one_time_offset = 0;
            self.one_time_buffer = Vec::new();
            Ok(())
        } else if size < remaining {
            self.one_time_offset += size;
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::InvalidData,
                "over-read one-time buffer",
            ))
        }
    }
}
