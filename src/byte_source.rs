//! The byte source abstraction the VM reads opcodes and operands through,
//! plus the `Unframer` that hides protocol-5 framing (`FRAME`) behind it.
//!
//! Two `ByteSource` implementations ship here, mirroring the teacher's habit
//! of a concrete struct per backing store rather than one generic wrapper:
//! `SliceSource` for an in-memory buffer and `ReaderSource` for anything
//! implementing `std::io::Read`.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{PickleError, Result};

/// Raw byte access the `Unframer` and VM read through. Implementors only
/// need to serve exact-length reads; everything else is built on top.
pub trait ByteSource {
    /// Read exactly `len` bytes, or fail with `PickleError::Eof`.
    fn read(&mut self, len: usize) -> Result<Vec<u8>>;
}

/// A `ByteSource` over an in-memory buffer.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl ByteSource for SliceSource<'_> {
    fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let end = self.pos.checked_add(len).ok_or(PickleError::Eof)?;
        if end > self.data.len() {
            return Err(PickleError::Eof);
        }
        let out = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(out)
    }
}

/// A `ByteSource` over any `std::io::Read`.
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read> ByteSource for ReaderSource<R> {
    fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.reader
            .read_exact(&mut buf)
            .map_err(|_| PickleError::Eof)?;
        Ok(buf)
    }
}

struct Frame {
    data: Vec<u8>,
    pos: usize,
}

impl Frame {
    fn is_drained(&self) -> bool {
        self.pos >= self.data.len()
    }
}

/// Wraps a `ByteSource`, transparently honoring the frame boundary a
/// protocol-5 `FRAME` opcode establishes: reads inside a frame never cross
/// past its declared length, and once a frame is fully drained reads fall
/// back to the underlying source directly (for opcodes that precede the
/// first `FRAME`, or follow the last one).
pub struct Unframer<S> {
    source: S,
    frame: Option<Frame>,
}

impl<S: ByteSource> Unframer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            frame: None,
        }
    }

    /// Handle a `FRAME` opcode: read `len` bytes from the underlying source
    /// up front and make them the current frame.
    pub fn load_frame(&mut self, len: usize) -> Result<()> {
        if let Some(frame) = &self.frame {
            if !frame.is_drained() {
                return Err(PickleError::UnexpectedFrameState);
            }
        }
        let data = self.source.read(len)?;
        self.frame = Some(Frame { data, pos: 0 });
        Ok(())
    }

    /// Whether a previously-loaded frame still has undrained bytes.
    pub fn frame_pending(&self) -> bool {
        self.frame.as_ref().is_some_and(|f| !f.is_drained())
    }

    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        if let Some(frame) = &mut self.frame {
            if !frame.is_drained() {
                let end = frame
                    .pos
                    .checked_add(len)
                    .ok_or(PickleError::FrameExhausted)?;
                if end > frame.data.len() {
                    return Err(PickleError::FrameExhausted);
                }
                let out = frame.data[frame.pos..end].to_vec();
                frame.pos = end;
                if frame.is_drained() {
                    self.frame = None;
                }
                return Ok(out);
            }
        }
        self.source.read(len)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Reads up to (but not including) a trailing `\n`, used by the
    /// text-mode opcodes of protocols 0–1 (`INT`, `LONG`, `STRING`, ...).
    pub fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == b'\n' {
                break;
            }
            line.push(b);
        }
        Ok(line)
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(&self.read(2)?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(&self.read(4)?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(&self.read(4)?))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(&self.read(8)?))
    }

    pub fn read_f64_be(&mut self) -> Result<f64> {
        Ok(BigEndian::read_f64(&self.read(8)?))
    }
}
