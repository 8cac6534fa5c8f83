//! Length-prefixed JSON frames.
//!
//! Each frame is 4 bytes (little-endian u32) of length followed by that many
//! bytes of JSON. Used for the daemon protocol, staging files and persisted
//! generation records. A torn tail (crash mid-write) shows up as
//! `UnexpectedEof` on the last frame.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};
use std::marker::PhantomData;

/// Sanity limit: don't allocate more than 100MB for one frame
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

/// Write one frame, returning the number of bytes written
pub fn write_frame<W: Write>(writer: &mut W, msg: &impl Serialize) -> io::Result<u64> {
    let json = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    if json.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Message too large"));
    }

    let len = json.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&json)?;

    Ok(4 + json.len() as u64)
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub fn try_read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "Message too large"));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;

    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read one frame, treating end of stream as `UnexpectedEof`
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<T> {
    try_read_frame(reader)?
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "end of stream"))
}

/// Iterator over the frames of a stream
pub struct FrameReader<R, T> {
    reader: R,
    done: bool,
    _marker: PhantomData<T>,
}

impl<R: Read, T: DeserializeOwned> FrameReader<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl<R: Read, T: DeserializeOwned> Iterator for FrameReader<R, T> {
    type Item = io::Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match try_read_frame(&mut self.reader) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
