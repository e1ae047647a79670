// Decoder output sink
//
// The VCDIFF decoder pushes reconstructed bytes through a narrow
// interface; the same interface carries plain full-image downloads so
// both paths share one write target. The file is written without any
// userspace buffering, so the verifier's mmap readback observes what was
// pushed.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("unable to open output: {0}")]
    Open(std::io::Error),
    #[error("output write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Minimal push interface the VCDIFF decoder writes through.
pub trait DecoderSink {
    /// Write all of `data` at the current position.
    fn append(&mut self, data: &[u8]) -> Result<(), SinkError>;
    /// Single-byte append.
    fn push_byte(&mut self, byte: u8) -> Result<(), SinkError>;
    /// Grow the output so its total length is the current position plus
    /// `additional`. A no-op where the output length is fixed.
    fn reserve_additional(&mut self, additional: u64) -> Result<(), SinkError>;
    /// Rewind to offset 0.
    fn clear(&mut self) -> Result<(), SinkError>;
    /// Current write position.
    fn size(&self) -> u64;
}

/// Append-only sink over a partition block device or regular file.
pub struct PartitionSink {
    file: File,
    is_regular: bool,
    position: u64,
}

impl PartitionSink {
    /// Truncating, unbuffered open for writing.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(SinkError::Open)?;
        let is_regular = file
            .metadata()
            .map_err(SinkError::Open)?
            .file_type()
            .is_file();

        Ok(Self {
            file,
            is_regular,
            position: 0,
        })
    }
}

impl DecoderSink for PartitionSink {
    fn append(&mut self, data: &[u8]) -> Result<(), SinkError> {
        // write_all retries partial writes until the buffer is exhausted.
        self.file.write_all(data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    fn push_byte(&mut self, byte: u8) -> Result<(), SinkError> {
        self.append(&[byte])
    }

    fn reserve_additional(&mut self, additional: u64) -> Result<(), SinkError> {
        if !self.is_regular {
            // Block devices have a fixed length; growing them is a no-op.
            return Ok(());
        }
        self.file.set_len(self.position + additional)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), SinkError> {
        self.file.seek(SeekFrom::Start(0))?;
        self.position = 0;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.position
    }
}

// In-memory sink, used by decoder tests.
impl DecoderSink for Vec<u8> {
    fn append(&mut self, data: &[u8]) -> Result<(), SinkError> {
        self.extend_from_slice(data);
        Ok(())
    }

    fn push_byte(&mut self, byte: u8) -> Result<(), SinkError> {
        self.push(byte);
        Ok(())
    }

    fn reserve_additional(&mut self, additional: u64) -> Result<(), SinkError> {
        self.reserve(additional as usize);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), SinkError> {
        self.truncate(0);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}
