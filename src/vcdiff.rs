// VCDIFF (RFC 3284) streaming decoder
//
// Reconstructs a target image from a dictionary (the currently installed
// image) and a delta stream arriving in arbitrary chunks. Windows are
// decoded as soon as they are fully buffered and flushed to the output
// sink, so memory use is bounded by the largest single window.
//
// Secondary compression and custom code tables are not supported; windows
// that reference previously decoded target data (VCD_TARGET) are rejected
// so the decoder never has to retain its own output. The Adler-32
// checksum extension in the window header is verified when present.

use thiserror::Error;

use crate::sink::{DecoderSink, SinkError};

const VCD_MAGIC: [u8; 3] = [0xD6, 0xC3, 0xC4];

// Hdr_Indicator bits.
const VCD_DECOMPRESS: u8 = 0x01;
const VCD_CODETABLE: u8 = 0x02;
const VCD_APPHEADER: u8 = 0x04;

// Win_Indicator bits.
const VCD_SOURCE: u8 = 0x01;
const VCD_TARGET: u8 = 0x02;
const VCD_CHECKSUM: u8 = 0x04;

const NEAR_CACHE_SIZE: usize = 4;
const SAME_CACHE_SIZE: usize = 3;

#[derive(Debug, Error)]
pub enum VcdiffError {
    #[error("not a VCDIFF stream")]
    BadMagic,
    #[error("secondary compression is not supported")]
    UnsupportedCompression,
    #[error("application-defined code tables are not supported")]
    UnsupportedCodeTable,
    #[error("windows referencing target data are not supported")]
    UnsupportedTargetWindow,
    #[error("corrupt delta: {0}")]
    Corrupt(&'static str),
    #[error("decoded target size {decoded} exceeds limit {limit}")]
    TargetTooLarge { decoded: u64, limit: u64 },
    #[error("window checksum mismatch")]
    ChecksumMismatch,
    #[error("delta stream is truncated")]
    Truncated,
    #[error(transparent)]
    Sink(#[from] SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inst {
    NoOp,
    Add,
    Run,
    Copy,
}

#[derive(Debug, Clone, Copy)]
struct CodeEntry {
    inst1: Inst,
    size1: u8,
    mode1: u8,
    inst2: Inst,
    size2: u8,
    mode2: u8,
}

const NOOP_ENTRY: CodeEntry = CodeEntry {
    inst1: Inst::NoOp,
    size1: 0,
    mode1: 0,
    inst2: Inst::NoOp,
    size2: 0,
    mode2: 0,
};

// Default instruction code table from RFC 3284 section 5.6.
fn default_code_table() -> [CodeEntry; 256] {
    fn put(
        table: &mut [CodeEntry; 256],
        index: &mut usize,
        inst1: Inst,
        size1: u8,
        mode1: u8,
        inst2: Inst,
        size2: u8,
        mode2: u8,
    ) {
        table[*index] = CodeEntry {
            inst1,
            size1,
            mode1,
            inst2,
            size2,
            mode2,
        };
        *index += 1;
    }

    let mut table = [NOOP_ENTRY; 256];
    let mut index = 0;

    put(&mut table, &mut index, Inst::Run, 0, 0, Inst::NoOp, 0, 0);
    for size in 0..=17 {
        put(&mut table, &mut index, Inst::Add, size, 0, Inst::NoOp, 0, 0);
    }
    for mode in 0..=8 {
        put(&mut table, &mut index, Inst::Copy, 0, mode, Inst::NoOp, 0, 0);
        for size in 4..=18 {
            put(&mut table, &mut index, Inst::Copy, size, mode, Inst::NoOp, 0, 0);
        }
    }
    for mode in 0..=5 {
        for add_size in 1..=4 {
            for copy_size in 4..=6 {
                put(
                    &mut table, &mut index, Inst::Add, add_size, 0, Inst::Copy, copy_size, mode,
                );
            }
        }
    }
    for mode in 6..=8 {
        for add_size in 1..=4 {
            put(&mut table, &mut index, Inst::Add, add_size, 0, Inst::Copy, 4, mode);
        }
    }
    for mode in 0..=8 {
        put(&mut table, &mut index, Inst::Copy, 4, mode, Inst::Add, 1, 0);
    }

    debug_assert_eq!(index, 256);
    table
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    // 5552 is the largest chunk for which the sums cannot overflow u32.
    for chunk in data.chunks(5552) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Byte cursor over buffered input. Read methods return `None` when the
/// buffer ends mid-field, which makes the caller wait for more chunks.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let byte = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Some(slice)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    // Big-endian base-128 integer, most significant groups first.
    fn varint(&mut self) -> Result<Option<u64>, VcdiffError> {
        let mut value: u64 = 0;
        loop {
            let byte = match self.u8() {
                Some(b) => b,
                None => return Ok(None),
            };
            if value > u64::MAX >> 7 {
                return Err(VcdiffError::Corrupt("integer overflow"));
            }
            value = (value << 7) | u64::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                return Ok(Some(value));
            }
        }
    }
}

/// Per-window COPY address caches (RFC 3284 section 5.1).
struct AddressCache {
    near: [u64; NEAR_CACHE_SIZE],
    same: [u64; SAME_CACHE_SIZE * 256],
    next_slot: usize,
}

impl AddressCache {
    fn new() -> Self {
        Self {
            near: [0; NEAR_CACHE_SIZE],
            same: [0; SAME_CACHE_SIZE * 256],
            next_slot: 0,
        }
    }

    fn decode(&mut self, cursor: &mut Cursor<'_>, here: u64, mode: u8) -> Result<u64, VcdiffError> {
        let mode = mode as usize;
        let address = if mode == 0 {
            cursor
                .varint()?
                .ok_or(VcdiffError::Corrupt("address section ends mid-field"))?
        } else if mode == 1 {
            let offset = cursor
                .varint()?
                .ok_or(VcdiffError::Corrupt("address section ends mid-field"))?;
            here.checked_sub(offset)
                .ok_or(VcdiffError::Corrupt("HERE address before window start"))?
        } else if mode - 2 < NEAR_CACHE_SIZE {
            let offset = cursor
                .varint()?
                .ok_or(VcdiffError::Corrupt("address section ends mid-field"))?;
            self.near[mode - 2]
                .checked_add(offset)
                .ok_or(VcdiffError::Corrupt("near address overflow"))?
        } else if mode - 2 - NEAR_CACHE_SIZE < SAME_CACHE_SIZE {
            let byte = cursor
                .u8()
                .ok_or(VcdiffError::Corrupt("address section ends mid-field"))?;
            self.same[(mode - 2 - NEAR_CACHE_SIZE) * 256 + byte as usize]
        } else {
            return Err(VcdiffError::Corrupt("invalid copy address mode"));
        };

        self.near[self.next_slot] = address;
        self.next_slot = (self.next_slot + 1) % NEAR_CACHE_SIZE;
        self.same[(address % (SAME_CACHE_SIZE as u64 * 256)) as usize] = address;

        Ok(address)
    }
}

enum DecoderState {
    Header,
    Windows,
}

/// Streaming decoder fed by `decode_chunk`; call `finish` after the last
/// chunk to catch truncated streams.
pub struct VcdiffDecoder<'a> {
    dictionary: &'a [u8],
    max_target_size: u64,
    code_table: [CodeEntry; 256],
    buf: Vec<u8>,
    state: DecoderState,
    total_decoded: u64,
}

impl<'a> VcdiffDecoder<'a> {
    pub fn new(dictionary: &'a [u8], max_target_size: u64) -> Self {
        Self {
            dictionary,
            max_target_size,
            code_table: default_code_table(),
            buf: Vec::new(),
            state: DecoderState::Header,
            total_decoded: 0,
        }
    }

    /// Total bytes flushed to the sink so far.
    pub fn decoded_size(&self) -> u64 {
        self.total_decoded
    }

    /// Feed one chunk of delta input, flushing any completed windows.
    pub fn decode_chunk(
        &mut self,
        input: &[u8],
        sink: &mut dyn DecoderSink,
    ) -> Result<(), VcdiffError> {
        self.buf.extend_from_slice(input);

        let buf = std::mem::take(&mut self.buf);
        let mut consumed = 0;
        let result = self.drain_buffered(&buf, &mut consumed, sink);
        self.buf = buf;
        self.buf.drain(..consumed);
        result
    }

    fn drain_buffered(
        &mut self,
        buf: &[u8],
        consumed: &mut usize,
        sink: &mut dyn DecoderSink,
    ) -> Result<(), VcdiffError> {
        loop {
            match self.state {
                DecoderState::Header => {
                    let mut cursor = Cursor::new(&buf[*consumed..]);
                    match Self::parse_header(&mut cursor)? {
                        Some(()) => {
                            *consumed += cursor.pos;
                            self.state = DecoderState::Windows;
                        }
                        None => return Ok(()),
                    }
                }
                DecoderState::Windows => {
                    if *consumed == buf.len() {
                        return Ok(());
                    }
                    match self.decode_window(&buf[*consumed..], sink)? {
                        Some(window_len) => *consumed += window_len,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// The stream must end on a window boundary; leftover bytes mean the
    /// transfer was cut short.
    pub fn finish(self) -> Result<(), VcdiffError> {
        match self.state {
            DecoderState::Header => Err(VcdiffError::Truncated),
            DecoderState::Windows if !self.buf.is_empty() => Err(VcdiffError::Truncated),
            DecoderState::Windows => Ok(()),
        }
    }

    fn parse_header(cursor: &mut Cursor<'_>) -> Result<Option<()>, VcdiffError> {
        let magic = match cursor.take(4) {
            Some(m) => m,
            None => return Ok(None),
        };
        if magic[..3] != VCD_MAGIC || magic[3] != 0 {
            return Err(VcdiffError::BadMagic);
        }

        let indicator = match cursor.u8() {
            Some(b) => b,
            None => return Ok(None),
        };
        if indicator & VCD_DECOMPRESS != 0 {
            return Err(VcdiffError::UnsupportedCompression);
        }
        if indicator & VCD_CODETABLE != 0 {
            return Err(VcdiffError::UnsupportedCodeTable);
        }
        if indicator & !(VCD_DECOMPRESS | VCD_CODETABLE | VCD_APPHEADER) != 0 {
            return Err(VcdiffError::Corrupt("reserved header bits set"));
        }
        if indicator & VCD_APPHEADER != 0 {
            let len = match cursor.varint()? {
                Some(l) => l,
                None => return Ok(None),
            };
            if cursor.take(len as usize).is_none() {
                return Ok(None);
            }
        }

        Ok(Some(()))
    }

    /// Decode one window if it is fully buffered. Returns the number of
    /// input bytes the window occupied, or `None` to wait for more data.
    fn decode_window(
        &mut self,
        input: &[u8],
        sink: &mut dyn DecoderSink,
    ) -> Result<Option<usize>, VcdiffError> {
        let mut cursor = Cursor::new(input);

        let win_indicator = match cursor.u8() {
            Some(b) => b,
            None => return Ok(None),
        };
        if win_indicator & !(VCD_SOURCE | VCD_TARGET | VCD_CHECKSUM) != 0 {
            return Err(VcdiffError::Corrupt("reserved window bits set"));
        }
        if win_indicator & VCD_TARGET != 0 {
            return Err(VcdiffError::UnsupportedTargetWindow);
        }

        let dictionary = self.dictionary;
        let source = if win_indicator & VCD_SOURCE != 0 {
            let len = match cursor.varint()? {
                Some(v) => v,
                None => return Ok(None),
            };
            let pos = match cursor.varint()? {
                Some(v) => v,
                None => return Ok(None),
            };
            let end = pos
                .checked_add(len)
                .ok_or(VcdiffError::Corrupt("source segment overflow"))?;
            if end > dictionary.len() as u64 {
                return Err(VcdiffError::Corrupt("source segment outside dictionary"));
            }
            &dictionary[pos as usize..end as usize]
        } else {
            &[][..]
        };

        let delta_len = match cursor.varint()? {
            Some(v) => v,
            None => return Ok(None),
        };
        let delta_start = cursor.pos;
        if cursor.remaining() < delta_len as usize {
            return Ok(None);
        }

        let target_len = cursor
            .varint()?
            .ok_or(VcdiffError::Corrupt("window header ends mid-field"))?;
        let decoded = self
            .total_decoded
            .checked_add(target_len)
            .ok_or(VcdiffError::Corrupt("target size overflow"))?;
        if decoded > self.max_target_size {
            return Err(VcdiffError::TargetTooLarge {
                decoded,
                limit: self.max_target_size,
            });
        }

        let delta_indicator = cursor
            .u8()
            .ok_or(VcdiffError::Corrupt("window header ends mid-field"))?;
        if delta_indicator != 0 {
            return Err(VcdiffError::UnsupportedCompression);
        }

        let data_len = cursor
            .varint()?
            .ok_or(VcdiffError::Corrupt("window header ends mid-field"))?
            as usize;
        let inst_len = cursor
            .varint()?
            .ok_or(VcdiffError::Corrupt("window header ends mid-field"))?
            as usize;
        let addr_len = cursor
            .varint()?
            .ok_or(VcdiffError::Corrupt("window header ends mid-field"))?
            as usize;

        let checksum = if win_indicator & VCD_CHECKSUM != 0 {
            let bytes = cursor
                .take(4)
                .ok_or(VcdiffError::Corrupt("window checksum cut short"))?;
            Some(u32::from_be_bytes(bytes.try_into().unwrap()))
        } else {
            None
        };

        let data_section = cursor
            .take(data_len)
            .ok_or(VcdiffError::Corrupt("data section cut short"))?;
        let inst_section = cursor
            .take(inst_len)
            .ok_or(VcdiffError::Corrupt("instruction section cut short"))?;
        let addr_section = cursor
            .take(addr_len)
            .ok_or(VcdiffError::Corrupt("address section cut short"))?;

        if cursor.pos - delta_start != delta_len as usize {
            return Err(VcdiffError::Corrupt("window length mismatch"));
        }

        let target = self.decode_instructions(
            source,
            target_len as usize,
            data_section,
            inst_section,
            addr_section,
        )?;

        if let Some(expected) = checksum {
            if adler32(&target) != expected {
                return Err(VcdiffError::ChecksumMismatch);
            }
        }

        sink.reserve_additional(target_len)?;
        sink.append(&target)?;
        self.total_decoded += target_len;

        Ok(Some(cursor.pos))
    }

    fn decode_instructions(
        &self,
        source: &[u8],
        target_len: usize,
        data_section: &[u8],
        inst_section: &[u8],
        addr_section: &[u8],
    ) -> Result<Vec<u8>, VcdiffError> {
        let mut target = Vec::with_capacity(target_len);
        let mut data = Cursor::new(data_section);
        let mut inst = Cursor::new(inst_section);
        let mut addr = Cursor::new(addr_section);
        let mut cache = AddressCache::new();

        while let Some(opcode) = inst.u8() {
            let entry = self.code_table[opcode as usize];
            for (kind, table_size, mode) in [
                (entry.inst1, entry.size1, entry.mode1),
                (entry.inst2, entry.size2, entry.mode2),
            ] {
                if kind == Inst::NoOp {
                    continue;
                }

                let size = if table_size == 0 {
                    inst.varint()?
                        .ok_or(VcdiffError::Corrupt("instruction section ends mid-field"))?
                        as usize
                } else {
                    table_size as usize
                };
                if target.len() + size > target_len {
                    return Err(VcdiffError::Corrupt("instructions overrun target window"));
                }

                match kind {
                    Inst::Add => {
                        let bytes = data
                            .take(size)
                            .ok_or(VcdiffError::Corrupt("data section cut short"))?;
                        target.extend_from_slice(bytes);
                    }
                    Inst::Run => {
                        let byte = data
                            .u8()
                            .ok_or(VcdiffError::Corrupt("data section cut short"))?;
                        target.resize(target.len() + size, byte);
                    }
                    Inst::Copy => {
                        let here = source.len() as u64 + target.len() as u64;
                        let address = cache.decode(&mut addr, here, mode)?;
                        if address >= here {
                            return Err(VcdiffError::Corrupt("copy address beyond window"));
                        }
                        // Copies may span from the source segment into
                        // already-produced target bytes, and may overlap
                        // their own output; copy bytewise.
                        for i in 0..size as u64 {
                            let at = address + i;
                            let byte = if at < source.len() as u64 {
                                source[at as usize]
                            } else {
                                target[(at - source.len() as u64) as usize]
                            };
                            target.push(byte);
                        }
                    }
                    Inst::NoOp => unreachable!(),
                }
            }
        }

        if target.len() != target_len {
            return Err(VcdiffError::Corrupt("window decoded to wrong length"));
        }
        if data.remaining() != 0 || addr.remaining() != 0 {
            return Err(VcdiffError::Corrupt("unconsumed section bytes"));
        }

        Ok(target)
    }
}
