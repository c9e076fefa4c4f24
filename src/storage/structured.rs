//! Structured, checksummed binary files.
//!
//! Every index file segdex writes itself (manifests, live-docs bitmaps,
//! doc-values updates, snapshot stores) has the same framing:
//!
//! ```text
//! header:  magic u32 | version u32
//! body:    little-endian fixed-width values, varints, length-prefixed bytes
//! footer:  FOOTER_MAGIC u32 | crc32 u32
//! ```
//!
//! The CRC covers every byte before it, footer magic included. A file is
//! either complete with a matching checksum or it is treated as corrupt.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Result, SegdexError};
use crate::storage::{Storage, StorageOutput};
use crate::util::varint;

/// Marker written before the trailing checksum.
pub const FOOTER_MAGIC: u32 = 0xC02893E8;

/// Size of the footer in bytes.
pub const FOOTER_LEN: usize = 8;

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            position: 0,
        }
    }

    /// Write the file header.
    pub fn write_header(&mut self, magic: u32, version: u32) -> Result<()> {
        self.write_u32(magic)?;
        self.write_u32(version)
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_raw(&[value])
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write an i64 value (little-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_raw(&value.to_le_bytes())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = varint::encode_u64(value);
        self.write_raw(&encoded)
    }

    /// Write a zig-zag encoded signed variable-length integer.
    pub fn write_zigzag(&mut self, value: i64) -> Result<()> {
        self.write_varint(varint::zigzag_encode(value))
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.hasher.update(value);
        self.position += value.len() as u64;
        Ok(())
    }

    /// Write a sorted string map.
    pub fn write_string_map(&mut self, map: &BTreeMap<String, String>) -> Result<()> {
        self.write_varint(map.len() as u64)?;
        for (key, value) in map {
            self.write_string(key)?;
            self.write_string(value)?;
        }
        Ok(())
    }

    /// Write a list of strings.
    pub fn write_strings<'a, I>(&mut self, values: I) -> Result<()>
    where
        I: ExactSizeIterator<Item = &'a String>,
    {
        self.write_varint(values.len() as u64)?;
        for value in values {
            self.write_string(value)?;
        }
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write the footer and close the output.
    ///
    /// The file is not durable until it has been synced through
    /// [`Storage::sync`].
    pub fn close(mut self) -> Result<()> {
        self.write_u32(FOOTER_MAGIC)?;
        let checksum = self.hasher.clone().finalize();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.close()
    }
}

/// A reader over a structured file whose checksum has already been verified.
#[derive(Debug)]
pub struct StructReader {
    name: String,
    cursor: Cursor<Vec<u8>>,
    body_len: u64,
}

impl StructReader {
    /// Read `name` fully and verify its footer.
    ///
    /// Truncated files, a missing footer and checksum mismatches all produce
    /// [`SegdexError::CorruptIndex`].
    pub fn open(storage: &dyn Storage, name: &str) -> Result<Self> {
        let bytes = storage.read_all(name)?;
        Self::from_bytes(name, bytes)
    }

    /// Verify and wrap an in-memory copy of a structured file.
    pub fn from_bytes(name: &str, mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < FOOTER_LEN {
            return Err(SegdexError::corrupt(format!(
                "{name}: file too short ({} bytes)",
                bytes.len()
            )));
        }

        let footer_start = bytes.len() - FOOTER_LEN;
        let mut footer = &bytes[footer_start..];
        let magic = footer.read_u32::<LittleEndian>()?;
        let stored = footer.read_u32::<LittleEndian>()?;
        if magic != FOOTER_MAGIC {
            return Err(SegdexError::corrupt(format!(
                "{name}: bad footer magic {magic:#x}"
            )));
        }

        let actual = crc32fast::hash(&bytes[..footer_start + 4]);
        if actual != stored {
            return Err(SegdexError::corrupt(format!(
                "{name}: checksum mismatch (stored {stored:#x}, actual {actual:#x})"
            )));
        }

        bytes.truncate(footer_start);
        Ok(StructReader {
            name: name.to_string(),
            body_len: footer_start as u64,
            cursor: Cursor::new(bytes),
        })
    }

    /// Read and check the header, returning the format version.
    pub fn read_header(&mut self, magic: u32, min_version: u32, max_version: u32) -> Result<u32> {
        let actual = self.read_u32()?;
        if actual != magic {
            return Err(self.corrupt(format!("bad magic {actual:#x}, expected {magic:#x}")));
        }
        let version = self.read_u32()?;
        if version < min_version || version > max_version {
            return Err(self.corrupt(format!(
                "unsupported version {version} (supported {min_version}..={max_version})"
            )));
        }
        Ok(version)
    }

    fn corrupt(&self, msg: impl std::fmt::Display) -> SegdexError {
        SegdexError::corrupt(format!("{}: {msg}", self.name))
    }

    fn eof<T>(&self, r: std::io::Result<T>) -> Result<T> {
        r.map_err(|_| self.corrupt("unexpected end of file"))
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let r = self.cursor.read_u8();
        self.eof(r)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let r = self.cursor.read_u32::<LittleEndian>();
        self.eof(r)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let r = self.cursor.read_u64::<LittleEndian>();
        self.eof(r)
    }

    /// Read an i64 value (little-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        let r = self.cursor.read_i64::<LittleEndian>();
        self.eof(r)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        varint::read_u64(&mut self.cursor).map_err(|e| self.corrupt(e))
    }

    /// Read a zig-zag encoded signed variable-length integer.
    pub fn read_zigzag(&mut self) -> Result<i64> {
        Ok(varint::zigzag_decode(self.read_varint()?))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()?;
        if length > self.remaining() {
            return Err(self.corrupt(format!("length {length} past end of file")));
        }
        let mut bytes = vec![0u8; length as usize];
        let r = self.cursor.read_exact(&mut bytes);
        self.eof(r)?;
        Ok(bytes)
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| self.corrupt(format!("invalid UTF-8: {e}")))
    }

    /// Read a sorted string map.
    pub fn read_string_map(&mut self) -> Result<BTreeMap<String, String>> {
        let length = self.read_varint()?;
        let mut map = BTreeMap::new();
        for _ in 0..length {
            let key = self.read_string()?;
            let value = self.read_string()?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Read a list of strings.
    pub fn read_strings(&mut self) -> Result<Vec<String>> {
        let length = self.read_varint()?;
        if length > self.remaining() {
            return Err(self.corrupt(format!("count {length} past end of file")));
        }
        (0..length).map(|_| self.read_string()).collect()
    }

    /// Bytes left before the footer.
    pub fn remaining(&self) -> u64 {
        self.body_len.saturating_sub(self.cursor.position())
    }

    /// Check if the whole body has been consumed.
    pub fn is_eof(&self) -> bool {
        self.remaining() == 0
    }

    /// Fail unless the whole body has been consumed.
    pub fn expect_eof(&self) -> Result<()> {
        if self.is_eof() {
            Ok(())
        } else {
            Err(self.corrupt(format!("{} trailing bytes", self.remaining())))
        }
    }
}
