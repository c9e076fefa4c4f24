//! Live-documents bitmap.
//!
//! One bit per document of a segment, set while the document is live. Each
//! time deletions are written the whole bitmap goes into a new
//! `_<seg>_<gen>.del` file; earlier generations stay untouched for the
//! commits that still reference them.

use bit_vec::BitVec;

use crate::error::{Result, SegdexError};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const LIVE_DOCS_MAGIC: u32 = 0x44454C42; // "DELB"
const LIVE_DOCS_VERSION: u32 = 1;

/// Bitmap of live documents for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveDocs {
    bits: BitVec,
    num_deleted: u32,
}

impl LiveDocs {
    /// A bitmap where every one of `max_doc` documents is live.
    pub fn all_live(max_doc: u32) -> Self {
        LiveDocs {
            bits: BitVec::from_elem(max_doc as usize, true),
            num_deleted: 0,
        }
    }

    /// Mark a document as deleted. Returns whether it was live before.
    pub fn delete(&mut self, doc: u32) -> bool {
        match self.bits.get(doc as usize) {
            Some(true) => {
                self.bits.set(doc as usize, false);
                self.num_deleted += 1;
                true
            }
            _ => false,
        }
    }

    /// Check if a document is live. Out-of-range ids are not live.
    pub fn is_live(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Number of documents covered, live or not.
    pub fn max_doc(&self) -> u32 {
        self.bits.len() as u32
    }

    /// Number of deleted documents.
    pub fn num_deleted(&self) -> u32 {
        self.num_deleted
    }

    /// Number of live documents.
    pub fn num_live(&self) -> u32 {
        self.max_doc() - self.num_deleted
    }

    /// Iterate over the ids of live documents.
    pub fn live_iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, live)| *live)
            .map(|(doc, _)| doc as u32)
    }

    /// Write the bitmap to `name`. The file still needs a sync to be durable.
    pub fn write(&self, storage: &dyn Storage, name: &str, segment: &str) -> Result<()> {
        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);
        writer.write_header(LIVE_DOCS_MAGIC, LIVE_DOCS_VERSION)?;
        writer.write_string(segment)?;
        writer.write_u32(self.max_doc())?;
        writer.write_u32(self.num_deleted)?;
        writer.write_bytes(&self.bits.to_bytes())?;
        writer.close()
    }

    /// Read a bitmap and check it against the segment it belongs to.
    pub fn read(
        storage: &dyn Storage,
        name: &str,
        segment: &str,
        max_doc: u32,
        del_count: u32,
    ) -> Result<Self> {
        let mut reader = StructReader::open(storage, name)?;
        reader.read_header(LIVE_DOCS_MAGIC, LIVE_DOCS_VERSION, LIVE_DOCS_VERSION)?;

        let stored_segment = reader.read_string()?;
        let stored_max_doc = reader.read_u32()?;
        let stored_deleted = reader.read_u32()?;
        let bytes = reader.read_bytes()?;
        reader.expect_eof()?;

        if stored_segment != segment || stored_max_doc != max_doc {
            return Err(SegdexError::corrupt(format!(
                "{name}: belongs to {stored_segment} with {stored_max_doc} docs, expected {segment} with {max_doc}"
            )));
        }

        let mut bits = BitVec::from_bytes(&bytes);
        if bits.len() < max_doc as usize {
            return Err(SegdexError::corrupt(format!("{name}: bitmap too short")));
        }
        bits.truncate(max_doc as usize);

        let actual_deleted = max_doc - bits.iter().filter(|b| *b).count() as u32;
        if actual_deleted != stored_deleted || actual_deleted != del_count {
            return Err(SegdexError::corrupt(format!(
                "{name}: {actual_deleted} deleted docs in bitmap, header says {stored_deleted}, manifest says {del_count}"
            )));
        }

        Ok(LiveDocs {
            bits,
            num_deleted: actual_deleted,
        })
    }
}
