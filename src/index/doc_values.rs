//! Numeric doc-values updates.
//!
//! Updating a numeric field in place never rewrites the segment. The new
//! values are kept as an overlay keyed by field and document, and every time
//! the overlay is written the complete overlay goes into a new
//! `_<seg>_<gen>.dvu` file.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

const DOC_VALUES_MAGIC: u32 = 0x44565550; // "DVUP"
const DOC_VALUES_VERSION: u32 = 1;

/// Per-segment overlay of numeric field values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocValuesUpdates {
    fields: BTreeMap<String, BTreeMap<u32, i64>>,
}

impl DocValuesUpdates {
    /// An empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `field` of `doc` to `value`, replacing any earlier update.
    pub fn set(&mut self, doc: u32, field: &str, value: i64) {
        self.fields
            .entry(field.to_string())
            .or_default()
            .insert(doc, value);
    }

    /// The updated value of `field` for `doc`, if any.
    pub fn get(&self, doc: u32, field: &str) -> Option<i64> {
        self.fields.get(field)?.get(&doc).copied()
    }

    /// All updated values of one document.
    pub fn for_doc(&self, doc: u32) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.fields
            .iter()
            .filter_map(move |(field, docs)| docs.get(&doc).map(|v| (field.as_str(), *v)))
    }

    /// Every update as `(field, doc, value)`, by field then doc.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32, i64)> + '_ {
        self.fields.iter().flat_map(|(field, docs)| {
            docs.iter()
                .map(move |(doc, value)| (field.as_str(), *doc, *value))
        })
    }

    /// Apply every update of `newer` on top of this overlay.
    pub fn apply(&mut self, newer: &DocValuesUpdates) {
        for (field, docs) in &newer.fields {
            let target = self.fields.entry(field.clone()).or_default();
            for (doc, value) in docs {
                target.insert(*doc, *value);
            }
        }
    }

    /// Whether no update is recorded.
    pub fn is_empty(&self) -> bool {
        self.fields.values().all(BTreeMap::is_empty)
    }

    /// Number of (field, document) updates.
    pub fn len(&self) -> usize {
        self.fields.values().map(BTreeMap::len).sum()
    }

    /// Write the overlay to `name`. The file still needs a sync to be durable.
    pub fn write(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        let output = storage.create_output(name)?;
        let mut writer = StructWriter::new(output);
        writer.write_header(DOC_VALUES_MAGIC, DOC_VALUES_VERSION)?;
        writer.write_varint(self.fields.len() as u64)?;
        for (field, docs) in &self.fields {
            writer.write_string(field)?;
            writer.write_varint(docs.len() as u64)?;
            let mut previous = 0u32;
            for (doc, value) in docs {
                writer.write_varint((doc - previous) as u64)?;
                writer.write_zigzag(*value)?;
                previous = *doc;
            }
        }
        writer.close()
    }

    /// Read an overlay written by [`DocValuesUpdates::write`].
    pub fn read(storage: &dyn Storage, name: &str) -> Result<Self> {
        let mut reader = StructReader::open(storage, name)?;
        reader.read_header(DOC_VALUES_MAGIC, DOC_VALUES_VERSION, DOC_VALUES_VERSION)?;

        let mut fields = BTreeMap::new();
        for _ in 0..reader.read_varint()? {
            let field = reader.read_string()?;
            let mut docs = BTreeMap::new();
            let mut doc = 0u32;
            for _ in 0..reader.read_varint()? {
                doc += reader.read_varint()? as u32;
                docs.insert(doc, reader.read_zigzag()?);
            }
            fields.insert(field, docs);
        }
        reader.expect_eof()?;

        Ok(DocValuesUpdates { fields })
    }
}
