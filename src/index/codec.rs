//! Segment codecs.
//!
//! The engine never looks inside segment files. A [`Codec`] turns a batch of
//! buffered documents into the files of a new segment, opens a segment for
//! reading, and combines several segments into one during a merge.
//!
//! [`StoredFieldsCodec`] is the reference implementation: stored documents in
//! `_N.fdt` (one bincode blob per document) and a term dictionary with
//! delta-coded postings in `_N.tim`. Both files carry the checksum footer of
//! [`crate::storage::structured`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;

use crate::document::{Document, Term};
use crate::error::{Result, SegdexError};
use crate::index::doc_values::DocValuesUpdates;
use crate::index::file_names;
use crate::index::live_docs::LiveDocs;
use crate::index::merge::DocMap;
use crate::index::segment::SegmentInfo;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

/// Name of the reference codec.
pub const DEFAULT_CODEC_NAME: &str = "Segdex10";

/// Extension of the stored fields file.
pub const STORED_FIELDS_EXTENSION: &str = "fdt";

/// Extension of the term dictionary file.
pub const TERMS_EXTENSION: &str = "tim";

/// The abort check is called every this many documents during a merge.
pub const ABORT_CHECK_INTERVAL: u32 = 256;

const STORED_FIELDS_MAGIC: u32 = 0x4644_5430; // "FDT0"
const TERMS_MAGIC: u32 = 0x5449_4D30; // "TIM0"
const CODEC_VERSION: u32 = 1;

/// Decoded content of one segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentCore {
    /// Stored documents by segment-local id.
    pub docs: Vec<Document>,
    /// Term to ascending doc ids.
    pub postings: BTreeMap<Term, Vec<u32>>,
}

impl SegmentCore {
    /// Build the in-memory core of a batch of documents.
    pub fn from_documents(docs: Vec<Document>) -> Result<Self> {
        let mut postings: BTreeMap<Term, Vec<u32>> = BTreeMap::new();
        for (doc_id, doc) in docs.iter().enumerate() {
            for term in doc.terms()? {
                postings.entry(term).or_default().push(doc_id as u32);
            }
        }
        Ok(SegmentCore { docs, postings })
    }

    /// Number of documents, deleted ones included.
    pub fn max_doc(&self) -> u32 {
        self.docs.len() as u32
    }

    /// Stored document by id.
    pub fn document(&self, doc: u32) -> Option<&Document> {
        self.docs.get(doc as usize)
    }

    /// Doc ids containing `term`.
    pub fn postings(&self, term: &Term) -> &[u32] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// One input of a merge: the segment core plus the live docs and doc-values
/// overlay snapshotted when the merge started.
#[derive(Debug, Clone)]
pub struct MergeInput {
    pub segment: String,
    pub core: Arc<SegmentCore>,
    pub live_docs: Option<Arc<LiveDocs>>,
    pub doc_values: Arc<DocValuesUpdates>,
}

/// Result of [`Codec::merge`].
#[derive(Debug, Clone)]
pub struct MergedSegment {
    pub files: BTreeSet<String>,
    pub doc_count: u32,
    pub doc_map: DocMap,
}

/// Reads and writes segment files.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Name recorded in every segment this codec writes.
    fn name(&self) -> &str;

    /// Write a new segment from buffered documents, returning its files.
    fn write_segment(
        &self,
        storage: &dyn Storage,
        segment: &str,
        docs: &[Document],
    ) -> Result<BTreeSet<String>>;

    /// Decode a segment written by this codec.
    fn open_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentCore>;

    /// Combine `inputs` into a new segment named `segment`.
    ///
    /// Deleted documents are dropped, doc-values overlays are baked into the
    /// stored documents, and `check_abort` is called with the number of
    /// documents processed so far at least every [`ABORT_CHECK_INTERVAL`]
    /// documents. An error from `check_abort` stops the merge.
    fn merge(
        &self,
        storage: &dyn Storage,
        segment: &str,
        inputs: &[MergeInput],
        check_abort: &dyn Fn(u32) -> Result<()>,
    ) -> Result<MergedSegment>;
}

/// The reference codec.
#[derive(Debug, Clone, Default)]
pub struct StoredFieldsCodec;

impl StoredFieldsCodec {
    pub fn new() -> Self {
        StoredFieldsCodec
    }

    fn write_files(
        &self,
        storage: &dyn Storage,
        segment: &str,
        core: &SegmentCore,
    ) -> Result<BTreeSet<String>> {
        let fdt = file_names::segment_file_name(segment, STORED_FIELDS_EXTENSION);
        let tim = file_names::segment_file_name(segment, TERMS_EXTENSION);

        let mut writer = StructWriter::new(storage.create_output(&fdt)?);
        writer.write_header(STORED_FIELDS_MAGIC, CODEC_VERSION)?;
        writer.write_string(segment)?;
        writer.write_u32(core.max_doc())?;
        for doc in &core.docs {
            let bytes = bincode::serialize(doc)
                .map_err(|e| SegdexError::codec(format!("{fdt}: cannot encode document: {e}")))?;
            writer.write_bytes(&bytes)?;
        }
        writer.close()?;

        let mut writer = StructWriter::new(storage.create_output(&tim)?);
        writer.write_header(TERMS_MAGIC, CODEC_VERSION)?;
        writer.write_string(segment)?;
        writer.write_varint(core.postings.len() as u64)?;
        for (term, docs) in &core.postings {
            writer.write_string(&term.field)?;
            writer.write_string(&term.text)?;
            writer.write_varint(docs.len() as u64)?;
            let mut previous = 0u32;
            for (i, doc) in docs.iter().enumerate() {
                let delta = if i == 0 { *doc } else { doc - previous };
                writer.write_varint(delta as u64)?;
                previous = *doc;
            }
        }
        writer.close()?;

        Ok([fdt, tim].into_iter().collect())
    }
}

impl Codec for StoredFieldsCodec {
    fn name(&self) -> &str {
        DEFAULT_CODEC_NAME
    }

    fn write_segment(
        &self,
        storage: &dyn Storage,
        segment: &str,
        docs: &[Document],
    ) -> Result<BTreeSet<String>> {
        let core = SegmentCore::from_documents(docs.to_vec())?;
        let files = self.write_files(storage, segment, &core)?;
        debug!("codec wrote {segment} with {} docs", core.max_doc());
        Ok(files)
    }

    fn open_segment(&self, storage: &dyn Storage, info: &SegmentInfo) -> Result<SegmentCore> {
        let fdt = file_names::segment_file_name(&info.name, STORED_FIELDS_EXTENSION);
        let tim = file_names::segment_file_name(&info.name, TERMS_EXTENSION);

        let mut reader = StructReader::open(storage, &fdt)?;
        reader.read_header(STORED_FIELDS_MAGIC, CODEC_VERSION, CODEC_VERSION)?;
        let stored_segment = reader.read_string()?;
        let doc_count = reader.read_u32()?;
        if stored_segment != info.name || doc_count != info.doc_count {
            return Err(SegdexError::corrupt(format!(
                "{fdt}: holds {doc_count} docs of {stored_segment}, manifest expects {} of {}",
                info.doc_count, info.name
            )));
        }
        let mut docs = Vec::with_capacity(doc_count as usize);
        for _ in 0..doc_count {
            let bytes = reader.read_bytes()?;
            let doc: Document = bincode::deserialize(&bytes)
                .map_err(|e| SegdexError::corrupt(format!("{fdt}: undecodable document: {e}")))?;
            docs.push(doc);
        }
        reader.expect_eof()?;

        let mut reader = StructReader::open(storage, &tim)?;
        reader.read_header(TERMS_MAGIC, CODEC_VERSION, CODEC_VERSION)?;
        let stored_segment = reader.read_string()?;
        if stored_segment != info.name {
            return Err(SegdexError::corrupt(format!(
                "{tim}: belongs to {stored_segment}"
            )));
        }
        let mut postings = BTreeMap::new();
        let term_count = reader.read_varint()?;
        for _ in 0..term_count {
            let field = reader.read_string()?;
            let text = reader.read_string()?;
            let len = reader.read_varint()?;
            if len == 0 || len > doc_count as u64 {
                return Err(SegdexError::corrupt(format!(
                    "{tim}: term {field}:{text} has {len} postings"
                )));
            }
            let mut docs = Vec::with_capacity(len as usize);
            let mut doc = 0u64;
            for i in 0..len {
                let delta = reader.read_varint()?;
                if i > 0 && delta == 0 {
                    return Err(SegdexError::corrupt(format!(
                        "{tim}: postings of {field}:{text} are not increasing"
                    )));
                }
                doc += delta;
                if doc >= doc_count as u64 {
                    return Err(SegdexError::corrupt(format!(
                        "{tim}: doc {doc} out of range for {field}:{text}"
                    )));
                }
                docs.push(doc as u32);
            }
            postings.insert(Term::new(field, text), docs);
        }
        reader.expect_eof()?;

        Ok(SegmentCore { docs, postings })
    }

    fn merge(
        &self,
        storage: &dyn Storage,
        segment: &str,
        inputs: &[MergeInput],
        check_abort: &dyn Fn(u32) -> Result<()>,
    ) -> Result<MergedSegment> {
        let doc_map = DocMap::build(
            inputs
                .iter()
                .map(|input| (input.core.max_doc(), input.live_docs.as_deref())),
        );

        let mut merged = SegmentCore {
            docs: Vec::with_capacity(doc_map.new_doc_count() as usize),
            postings: BTreeMap::new(),
        };

        let mut processed = 0u32;
        check_abort(processed)?;
        for (idx, input) in inputs.iter().enumerate() {
            for (old, doc) in input.core.docs.iter().enumerate() {
                processed += 1;
                if processed % ABORT_CHECK_INTERVAL == 0 {
                    check_abort(processed)?;
                }
                if doc_map.get(idx, old as u32).is_none() {
                    continue;
                }
                let mut doc = doc.clone();
                for (field, value) in input.doc_values.for_doc(old as u32) {
                    doc.set_numeric(field, value);
                }
                merged.docs.push(doc);
            }

            // Inputs are visited in order, so appending keeps postings sorted.
            for (term, docs) in &input.core.postings {
                let remapped: Vec<u32> = docs.iter().filter_map(|d| doc_map.get(idx, *d)).collect();
                if !remapped.is_empty() {
                    merged
                        .postings
                        .entry(term.clone())
                        .or_default()
                        .extend(remapped);
                }
            }
        }
        check_abort(processed)?;

        let files = self.write_files(storage, segment, &merged)?;
        debug!(
            "codec merged {} inputs into {segment}: {} of {processed} docs kept",
            inputs.len(),
            merged.max_doc()
        );
        Ok(MergedSegment {
            files,
            doc_count: merged.max_doc(),
            doc_map,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn docs(prefix: &str, n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                Document::builder()
                    .add_keyword("id", format!("{prefix}{i}"))
                    .add_text("body", format!("common {prefix}"))
                    .build()
            })
            .collect()
    }

    fn write(codec: &StoredFieldsCodec, storage: &MemoryStorage, name: &str, docs: &[Document]) -> SegmentInfo {
        let files = codec.write_segment(storage, name, docs).unwrap();
        SegmentInfo::new(name, docs.len() as u32, codec.name(), files, 0, "flush", 0)
    }

    #[test]
    fn test_write_and_open() {
        let storage = MemoryStorage::new_default();
        let codec = StoredFieldsCodec::new();
        let info = write(&codec, &storage, "_0", &docs("a", 3));
        assert!(info.files.contains("_0.fdt"));
        assert!(info.files.contains("_0.tim"));

        let core = codec.open_segment(&storage, &info).unwrap();
        assert_eq!(core.max_doc(), 3);
        assert_eq!(core.postings(&Term::new("id", "a1")), &[1]);
        assert_eq!(core.postings(&Term::new("body", "common")), &[0, 1, 2]);
        assert!(core.postings(&Term::new("body", "missing")).is_empty());
    }

    #[test]
    fn test_open_detects_corruption() {
        let storage = MemoryStorage::new_default();
        let codec = StoredFieldsCodec::new();
        let info = write(&codec, &storage, "_0", &docs("a", 3));
        storage.corrupt_file("_0.tim", 20).unwrap();
        assert!(codec.open_segment(&storage, &info).unwrap_err().is_corruption());
    }

    #[test]
    fn test_merge_drops_deleted_and_bakes_doc_values() {
        let storage = MemoryStorage::new_default();
        let codec = StoredFieldsCodec::new();
        let a = write(&codec, &storage, "_0", &docs("a", 4));
        let b = write(&codec, &storage, "_1", &docs("b", 2));

        let mut live = LiveDocs::all_live(4);
        live.delete(1);
        let mut updates = DocValuesUpdates::new();
        updates.set(2, "price", 7);

        let inputs = vec![
            MergeInput {
                segment: "_0".into(),
                core: Arc::new(codec.open_segment(&storage, &a).unwrap()),
                live_docs: Some(Arc::new(live)),
                doc_values: Arc::new(updates),
            },
            MergeInput {
                segment: "_1".into(),
                core: Arc::new(codec.open_segment(&storage, &b).unwrap()),
                live_docs: None,
                doc_values: Arc::new(DocValuesUpdates::new()),
            },
        ];

        let merged = codec.merge(&storage, "_2", &inputs, &|_| Ok(())).unwrap();
        assert_eq!(merged.doc_count, 5);
        assert_eq!(merged.doc_map.get(0, 1), None);
        assert_eq!(merged.doc_map.get(0, 2), Some(1));
        assert_eq!(merged.doc_map.get(1, 0), Some(3));

        let info = SegmentInfo::new("_2", 5, codec.name(), merged.files, 0, "merge", 0);
        let core = codec.open_segment(&storage, &info).unwrap();
        assert_eq!(core.document(1).unwrap().numeric("price"), Some(7));
        assert!(core.postings(&Term::new("id", "a1")).is_empty());
        assert_eq!(core.postings(&Term::new("body", "common")), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_merge_abort_is_checked() {
        let storage = MemoryStorage::new_default();
        let codec = StoredFieldsCodec::new();
        let info = write(&codec, &storage, "_0", &docs("a", 600));
        let inputs = vec![MergeInput {
            segment: "_0".into(),
            core: Arc::new(codec.open_segment(&storage, &info).unwrap()),
            live_docs: None,
            doc_values: Arc::new(DocValuesUpdates::new()),
        }];

        let calls = AtomicU32::new(0);
        let result = codec.merge(&storage, "_1", &inputs, &|processed| {
            calls.fetch_add(1, Ordering::SeqCst);
            if processed >= ABORT_CHECK_INTERVAL {
                Err(SegdexError::merge_aborted("test"))
            } else {
                Ok(())
            }
        });
        assert!(result.unwrap_err().is_merge_aborted());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!storage.file_exists("_1.fdt"));
    }
}
