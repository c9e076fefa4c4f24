//! In-memory buffer of edits not yet flushed into a segment.
//!
//! Added documents wait here until a flush writes them as a new segment.
//! Deletes and doc-values updates are split in two: the part that targets
//! buffered documents is resolved at flush time, the part that targets
//! existing segments is handed to the reader pool in one batch.
//!
//! Every segment in the index while a delete term is buffered only holds
//! documents added before that delete (later documents are still buffered),
//! so segment-side edits can be applied at any point up to the next flush.

use std::collections::BTreeSet;

use crate::document::{Document, Term};
use crate::error::Result;
use crate::index::live_docs::LiveDocs;

/// A document and its analyzed terms.
#[derive(Debug, Clone)]
struct BufferedDocument {
    doc: Document,
    terms: BTreeSet<Term>,
}

/// Delete of buffered documents matching `term`, limited to the documents
/// that were buffered when the delete was issued.
#[derive(Debug, Clone)]
struct BufferedDelete {
    term: Term,
    docs_upto: usize,
}

/// Numeric doc-values update targeting existing segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericUpdate {
    pub term: Term,
    pub field: String,
    pub value: i64,
}

/// Edits that apply to segments already in the index.
#[derive(Debug, Clone, Default)]
pub struct SegmentEdits {
    pub delete_terms: Vec<Term>,
    pub numeric_updates: Vec<NumericUpdate>,
}

impl SegmentEdits {
    pub fn is_empty(&self) -> bool {
        self.delete_terms.is_empty() && self.numeric_updates.is_empty()
    }
}

/// Buffered documents ready to be written, with the deletes that apply to
/// them already resolved.
#[derive(Debug)]
pub struct FlushBatch {
    pub docs: Vec<Document>,
    /// `None` when no buffered document was deleted.
    pub live_docs: Option<LiveDocs>,
}

/// Edits accumulated between flushes.
#[derive(Debug, Default)]
pub struct DocumentsBuffer {
    docs: Vec<BufferedDocument>,
    doc_deletes: Vec<BufferedDelete>,
    segment_edits: SegmentEdits,
    bytes_used: usize,
}

impl DocumentsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a document. Fails without changing the buffer if the document
    /// cannot be analyzed.
    pub fn add_document(&mut self, doc: Document) -> Result<()> {
        let terms = doc.terms()?;
        self.bytes_used += doc.ram_bytes();
        self.docs.push(BufferedDocument { doc, terms });
        Ok(())
    }

    /// Delete every document matching `term` that exists now, buffered or
    /// not.
    pub fn delete_term(&mut self, term: Term) {
        self.bytes_used += term.field.len() + term.text.len() + 32;
        if !self.docs.is_empty() {
            self.doc_deletes.push(BufferedDelete {
                term: term.clone(),
                docs_upto: self.docs.len(),
            });
        }
        self.segment_edits.delete_terms.push(term);
    }

    /// Set `field` to `value` on every document matching `term` that exists
    /// now. Buffered documents are updated in place.
    pub fn update_numeric(&mut self, term: Term, field: &str, value: i64) {
        for buffered in &mut self.docs {
            if buffered.terms.contains(&term) {
                buffered.doc.set_numeric(field, value);
            }
        }
        self.bytes_used += term.field.len() + term.text.len() + field.len() + 40;
        self.segment_edits.numeric_updates.push(NumericUpdate {
            term,
            field: field.to_string(),
            value,
        });
    }

    /// Number of buffered documents.
    pub fn num_docs(&self) -> usize {
        self.docs.len()
    }

    /// Number of buffered documents that will survive the flush.
    pub fn num_live_docs(&self) -> usize {
        (0..self.docs.len()).filter(|d| !self.is_deleted(*d)).count()
    }

    /// Delete terms not yet applied to existing segments.
    pub fn num_delete_terms(&self) -> usize {
        self.segment_edits.delete_terms.len()
    }

    /// Approximate memory held by the buffer.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Whether a flush would change anything.
    pub fn has_changes(&self) -> bool {
        !self.docs.is_empty() || !self.segment_edits.is_empty()
    }

    pub fn has_segment_edits(&self) -> bool {
        !self.segment_edits.is_empty()
    }

    /// Hand over the edits for existing segments.
    pub fn take_segment_edits(&mut self) -> SegmentEdits {
        std::mem::take(&mut self.segment_edits)
    }

    fn is_deleted(&self, doc: usize) -> bool {
        let terms = &self.docs[doc].terms;
        self.doc_deletes
            .iter()
            .any(|d| doc < d.docs_upto && terms.contains(&d.term))
    }

    /// Take the buffered documents, resolving the deletes that target them.
    /// Segment edits stay in the buffer.
    pub fn take_flush_batch(&mut self) -> Option<FlushBatch> {
        if self.docs.is_empty() {
            return None;
        }
        let max_doc = self.docs.len() as u32;
        let mut live_docs = LiveDocs::all_live(max_doc);
        for doc in 0..self.docs.len() {
            if self.is_deleted(doc) {
                live_docs.delete(doc as u32);
            }
        }
        let docs = std::mem::take(&mut self.docs)
            .into_iter()
            .map(|b| b.doc)
            .collect();
        self.doc_deletes.clear();
        self.bytes_used = 0;
        Some(FlushBatch {
            docs,
            live_docs: (live_docs.num_deleted() > 0).then_some(live_docs),
        })
    }

    /// Put back the edits of a failed segment-side apply, ahead of anything
    /// buffered since.
    pub fn restore_segment_edits(&mut self, edits: SegmentEdits) {
        let newer = std::mem::replace(&mut self.segment_edits, edits);
        self.segment_edits.delete_terms.extend(newer.delete_terms);
        self.segment_edits.numeric_updates.extend(newer.numeric_updates);
    }

    /// Put back the documents of a failed flush. Documents the batch had
    /// already deleted stay deleted.
    pub fn restore(&mut self, batch: FlushBatch) {
        let newer = std::mem::take(&mut self.docs);
        for (idx, doc) in batch.docs.into_iter().enumerate() {
            let terms = match doc.terms() {
                Ok(terms) => terms,
                Err(_) => continue,
            };
            let live = batch
                .live_docs
                .as_ref()
                .is_none_or(|l| l.is_live(idx as u32));
            if live {
                self.bytes_used += doc.ram_bytes();
                self.docs.push(BufferedDocument { doc, terms });
            }
        }
        let restored = self.docs.len();
        for delete in &mut self.doc_deletes {
            delete.docs_upto += restored;
        }
        self.docs.extend(newer);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
