//! Documents and terms.
//!
//! A [`Document`] is a flat map from field name to [`FieldValue`]. Text fields
//! are split into lowercase Unicode words when indexed, keyword fields are
//! indexed verbatim (one term per field), and numeric fields are stored as
//! doc values that can later be changed in place with
//! [`IndexWriter::update_numeric_doc_value`](crate::index::writer::IndexWriter::update_numeric_doc_value).
//!
//! ```
//! use segdex::document::{Document, Term};
//!
//! let doc = Document::builder()
//!     .add_keyword("id", "doc-7")
//!     .add_text("body", "Segments are merged in the Background")
//!     .add_numeric("price", 42)
//!     .build();
//!
//! let terms = doc.terms().unwrap();
//! assert!(terms.contains(&Term::new("id", "doc-7")));
//! assert!(terms.contains(&Term::new("body", "background")));
//! assert_eq!(doc.numeric("price"), Some(42));
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Result, SegdexError};

/// Longest term, in UTF-8 bytes, the index accepts.
pub const MAX_TERM_LENGTH: usize = 32766;

/// The value of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Tokenized into lowercase words.
    Text(String),
    /// Indexed as a single term.
    Keyword(String),
    /// Numeric doc value. Not indexed.
    Numeric(i64),
}

/// A document: named fields with values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    /// Create an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    /// Add or replace a field.
    pub fn add_field<S: Into<String>>(&mut self, name: S, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Get a field value by name.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// The string content of a text or keyword field.
    pub fn get(&self, name: &str) -> Option<&str> {
        match self.fields.get(name)? {
            FieldValue::Text(s) | FieldValue::Keyword(s) => Some(s),
            FieldValue::Numeric(_) => None,
        }
    }

    /// The value of a numeric field.
    pub fn numeric(&self, name: &str) -> Option<i64> {
        match self.fields.get(name)? {
            FieldValue::Numeric(v) => Some(*v),
            _ => None,
        }
    }

    /// Set a numeric field, replacing any previous value.
    pub fn set_numeric<S: Into<String>>(&mut self, name: S, value: i64) {
        self.fields.insert(name.into(), FieldValue::Numeric(value));
    }

    /// All fields, sorted by name.
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the document has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Analyze the document into its distinct indexed terms.
    ///
    /// Fails with [`SegdexError::InvalidArgument`] if any term is longer than
    /// [`MAX_TERM_LENGTH`] bytes.
    pub fn terms(&self) -> Result<BTreeSet<Term>> {
        let mut terms = BTreeSet::new();
        for (field, value) in &self.fields {
            match value {
                FieldValue::Keyword(s) => {
                    check_term_length(field, s)?;
                    terms.insert(Term::new(field.as_str(), s.as_str()));
                }
                FieldValue::Text(s) => {
                    for word in s.unicode_words() {
                        let word = word.to_lowercase();
                        check_term_length(field, &word)?;
                        terms.insert(Term::new(field.as_str(), word));
                    }
                }
                FieldValue::Numeric(_) => {}
            }
        }
        Ok(terms)
    }

    /// Rough in-memory footprint, used for the RAM flush trigger.
    pub fn ram_bytes(&self) -> usize {
        self.fields
            .iter()
            .map(|(name, value)| {
                let value_len = match value {
                    FieldValue::Text(s) | FieldValue::Keyword(s) => s.len() * 2,
                    FieldValue::Numeric(_) => 8,
                };
                // Per-field overhead for the map entry and postings slot.
                name.len() + value_len + 64
            })
            .sum()
    }
}

fn check_term_length(field: &str, term: &str) -> Result<()> {
    if term.len() > MAX_TERM_LENGTH {
        return Err(SegdexError::invalid_argument(format!(
            "immense term in field \"{field}\": {} bytes exceeds the maximum of {MAX_TERM_LENGTH}; prefix: {:?}",
            term.len(),
            term.chars().take(30).collect::<String>()
        )));
    }
    Ok(())
}

/// Builder for constructing documents.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Add a tokenized text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add_field(name, FieldValue::Text(value.into()));
        self
    }

    /// Add an untokenized keyword field.
    pub fn add_keyword<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add_field(name, FieldValue::Keyword(value.into()));
        self
    }

    /// Add a numeric doc-values field.
    pub fn add_numeric<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document.add_field(name, FieldValue::Numeric(value));
        self
    }

    /// Add a field with an explicit value.
    pub fn add_field<S: Into<String>>(mut self, name: S, value: FieldValue) -> Self {
        self.document.add_field(name, value);
        self
    }

    /// Build the document.
    pub fn build(self) -> Document {
        self.document
    }
}

/// A term: a field name and the indexed text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    /// Create a new term.
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_is_lowercased_words() {
        let doc = Document::builder()
            .add_text("body", "Hello, World! Hello again.")
            .build();
        let terms: Vec<String> = doc.terms().unwrap().into_iter().map(|t| t.text).collect();
        assert_eq!(terms, vec!["again", "hello", "world"]);
    }

    #[test]
    fn test_keyword_is_verbatim() {
        let doc = Document::builder().add_keyword("id", "Doc-7 X").build();
        let terms = doc.terms().unwrap();
        assert_eq!(terms.len(), 1);
        assert!(terms.contains(&Term::new("id", "Doc-7 X")));
    }

    #[test]
    fn test_numeric_not_indexed() {
        let mut doc = Document::builder().add_numeric("price", 3).build();
        assert!(doc.terms().unwrap().is_empty());
        doc.set_numeric("price", 9);
        assert_eq!(doc.numeric("price"), Some(9));
        assert_eq!(doc.get("price"), None);
    }

    #[test]
    fn test_immense_term_rejected() {
        let big = "x".repeat(MAX_TERM_LENGTH + 1);
        let doc = Document::builder().add_keyword("id", big.clone()).build();
        assert!(matches!(doc.terms(), Err(SegdexError::InvalidArgument(_))));

        let doc = Document::builder().add_text("body", format!("ok {big}")).build();
        assert!(matches!(doc.terms(), Err(SegdexError::InvalidArgument(_))));

        let edge = "y".repeat(MAX_TERM_LENGTH);
        let doc = Document::builder().add_keyword("id", edge).build();
        assert!(doc.terms().is_ok());
    }

    #[test]
    fn test_term_ordering() {
        let mut terms = vec![Term::new("b", "a"), Term::new("a", "z"), Term::new("a", "b")];
        terms.sort();
        assert_eq!(terms[0], Term::new("a", "b"));
        assert_eq!(terms[2].to_string(), "b:a");
    }
}
