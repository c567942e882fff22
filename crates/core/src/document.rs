//! Documents and the chunks cut from them

use crate::hashing::content_hash;
use serde::{Deserialize, Serialize};

/// A source document. Its identifier is the content hash of the raw text,
/// so the same text always maps to the same document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Hex SHA-256 of `text`
    pub id: String,

    /// Raw text
    pub text: String,

    /// Where the text came from (file path, URL, ...)
    #[serde(default)]
    pub source_uri: Option<String>,

    /// Free-form source metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Document {
    /// Create a document from raw text
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: content_hash(&text),
            text,
            source_uri: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Builder: set the source URI
    pub fn with_source(mut self, uri: impl Into<String>) -> Self {
        self.source_uri = Some(uri.into());
        self
    }

    /// Builder: set metadata
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A window of document text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    /// Owning document
    pub document_id: String,

    /// Position in the document's chunk sequence
    pub index: usize,

    /// The chunk text
    pub text: String,

    /// Character offset where the chunk starts (inclusive)
    pub start_char: usize,

    /// Character offset where the chunk ends (exclusive)
    pub end_char: usize,
}

impl Chunk {
    /// Stable identifier `"{document_id}:{index}"`
    pub fn id(&self) -> String {
        format!("{}:{}", self.document_id, self.index)
    }

    /// Document id encoded in a chunk id
    pub fn document_of(chunk_id: &str) -> &str {
        chunk_id.rsplit_once(':').map(|(doc, _)| doc).unwrap_or(chunk_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_is_content_hash() {
        let a = Document::new("hello world").with_source("a.txt");
        let b = Document::new("hello world");
        assert_eq!(a.id, b.id);
        assert_eq!(a.source_uri.as_deref(), Some("a.txt"));
    }

    #[test]
    fn test_chunk_id_round_trip() {
        let chunk = Chunk {
            document_id: "abc".into(),
            index: 3,
            text: "x".into(),
            start_char: 0,
            end_char: 1,
        };
        assert_eq!(chunk.id(), "abc:3");
        assert_eq!(Chunk::document_of(&chunk.id()), "abc");
    }
}
