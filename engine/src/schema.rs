//! Data model: libraries, documents, chunks, and search results.
//!
//! Identifiers are opaque UUID-shaped strings. Parent references are modeled
//! as id strings, never object ownership; libraries own their children via
//! id-keyed maps in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::index::{IndexKind, IndexParams, IndexStats};

/// Upper bound on embedding dimensionality accepted at library creation.
pub const MAX_DIMS: usize = 65_536;

/// A namespace with fixed dims and index kind, owning documents and chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    /// Unique library identifier
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Embedding dimensionality for all chunks in this library (immutable)
    pub dims: usize,
    /// Index algorithm (immutable)
    pub index_kind: IndexKind,
    /// Kind-specific index parameters
    pub index_params: IndexParams,
    /// Whether the library's index has been trained. Meaningful for IVF;
    /// persisted so recovery knows to retrain.
    #[serde(default)]
    pub index_trained: bool,
    /// Library-level metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Library {
    pub fn new(
        name: String,
        dims: usize,
        index_kind: IndexKind,
        index_params: IndexParams,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            dims,
            index_kind,
            index_params,
            index_trained: false,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A titled group of chunks inside one library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Parent library (immutable)
    pub library_id: String,
    pub title: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(library_id: String, title: String, metadata: HashMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            library_id,
            title,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A text fragment plus its embedding; the unit of indexing and retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// Parent library (immutable)
    pub library_id: String,
    /// Parent document (immutable, same library)
    pub document_id: String,
    /// Text content, preserved verbatim
    pub text: String,
    /// Embedding of length `library.dims`, all values finite
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chunk {
    pub fn new(
        library_id: String,
        document_id: String,
        text: String,
        embedding: Vec<f32>,
        metadata: HashMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            library_id,
            document_id,
            text,
            embedding,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One ranked search hit, optionally hydrated with the chunk itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    /// Cosine similarity, higher is better
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Chunk>,
}

/// Counts reported by `GET /v1/libraries/{id}/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryStats {
    pub library_id: String,
    pub name: String,
    pub dims: usize,
    pub index_kind: IndexKind,
    pub n_documents: usize,
    pub n_chunks: usize,
    pub index: IndexStats,
}
