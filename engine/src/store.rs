//! In-memory library store.
//!
//! A process-wide map of library handles. Each handle owns the library
//! entity, its document and chunk maps, and the index, all behind one
//! `tokio::sync::RwLock`: many concurrent readers, one writer, fair FIFO
//! queuing, and newly arriving readers queue behind a waiting writer so
//! search traffic cannot starve mutations.
//!
//! The outer map lock is synchronous and only guards handle insertion and
//! removal; it is never held across a suspension point.

use parking_lot::RwLock as SyncRwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::index::{build_index, VectorIndex};
use crate::schema::{Chunk, Document, Library};

/// Everything guarded by a library's reader/writer lock.
pub struct LibraryState {
    pub library: Library,
    pub documents: HashMap<String, Document>,
    pub chunks: HashMap<String, Chunk>,
    pub index: Box<dyn VectorIndex>,
}

impl LibraryState {
    /// Fresh state with an empty index of the library's declared kind.
    pub fn new(library: Library) -> Self {
        let index = build_index(library.dims, &library.index_params);
        Self {
            library,
            documents: HashMap::new(),
            chunks: HashMap::new(),
            index,
        }
    }

    /// Full id -> embedding snapshot, as `rebuild` consumes it.
    pub fn chunk_snapshot(&self) -> HashMap<String, Vec<f32>> {
        self.chunks
            .iter()
            .map(|(id, c)| (id.clone(), c.embedding.clone()))
            .collect()
    }

    /// All chunk embeddings in ascending chunk-id order. Training consumes
    /// samples in this order so results are reproducible across restarts.
    pub fn embeddings_sorted(&self) -> Vec<Vec<f32>> {
        let mut ids: Vec<&String> = self.chunks.keys().collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.chunks.get(*id).map(|c| c.embedding.clone()))
            .collect()
    }
}

/// One library plus its lock.
pub struct LibraryHandle {
    pub id: String,
    pub state: RwLock<LibraryState>,
}

impl LibraryHandle {
    pub fn new(state: LibraryState) -> Arc<Self> {
        Arc::new(Self {
            id: state.library.id.clone(),
            state: RwLock::new(state),
        })
    }
}

/// Process-wide `library_id -> handle` map.
#[derive(Default)]
pub struct LibraryStore {
    handles: SyncRwLock<HashMap<String, Arc<LibraryHandle>>>,
}

impl LibraryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<LibraryHandle>) {
        self.handles.write().insert(handle.id.clone(), handle);
    }

    pub fn get(&self, id: &str) -> Option<Arc<LibraryHandle>> {
        self.handles.read().get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<LibraryHandle>> {
        self.handles.write().remove(id)
    }

    /// Snapshot of all handles (for listing; per-library locks are taken by
    /// the caller, one at a time).
    pub fn all(&self) -> Vec<Arc<LibraryHandle>> {
        self.handles.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}
