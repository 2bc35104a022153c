//! Startup recovery: reload persisted state and rebuild every index.
//!
//! Index contents are never persisted; they are a pure function of the chunk
//! set plus the library's index parameters and seed, so recovery rebuilds
//! them deterministically. The server flips to serving only after every
//! handle is ready; requests before that are refused with UNAVAILABLE.

use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;
use crate::index::IndexKind;
use crate::metrics;
use crate::persist::StorageBackend;
use crate::store::{LibraryHandle, LibraryState, LibraryStore};

/// Load all persisted libraries, documents, and chunks, and rebuild each
/// library's index from its chunk set.
pub async fn recover(storage: &Arc<dyn StorageBackend>) -> Result<LibraryStore> {
    let timer = metrics::RECOVERY_SECONDS.start_timer();
    let mut snapshot = storage.load_all().await?;
    let store = LibraryStore::new();
    let n_libraries = snapshot.libraries.len();

    for library in snapshot.libraries.drain(..) {
        let library_id = library.id.clone();
        let persisted_trained = library.index_trained;
        let mut state = LibraryState::new(library);

        if let Some(documents) = snapshot.documents_by_library.remove(&library_id) {
            for document in documents {
                state.documents.insert(document.id.clone(), document);
            }
        }
        if let Some(chunks) = snapshot.chunks_by_library.remove(&library_id) {
            for chunk in chunks {
                state.chunks.insert(chunk.id.clone(), chunk);
            }
        }

        // For IVF, a persisted trained flag with a non-empty chunk set is
        // restored by rebuild's train-then-assign path. A trained flag with
        // zero chunks cannot be reproduced (there is no data to train on);
        // the library comes back untrained and must be trained again.
        let chunk_set = state.chunk_snapshot();
        state.index.rebuild(&chunk_set)?;
        let index_trained = state.index.stats().trained;
        if state.library.index_kind == IndexKind::Ivf && persisted_trained && !index_trained {
            warn!(
                library_id = %library_id,
                op = "recover",
                "ivf index was trained before shutdown but has no chunks to retrain on"
            );
        }
        state.library.index_trained = index_trained;

        info!(
            library_id = %library_id,
            op = "recover",
            n_documents = state.documents.len(),
            n_chunks = state.chunks.len(),
            kind = %state.library.index_kind,
            "library recovered"
        );
        store.insert(LibraryHandle::new(state));
    }

    metrics::LIBRARIES.set(store.len() as i64);
    timer.observe_duration();
    info!(n_libraries, "recovery complete");
    Ok(store)
}
