//! k-NN index contract and factory.
//!
//! Three interchangeable index kinds share one object-safe trait: exhaustive
//! flat scan, inverted-file clustering (IVF), and multi-table SimHash LSH.
//! All kinds rank by cosine similarity (higher is better) with ties broken by
//! ascending chunk id, and all are deterministic given the per-library seed.

pub mod flat;
pub mod ivf;
pub mod lsh;

pub use flat::FlatIndex;
pub use ivf::IvfIndex;
pub use lsh::LshIndex;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, Result};

/// Index algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    Flat,
    Ivf,
    LshSimhash,
}

impl IndexKind {
    /// Wire name as used in `index_type` request fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Flat => "flat",
            IndexKind::Ivf => "ivf",
            IndexKind::LshSimhash => "lsh_simhash",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "flat" => Ok(IndexKind::Flat),
            "ivf" => Ok(IndexKind::Ivf),
            "lsh_simhash" => Ok(IndexKind::LshSimhash),
            other => Err(EngineError::Validation(format!(
                "unknown index_type '{other}' (expected flat, ivf, or lsh_simhash)"
            ))),
        }
    }
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_n_clusters() -> usize {
    64
}
fn default_n_probes() -> usize {
    1
}
fn default_kmeans_iters() -> usize {
    20
}
fn default_n_tables() -> usize {
    8
}
fn default_n_bits() -> u32 {
    16
}
fn default_seed() -> u64 {
    42
}

/// IVF tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvfParams {
    #[serde(default = "default_n_clusters")]
    pub n_clusters: usize,
    #[serde(default = "default_n_probes")]
    pub n_probes: usize,
    #[serde(default = "default_kmeans_iters")]
    pub kmeans_iters: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            n_clusters: default_n_clusters(),
            n_probes: default_n_probes(),
            kmeans_iters: default_kmeans_iters(),
            seed: default_seed(),
        }
    }
}

/// LSH-SimHash tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LshParams {
    #[serde(default = "default_n_tables")]
    pub n_tables: usize,
    #[serde(default = "default_n_bits")]
    pub n_bits: u32,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for LshParams {
    fn default() -> Self {
        Self {
            n_tables: default_n_tables(),
            n_bits: default_n_bits(),
            seed: default_seed(),
        }
    }
}

/// Kind-specific parameter bag stored on the library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndexParams {
    Flat,
    Ivf(IvfParams),
    Lsh(LshParams),
}

impl IndexParams {
    pub fn kind(&self) -> IndexKind {
        match self {
            IndexParams::Flat => IndexKind::Flat,
            IndexParams::Ivf(_) => IndexKind::Ivf,
            IndexParams::Lsh(_) => IndexKind::LshSimhash,
        }
    }

    /// Parse the `index_type` + optional `index_params` pair of a create
    /// request into a validated parameter bag. Missing fields take defaults.
    pub fn from_request(index_type: &str, raw: Option<&serde_json::Value>) -> Result<Self> {
        let kind = IndexKind::parse(index_type)?;
        let params = match kind {
            IndexKind::Flat => IndexParams::Flat,
            IndexKind::Ivf => {
                let p = match raw {
                    Some(v) => serde_json::from_value::<IvfParams>(v.clone()).map_err(|e| {
                        EngineError::Validation(format!("invalid ivf index_params: {e}"))
                    })?,
                    None => IvfParams::default(),
                };
                IndexParams::Ivf(p)
            }
            IndexKind::LshSimhash => {
                let p = match raw {
                    Some(v) => serde_json::from_value::<LshParams>(v.clone()).map_err(|e| {
                        EngineError::Validation(format!("invalid lsh index_params: {e}"))
                    })?,
                    None => LshParams::default(),
                };
                IndexParams::Lsh(p)
            }
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            IndexParams::Flat => Ok(()),
            IndexParams::Ivf(p) => {
                if p.n_clusters < 1 {
                    return Err(EngineError::Validation("n_clusters must be >= 1".into()));
                }
                if p.n_probes < 1 || p.n_probes > p.n_clusters {
                    return Err(EngineError::Validation(format!(
                        "n_probes must be in [1, n_clusters={}]",
                        p.n_clusters
                    )));
                }
                if p.kmeans_iters < 1 {
                    return Err(EngineError::Validation("kmeans_iters must be >= 1".into()));
                }
                Ok(())
            }
            IndexParams::Lsh(p) => {
                if p.n_tables < 1 {
                    return Err(EngineError::Validation("n_tables must be >= 1".into()));
                }
                if p.n_bits < 1 || p.n_bits > 64 {
                    return Err(EngineError::Validation("n_bits must be in [1, 64]".into()));
                }
                Ok(())
            }
        }
    }
}

/// One ranked hit returned by an index search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
}

/// Kind-specific stats counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDetail {
    Flat,
    Ivf {
        n_clusters: usize,
        n_probes: usize,
        nonempty_lists: usize,
    },
    Lsh {
        n_tables: usize,
        n_bits: u32,
        occupied_buckets: usize,
    },
}

/// Snapshot of index size and configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub kind: IndexKind,
    pub size: usize,
    pub trained: bool,
    pub detail: IndexDetail,
}

/// Contract shared by all index kinds.
///
/// Vectors are L2-normalized at ingress; scores are dot products of unit
/// vectors, i.e. cosine similarity. `search` results are reproducible for a
/// fixed seed and identical inputs.
pub trait VectorIndex: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Insert or overwrite a vector. Fails on wrong dimensionality, or when
    /// the kind requires training that has not happened yet.
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()>;

    /// Remove an entry; no-op when absent.
    fn remove(&mut self, id: &str);

    /// Top-k by cosine, descending, ties by ascending id. Empty index (or an
    /// empty candidate set) yields an empty list.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    /// Train on sample vectors. Only meaningful for IVF; no-op otherwise.
    fn train(&mut self, samples: &[Vec<f32>]) -> Result<()>;

    /// Drop all state and repopulate from a full id -> vector snapshot.
    fn rebuild(&mut self, entries: &HashMap<String, Vec<f32>>) -> Result<()>;

    fn stats(&self) -> IndexStats;
}

/// Construct an index of the configured kind for `dims`-dimensional vectors.
pub fn build_index(dims: usize, params: &IndexParams) -> Box<dyn VectorIndex> {
    match params {
        IndexParams::Flat => Box::new(FlatIndex::new(dims)),
        IndexParams::Ivf(p) => Box::new(IvfIndex::new(dims, p.clone())),
        IndexParams::Lsh(p) => Box::new(LshIndex::new(dims, p.clone())),
    }
}

pub(crate) fn check_dims(expected: usize, got: usize, what: &str) -> Result<()> {
    if got != expected {
        return Err(EngineError::Validation(format!(
            "dim mismatch for {what}: expected {expected}, got {got}"
        )));
    }
    Ok(())
}

/// Sort hits by descending score, then ascending id, and keep the first `k`.
pub(crate) fn rank_top_k(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_unstable_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(k);
    hits
}
