//! Multi-table SimHash LSH index.
//!
//! Each table hashes a vector to an n_bits signature via random hyperplanes;
//! a query's candidates are the union of its matching buckets across tables,
//! reranked exactly by cosine. An empty candidate set yields an empty result:
//! there is no fallback scan, recall is tuned via n_tables and n_bits.

use ahash::{AHashMap, AHashSet};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::HashMap;

use super::{
    check_dims, rank_top_k, IndexDetail, IndexKind, IndexStats, LshParams, SearchHit, VectorIndex,
};
use crate::error::Result;
use crate::vector;

struct LshEntry {
    /// Unit-norm vector
    vec: Vec<f32>,
    /// Per-table bucket signatures
    keys: Vec<u64>,
}

pub struct LshIndex {
    dims: usize,
    params: LshParams,
    /// Per table: n_bits hyperplanes of `dims` standard normals.
    hyperplanes: Vec<Vec<Vec<f32>>>,
    /// Per table: signature -> bucket of chunk ids.
    tables: Vec<AHashMap<u64, AHashSet<String>>>,
    entries: AHashMap<String, LshEntry>,
}

impl LshIndex {
    pub fn new(dims: usize, params: LshParams) -> Self {
        let hyperplanes = sample_hyperplanes(dims, &params);
        let tables = (0..params.n_tables).map(|_| AHashMap::new()).collect();
        Self {
            dims,
            params,
            hyperplanes,
            tables,
            entries: AHashMap::new(),
        }
    }

    /// Signature per table: bit i set when dot(plane_i, v) >= 0.
    fn signatures(&self, v: &[f32]) -> Vec<u64> {
        self.hyperplanes
            .iter()
            .map(|planes| {
                let mut key = 0u64;
                for (i, plane) in planes.iter().enumerate() {
                    if vector::dot(plane, v) >= 0.0 {
                        key |= 1u64 << i;
                    }
                }
                key
            })
            .collect()
    }

    fn add_to_buckets(&mut self, id: &str, keys: &[u64]) {
        for (t, key) in keys.iter().enumerate() {
            self.tables[t]
                .entry(*key)
                .or_default()
                .insert(id.to_string());
        }
    }

    fn remove_from_buckets(&mut self, id: &str, keys: &[u64]) {
        for (t, key) in keys.iter().enumerate() {
            if let Some(bucket) = self.tables[t].get_mut(key) {
                bucket.remove(id);
                if bucket.is_empty() {
                    self.tables[t].remove(key);
                }
            }
        }
    }
}

/// Hyperplane matrices derived deterministically from the seed and the table
/// index; immutable after construction.
fn sample_hyperplanes(dims: usize, params: &LshParams) -> Vec<Vec<Vec<f32>>> {
    (0..params.n_tables)
        .map(|t| {
            let mut rng = ChaCha8Rng::seed_from_u64(params.seed.wrapping_add(t as u64));
            (0..params.n_bits)
                .map(|_| {
                    (0..dims)
                        .map(|_| StandardNormal.sample(&mut rng))
                        .collect()
                })
                .collect()
        })
        .collect()
}

impl VectorIndex for LshIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::LshSimhash
    }

    fn add(&mut self, id: &str, vector_in: &[f32]) -> Result<()> {
        check_dims(self.dims, vector_in.len(), id)?;
        // Overwrite: previous signatures are on the stored entry.
        if let Some(old) = self.entries.remove(id) {
            let keys = old.keys;
            self.remove_from_buckets(id, &keys);
        }
        let v = vector::normalize(vector_in);
        let keys = self.signatures(&v);
        self.add_to_buckets(id, &keys);
        self.entries.insert(id.to_string(), LshEntry { vec: v, keys });
        Ok(())
    }

    fn remove(&mut self, id: &str) {
        if let Some(entry) = self.entries.remove(id) {
            let keys = entry.keys;
            self.remove_from_buckets(id, &keys);
        }
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_dims(self.dims, query.len(), "query")?;
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        let q = vector::normalize(query);
        let qkeys = self.signatures(&q);

        let mut candidates: AHashSet<&String> = AHashSet::new();
        for (t, key) in qkeys.iter().enumerate() {
            if let Some(bucket) = self.tables[t].get(key) {
                candidates.extend(bucket.iter());
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let hits = candidates
            .into_iter()
            .filter_map(|id| {
                self.entries.get(id).map(|entry| SearchHit {
                    id: id.clone(),
                    score: vector::dot(&q, &entry.vec),
                })
            })
            .collect();
        Ok(rank_top_k(hits, k))
    }

    fn train(&mut self, _samples: &[Vec<f32>]) -> Result<()> {
        // No training phase beyond hyperplane sampling at construction.
        Ok(())
    }

    fn rebuild(&mut self, entries: &HashMap<String, Vec<f32>>) -> Result<()> {
        self.hyperplanes = sample_hyperplanes(self.dims, &self.params);
        self.tables = (0..self.params.n_tables).map(|_| AHashMap::new()).collect();
        self.entries.clear();
        for (id, v) in entries {
            self.add(id, v)?;
        }
        Ok(())
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            kind: IndexKind::LshSimhash,
            size: self.entries.len(),
            trained: true,
            detail: IndexDetail::Lsh {
                n_tables: self.params.n_tables,
                n_bits: self.params.n_bits,
                occupied_buckets: self.tables.iter().map(|t| t.len()).sum(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FlatIndex;
    use rand::Rng;

    fn params(n_tables: usize, n_bits: u32, seed: u64) -> LshParams {
        LshParams {
            n_tables,
            n_bits,
            seed,
        }
    }

    fn random_unit_vectors(n: usize, dims: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let v: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
                vector::normalize(&v)
            })
            .collect()
    }

    #[test]
    fn self_query_ranks_first() {
        let dims = 16;
        let vectors = random_unit_vectors(100, dims, 0);
        let mut idx = LshIndex::new(dims, params(4, 8, 0));
        for (i, v) in vectors.iter().enumerate() {
            idx.add(&format!("c{i:03}"), v).unwrap();
        }
        for probe in [0usize, 17, 42, 99] {
            let hits = idx.search(&vectors[probe], 5).unwrap();
            assert_eq!(hits[0].id, format!("c{probe:03}"));
            assert!(hits[0].score > 0.999);
        }
    }

    #[test]
    fn recall_at_10_exceeds_threshold() {
        let dims = 32;
        let vectors = random_unit_vectors(500, dims, 7);
        let mut lsh = LshIndex::new(dims, params(8, 16, 7));
        let mut flat = FlatIndex::new(dims);
        for (i, v) in vectors.iter().enumerate() {
            let id = format!("c{i:03}");
            lsh.add(&id, v).unwrap();
            flat.add(&id, v).unwrap();
        }

        let queries = random_unit_vectors(50, dims, 1234);
        let mut found = 0usize;
        let mut expected = 0usize;
        for q in &queries {
            let truth: AHashSet<String> = flat
                .search(q, 10)
                .unwrap()
                .into_iter()
                .map(|h| h.id)
                .collect();
            let got = lsh.search(q, 10).unwrap();
            expected += truth.len();
            found += got.iter().filter(|h| truth.contains(&h.id)).count();
        }
        let recall = found as f64 / expected as f64;
        assert!(recall >= 0.8, "recall@10 too low: {recall}");
    }

    #[test]
    fn signatures_deterministic_for_seed() {
        let dims = 8;
        let a = LshIndex::new(dims, params(3, 12, 5));
        let b = LshIndex::new(dims, params(3, 12, 5));
        let v = random_unit_vectors(1, dims, 2).remove(0);
        assert_eq!(a.signatures(&v), b.signatures(&v));

        let c = LshIndex::new(dims, params(3, 12, 6));
        assert_ne!(a.signatures(&v), c.signatures(&v));
    }

    #[test]
    fn overwrite_relocates_buckets() {
        let dims = 8;
        let vs = random_unit_vectors(2, dims, 3);
        let mut idx = LshIndex::new(dims, params(4, 10, 1));
        idx.add("x", &vs[0]).unwrap();
        idx.add("x", &vs[1]).unwrap();
        assert_eq!(idx.stats().size, 1);
        // only the new vector's buckets contain x
        let hits = idx.search(&vs[1], 1).unwrap();
        assert_eq!(hits[0].id, "x");
        assert!(hits[0].score > 0.999);
    }

    #[test]
    fn remove_clears_buckets() {
        let dims = 8;
        let vs = random_unit_vectors(1, dims, 4);
        let mut idx = LshIndex::new(dims, params(2, 6, 9));
        idx.add("x", &vs[0]).unwrap();
        idx.remove("x");
        assert_eq!(idx.stats().size, 0);
        assert!(idx.search(&vs[0], 1).unwrap().is_empty());
        match idx.stats().detail {
            IndexDetail::Lsh {
                occupied_buckets, ..
            } => assert_eq!(occupied_buckets, 0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn rebuild_rehashes_everything() {
        let dims = 8;
        let vectors = random_unit_vectors(30, dims, 6);
        let mut idx = LshIndex::new(dims, params(4, 8, 2));
        let mut entries = HashMap::new();
        for (i, v) in vectors.iter().enumerate() {
            let id = format!("c{i:02}");
            idx.add(&id, v).unwrap();
            entries.insert(id, v.clone());
        }
        idx.rebuild(&entries).unwrap();
        let first = idx.search(&vectors[3], 5).unwrap();
        idx.rebuild(&entries).unwrap();
        let second = idx.search(&vectors[3], 5).unwrap();
        assert_eq!(first, second);
        assert_eq!(idx.stats().size, 30);
    }
}
