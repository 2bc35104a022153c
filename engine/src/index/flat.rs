//! Exact brute-force k-NN index.
//!
//! Stores unit-normalized vectors in an id-keyed map and scans all of them
//! per query. Theta(n*d) per search; the reference answer the approximate
//! kinds are measured against.

use ahash::AHashMap;
use std::collections::HashMap;

use super::{check_dims, rank_top_k, IndexDetail, IndexKind, IndexStats, SearchHit, VectorIndex};
use crate::error::Result;
use crate::vector;

pub struct FlatIndex {
    dims: usize,
    vecs: AHashMap<String, Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vecs: AHashMap::new(),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()> {
        check_dims(self.dims, vector.len(), id)?;
        self.vecs.insert(id.to_string(), vector::normalize(vector));
        Ok(())
    }

    fn remove(&mut self, id: &str) {
        self.vecs.remove(id);
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_dims(self.dims, query.len(), "query")?;
        if k == 0 || self.vecs.is_empty() {
            return Ok(Vec::new());
        }
        let q = vector::normalize(query);
        let hits = self
            .vecs
            .iter()
            .map(|(id, v)| SearchHit {
                id: id.clone(),
                score: vector::dot(&q, v),
            })
            .collect();
        Ok(rank_top_k(hits, k))
    }

    fn train(&mut self, _samples: &[Vec<f32>]) -> Result<()> {
        // No training phase.
        Ok(())
    }

    fn rebuild(&mut self, entries: &HashMap<String, Vec<f32>>) -> Result<()> {
        self.vecs.clear();
        for (id, v) in entries {
            self.add(id, v)?;
        }
        Ok(())
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            kind: IndexKind::Flat,
            size: self.vecs.len(),
            trained: false,
            detail: IndexDetail::Flat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn index_with(entries: &[(&str, &[f32])]) -> FlatIndex {
        let dims = entries[0].1.len();
        let mut idx = FlatIndex::new(dims);
        for (id, v) in entries {
            idx.add(id, v).unwrap();
        }
        idx
    }

    #[test]
    fn exact_top_k_ordering() {
        let idx = index_with(&[
            ("a", &[1.0, 0.0, 0.0, 0.0]),
            ("b", &[0.0, 1.0, 0.0, 0.0]),
            ("c", &[0.9, 0.1, 0.0, 0.0]),
        ]);
        let hits = idx.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
        assert_relative_eq!(hits[0].score, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn matches_brute_force_reference() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(11);
        let dims = 16;
        let mut idx = FlatIndex::new(dims);
        let mut raw: Vec<(String, Vec<f32>)> = Vec::new();
        for i in 0..200 {
            let v: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let id = format!("c{i:03}");
            idx.add(&id, &v).unwrap();
            raw.push((id, v));
        }
        let q: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();

        // independent reference: full cosine scan + sort
        let mut expect: Vec<(String, f32)> = raw
            .iter()
            .map(|(id, v)| (id.clone(), crate::vector::cosine(&q, v)))
            .collect();
        expect.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));

        let hits = idx.search(&q, 10).unwrap();
        for (hit, (id, score)) in hits.iter().zip(expect.iter()) {
            assert_eq!(&hit.id, id);
            assert_relative_eq!(hit.score, *score, epsilon = 1e-4);
        }
    }

    #[test]
    fn empty_index_returns_empty() {
        let idx = FlatIndex::new(4);
        assert!(idx.search(&[1.0, 0.0, 0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn duplicate_add_overwrites() {
        let mut idx = FlatIndex::new(2);
        idx.add("a", &[1.0, 0.0]).unwrap();
        idx.add("a", &[0.0, 1.0]).unwrap();
        let hits = idx.search(&[0.0, 1.0], 1).unwrap();
        assert_eq!(hits[0].id, "a");
        assert_relative_eq!(hits[0].score, 1.0, epsilon = 1e-6);
        assert_eq!(idx.stats().size, 1);
    }

    #[test]
    fn dim_mismatch_rejected() {
        let mut idx = FlatIndex::new(3);
        assert!(idx.add("a", &[1.0, 0.0]).is_err());
        assert!(idx.search(&[1.0, 0.0], 1).is_err());
    }

    #[test]
    fn remove_is_noop_when_absent() {
        let mut idx = FlatIndex::new(2);
        idx.remove("ghost");
        idx.add("a", &[1.0, 0.0]).unwrap();
        idx.remove("a");
        assert_eq!(idx.stats().size, 0);
    }

    #[test]
    fn results_never_exceed_population() {
        let idx = index_with(&[("a", &[1.0, 0.0]), ("b", &[0.5, 0.5])]);
        let hits = idx.search(&[1.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 2);
    }
}
