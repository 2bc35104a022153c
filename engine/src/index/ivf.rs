//! Inverted-file (IVF) cluster index.
//!
//! K-means centroids partition the vector set into posting lists; a query
//! scores every centroid, probes the best `n_probes` lists, and reranks the
//! candidates exactly. Must be trained before mutations are accepted.
//!
//! Clustering distance is cosine: vectors are unit-normalized at ingress and
//! all comparisons are dot products.

use ahash::AHashMap;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

use super::{
    check_dims, rank_top_k, IndexDetail, IndexKind, IndexStats, IvfParams, SearchHit, VectorIndex,
};
use crate::error::{EngineError, Result};
use crate::vector;

/// Lloyd iterations stop when no centroid moved farther than this (L2).
const CONVERGENCE_EPS: f32 = 1e-4;

pub struct IvfIndex {
    dims: usize,
    params: IvfParams,
    /// Unit-norm centroids; empty until trained.
    centroids: Vec<Vec<f32>>,
    /// Posting lists: cluster index -> member chunk ids.
    lists: Vec<Vec<String>>,
    /// Raw id -> unit-norm vector map, kept for rebuild and update.
    vecs: AHashMap<String, Vec<f32>>,
    /// id -> cluster index, for O(1) removal.
    assignment: AHashMap<String, usize>,
    trained: bool,
}

impl IvfIndex {
    pub fn new(dims: usize, params: IvfParams) -> Self {
        Self {
            dims,
            params,
            centroids: Vec::new(),
            lists: Vec::new(),
            vecs: AHashMap::new(),
            assignment: AHashMap::new(),
            trained: false,
        }
    }

    /// Nearest centroid by dot product; ties resolve to the lowest index.
    fn nearest_centroid(&self, v: &[f32]) -> usize {
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (i, c) in self.centroids.iter().enumerate() {
            let s = vector::dot(c, v);
            if s > best_score {
                best_score = s;
                best = i;
            }
        }
        best
    }

    fn assign(&mut self, id: String, v: &[f32]) {
        let cluster = self.nearest_centroid(v);
        self.lists[cluster].push(id.clone());
        self.assignment.insert(id, cluster);
    }

    fn unassign(&mut self, id: &str) {
        if let Some(cluster) = self.assignment.remove(id) {
            self.lists[cluster].retain(|member| member != id);
        }
    }

    /// Rebuild every posting list by assigning the raw map against the
    /// current centroids.
    fn reassign_all(&mut self) {
        self.lists = vec![Vec::new(); self.centroids.len()];
        self.assignment.clear();
        let entries: Vec<(String, Vec<f32>)> = self
            .vecs
            .iter()
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect();
        for (id, v) in entries {
            self.assign(id, &v);
        }
    }

    /// Stored vectors in ascending id order, the sample order training uses
    /// so centroids are reproducible across restarts.
    fn stored_sorted(&self) -> Vec<Vec<f32>> {
        let mut ids: Vec<&String> = self.vecs.keys().collect();
        ids.sort();
        ids.iter()
            .filter_map(|id| self.vecs.get(*id).cloned())
            .collect()
    }

    /// Train on already-normalized samples without the sample-count
    /// precondition; the cluster count is capped at the sample count.
    fn train_on(&mut self, normalized: &[Vec<f32>]) {
        self.centroids = self.kmeans(normalized);
        self.trained = true;
        self.reassign_all();
    }

    /// Cosine k-means: k-means++ seeding then Lloyd iterations over unit-norm
    /// samples. Returns unit-norm centroids. Deterministic for a fixed seed
    /// and sample order.
    fn kmeans(&self, samples: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let n = samples.len();
        let k = self.params.n_clusters.min(n);
        let mut rng = ChaCha8Rng::seed_from_u64(self.params.seed);

        // k-means++ seeding: D^2 weighting with cosine distance 1 - dot.
        let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);
        centroids.push(samples[rng.gen_range(0..n)].clone());
        let mut dist: Vec<f32> = samples
            .iter()
            .map(|v| (1.0 - vector::dot(v, &centroids[0])).max(0.0))
            .collect();
        while centroids.len() < k {
            let total: f64 = dist.iter().map(|d| (*d as f64) * (*d as f64)).sum();
            let next = if total > 0.0 {
                let mut r = rng.gen::<f64>() * total;
                let mut chosen = n - 1;
                for (i, d) in dist.iter().enumerate() {
                    r -= (*d as f64) * (*d as f64);
                    if r <= 0.0 {
                        chosen = i;
                        break;
                    }
                }
                chosen
            } else {
                // all points coincide with a centroid; any pick works
                rng.gen_range(0..n)
            };
            let c = samples[next].clone();
            for (i, v) in samples.iter().enumerate() {
                let d = (1.0 - vector::dot(v, &c)).max(0.0);
                if d < dist[i] {
                    dist[i] = d;
                }
            }
            centroids.push(c);
        }

        // Lloyd iterations.
        for _ in 0..self.params.kmeans_iters {
            let mut labels = vec![0usize; n];
            for (i, v) in samples.iter().enumerate() {
                let mut best = 0;
                let mut best_score = f32::NEG_INFINITY;
                for (j, c) in centroids.iter().enumerate() {
                    let s = vector::dot(v, c);
                    if s > best_score {
                        best_score = s;
                        best = j;
                    }
                }
                labels[i] = best;
            }

            let mut sums = vec![vec![0.0f32; self.dims]; k];
            let mut counts = vec![0usize; k];
            for (i, v) in samples.iter().enumerate() {
                let label = labels[i];
                counts[label] += 1;
                for (d, x) in v.iter().enumerate() {
                    sums[label][d] += x;
                }
            }

            let mut next: Vec<Vec<f32>> = Vec::with_capacity(k);
            for (j, sum) in sums.iter().enumerate() {
                if counts[j] > 0 {
                    next.push(vector::normalize(sum));
                } else {
                    next.push(Vec::new()); // reseeded below
                }
            }

            // Re-seed empty clusters from the farthest members of the
            // largest cluster.
            let empties: Vec<usize> = (0..k).filter(|j| counts[*j] == 0).collect();
            if !empties.is_empty() {
                let largest = (0..k)
                    .max_by_key(|j| counts[*j])
                    .unwrap_or(0);
                let mut members: Vec<usize> = (0..n).filter(|i| labels[*i] == largest).collect();
                // ascending similarity to their centroid = farthest first
                members.sort_by(|a, b| {
                    let sa = vector::dot(&samples[*a], &next[largest]);
                    let sb = vector::dot(&samples[*b], &next[largest]);
                    sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
                });
                for (slot, empty) in empties.iter().enumerate() {
                    let pick = members.get(slot).copied().unwrap_or(0);
                    next[*empty] = samples[pick].clone();
                }
            }

            let shift = centroids
                .iter()
                .zip(next.iter())
                .map(|(old, new)| vector::l2_sq(old, new).sqrt())
                .fold(0.0f32, f32::max);
            centroids = next;
            if shift < CONVERGENCE_EPS {
                break;
            }
        }

        centroids
    }
}

impl VectorIndex for IvfIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Ivf
    }

    fn add(&mut self, id: &str, vector_in: &[f32]) -> Result<()> {
        check_dims(self.dims, vector_in.len(), id)?;
        if !self.trained {
            return Err(EngineError::State(
                "ivf index is not trained; call train before inserting".into(),
            ));
        }
        let v = vector::normalize(vector_in);
        if self.vecs.contains_key(id) {
            self.unassign(id);
        }
        self.vecs.insert(id.to_string(), v.clone());
        self.assign(id.to_string(), &v);
        Ok(())
    }

    fn remove(&mut self, id: &str) {
        self.vecs.remove(id);
        self.unassign(id);
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        check_dims(self.dims, query.len(), "query")?;
        if k == 0 || !self.trained || self.vecs.is_empty() {
            return Ok(Vec::new());
        }
        let q = vector::normalize(query);

        // Rank centroids, probe the best n_probes lists.
        let mut centroid_scores: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, vector::dot(c, &q)))
            .collect();
        centroid_scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        let n_probes = self.params.n_probes.min(self.centroids.len());

        let mut hits = Vec::new();
        for (cluster, _) in centroid_scores.into_iter().take(n_probes) {
            for id in &self.lists[cluster] {
                if let Some(v) = self.vecs.get(id) {
                    hits.push(SearchHit {
                        id: id.clone(),
                        score: vector::dot(&q, v),
                    });
                }
            }
        }
        Ok(rank_top_k(hits, k))
    }

    fn train(&mut self, samples: &[Vec<f32>]) -> Result<()> {
        let normalized: Vec<Vec<f32>> = if samples.is_empty() {
            // fall back to the currently stored vectors (already unit-norm)
            self.stored_sorted()
        } else {
            for (i, s) in samples.iter().enumerate() {
                check_dims(self.dims, s.len(), &format!("sample {i}"))?;
            }
            samples.iter().map(|s| vector::normalize(s)).collect()
        };

        if normalized.len() < self.params.n_clusters {
            return Err(EngineError::State(format!(
                "insufficient data to train: {} samples < {} clusters",
                normalized.len(),
                self.params.n_clusters
            )));
        }

        self.train_on(&normalized);
        Ok(())
    }

    fn rebuild(&mut self, entries: &HashMap<String, Vec<f32>>) -> Result<()> {
        for (id, v) in entries {
            check_dims(self.dims, v.len(), id)?;
        }
        self.vecs = entries
            .iter()
            .map(|(id, v)| (id.clone(), vector::normalize(v)))
            .collect();
        if self.trained {
            self.reassign_all();
        } else if !self.vecs.is_empty() {
            // Restoring from a snapshot: retrain from the stored vectors,
            // capping the cluster count at the population size.
            let samples = self.stored_sorted();
            self.train_on(&samples);
        } else {
            self.lists.clear();
            self.assignment.clear();
        }
        Ok(())
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            kind: IndexKind::Ivf,
            size: self.vecs.len(),
            trained: self.trained,
            detail: IndexDetail::Ivf {
                n_clusters: self.params.n_clusters,
                n_probes: self.params.n_probes,
                nonempty_lists: self.lists.iter().filter(|l| !l.is_empty()).count(),
            },
        }
    }
}
