//! End-to-end scenarios at the service level: one library per scenario,
//! literal vectors, dims = 4.

use std::collections::HashMap;
use std::sync::Arc;

use shelfdb_engine::{MemoryStorage, NewChunk, VectorDbService};

fn svc() -> VectorDbService {
    VectorDbService::new(Arc::new(MemoryStorage::new()))
}

fn chunk(doc_id: &str, text: &str, embedding: Vec<f32>) -> NewChunk {
    NewChunk {
        document_id: doc_id.to_string(),
        text: text.to_string(),
        embedding,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn flat_returns_exact_neighbors_in_order() {
    let svc = svc();
    let lib = svc
        .create_library("s1".into(), 4, "flat", None, HashMap::new())
        .await
        .unwrap();
    let doc = svc
        .create_document(&lib.id, "doc".into(), HashMap::new())
        .await
        .unwrap();

    let a = svc
        .create_chunk(&lib.id, chunk(&doc.id, "A", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();
    let _b = svc
        .create_chunk(&lib.id, chunk(&doc.id, "B", vec![0.0, 1.0, 0.0, 0.0]))
        .await
        .unwrap();
    let c = svc
        .create_chunk(&lib.id, chunk(&doc.id, "C", vec![0.9, 0.1, 0.0, 0.0]))
        .await
        .unwrap();

    let hits = svc
        .search(&lib.id, &[1.0, 0.0, 0.0, 0.0], 2, false)
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk_id, a.id);
    assert_eq!(hits[1].chunk_id, c.id);
    assert!(hits[0].score >= hits[1].score);
}

#[tokio::test]
async fn ivf_requires_training_then_matches_expected_set() {
    let svc = svc();
    let params = serde_json::json!({ "n_clusters": 2, "n_probes": 1, "seed": 0 });
    let lib = svc
        .create_library("s2".into(), 4, "ivf", Some(&params), HashMap::new())
        .await
        .unwrap();
    let doc = svc
        .create_document(&lib.id, "doc".into(), HashMap::new())
        .await
        .unwrap();

    // inserting before train fails with the state kind
    let err = svc
        .create_chunk(&lib.id, chunk(&doc.id, "A", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "state");

    svc.train_index(
        &lib.id,
        Some(vec![
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.9, 0.1, 0.0, 0.0],
        ]),
    )
    .await
    .unwrap();

    let a = svc
        .create_chunk(&lib.id, chunk(&doc.id, "A", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();
    let _b = svc
        .create_chunk(&lib.id, chunk(&doc.id, "B", vec![0.0, 1.0, 0.0, 0.0]))
        .await
        .unwrap();
    let c = svc
        .create_chunk(&lib.id, chunk(&doc.id, "C", vec![0.9, 0.1, 0.0, 0.0]))
        .await
        .unwrap();

    let hits = svc
        .search(&lib.id, &[1.0, 0.0, 0.0, 0.0], 2, false)
        .await
        .unwrap();
    let mut got: Vec<String> = hits.into_iter().map(|h| h.chunk_id).collect();
    let mut expected = vec![a.id, c.id];
    got.sort();
    expected.sort();
    assert_eq!(got, expected);
}

#[tokio::test]
async fn lsh_self_query_ranks_first() {
    use rand::{Rng, SeedableRng};

    let svc = svc();
    let params = serde_json::json!({ "n_tables": 4, "n_bits": 8, "seed": 0 });
    let lib = svc
        .create_library("s3".into(), 4, "lsh_simhash", Some(&params), HashMap::new())
        .await
        .unwrap();
    let doc = svc
        .create_document(&lib.id, "doc".into(), HashMap::new())
        .await
        .unwrap();

    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
    let mut ids = Vec::new();
    let mut vectors = Vec::new();
    for i in 0..100 {
        let raw: Vec<f32> = (0..4).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        let n: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let unit: Vec<f32> = raw.iter().map(|x| x / n).collect();
        let created = svc
            .create_chunk(&lib.id, chunk(&doc.id, &format!("v{i}"), unit.clone()))
            .await
            .unwrap();
        ids.push(created.id);
        vectors.push(unit);
    }

    for probe in [0usize, 31, 64, 99] {
        let hits = svc.search(&lib.id, &vectors[probe], 5, false).await.unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].chunk_id, ids[probe]);
        assert!(hits[0].score > 0.999);
    }
}

#[tokio::test]
async fn document_delete_cascades_out_of_index() {
    let svc = svc();
    let lib = svc
        .create_library("s6".into(), 4, "flat", None, HashMap::new())
        .await
        .unwrap();
    let doomed = svc
        .create_document(&lib.id, "doomed".into(), HashMap::new())
        .await
        .unwrap();
    let kept = svc
        .create_document(&lib.id, "kept".into(), HashMap::new())
        .await
        .unwrap();

    for i in 0..3 {
        let mut v = vec![0.0; 4];
        v[i] = 1.0;
        svc.create_chunk(&lib.id, chunk(&doomed.id, &format!("d{i}"), v))
            .await
            .unwrap();
    }
    let survivor = svc
        .create_chunk(&lib.id, chunk(&kept.id, "k", vec![0.5, 0.5, 0.5, 0.5]))
        .await
        .unwrap();

    svc.delete_document(&lib.id, &doomed.id).await.unwrap();

    let chunks = svc.list_chunks(&lib.id).await.unwrap();
    assert!(chunks.iter().all(|c| c.document_id != doomed.id));
    assert_eq!(chunks.len(), 1);

    // the index no longer surfaces the cascaded ids
    let hits = svc
        .search(&lib.id, &[1.0, 0.0, 0.0, 0.0], 10, false)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, survivor.id);
}

#[tokio::test]
async fn create_then_delete_chunk_restores_pre_state() {
    let svc = svc();
    let lib = svc
        .create_library("roundtrip".into(), 4, "flat", None, HashMap::new())
        .await
        .unwrap();
    let doc = svc
        .create_document(&lib.id, "doc".into(), HashMap::new())
        .await
        .unwrap();
    let base = svc
        .create_chunk(&lib.id, chunk(&doc.id, "base", vec![1.0, 0.0, 0.0, 0.0]))
        .await
        .unwrap();
    let before = svc.stats(&lib.id).await.unwrap();

    let temp = svc
        .create_chunk(&lib.id, chunk(&doc.id, "temp", vec![0.0, 1.0, 0.0, 0.0]))
        .await
        .unwrap();
    svc.delete_chunk(&lib.id, &temp.id).await.unwrap();

    let after = svc.stats(&lib.id).await.unwrap();
    assert_eq!(before.n_chunks, after.n_chunks);
    assert_eq!(before.index.size, after.index.size);
    let hits = svc
        .search(&lib.id, &[0.0, 1.0, 0.0, 0.0], 10, false)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk_id, base.id);
}
