//! Cached semantic index handles.
//!
//! An [`AnnIndex`] is the in-memory loaded form of one collection's vector
//! side, held by the daemon cache between queries. Construction follows the
//! loader contract: the vector dimension comes from `collection_meta.json`,
//! the distance space is cosine, and loading is bounded by `max_elements`.

use std::collections::HashMap;

use arroy::distances::Cosine;
use arroy::{Database as ArroyDatabase, Reader};
use heed::Env;
use tracing::debug;

use crate::error::{CidxError, Result};

use super::store::search_k_for;
use super::PointPayload;

/// Mapping from point id to payload, loaded alongside the ANN index.
pub type IdMapping = HashMap<u32, PointPayload>;

/// An opened ANN index over one collection.
pub struct AnnIndex {
    env: Env,
    vectors: ArroyDatabase<Cosine>,
    vector_dim: usize,
    rebuild_uuid: String,
    max_elements: usize,
}

impl AnnIndex {
    /// Open the index from an already-opened collection environment.
    ///
    /// Fails when the ANN forest has never been built, which also covers
    /// the freshly-created-but-empty collection case.
    pub(crate) fn load_index(
        vector_dim: usize,
        env: Env,
        vectors: ArroyDatabase<Cosine>,
        rebuild_uuid: String,
        max_elements: usize,
    ) -> Result<Self> {
        {
            let rtxn = env.read_txn()?;
            Reader::open(&rtxn, 0, vectors).map_err(|e| {
                CidxError::storage(format!("ANN index not built or unreadable: {e}"))
            })?;
        }
        debug!("loaded ANN index (dim: {vector_dim}, version: {rebuild_uuid})");
        Ok(Self {
            env,
            vectors,
            vector_dim,
            rebuild_uuid,
            max_elements,
        })
    }

    pub fn vector_dim(&self) -> usize {
        self.vector_dim
    }

    /// Rebuild stamp observed at load time; compared against the on-disk
    /// stamp to detect out-of-band rebuilds.
    pub fn rebuild_uuid(&self) -> &str {
        &self.rebuild_uuid
    }

    /// Approximate nearest-neighbour search.
    ///
    /// `ef` is the runtime accuracy knob: it scales how many candidates are
    /// explored before the top `limit` are returned. Scores are cosine
    /// similarities (`1.0 - distance`).
    pub fn search(&self, query: &[f32], limit: usize, ef: usize) -> Result<Vec<(u32, f32)>> {
        if query.len() != self.vector_dim {
            return Err(CidxError::storage(format!(
                "query dimension mismatch: expected {}, got {}",
                self.vector_dim,
                query.len()
            )));
        }

        let rtxn = self.env.read_txn()?;
        let reader = Reader::open(&rtxn, 0, self.vectors)?;

        let limit = limit.min(self.max_elements);
        let mut query_builder = reader.nns(limit);
        if let Some(search_k) = search_k_for(limit, ef) {
            query_builder.search_k(search_k);
        }

        let results = query_builder.by_vector(&rtxn, query)?;
        Ok(results
            .into_iter()
            .map(|(id, distance)| (id, 1.0 - distance))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::DiskVectorStore;
    use crate::storage::{Point, PointPayload, VectorBackend};
    use tempfile::tempdir;

    fn point(path: &str, vector: Vec<f32>) -> Point {
        Point {
            vector,
            payload: PointPayload {
                path: path.to_string(),
                content: String::new(),
                line_start: 1,
                line_end: 1,
                language: "rs".to_string(),
                indexed_at: "2025-06-01T10:00:00Z".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_load_fails_before_build() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));
        store.ensure_collection("c", 4).unwrap();
        store
            .upsert_points("c", &[point("a.rs", vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();

        assert!(store.load_ann_index("c", 1000).is_err());
        store.build_collection("c").unwrap();
        assert!(store.load_ann_index("c", 1000).is_ok());
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));
        store.ensure_collection("c", 4).unwrap();
        store
            .upsert_points(
                "c",
                &[
                    point("close.rs", vec![1.0, 0.0, 0.0, 0.0]),
                    point("far.rs", vec![0.0, 0.0, 1.0, 0.0]),
                ],
            )
            .unwrap();
        store.build_collection("c").unwrap();

        let ann = store.load_ann_index("c", 1000).unwrap();
        let mapping = store.load_id_mapping("c", 1000).unwrap();
        let hits = ann.search(&[1.0, 0.0, 0.0, 0.0], 2, 200).unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(mapping.get(&hits[0].0).unwrap().path, "close.rs");
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_query_dimension_checked() {
        let dir = tempdir().unwrap();
        let store = DiskVectorStore::new(dir.path().join("index"));
        store.ensure_collection("c", 4).unwrap();
        store
            .upsert_points("c", &[point("a.rs", vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        store.build_collection("c").unwrap();

        let ann = store.load_ann_index("c", 1000).unwrap();
        assert!(ann.search(&[1.0, 0.0], 5, 100).is_err());
    }
}
