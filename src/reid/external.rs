//! Vector-database backend speaking a JSON descriptor-set protocol.
//!
//! A request is `{"queries": [{"<Command>": {...}}, ...], "blobs": [...]}` where every
//! `AddDescriptor` and `FindDescriptor` consumes the next base64 blob in order. The reply
//! is an array with one `{"<Command>": {"status": 0, ...}}` object per query.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use uuid::Uuid;

use super::metric::SimilarityMetric;
use super::store::{Embedding, ReidStore, SimilarityMatch, encode_embedding, merge_matches};
use crate::error::{FusionError, Result};

/// Byte pipe to the database. Connection handling and authentication live behind it.
pub trait Transport: Send {
    fn open(&mut self, endpoint: &str) -> io::Result<()>;

    fn send(&mut self, request: &Value) -> io::Result<Value>;
}

pub struct ExternalStore<T: Transport> {
    transport: Mutex<T>,
    connected: AtomicBool,
    schemas: RwLock<HashMap<String, (SimilarityMetric, usize)>>,
}

impl<T: Transport> ExternalStore<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport: Mutex::new(transport),
            connected: AtomicBool::new(false),
            schemas: RwLock::new(HashMap::new()),
        }
    }

    fn query(&self, queries: Vec<Value>, blobs: Vec<String>) -> Result<Vec<Value>> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(FusionError::NotConnected);
        }
        let commands: Vec<String> = queries
            .iter()
            .filter_map(|q| q.as_object().and_then(|o| o.keys().next().cloned()))
            .collect();
        let request = json!({ "queries": queries, "blobs": blobs });
        let response = self
            .transport
            .lock()
            .send(&request)
            .map_err(|e| FusionError::Store(format!("transport failure: {e}")))?;

        let items = response
            .as_array()
            .ok_or_else(|| FusionError::Store("response is not an array".to_string()))?;
        if items.len() != commands.len() {
            return Err(FusionError::Store(format!(
                "sent {} queries, got {} responses",
                commands.len(),
                items.len()
            )));
        }
        commands
            .iter()
            .zip(items)
            .map(|(command, item)| {
                item.get(command).cloned().ok_or_else(|| {
                    FusionError::Store(format!("response has no '{command}' entry"))
                })
            })
            .collect()
    }

    /// Metric and dimensions of a set, asking the database once per set.
    fn schema(&self, set: &str) -> Result<(SimilarityMetric, usize)> {
        if let Some(schema) = self.schemas.read().get(set) {
            return Ok(*schema);
        }
        if !self.find_schema(set)? {
            return Err(FusionError::SchemaNotFound(set.to_string()));
        }
        self.schemas.read().get(set).copied().ok_or_else(|| {
            FusionError::Store(format!("set '{set}' reported without metric/dimensions"))
        })
    }
}

fn status(command: &str, body: &Value) -> Result<()> {
    match body.get("status").and_then(Value::as_i64) {
        Some(0) => Ok(()),
        _ => Err(FusionError::Store(format!("{command} failed: {body}"))),
    }
}

fn returned(body: &Value) -> u64 {
    body.get("returned").and_then(Value::as_u64).unwrap_or(0)
}

impl<T: Transport> ReidStore for ExternalStore<T> {
    fn connect(&self, endpoint: &str) -> Result<()> {
        if let Err(e) = self.transport.lock().open(endpoint) {
            tracing::warn!(endpoint, error = %e, "failed to connect to similarity store");
            self.connected.store(false, Ordering::Release);
            return Err(FusionError::NotConnected);
        }
        self.connected.store(true, Ordering::Release);
        tracing::info!(endpoint, "similarity store connection ready");
        Ok(())
    }

    fn define_schema(&self, set: &str, metric: SimilarityMetric, dimensions: usize) -> Result<()> {
        if self.find_schema(set)? {
            return match self.schemas.read().get(set) {
                Some(&(m, d)) if m != metric || d != dimensions => {
                    Err(FusionError::SchemaConflict {
                        set: set.to_string(),
                        reason: format!(
                            "defined as {m:?}/{d}, requested {metric:?}/{dimensions}"
                        ),
                    })
                }
                _ => Ok(()),
            };
        }
        let query = json!({
            "AddDescriptorSet": {
                "name": set,
                "metric": metric.protocol_name(),
                "dimensions": dimensions,
            }
        });
        let responses = self.query(vec![query], Vec::new())?;
        status("AddDescriptorSet", &responses[0])?;
        self.schemas
            .write()
            .insert(set.to_string(), (metric, dimensions));
        Ok(())
    }

    fn find_schema(&self, set: &str) -> Result<bool> {
        let query = json!({
            "FindDescriptorSet": {
                "set": set,
                "results": { "list": ["metric", "dimensions"] },
            }
        });
        let responses = self.query(vec![query], Vec::new())?;
        let body = &responses[0];
        status("FindDescriptorSet", body)?;
        if returned(body) == 0 {
            return Ok(false);
        }
        let entity = body.get("entities").and_then(|e| e.get(0));
        let metric = entity
            .and_then(|e| e.get("metric"))
            .and_then(Value::as_str)
            .and_then(SimilarityMetric::from_protocol_name);
        let dimensions = entity
            .and_then(|e| e.get("dimensions"))
            .and_then(Value::as_u64);
        if let (Some(metric), Some(dimensions)) = (metric, dimensions) {
            self.schemas
                .write()
                .insert(set.to_string(), (metric, dimensions as usize));
        }
        Ok(true)
    }

    fn add_entry(
        &self,
        identity: Uuid,
        source_track: &str,
        class: &str,
        vectors: &[Embedding],
        set: &str,
    ) -> Result<()> {
        let (_, dimensions) = self.schema(set)?;
        if let Some(v) = vectors.iter().find(|v| v.len() != dimensions) {
            return Err(FusionError::Store(format!(
                "set '{set}' holds {dimensions}-dimensional vectors, got {}",
                v.len()
            )));
        }
        if vectors.is_empty() {
            return Ok(());
        }
        let query = json!({
            "AddDescriptor": {
                "set": set,
                "properties": {
                    "uuid": identity.to_string(),
                    "rvid": source_track,
                    "type": class,
                }
            }
        });
        let queries = vec![query; vectors.len()];
        let blobs = vectors.iter().map(|v| encode_embedding(v)).collect();
        for body in self.query(queries, blobs)? {
            status("AddDescriptor", &body)?;
        }
        Ok(())
    }

    fn find_similar(
        &self,
        class: &str,
        vectors: &[Embedding],
        set: &str,
        k: usize,
    ) -> Result<Vec<SimilarityMatch>> {
        let (metric, _) = self.schema(set)?;
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let query = json!({
            "FindDescriptor": {
                "set": set,
                "constraints": { "type": ["==", class] },
                "k_neighbors": k,
                "results": { "list": ["uuid", "rvid", "_distance"], "blob": false },
            }
        });
        let queries = vec![query; vectors.len()];
        let blobs = vectors.iter().map(|v| encode_embedding(v)).collect();
        let mut matches = Vec::new();
        for body in self.query(queries, blobs)? {
            status("FindDescriptor", &body)?;
            let Some(entities) = body.get("entities").and_then(Value::as_array) else {
                continue;
            };
            for entity in entities {
                let identity = entity
                    .get("uuid")
                    .and_then(Value::as_str)
                    .and_then(|s| Uuid::parse_str(s).ok());
                let distance = entity.get("_distance").and_then(Value::as_f64);
                let (Some(identity), Some(distance)) = (identity, distance) else {
                    tracing::warn!(%entity, "skipping malformed similarity result");
                    continue;
                };
                matches.push(SimilarityMatch {
                    identity,
                    source_track: entity
                        .get("rvid")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    class: class.to_string(),
                    distance,
                    similarity: metric.similarity(distance),
                });
            }
        }
        Ok(merge_matches(matches, k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reid::{MemoryStore, decode_embedding};

    /// Answers protocol requests from an in-process store.
    struct Loopback {
        store: MemoryStore,
        fail_open: bool,
    }

    impl Loopback {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                fail_open: false,
            }
        }

        fn answer(&self, command: &str, body: &Value, blob: Option<&str>) -> Value {
            let set = body
                .get("set")
                .or_else(|| body.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            match command {
                "AddDescriptorSet" => {
                    let metric = SimilarityMetric::from_protocol_name(
                        body["metric"].as_str().unwrap_or_default(),
                    )
                    .unwrap();
                    let dims = body["dimensions"].as_u64().unwrap() as usize;
                    self.store.define_schema(set, metric, dims).unwrap();
                    json!({ "status": 0 })
                }
                "FindDescriptorSet" => {
                    if self.store.find_schema(set).unwrap() {
                        json!({ "status": 0, "returned": 1,
                                "entities": [{ "metric": "COSINE", "dimensions": 2 }] })
                    } else {
                        json!({ "status": 0, "returned": 0 })
                    }
                }
                "AddDescriptor" => {
                    let props = &body["properties"];
                    let vector = decode_embedding(blob.unwrap()).unwrap();
                    self.store
                        .add_entry(
                            Uuid::parse_str(props["uuid"].as_str().unwrap()).unwrap(),
                            props["rvid"].as_str().unwrap(),
                            props["type"].as_str().unwrap(),
                            &[vector],
                            set,
                        )
                        .unwrap();
                    json!({ "status": 0 })
                }
                "FindDescriptor" => {
                    let class = body["constraints"]["type"][1].as_str().unwrap();
                    let k = body["k_neighbors"].as_u64().unwrap() as usize;
                    let vector = decode_embedding(blob.unwrap()).unwrap();
                    let found = self.store.find_similar(class, &[vector], set, k).unwrap();
                    let entities: Vec<Value> = found
                        .iter()
                        .map(|m| {
                            json!({ "uuid": m.identity.to_string(), "rvid": m.source_track,
                                    "_distance": m.distance })
                        })
                        .collect();
                    json!({ "status": 0, "returned": entities.len(), "entities": entities })
                }
                _ => json!({ "status": -1 }),
            }
        }
    }

    impl Transport for Loopback {
        fn open(&mut self, endpoint: &str) -> io::Result<()> {
            if self.fail_open {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
            }
            self.store.connect(endpoint).map_err(io::Error::other)
        }

        fn send(&mut self, request: &Value) -> io::Result<Value> {
            let mut blobs = request["blobs"].as_array().unwrap().iter();
            let replies = request["queries"]
                .as_array()
                .unwrap()
                .iter()
                .map(|q| {
                    let (command, body) = q.as_object().unwrap().iter().next().unwrap();
                    let blob = match command.as_str() {
                        "AddDescriptor" | "FindDescriptor" => blobs.next().and_then(Value::as_str),
                        _ => None,
                    };
                    json!({ command.clone(): self.answer(command, body, blob) })
                })
                .collect();
            Ok(Value::Array(replies))
        }
    }

    #[test]
    fn test_connect_failure_is_not_connected() {
        let mut transport = Loopback::new();
        transport.fail_open = true;
        let store = ExternalStore::new(transport);
        assert!(matches!(store.connect("db:55555"), Err(FusionError::NotConnected)));
        assert!(matches!(store.find_schema("reid"), Err(FusionError::NotConnected)));
    }

    #[test]
    fn test_round_trip_through_protocol() {
        let store = ExternalStore::new(Loopback::new());
        store.connect("db:55555").unwrap();
        store
            .define_schema("reid", SimilarityMetric::Cosine, 2)
            .unwrap();
        // second definition with the same parameters is a no-op
        store
            .define_schema("reid", SimilarityMetric::Cosine, 2)
            .unwrap();
        assert!(matches!(
            store.define_schema("reid", SimilarityMetric::L2, 2),
            Err(FusionError::SchemaConflict { .. })
        ));

        assert!(store
            .find_similar("person", &[vec![1.0, 0.0]], "reid", 1)
            .unwrap()
            .is_empty());

        let id = Uuid::new_v4();
        store
            .add_entry(id, "7", "person", &[vec![1.0, 0.0], vec![0.9, 0.1]], "reid")
            .unwrap();
        let found = store
            .find_similar("person", &[vec![1.0, 0.05]], "reid", 1)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identity, id);
        assert_eq!(found[0].source_track, "7");
        assert!(found[0].similarity > 0.99);
    }

    #[test]
    fn test_unknown_set() {
        let store = ExternalStore::new(Loopback::new());
        store.connect("db").unwrap();
        assert!(matches!(
            store.find_similar("person", &[vec![1.0, 0.0]], "missing", 1),
            Err(FusionError::SchemaNotFound(_))
        ));
    }

    #[test]
    fn test_error_status_maps_to_store_error() {
        struct Broken;
        impl Transport for Broken {
            fn open(&mut self, _: &str) -> io::Result<()> {
                Ok(())
            }
            fn send(&mut self, _: &Value) -> io::Result<Value> {
                Ok(json!([{ "FindDescriptorSet": { "status": -1, "info": "boom" } }]))
            }
        }
        let store = ExternalStore::new(Broken);
        store.connect("db").unwrap();
        assert!(matches!(store.find_schema("reid"), Err(FusionError::Store(_))));
    }
}
