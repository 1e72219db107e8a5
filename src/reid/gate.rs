//! Latency guard between the fusion engine and a similarity store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use uuid::Uuid;

use super::store::{Embedding, ReidStore, SimilarityMatch};
use crate::config::FusionConfig;
use crate::error::{FusionError, Result};

/// Query durations kept for the rolling average.
const QUERY_WINDOW: usize = 10;

enum Request {
    Find {
        class: String,
        vectors: Vec<Embedding>,
        k: usize,
        reply: Sender<Result<Vec<SimilarityMatch>>>,
    },
    Add {
        identity: Uuid,
        source_track: String,
        class: String,
        vectors: Vec<Embedding>,
    },
}

/// Runs store calls on a dedicated worker so a slow backend can only cost a cycle the
/// configured timeout. Writes are queued in order, which keeps each identity's history
/// append-only and ordered.
///
/// Once the rolling average query time exceeds the configured maximum, re-identification
/// is switched off until [`ReidGate::reset`].
///
/// Dropping the gate waits at most one query timeout for the worker. A worker still stuck
/// in the store after that is detached and finishes on its own.
pub struct ReidGate {
    requests: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
    /// Disconnects when the worker exits.
    finished: Receiver<()>,
    timeout: Duration,
    max_average: Duration,
    k: usize,
    durations: VecDeque<Duration>,
    disabled: bool,
}

impl ReidGate {
    /// Prepare the configured vector set and start the worker. The store must already be
    /// connected.
    pub fn start(store: Arc<dyn ReidStore>, config: &FusionConfig) -> Result<Self> {
        store.define_schema(
            &config.reid_set_name,
            config.reid_metric,
            config.reid_dimensions,
        )?;
        let (tx, rx) = unbounded();
        let (done, finished) = bounded::<()>(0);
        let set = config.reid_set_name.clone();
        let worker = thread::Builder::new()
            .name("reid-store".to_string())
            .spawn(move || {
                let _done = done;
                run_worker(store, set, rx);
            })?;
        Ok(Self {
            requests: Some(tx),
            worker: Some(worker),
            finished,
            timeout: config.reid_query_timeout(),
            max_average: config.reid_max_average_query(),
            k: config.reid_k_neighbors,
            durations: VecDeque::with_capacity(QUERY_WINDOW),
            disabled: false,
        })
    }

    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }

    pub fn average_query_time(&self) -> Option<Duration> {
        if self.durations.is_empty() {
            return None;
        }
        Some(self.durations.iter().sum::<Duration>() / self.durations.len() as u32)
    }

    /// Re-enable after a slowdown and forget the recorded durations.
    pub fn reset(&mut self) {
        self.durations.clear();
        self.disabled = false;
    }

    /// Nearest identities for `vectors`, bounded by the query timeout.
    pub fn find_similar(
        &mut self,
        class: &str,
        vectors: &[Embedding],
    ) -> Result<Vec<SimilarityMatch>> {
        if self.disabled {
            return Err(FusionError::Store(
                "re-identification disabled after slow queries".to_string(),
            ));
        }
        let (reply, answer) = bounded(1);
        self.send(Request::Find {
            class: class.to_string(),
            vectors: vectors.to_vec(),
            k: self.k,
            reply,
        })?;

        let started = Instant::now();
        let outcome = match answer.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(_) => Err(FusionError::StoreTimeout(self.timeout)),
        };
        self.record(started.elapsed());
        outcome
    }

    /// Queue embeddings for an identity.
    pub fn add_entry(
        &self,
        identity: Uuid,
        source_track: &str,
        class: &str,
        vectors: Vec<Embedding>,
    ) -> Result<()> {
        if vectors.is_empty() {
            return Ok(());
        }
        self.send(Request::Add {
            identity,
            source_track: source_track.to_string(),
            class: class.to_string(),
            vectors,
        })
    }

    fn send(&self, request: Request) -> Result<()> {
        self.requests
            .as_ref()
            .and_then(|tx| tx.send(request).ok())
            .ok_or_else(|| FusionError::Store("re-identification worker stopped".to_string()))
    }

    fn record(&mut self, elapsed: Duration) {
        if self.durations.len() == QUERY_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(elapsed);
        if self.durations.len() == QUERY_WINDOW {
            if let Some(average) = self.average_query_time() {
                if average > self.max_average {
                    tracing::warn!(
                        average_ms = average.as_millis() as u64,
                        max_ms = self.max_average.as_millis() as u64,
                        "re-identification disabled, similarity queries too slow"
                    );
                    self.disabled = true;
                }
            }
        }
    }
}

impl Drop for ReidGate {
    fn drop(&mut self) {
        self.requests.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        match self.finished.recv_timeout(self.timeout) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "similarity store still busy, detaching re-identification worker"
                );
            }
            _ => {
                let _ = worker.join();
            }
        }
    }
}

fn run_worker(store: Arc<dyn ReidStore>, set: String, requests: Receiver<Request>) {
    for request in requests {
        match request {
            Request::Find {
                class,
                vectors,
                k,
                reply,
            } => {
                let result = store.find_similar(&class, &vectors, &set, k);
                // the caller may have given up already
                let _ = reply.send(result);
            }
            Request::Add {
                identity,
                source_track,
                class,
                vectors,
            } => {
                if let Err(e) = store.add_entry(identity, &source_track, &class, &vectors, &set) {
                    tracing::warn!(%identity, error = %e, "failed to store embeddings");
                }
            }
        }
    }
}
