//! Re-identification similarity store.
//!
//! [`ReidStore`] is the capability set every backend provides. [`MemoryStore`] is an
//! in-process brute-force index, [`ExternalStore`] talks to a vector database through a
//! caller-supplied [`Transport`]. The fusion engine never calls a store directly; it goes
//! through [`ReidGate`], which bounds query latency.

mod external;
mod gate;
mod memory;
mod metric;
mod store;

pub use external::{ExternalStore, Transport};
pub use gate::ReidGate;
pub use memory::MemoryStore;
pub use metric::SimilarityMetric;
pub use store::{
    Embedding, ReidStore, SimilarityMatch, decode_embedding, encode_embedding, merge_matches,
};
