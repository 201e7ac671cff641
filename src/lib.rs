//! Self-hosted, content-addressed asset store: storage and integrity engine.
//!
//! See [`engine::Engine`] for the facade most callers want. The other
//! modules are the components it wires together, each independently
//! testable: [`hasher`] (content digests), [`container`] (the append-only
//! DAT file format), [`datset`] (container rollover within a topic),
//! [`topicdb`] (per-topic SQLite schema), [`orchestrator_index`] (the
//! global dedup index), [`pipeline`] (the single-writer upload path),
//! [`metadata`] (the append-only metadata log and its JSON projection),
//! [`discovery`] (topic health classification and index reconciliation),
//! [`verifier`] (chain replay and payload re-hashing), [`query`] (named-
//! parameter SQL fan-out across topics), and [`sanitize`] (filename and
//! extension normalisation).

pub mod config;
pub mod container;
pub mod datset;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod logging;
pub mod metadata;
pub mod orchestrator_index;
pub mod pipeline;
pub mod query;
pub mod sanitize;
pub mod topicdb;
pub mod verifier;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{SiloError, SiloResult};
