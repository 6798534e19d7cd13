//! ytcipher Server
//!
//! HTTP service that resolves obfuscated media-stream URLs. Clients name an
//! upstream JavaScript player program and submit encrypted signature
//! material; the service evaluates the player's decryption logic and
//! returns the decrypted values or a fully rebuilt playback URL.
//!
//! # Architecture
//!
//! - [`pool`] - Bounded pool of worker threads, each owning an isolated Boa
//!   context; message budgets, watchdog timeouts, crash containment, and a
//!   bounded recovery protocol.
//! - [`player_cache`] - On-disk cache of player sources with single-flight
//!   download coalescing and startup eviction.
//! - [`cache`] - In-memory LRU tiers (preprocessed scripts, solver pairs,
//!   signature timestamps), all publishing size gauges.
//! - [`orchestrator`] - Composes the caches and the pool into solver
//!   lookups.
//! - [`runtime`] - Boa plumbing: the preprocessor evaluator that runs in
//!   workers, and host-side solver invocation.
//! - [`handlers`] / [`http_server`] - The three API operations and the
//!   hyper transport around them.

pub mod cache;
pub mod config;
pub mod handlers;
pub mod http_server;
pub mod orchestrator;
pub mod player_cache;
pub mod pool;
pub mod runtime;

pub use config::Config;
pub use http_server::{AppState, HttpServer};
pub use orchestrator::{CacheSizes, SolverOrchestrator};
pub use player_cache::PlayerFileCache;
pub use pool::{PoolConfig, WorkerPool};
pub use runtime::{BoaPreprocessor, SolverSet};

/// Preprocessor bundle compiled into the binary; `PREPROCESSOR_PATH`
/// overrides it.
pub const DEFAULT_PREPROCESSOR: &str = include_str!("../assets/preprocessor.js");
