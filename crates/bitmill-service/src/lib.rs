//! The bitmill image loading engine.
//!
//! Requests for a model (a file, some bytes, a URL handled by an embedder-provided loader)
//! go through the [`Engine`](engine::Engine), which serves them from the tiered caches or
//! coalesces them into a single in-flight [`EngineJob`](engine::EngineJob). Each job runs one
//! [`DecodeJob`](decode::DecodeJob) on the prioritized [`executor`] pools.
//!
//! See the [`caching`] module for an overview of the cache layers.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod decode;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod registry;
pub mod resource;
pub mod types;
pub mod utils;
