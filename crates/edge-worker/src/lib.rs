//! Edge cache worker.
//!
//! Intercepts outgoing requests, serves stored responses while they are fresh
//! and not named by the backend's invalidation Bloom filter, and otherwise
//! fetches through the tenant's asset proxy and stores the result.

pub mod api;
pub mod bloom;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod interceptor;
pub mod message;
pub mod refresher;
pub mod rewrite;
pub mod state;
pub mod store;

pub use config::WorkerConfig;
pub use engine::{CacheDecisionEngine, CacheOutcome};
pub use interceptor::{InterceptorSettings, RequestInterceptor};
pub use state::WorkerState;
