//! Common utilities and types shared across minizero

pub mod config;
pub mod error;
pub mod metrics;
pub mod raft;
pub mod storage;
pub mod tracing_middleware;
pub mod utils;

pub use config::{Config, CoordinatorConfig, StorageBackend};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{crc32, parse_duration, retry_with_backoff, timestamp_now};
