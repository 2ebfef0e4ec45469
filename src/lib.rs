//! Content-addressed incremental media analysis core.
//!
//! Media bytes are identified by fingerprint, analysis capabilities are
//! tracked as a bitmask per fingerprint, and scans compute only the delta
//! between what is requested and what is already recorded.

pub mod capability;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod sampler;
pub mod scanner;

pub use capability::{Capability, CapabilityFlags};
pub use config::Config;
pub use db::ResultStore;
pub use engine::EngineManager;
pub use error::ScanError;
pub use sampler::{BatchOutcome, FrameSampler};
pub use scanner::{ScanOrchestrator, ScanOutcome};
