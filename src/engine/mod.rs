//! Heavyweight analysis engine lifecycle and dispatch.
//!
//! Each heavy capability (risk, tags, face, vector) is served by one engine
//! slot that is lazily loaded, evicted under memory pressure, and unloaded
//! after sitting idle. Basic metadata needs no engine.

pub mod manager;
pub mod memory;
mod runtime;

pub use manager::EngineManager;
pub use memory::{MemoryProbe, SystemMemoryProbe};

/// Tag inference output split into general and character vocabularies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagPrediction {
    pub general: Vec<String>,
    pub characters: Vec<String>,
}

impl TagPrediction {
    pub fn is_empty(&self) -> bool {
        self.general.is_empty() && self.characters.is_empty()
    }

    /// All predicted labels, general first.
    pub fn all(&self) -> Vec<String> {
        let mut all = self.general.clone();
        all.extend(self.characters.iter().cloned());
        all
    }
}
