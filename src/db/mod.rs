//! Content-addressed result store.
//!
//! One row per content fingerprint; analysis payloads are opaque,
//! schema-tagged JSON so the storage layer never inspects engine output
//! structure.

mod schema;
pub mod store;

pub use schema::{MIGRATIONS, SCHEMA};
pub use store::ResultStore;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityFlags;

/// Version tag carried inside every opaque JSON payload, so future builds
/// can migrate old rows without schema changes.
pub const PAYLOAD_VERSION: u32 = 1;

/// Basic media metadata payload (capability: basic).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    #[serde(default = "default_payload_version")]
    pub v: u32,
    pub width: u32,
    pub height: u32,
    pub format: Option<String>,
    pub size_bytes: u64,
}

fn default_payload_version() -> u32 {
    PAYLOAD_VERSION
}

/// One detected face bounding box (capability: face).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: Option<f32>,
}

/// Face geometry payload wrapper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FaceGeometry {
    #[serde(default = "default_payload_version")]
    pub v: u32,
    pub boxes: Vec<FaceBox>,
}

impl FaceGeometry {
    pub fn new(boxes: Vec<FaceBox>) -> Self {
        Self {
            v: PAYLOAD_VERSION,
            boxes,
        }
    }
}

/// A stored content row, with its tag associations resolved.
#[derive(Debug, Clone, Default)]
pub struct ContentRecord {
    pub fingerprint: String,
    pub path: Option<String>,
    pub capabilities_done: CapabilityFlags,
    pub metadata: Option<MediaInfo>,
    pub risk: Option<f64>,
    pub faces: Option<FaceGeometry>,
    pub embedding: Option<Vec<f32>>,
    pub last_scanned: Option<String>,
    pub tags: Vec<String>,
    pub characters: Vec<String>,
}

/// Partial fields for an upsert. `None` means "keep whatever is stored".
#[derive(Debug, Clone, Default)]
pub struct ScanFields {
    pub metadata: Option<MediaInfo>,
    pub risk: Option<f64>,
    pub faces: Option<FaceGeometry>,
    pub embedding: Option<Vec<f32>>,
}

/// One ranked entry from the weighted trending query.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrendingTag {
    pub tag: String,
    pub weighted_count: f64,
}

/// Aggregate counters for the legacy stats surface.
#[derive(Debug, Clone, Serialize, Default)]
pub struct LegacyStats {
    pub count: i64,
    pub top_tags: Vec<String>,
}

/// Serialize an embedding as little-endian f32 bytes.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Deserialize little-endian f32 bytes back into an embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
