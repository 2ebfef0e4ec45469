//! Basic media metadata extraction (capability: basic).

use anyhow::Result;
use std::path::Path;

use crate::db::{MediaInfo, PAYLOAD_VERSION};

pub fn extract(path: &Path) -> Result<MediaInfo> {
    let size_bytes = std::fs::metadata(path)?.len();

    let mut format = None;
    if let Ok(reader) = image::ImageReader::open(path) {
        if let Some(detected) = reader.format() {
            format = Some(format!("{:?}", detected));
        }
    }

    // Open again since into_dimensions consumes the reader.
    let (width, height) = image::ImageReader::open(path)?
        .with_guessed_format()?
        .into_dimensions()?;

    Ok(MediaInfo {
        v: PAYLOAD_VERSION,
        width,
        height,
        format,
        size_bytes,
    })
}
