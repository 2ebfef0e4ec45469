//! Corruption validation.
//!
//! Runs before any engine work on content that still needs analysis; fully
//! cached content is never re-validated.

use std::path::Path;

use crate::error::ScanError;

pub fn validate(path: &Path, max_pixels: u64) -> Result<(), ScanError> {
    let reader = image::ImageReader::open(path)
        .map_err(|e| ScanError::Corrupt(format!("unreadable: {}", e)))?
        .with_guessed_format()
        .map_err(|e| ScanError::Corrupt(format!("unreadable: {}", e)))?;

    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| ScanError::Corrupt(format!("undecodable header: {}", e)))?;

    // Decompression-bomb guard before the full decode.
    let pixels = width as u64 * height as u64;
    if pixels > max_pixels {
        return Err(ScanError::Corrupt(format!(
            "image too large: {} pixels",
            pixels
        )));
    }

    image::open(path)
        .map(|_| ())
        .map_err(|e| ScanError::Corrupt(format!("decode failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_valid_image_passes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ok.png");
        image::RgbImage::new(4, 4).save(&path).unwrap();
        assert!(validate(&path, 50_000_000).is_ok());
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.png");
        std::fs::write(&path, b"\x89PNG but not really").unwrap();
        assert!(matches!(
            validate(&path, 50_000_000),
            Err(ScanError::Corrupt(_))
        ));
    }

    #[test]
    fn test_pixel_bomb_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.png");
        image::RgbImage::new(100, 100).save(&path).unwrap();
        assert!(matches!(validate(&path, 99), Err(ScanError::Corrupt(_))));
    }
}
