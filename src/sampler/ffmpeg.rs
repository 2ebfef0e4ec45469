//! Frame extraction via the ffmpeg binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::ScanError;

/// Extract up to `max_frames` frames from `input` into `out_dir` as numbered
/// PNGs, returning their paths in frame order. A missing binary, a non-zero
/// exit, or a hung process all surface as `ExternalTool`.
pub async fn extract_frames(
    ffmpeg_bin: &Path,
    input: &Path,
    out_dir: &Path,
    max_frames: u32,
    timeout: Duration,
) -> Result<Vec<PathBuf>, ScanError> {
    let pattern = out_dir.join("frame_%05d.png");

    let child = Command::new(ffmpeg_bin)
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(input)
        .arg("-vframes")
        .arg(max_frames.to_string())
        .arg(&pattern)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ScanError::ExternalTool(format!("failed to spawn ffmpeg: {}", e)))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => {
            result.map_err(|e| ScanError::ExternalTool(format!("ffmpeg wait failed: {}", e)))?
        }
        Err(_) => {
            // kill_on_drop reaps the hung process.
            return Err(ScanError::ExternalTool(format!(
                "ffmpeg timed out after {}s",
                timeout.as_secs()
            )));
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScanError::ExternalTool(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    collect_frames(out_dir)
}

/// Frame files in numbering order. ffmpeg writes frame_00001.png upward, so
/// lexicographic order is frame order.
fn collect_frames(out_dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
    let entries = std::fs::read_dir(out_dir)
        .map_err(|e| ScanError::ExternalTool(format!("frame dir unreadable: {}", e)))?;
    let mut frames: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
        .collect();
    frames.sort();
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_frames_sorts_by_number() {
        let dir = TempDir::new().unwrap();
        for name in ["frame_00003.png", "frame_00001.png", "frame_00002.png"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let frames = collect_frames(dir.path()).unwrap();
        let names: Vec<_> = frames
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .collect();
        assert_eq!(
            names,
            vec!["frame_00001.png", "frame_00002.png", "frame_00003.png"]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_external_tool_error() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let result = extract_frames(
            Path::new("/nonexistent/ffmpeg-binary"),
            &input,
            dir.path(),
            10,
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(ScanError::ExternalTool(_))));
    }
}
