//! Adaptive frame sampling for animated and video content.
//!
//! Frames are extracted with ffmpeg, a strided subset is analyzed, and the
//! results fold into one risk score and one tag union. Maximum risk
//! saturates the scan: once any frame hits 1.0 the remaining frames are
//! skipped.

pub mod ffmpeg;

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::capability::CapabilityFlags;
use crate::config::SamplerConfig;
use crate::engine::EngineManager;
use crate::error::ScanError;

/// Aggregated result of one batch scan.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BatchOutcome {
    /// Maximum per-frame risk, rounded to 3 decimals.
    pub risk: f64,
    /// Sorted union of tags across sampled frames.
    pub tags: Vec<String>,
    /// Total frames extracted, not the number sampled.
    pub frame_count: usize,
}

pub struct FrameSampler {
    engines: Arc<EngineManager>,
    config: SamplerConfig,
}

impl FrameSampler {
    pub fn new(engines: Arc<EngineManager>, config: SamplerConfig) -> Self {
        Self { engines, config }
    }

    /// Analyze in-memory media bytes. The bytes are staged to a scratch
    /// directory for ffmpeg and cleaned up on return.
    pub async fn scan_batch(&self, bytes: &[u8], mime: &str) -> Result<BatchOutcome, ScanError> {
        let work = tempfile::tempdir()
            .map_err(|e| ScanError::ExternalTool(format!("scratch dir failed: {}", e)))?;
        let input = work.path().join(format!("input{}", input_suffix(mime)));
        tokio::fs::write(&input, bytes)
            .await
            .map_err(|e| ScanError::ExternalTool(format!("staging input failed: {}", e)))?;
        let frame_dir = work.path().join("frames");
        tokio::fs::create_dir(&frame_dir)
            .await
            .map_err(|e| ScanError::ExternalTool(format!("scratch dir failed: {}", e)))?;

        let frames = ffmpeg::extract_frames(
            &self.config.ffmpeg_bin,
            &input,
            &frame_dir,
            self.config.max_frames,
            self.config.extract_timeout(),
        )
        .await?;

        if frames.is_empty() {
            return Ok(BatchOutcome {
                risk: 0.0,
                tags: Vec::new(),
                frame_count: 0,
            });
        }

        let stride = select_stride(mime, &self.config);
        let indices = sample_indices(frames.len(), stride);
        tracing::debug!(
            mime = mime,
            total = frames.len(),
            sampled = indices.len(),
            stride = stride,
            "sampling batch frames"
        );

        self.engines
            .ensure_loaded(CapabilityFlags::RISK | CapabilityFlags::TAGS)
            .await;

        let mut aggregate = BatchAggregate::new();
        for index in indices {
            let frame = &frames[index];
            // A frame an engine cannot score contributes the neutral default
            // instead of failing the batch.
            let risk = match self.engines.predict_risk(frame).await {
                Ok(score) => score,
                Err(e) => {
                    tracing::warn!(frame = index, error = %e, "risk unavailable, defaulting to 0");
                    0.0
                }
            };
            let tags = match self.engines.predict_tags(frame).await {
                Ok(prediction) => prediction.all(),
                Err(e) => {
                    tracing::warn!(frame = index, error = %e, "tags unavailable for frame");
                    Vec::new()
                }
            };
            if aggregate.observe(risk, tags) {
                tracing::debug!(frame = index, "risk saturated, stopping early");
                break;
            }
        }

        let (risk, tags) = aggregate.finish(self.config.max_batch_tags);
        Ok(BatchOutcome {
            risk,
            tags,
            frame_count: frames.len(),
        })
    }
}

/// Long-form video samples sparser than gif-like content.
fn select_stride(mime: &str, config: &SamplerConfig) -> usize {
    if mime.starts_with("video/") {
        config.video_stride.max(1)
    } else {
        config.gif_stride.max(1)
    }
}

/// First frame, last frame, and every stride-th frame between, in order.
fn sample_indices(total: usize, stride: usize) -> Vec<usize> {
    let mut picked: BTreeSet<usize> = (0..total).step_by(stride.max(1)).collect();
    if total > 0 {
        picked.insert(0);
        picked.insert(total - 1);
    }
    picked.into_iter().collect()
}

/// Running fold over sampled frames: max risk plus tag union, saturating at
/// risk 1.0.
struct BatchAggregate {
    max_risk: f64,
    tags: BTreeSet<String>,
}

impl BatchAggregate {
    fn new() -> Self {
        Self {
            max_risk: 0.0,
            tags: BTreeSet::new(),
        }
    }

    /// Fold in one frame. Returns true once risk has saturated and further
    /// frames cannot change the outcome.
    fn observe(&mut self, risk: f64, tags: impl IntoIterator<Item = String>) -> bool {
        self.max_risk = self.max_risk.max(risk);
        self.tags.extend(tags);
        self.max_risk >= 1.0
    }

    fn finish(self, max_tags: usize) -> (f64, Vec<String>) {
        let tags = self.tags.into_iter().take(max_tags).collect();
        (round_risk(self.max_risk), tags)
    }
}

fn round_risk(risk: f64) -> f64 {
    (risk * 1000.0).round() / 1000.0
}

fn input_suffix(mime: &str) -> String {
    match mime.rsplit('/').next() {
        Some(subtype) if !subtype.is_empty() => {
            let clean: String = subtype
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect();
            if clean.is_empty() {
                String::new()
            } else {
                format!(".{}", clean)
            }
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::memory::FixedProbe;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn sampler_with_stub(dir: &TempDir, script: &str) -> FrameSampler {
        use std::os::unix::fs::PermissionsExt;
        let bin = dir.path().join("extract-stub.sh");
        std::fs::write(&bin, script).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engines = Arc::new(EngineManager::new(
            EngineConfig {
                model_dir: dir.path().join("models"),
                ..Default::default()
            },
            Arc::new(FixedProbe(Some(0.9))),
        ));
        let config = SamplerConfig {
            ffmpeg_bin: bin,
            ..Default::default()
        };
        FrameSampler::new(engines, config)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_zero_extracted_frames_is_empty_result_not_error() {
        let dir = TempDir::new().unwrap();
        let sampler = sampler_with_stub(&dir, "#!/bin/sh\nexit 0\n");
        let outcome = sampler.scan_batch(b"bytes", "image/gif").await.unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                risk: 0.0,
                tags: Vec::new(),
                frame_count: 0,
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_frame_count_reports_true_extracted_total() {
        let dir = TempDir::new().unwrap();
        // Emits 40 frame files into the output pattern's directory.
        let script = r#"#!/bin/sh
for arg; do pattern=$arg; done
out=$(dirname "$pattern")
i=1
while [ "$i" -le 40 ]; do
    : > "$out/$(printf 'frame_%05d.png' "$i")"
    i=$((i + 1))
done
"#;
        let sampler = sampler_with_stub(&dir, script);
        let outcome = sampler.scan_batch(b"bytes", "video/mp4").await.unwrap();
        // 40 frames at stride 20 samples only indices 0, 20 and 39, but the
        // reported count is the extracted total.
        assert_eq!(outcome.frame_count, 40);
        assert_eq!(outcome.risk, 0.0);
        assert!(outcome.tags.is_empty());
    }

    #[test]
    fn test_sample_indices_includes_endpoints_and_stride() {
        // 13 frames, stride 5: multiples {0,5,10} plus last frame.
        assert_eq!(sample_indices(13, 5), vec![0, 5, 10, 12]);
        assert_eq!(sample_indices(1, 5), vec![0]);
        assert_eq!(sample_indices(0, 5), Vec::<usize>::new());
        // Endpoints never duplicate.
        assert_eq!(sample_indices(6, 5), vec![0, 5]);
    }

    #[test]
    fn test_select_stride_by_mime() {
        let config = SamplerConfig::default();
        assert_eq!(select_stride("video/mp4", &config), 20);
        assert_eq!(select_stride("video/webm", &config), 20);
        assert_eq!(select_stride("image/gif", &config), 5);
        assert_eq!(select_stride("image/webp", &config), 5);
    }

    #[test]
    fn test_aggregate_saturates_at_full_risk() {
        let frames: Vec<(f64, Vec<String>)> = vec![
            (0.1, vec!["sky".into()]),
            (0.2, vec!["tree".into()]),
            (1.0, vec!["flag".into()]),
            (0.9, vec!["never_seen".into()]),
        ];

        let mut aggregate = BatchAggregate::new();
        let mut observed = 0;
        for (risk, tags) in frames {
            observed += 1;
            if aggregate.observe(risk, tags) {
                break;
            }
        }
        // The fourth frame is never folded in.
        assert_eq!(observed, 3);

        let (risk, tags) = aggregate.finish(200);
        assert_eq!(risk, 1.0);
        assert_eq!(tags, vec!["flag", "sky", "tree"]);
    }

    #[test]
    fn test_aggregate_rounds_and_caps_tags() {
        let mut aggregate = BatchAggregate::new();
        aggregate.observe(0.12345, vec!["b".into(), "a".into(), "c".into()]);
        aggregate.observe(0.6789, vec!["a".into()]);
        let (risk, tags) = aggregate.finish(2);
        assert_eq!(risk, 0.679);
        // Union is sorted, then capped.
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn test_input_suffix() {
        assert_eq!(input_suffix("image/gif"), ".gif");
        assert_eq!(input_suffix("video/mp4"), ".mp4");
        assert_eq!(input_suffix("video/x-matroska"), ".xmatroska");
        assert_eq!(input_suffix(""), "");
    }
}
