use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::capability::Capability;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scanner: ScannerConfig,

    #[serde(default)]
    pub engines: EngineConfig,

    #[serde(default)]
    pub sampler: SamplerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mediascan")
        .join("mediascan.db")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Roots a scan path must resolve under. Empty means any path is
    /// allowed (single-user workstation setups).
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,

    /// Decompression-bomb guard for corruption validation.
    #[serde(default = "default_max_image_pixels")]
    pub max_image_pixels: u64,
}

fn default_max_image_pixels() -> u64 {
    50_000_000
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            allowed_roots: Vec::new(),
            max_image_pixels: default_max_image_pixels(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    #[serde(default = "default_risk_model")]
    pub risk_model: String,
    #[serde(default = "default_tags_model")]
    pub tags_model: String,
    #[serde(default = "default_face_model")]
    pub face_model: String,
    #[serde(default = "default_vector_model")]
    pub vector_model: String,

    #[serde(default = "default_tag_vocab")]
    pub tag_vocab: String,
    #[serde(default = "default_character_vocab")]
    pub character_vocab: String,

    /// Tagger confidence cutoff.
    #[serde(default = "default_tag_threshold")]
    pub tag_threshold: f32,

    /// Free-memory fraction below which new engine loads trigger eviction.
    #[serde(default = "default_headroom_threshold")]
    pub headroom_threshold: f64,

    /// The capability whose engine is exempt from idle unloading.
    #[serde(default = "default_always_resident")]
    pub always_resident: String,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: u64,

    #[serde(default = "default_max_concurrent_inference")]
    pub max_concurrent_inference: usize,
}

fn default_model_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mediascan")
        .join("models")
}

fn default_risk_model() -> String {
    "risk.onnx".to_string()
}

fn default_tags_model() -> String {
    "tagger.onnx".to_string()
}

fn default_face_model() -> String {
    "ultraface-320.onnx".to_string()
}

fn default_vector_model() -> String {
    "clip-vit-b32-vision.onnx".to_string()
}

fn default_tag_vocab() -> String {
    "tags.txt".to_string()
}

fn default_character_vocab() -> String {
    "tags-character.txt".to_string()
}

fn default_tag_threshold() -> f32 {
    0.5
}

fn default_headroom_threshold() -> f64 {
    0.15
}

fn default_always_resident() -> String {
    "risk".to_string()
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_load_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent_inference() -> usize {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            risk_model: default_risk_model(),
            tags_model: default_tags_model(),
            face_model: default_face_model(),
            vector_model: default_vector_model(),
            tag_vocab: default_tag_vocab(),
            character_vocab: default_character_vocab(),
            tag_threshold: default_tag_threshold(),
            headroom_threshold: default_headroom_threshold(),
            always_resident: default_always_resident(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            load_timeout_secs: default_load_timeout_secs(),
            max_concurrent_inference: default_max_concurrent_inference(),
        }
    }
}

impl EngineConfig {
    pub fn model_path(&self, capability: Capability) -> PathBuf {
        let file = match capability {
            Capability::Risk => &self.risk_model,
            Capability::Tags => &self.tags_model,
            Capability::Face => &self.face_model,
            Capability::Vector => &self.vector_model,
            // Basic has no engine; map to a path that never exists.
            Capability::Basic => return self.model_dir.join("basic.onnx"),
        };
        self.model_dir.join(file)
    }

    pub fn tag_vocab_path(&self) -> PathBuf {
        self.model_dir.join(&self.tag_vocab)
    }

    pub fn character_vocab_path(&self) -> PathBuf {
        self.model_dir.join(&self.character_vocab)
    }

    /// The always-resident capability is declared explicitly rather than
    /// inferred from eviction-list ordering. Unknown names fall back to risk.
    pub fn always_resident_capability(&self) -> Capability {
        match self.always_resident.trim().to_ascii_lowercase().as_str() {
            "tags" => Capability::Tags,
            "face" => Capability::Face,
            "vector" => Capability::Vector,
            _ => Capability::Risk,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_secs(self.load_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// ffmpeg binary; resolved from PATH when not absolute.
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,

    #[serde(default = "default_max_frames")]
    pub max_frames: u32,

    /// Sampling stride for short-form (gif-like) content.
    #[serde(default = "default_gif_stride")]
    pub gif_stride: usize,

    /// Sampling stride for long-form video.
    #[serde(default = "default_video_stride")]
    pub video_stride: usize,

    /// Cap on the size of the returned tag union.
    #[serde(default = "default_max_batch_tags")]
    pub max_batch_tags: usize,

    #[serde(default = "default_extract_timeout_secs")]
    pub extract_timeout_secs: u64,
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_max_frames() -> u32 {
    60
}

fn default_gif_stride() -> usize {
    5
}

fn default_video_stride() -> usize {
    20
}

fn default_max_batch_tags() -> usize {
    200
}

fn default_extract_timeout_secs() -> u64 {
    60
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            ffmpeg_bin: default_ffmpeg_bin(),
            max_frames: default_max_frames(),
            gif_stride: default_gif_stride(),
            video_stride: default_video_stride(),
            max_batch_tags: default_max_batch_tags(),
            extract_timeout_secs: default_extract_timeout_secs(),
        }
    }
}

impl SamplerConfig {
    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs.max(1))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    fn save_to(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mediascan")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_policy() {
        let config = Config::default();
        assert_eq!(config.engines.headroom_threshold, 0.15);
        assert_eq!(
            config.engines.always_resident_capability(),
            Capability::Risk
        );
        assert_eq!(config.sampler.gif_stride, 5);
        assert_eq!(config.sampler.video_stride, 20);
        assert_eq!(config.sampler.max_frames, 60);
        assert_eq!(config.sampler.max_batch_tags, 200);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [engines]
            always_resident = "tags"
            [sampler]
            gif_stride = 3
            "#,
        )
        .unwrap();
        assert_eq!(
            config.engines.always_resident_capability(),
            Capability::Tags
        );
        assert_eq!(config.sampler.gif_stride, 3);
        assert_eq!(config.sampler.video_stride, 20);
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.engines.risk_model, config.engines.risk_model);
    }
}
