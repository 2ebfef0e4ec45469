//! Engine slot lifecycle: lazy load, pressure eviction, idle unload.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

use super::memory::MemoryProbe;
use super::runtime::{self, OnnxEngine, TagVocabulary};
use super::TagPrediction;
use crate::capability::{Capability, CapabilityFlags};
use crate::config::EngineConfig;
use crate::db::FaceBox;

/// Eviction order under memory pressure, lowest priority first.
const EVICTION_ORDER: [Capability; 3] = [Capability::Tags, Capability::Vector, Capability::Face];

struct Slot {
    capability: Capability,
    model_path: PathBuf,
    /// The slot mutex serializes load, evict, and in-flight predictions.
    cell: Mutex<Option<OnnxEngine>>,
    last_used: std::sync::Mutex<Option<Instant>>,
}

impl Slot {
    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used.lock() {
            *last_used = Some(Instant::now());
        }
    }

    fn idle_for(&self) -> Option<Duration> {
        self.last_used
            .lock()
            .ok()
            .and_then(|last_used| last_used.map(|at| at.elapsed()))
    }
}

pub struct EngineManager {
    slots: Vec<Arc<Slot>>,
    vocab: Arc<TagVocabulary>,
    probe: Arc<dyn MemoryProbe>,
    config: EngineConfig,
    /// Bounds concurrent inference so slow engines cannot monopolize the
    /// blocking pool.
    infer_permits: Arc<Semaphore>,
}

impl EngineManager {
    pub fn new(config: EngineConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        let vocab = Arc::new(TagVocabulary::load(
            &config.tag_vocab_path(),
            &config.character_vocab_path(),
        ));
        let slots = [Capability::Risk, Capability::Tags, Capability::Face, Capability::Vector]
            .into_iter()
            .map(|capability| {
                Arc::new(Slot {
                    capability,
                    model_path: config.model_path(capability),
                    cell: Mutex::new(None),
                    last_used: std::sync::Mutex::new(None),
                })
            })
            .collect();
        Self {
            slots,
            vocab,
            probe,
            infer_permits: Arc::new(Semaphore::new(config.max_concurrent_inference.max(1))),
            config,
        }
    }

    fn slot(&self, capability: Capability) -> Option<&Arc<Slot>> {
        self.slots.iter().find(|slot| slot.capability == capability)
    }

    /// Headroom check callers can use to skip heavy work pre-emptively.
    /// Unknown headroom admits; constrained headroom refuses heavy
    /// capabilities only.
    pub fn can_admit(&self, requested: CapabilityFlags) -> bool {
        let Some(free) = self.probe.headroom() else {
            return true;
        };
        if free >= self.config.headroom_threshold {
            return true;
        }
        if requested.intersects(CapabilityFlags::HEAVY) {
            tracing::warn!(
                free_pct = free * 100.0,
                flags = %requested,
                "memory headroom low, refusing heavy capabilities"
            );
            return false;
        }
        true
    }

    /// Load every unloaded slot named in `requested`, evicting lower
    /// priority slots first when headroom is short. A failed load leaves the
    /// slot unloaded; the capability is then simply unavailable this call.
    pub async fn ensure_loaded(&self, requested: CapabilityFlags) {
        self.ensure_capacity(requested).await;
        for capability in requested.iter() {
            if let Some(slot) = self.slot(capability) {
                if let Err(e) = self.load_slot(slot).await {
                    tracing::error!(
                        engine = capability.name(),
                        error = %e,
                        "engine load failed, capability unavailable"
                    );
                }
            }
        }
    }

    pub async fn is_loaded(&self, capability: Capability) -> bool {
        match self.slot(capability) {
            Some(slot) => slot.cell.lock().await.is_some(),
            None => false,
        }
    }

    async fn ensure_capacity(&self, requested: CapabilityFlags) {
        let Some(free) = self.probe.headroom() else {
            return;
        };
        if free >= self.config.headroom_threshold {
            return;
        }

        let targets = self.eviction_targets(requested).await;
        if !targets.is_empty() {
            tracing::info!(
                free_pct = free * 100.0,
                unloading = ?targets.iter().map(|c| c.name()).collect::<Vec<_>>(),
                "memory pressure, evicting idle engines"
            );
        }
        for capability in targets {
            self.unload_slot(capability).await;
        }

        if let Some(free) = self.probe.headroom() {
            if free < self.config.headroom_threshold
                && requested.contains(self.config.always_resident_capability())
            {
                tracing::warn!(
                    free_pct = free * 100.0,
                    "headroom still low after eviction, continuing degraded"
                );
            }
        }
    }

    /// Loaded slots eligible for eviction, in fixed priority order. Slots
    /// serving the current request are never evicted.
    async fn eviction_targets(&self, requested: CapabilityFlags) -> Vec<Capability> {
        let mut targets = Vec::new();
        for capability in EVICTION_ORDER {
            if requested.contains(capability) {
                continue;
            }
            if self.is_loaded(capability).await {
                targets.push(capability);
            }
        }
        targets
    }

    async fn load_slot(&self, slot: &Arc<Slot>) -> Result<()> {
        let mut cell = slot.cell.lock().await;
        if cell.is_some() {
            return Ok(());
        }
        if !slot.model_path.exists() {
            return Err(anyhow!("model not found: {}", slot.model_path.display()));
        }

        tracing::info!(engine = slot.capability.name(), path = ?slot.model_path, "loading engine");
        let model_path = slot.model_path.clone();
        let load = tokio::task::spawn_blocking(move || OnnxEngine::load(&model_path));
        let engine = tokio::time::timeout(self.config.load_timeout(), load)
            .await
            .map_err(|_| anyhow!("engine load timed out"))?
            .map_err(|e| anyhow!("engine load task failed: {}", e))??;

        *cell = Some(engine);
        slot.touch();
        tracing::info!(engine = slot.capability.name(), "engine loaded");
        Ok(())
    }

    async fn unload_slot(&self, capability: Capability) {
        if let Some(slot) = self.slot(capability) {
            let mut cell = slot.cell.lock().await;
            if cell.take().is_some() {
                tracing::info!(engine = capability.name(), "engine unloaded");
            }
        }
    }

    /// Periodic idle sweep. Slots idle beyond the configured timeout are
    /// unloaded, except the always-resident one. A slot with a prediction in
    /// flight holds its mutex and is skipped via try_lock.
    pub fn spawn_idle_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.sweep_idle_once().await;
            }
        })
    }

    pub async fn sweep_idle_once(&self) {
        let resident = self.config.always_resident_capability();
        let idle_timeout = self.config.idle_timeout();
        for slot in &self.slots {
            if slot.capability == resident {
                continue;
            }
            let Ok(mut cell) = slot.cell.try_lock() else {
                continue;
            };
            if cell.is_none() {
                continue;
            }
            let expired = slot
                .idle_for()
                .map(|idle| idle >= idle_timeout)
                .unwrap_or(false);
            if expired {
                *cell = None;
                tracing::info!(engine = slot.capability.name(), "idle engine unloaded");
            }
        }
    }

    /// Run one prediction on the blocking pool while keeping the slot
    /// locked, so eviction and the idle sweep cannot race an in-flight
    /// inference. An unloaded slot yields `Ok(None)`; the public predict
    /// operations substitute their defined default result.
    async fn run_prediction<T, F>(&self, capability: Capability, infer: F) -> Result<Option<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut OnnxEngine) -> Result<T> + Send + 'static,
    {
        let slot = self
            .slot(capability)
            .ok_or_else(|| anyhow!("no engine slot for {}", capability.name()))?;

        let mut cell = slot.cell.lock().await;
        let Some(mut engine) = cell.take() else {
            tracing::warn!(engine = capability.name(), "engine not loaded, returning default");
            return Ok(None);
        };

        let _permit = self
            .infer_permits
            .acquire()
            .await
            .map_err(|e| anyhow!("inference semaphore closed: {}", e))?;

        let joined = tokio::task::spawn_blocking(move || {
            let output = infer(&mut engine);
            (engine, output)
        })
        .await;

        match joined {
            Ok((engine, output)) => {
                *cell = Some(engine);
                if output.is_ok() {
                    slot.touch();
                }
                output.map(Some)
            }
            Err(e) => {
                // The engine was lost with the panicked task; the slot
                // reloads on next demand.
                tracing::error!(engine = capability.name(), error = %e, "inference task failed");
                Err(anyhow!("inference task failed: {}", e))
            }
        }
    }

    pub async fn predict_risk(&self, image_path: &Path) -> Result<f64> {
        let path = image_path.to_owned();
        Ok(self
            .run_prediction(Capability::Risk, move |engine| {
                runtime::predict_risk(engine, &path)
            })
            .await?
            .unwrap_or(0.0))
    }

    pub async fn predict_tags(&self, image_path: &Path) -> Result<TagPrediction> {
        let path = image_path.to_owned();
        let threshold = self.config.tag_threshold;
        if self.vocab.is_empty() {
            tracing::warn!("tag vocabulary empty, returning no tags");
            return Ok(TagPrediction::default());
        }
        let vocab = Arc::clone(&self.vocab);
        Ok(self
            .run_prediction(Capability::Tags, move |engine| {
                runtime::predict_tags(engine, &path, &vocab, threshold)
            })
            .await?
            .unwrap_or_default())
    }

    pub async fn predict_face_boxes(&self, image_path: &Path) -> Result<Vec<FaceBox>> {
        let path = image_path.to_owned();
        Ok(self
            .run_prediction(Capability::Face, move |engine| {
                runtime::predict_face_boxes(engine, &path)
            })
            .await?
            .unwrap_or_default())
    }

    pub async fn predict_embedding(&self, image_path: &Path) -> Result<Vec<f32>> {
        let path = image_path.to_owned();
        Ok(self
            .run_prediction(Capability::Vector, move |engine| {
                runtime::predict_embedding(engine, &path)
            })
            .await?
            .unwrap_or_default())
    }
}
