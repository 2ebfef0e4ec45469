//! Scan orchestration: diff requested capabilities against the cache and
//! dispatch only the delta.

pub mod content;
pub mod hashing;
pub mod metadata;
pub mod validate;

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::capability::{Capability, CapabilityFlags};
use crate::config::ScannerConfig;
use crate::db::{FaceBox, FaceGeometry, MediaInfo, ResultStore, ScanFields};
use crate::engine::EngineManager;
use crate::error::ScanError;

/// Merged view of one scan: freshly computed capabilities plus whatever the
/// prior record already held for the requested set.
#[derive(Debug, Serialize)]
pub struct ScanOutcome {
    pub fingerprint: String,
    pub path: String,
    pub requested: CapabilityFlags,
    /// Total recorded capabilities after this scan.
    pub capabilities_done: CapabilityFlags,
    /// Capabilities computed by this call (empty on a full cache hit).
    pub computed: CapabilityFlags,
    /// True when admission control skipped the heavy work this round.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MediaInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
    pub tags: Vec<String>,
    pub characters: Vec<String>,
    pub faces: Vec<FaceBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Per-capability failures, keyed by capability name. A failed
    /// capability never aborts its siblings and is retried on a later scan.
    pub errors: BTreeMap<String, String>,
}

impl ScanOutcome {
    fn new(fingerprint: String, path: String, requested: CapabilityFlags) -> Self {
        Self {
            fingerprint,
            path,
            requested,
            capabilities_done: CapabilityFlags::NONE,
            computed: CapabilityFlags::NONE,
            degraded: false,
            metadata: None,
            risk: None,
            tags: Vec::new(),
            characters: Vec::new(),
            faces: Vec::new(),
            embedding: None,
            errors: BTreeMap::new(),
        }
    }
}

pub struct ScanOrchestrator {
    store: Arc<ResultStore>,
    engines: Arc<EngineManager>,
    allowed_roots: Vec<PathBuf>,
    max_image_pixels: u64,
    /// Per-fingerprint single-flight locks: concurrent scans of the same
    /// content serialize instead of duplicating engine work.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ScanOrchestrator {
    pub fn new(
        store: Arc<ResultStore>,
        engines: Arc<EngineManager>,
        config: &ScannerConfig,
    ) -> Self {
        Self {
            store,
            engines,
            allowed_roots: config.allowed_roots.clone(),
            max_image_pixels: config.max_image_pixels,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn scan(
        &self,
        path: &Path,
        requested: CapabilityFlags,
    ) -> Result<ScanOutcome, ScanError> {
        let resolved = content::resolve(path, &self.allowed_roots)?;
        let path_str = resolved.to_string_lossy().to_string();

        let fingerprint = {
            let target = resolved.clone();
            tokio::task::spawn_blocking(move || hashing::fingerprint(&target))
                .await
                .map_err(|e| ScanError::ExternalTool(format!("hash task failed: {}", e)))?
                .map_err(|_| ScanError::NotFound(resolved.clone()))?
        };

        let lock = self.fingerprint_lock(&fingerprint).await;
        let _guard = lock.lock().await;

        let prior = match self.store.get_record(&fingerprint) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "record lookup failed, treating as absent");
                None
            }
        };
        let done = prior
            .as_ref()
            .map(|record| record.capabilities_done)
            .unwrap_or(CapabilityFlags::NONE);

        let mut outcome = ScanOutcome::new(fingerprint.clone(), path_str.clone(), requested);
        let mut needed = requested - done;

        // Fully cached content is never re-validated.
        if !needed.is_empty() {
            let target = resolved.clone();
            let max_pixels = self.max_image_pixels;
            tokio::task::spawn_blocking(move || validate::validate(&target, max_pixels))
                .await
                .map_err(|e| ScanError::ExternalTool(format!("validation task failed: {}", e)))??;

            if !self.engines.can_admit(needed) {
                let refusal = ScanError::ResourceExhausted(needed.to_string());
                tracing::warn!(
                    fingerprint = %fingerprint,
                    error = %refusal,
                    "admission denied, degrading to cached results"
                );
                needed = CapabilityFlags::NONE;
                outcome.degraded = true;
            }
        }

        let mut fields = ScanFields::default();
        let mut tag_output: Option<(Vec<String>, Vec<String>)> = None;

        if !needed.is_empty() {
            self.engines
                .ensure_loaded(needed & CapabilityFlags::HEAVY)
                .await;

            for capability in needed.iter() {
                self.dispatch(capability, &resolved, &mut outcome, &mut fields, &mut tag_output)
                    .await;
            }

            // Persistence failures must not fail the request; the next scan
            // simply recomputes.
            if let Err(e) = self
                .store
                .upsert(&fingerprint, &path_str, outcome.computed, &fields)
            {
                let e = ScanError::Storage(e);
                tracing::error!(fingerprint = %fingerprint, error = %e, "result upsert failed");
            }
            if let Some((general, characters)) = &tag_output {
                if let Err(e) = self.store.replace_tags(&fingerprint, general, characters) {
                    let e = ScanError::Storage(e);
                    tracing::error!(fingerprint = %fingerprint, error = %e, "tag replace failed");
                }
                self.record_sightings_deferred(general, characters);
            }
        }

        // Serve everything else in the requested set from the prior record.
        if let Some(record) = prior {
            if outcome.metadata.is_none() && requested.contains(Capability::Basic) {
                outcome.metadata = record.metadata;
            }
            if outcome.risk.is_none() && requested.contains(Capability::Risk) {
                outcome.risk = record.risk;
            }
            if requested.contains(Capability::Tags) && tag_output.is_none() {
                outcome.tags = record.tags;
                outcome.characters = record.characters;
            }
            if outcome.faces.is_empty() && requested.contains(Capability::Face) {
                if let Some(geometry) = record.faces {
                    outcome.faces = geometry.boxes;
                }
            }
            if outcome.embedding.is_none() && requested.contains(Capability::Vector) {
                outcome.embedding = record.embedding;
            }
        }

        outcome.capabilities_done = done | outcome.computed;
        Ok(outcome)
    }

    /// Run one capability and fold its output into the working record. A
    /// failure is embedded under the capability name; siblings still run.
    async fn dispatch(
        &self,
        capability: Capability,
        image_path: &Path,
        outcome: &mut ScanOutcome,
        fields: &mut ScanFields,
        tag_output: &mut Option<(Vec<String>, Vec<String>)>,
    ) {
        // An engine that failed to load surfaces as an embedded error, not a
        // recorded default; the bit stays unset so a later scan retries.
        if capability != Capability::Basic && !self.engines.is_loaded(capability).await {
            let unavailable = ScanError::CapabilityUnavailable(capability.name().to_string());
            tracing::warn!(capability = capability.name(), "engine unavailable");
            outcome
                .errors
                .insert(capability.name().to_string(), unavailable.to_string());
            return;
        }

        let result: anyhow::Result<()> = match capability {
            Capability::Basic => {
                let target = image_path.to_owned();
                match tokio::task::spawn_blocking(move || metadata::extract(&target)).await {
                    Ok(Ok(info)) => {
                        fields.metadata = Some(info.clone());
                        outcome.metadata = Some(info);
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(anyhow::anyhow!("metadata task failed: {}", e)),
                }
            }
            Capability::Risk => match self.engines.predict_risk(image_path).await {
                Ok(score) => {
                    fields.risk = Some(score);
                    outcome.risk = Some(score);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Capability::Tags => match self.engines.predict_tags(image_path).await {
                Ok(prediction) => {
                    outcome.tags = prediction.general.clone();
                    outcome.characters = prediction.characters.clone();
                    *tag_output = Some((prediction.general, prediction.characters));
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Capability::Face => match self.engines.predict_face_boxes(image_path).await {
                Ok(boxes) => {
                    outcome.faces = boxes.clone();
                    fields.faces = Some(FaceGeometry::new(boxes));
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Capability::Vector => match self.engines.predict_embedding(image_path).await {
                Ok(embedding) => {
                    fields.embedding = Some(embedding.clone());
                    outcome.embedding = Some(embedding);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => outcome.computed.insert(capability),
            Err(e) => {
                tracing::error!(
                    capability = capability.name(),
                    error = %e,
                    "capability failed, continuing with siblings"
                );
                outcome.errors.insert(capability.name().to_string(), e.to_string());
            }
        }
    }

    /// Trend recording is fire-and-forget: it must never delay or fail the
    /// caller's response.
    fn record_sightings_deferred(&self, general: &[String], characters: &[String]) {
        let mut all = general.to_vec();
        all.extend_from_slice(characters);
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.record_tag_sightings(&all) {
                let e = ScanError::Storage(e);
                tracing::warn!(error = %e, "deferred tag sighting recording failed");
            }
        });
    }

    async fn fingerprint_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut inflight = self.inflight.lock().await;
        // Drop locks nobody is holding anymore.
        inflight.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(inflight.entry(fingerprint.to_string()).or_default())
    }
}
