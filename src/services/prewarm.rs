//! Asynchronous export pre-building.
//!
//! `prewarm` returns a transient job key immediately and runs the export
//! pipeline in a background task. Once mirror fetches complete the real
//! fingerprint is known; the job either short-circuits on an existing
//! artifact, attaches to another job already building the same
//! fingerprint, or renders the artifact itself. Both the transient key
//! and the fingerprint key resolve to the same job record afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{PrewarmJob, PrewarmState};
use crate::services::export_pipeline::{ExportParams, ExportPipeline};
use crate::utils::fingerprint::ArtifactKind;

/// Ticket returned to the caller of `prewarm`.
#[derive(Debug, Clone)]
pub struct PrewarmTicket {
    pub key: String,
    pub export_url: String,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<String, PrewarmJob>,
    /// Any key (fingerprint or transient) to the canonical job key.
    aliases: HashMap<String, String>,
}

impl Registry {
    fn resolve(&self, key: &str) -> Option<&PrewarmJob> {
        match self.aliases.get(key) {
            Some(canonical) => self.jobs.get(canonical),
            None => self.jobs.get(key),
        }
    }
}

pub struct PrewarmScheduler {
    pipeline: Arc<ExportPipeline>,
    registry: Arc<Mutex<Registry>>,
}

impl PrewarmScheduler {
    pub fn new(pipeline: Arc<ExportPipeline>) -> Self {
        Self {
            pipeline,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Start a prewarm job and return immediately.
    pub async fn prewarm(&self, params: ExportParams) -> PrewarmTicket {
        let key = Uuid::new_v4().simple().to_string();
        let export_url = export_url(&params);

        {
            let mut registry = self.registry.lock().await;
            registry.jobs.insert(
                key.clone(),
                PrewarmJob {
                    status: PrewarmState::Queued,
                    percent: 0,
                    message: "queued".to_string(),
                    started_at: Utc::now(),
                    finished_at: None,
                    export_url: export_url.clone(),
                    alias_key: None,
                },
            );
        }

        let pipeline = Arc::clone(&self.pipeline);
        let registry = Arc::clone(&self.registry);
        let job_key = key.clone();
        tokio::spawn(async move {
            run_job(pipeline, registry, job_key, params).await;
        });

        PrewarmTicket { key, export_url }
    }

    /// Look up a job by its transient key or its fingerprint.
    pub async fn status(&self, key: &str) -> Option<PrewarmJob> {
        self.registry.lock().await.resolve(key).cloned()
    }
}

async fn run_job(
    pipeline: Arc<ExportPipeline>,
    registry: Arc<Mutex<Registry>>,
    key: String,
    params: ExportParams,
) {
    update(&registry, &key, |job| {
        job.status = PrewarmState::Running;
        job.percent = 10;
        job.message = "fetching sources".to_string();
    })
    .await;

    let prepared = match pipeline.prepare(&params, ArtifactKind::ExportGz).await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!("Prewarm {} failed during assembly: {}", key, e);
            fail(&registry, &key, e.to_string()).await;
            return;
        }
    };

    // The real fingerprint is known now. Attach to an existing job for
    // the same artifact, or claim it.
    {
        let mut guard = registry.lock().await;
        if let Some(canonical) = guard.aliases.get(&prepared.digest).cloned() {
            let attachable = guard
                .jobs
                .get(&canonical)
                .map(|j| j.status != PrewarmState::Error)
                .unwrap_or(false);
            if attachable && canonical != key {
                info!(
                    "Prewarm {} attaches to job {} for fingerprint {}",
                    key, canonical, prepared.digest
                );
                guard.jobs.remove(&key);
                guard.aliases.insert(key.clone(), canonical);
                return;
            }
        }
        guard.aliases.insert(prepared.digest.clone(), key.clone());
        if let Some(job) = guard.jobs.get_mut(&key) {
            job.alias_key = Some(prepared.digest.clone());
            job.percent = 60;
            job.message = "sources assembled".to_string();
        }
    }

    if pipeline.artifact_exists(&prepared) {
        info!(
            "Prewarm {} short-circuits: artifact {} already on disk",
            key, prepared.digest
        );
        complete(&registry, &key).await;
        return;
    }

    update(&registry, &key, |job| {
        job.percent = 80;
        job.message = "rendering export".to_string();
    })
    .await;

    match pipeline.finish(&prepared, true).await {
        Ok((bytes, reused)) => {
            info!(
                "Prewarm {} done ({} bytes, reused: {})",
                key,
                bytes.len(),
                reused
            );
            complete(&registry, &key).await;
        }
        Err(e) => {
            warn!("Prewarm {} failed during render: {}", key, e);
            fail(&registry, &key, e.to_string()).await;
        }
    }
}

async fn update(
    registry: &Arc<Mutex<Registry>>,
    key: &str,
    apply: impl FnOnce(&mut PrewarmJob),
) {
    let mut guard = registry.lock().await;
    if let Some(job) = guard.jobs.get_mut(key) {
        apply(job);
    }
}

async fn complete(registry: &Arc<Mutex<Registry>>, key: &str) {
    update(registry, key, |job| {
        job.status = PrewarmState::Done;
        job.percent = 100;
        job.message = "export ready".to_string();
        job.finished_at = Some(Utc::now());
    })
    .await;
}

async fn fail(registry: &Arc<Mutex<Registry>>, key: &str, message: String) {
    update(registry, key, |job| {
        job.status = PrewarmState::Error;
        job.message = message;
        job.finished_at = Some(Utc::now());
    })
    .await;
}

/// The download URL a finished prewarm serves.
fn export_url(params: &ExportParams) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    if params.full {
        query.append_pair("full", "1");
    } else {
        if let Some(past) = params.past_days {
            query.append_pair("pastDays", &past.to_string());
        }
        if let Some(future) = params.future_days {
            query.append_pair("futureDays", &future.to_string());
        }
    }
    if let Some(playlist) = &params.playlist {
        query.append_pair("playlist", playlist);
    }
    if let Some(epg) = &params.epg {
        query.append_pair("epg", epg);
    }
    let query = query.finish();
    if query.is_empty() {
        "/epg.xml.gz".to_string()
    } else {
        format!("/epg.xml.gz?{query}")
    }
}
