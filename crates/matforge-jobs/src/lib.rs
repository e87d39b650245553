use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// How many pending jobs the `can_finish` refusal reason previews.
const PENDING_PREVIEW_LIMIT: usize = 10;

/// Queries the backing compute service for a job's raw status string.
#[async_trait]
pub trait StatusPoller: Send + Sync {
    async fn query(&self, job_id: &str, external_ref: Option<&str>) -> anyhow::Result<String>;
}

/// Fetches results for a job that reported success.
#[async_trait]
pub trait ResultFetcher: Send + Sync {
    async fn fetch(&self, job_id: &str, external_ref: Option<&str>) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLifecycle {
    Submitted,
    Monitoring,
    Succeeded,
    Failed,
    UnknownTimeout,
}

impl JobLifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobLifecycle::Succeeded | JobLifecycle::Failed | JobLifecycle::UnknownTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobLifecycle::Submitted => "submitted",
            JobLifecycle::Monitoring => "monitoring",
            JobLifecycle::Succeeded => "succeeded",
            JobLifecycle::Failed => "failed",
            JobLifecycle::UnknownTimeout => "unknown_timeout",
        }
    }
}

/// Tracked state of one externally-submitted job. Once `lifecycle`
/// reaches a terminal value it never changes again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_ref: Option<String>,
    pub source: String,
    pub lifecycle: JobLifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_status: Option<String>,
    #[serde(default)]
    pub unknown_poll_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tracks externally-submitted jobs through their lifecycle via
/// periodic polling. Scoped to one orchestrator run; records are never
/// explicitly destroyed.
pub struct JobRegistry {
    records: RwLock<HashMap<String, JobRecord>>,
    poller: Arc<dyn StatusPoller>,
    fetcher: Arc<dyn ResultFetcher>,
    max_unknown_polls: u32,
}

impl JobRegistry {
    pub fn new(
        poller: Arc<dyn StatusPoller>,
        fetcher: Arc<dyn ResultFetcher>,
        max_unknown_polls: u32,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            poller,
            fetcher,
            max_unknown_polls: max_unknown_polls.max(1),
        }
    }

    /// Idempotent upsert. Re-submitting a known job updates its
    /// external ref and source without resetting lifecycle state.
    pub async fn record_submit(&self, job_id: &str, source: &str, external_ref: Option<&str>) {
        let mut records = self.records.write().await;
        let now = Utc::now();
        match records.get_mut(job_id) {
            Some(record) => {
                if let Some(external_ref) = external_ref {
                    record.external_ref = Some(external_ref.to_string());
                }
                record.source = source.to_string();
                record.updated_at = now;
            }
            None => {
                records.insert(
                    job_id.to_string(),
                    JobRecord {
                        job_id: job_id.to_string(),
                        external_ref: external_ref.map(str::to_string),
                        source: source.to_string(),
                        lifecycle: JobLifecycle::Submitted,
                        raw_status: None,
                        unknown_poll_count: 0,
                        results: None,
                        message: None,
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
    }

    /// Poll every non-terminal record once and advance its lifecycle.
    ///
    /// A poller error for one job is caught, recorded as `message`, and
    /// counted as an unknown poll; it never affects other jobs or
    /// propagates to the caller.
    pub async fn refresh_pending(&self) {
        let pending: Vec<(String, Option<String>)> = {
            let records = self.records.read().await;
            records
                .values()
                .filter(|r| !r.lifecycle.is_terminal())
                .map(|r| (r.job_id.clone(), r.external_ref.clone()))
                .collect()
        };

        for (job_id, external_ref) in pending {
            let polled = self
                .poller
                .query(&job_id, external_ref.as_deref())
                .await;

            let (raw_status, poll_error) = match polled {
                Ok(raw) => (Some(raw), None),
                Err(err) => (None, Some(format!("status poll failed: {:#}", err))),
            };

            let transition = classify_raw_status(raw_status.as_deref());

            // Success results are fetched outside the registry lock;
            // a fetch failure is recorded but the terminal state stays.
            let mut fetched: Option<Value> = None;
            let mut fetch_error: Option<String> = None;
            if transition == StatusClass::SuccessLike {
                match self.fetcher.fetch(&job_id, external_ref.as_deref()).await {
                    Ok(results) => fetched = Some(results),
                    Err(err) => fetch_error = Some(format!("result fetch failed: {:#}", err)),
                }
            }

            let mut records = self.records.write().await;
            let Some(record) = records.get_mut(&job_id) else {
                continue;
            };
            // Re-check under the write lock; never downgrade a record
            // that went terminal while we were polling.
            if record.lifecycle.is_terminal() {
                continue;
            }

            record.raw_status = raw_status.clone();
            record.updated_at = Utc::now();
            if let Some(message) = poll_error.clone() {
                record.message = Some(message);
            }

            match transition {
                StatusClass::RunningLike => {
                    record.lifecycle = JobLifecycle::Monitoring;
                    record.unknown_poll_count = 0;
                }
                StatusClass::SuccessLike => {
                    record.lifecycle = JobLifecycle::Succeeded;
                    record.results = fetched;
                    if let Some(message) = fetch_error {
                        tracing::warn!(job_id = %job_id, "{}", message);
                        record.message = Some(message);
                    }
                }
                StatusClass::FailureLike => {
                    record.lifecycle = JobLifecycle::Failed;
                }
                StatusClass::Unknown => {
                    record.unknown_poll_count += 1;
                    if record.unknown_poll_count >= self.max_unknown_polls {
                        record.lifecycle = JobLifecycle::UnknownTimeout;
                        tracing::warn!(
                            job_id = %job_id,
                            polls = record.unknown_poll_count,
                            "job status unknown after bounded polls, giving up"
                        );
                    } else {
                        record.lifecycle = JobLifecycle::Monitoring;
                    }
                }
            }
        }
    }

    /// The finish gate: true iff no record is still in a non-terminal
    /// state. The refusal reason previews the first pending jobs.
    pub async fn can_finish(&self) -> (bool, String) {
        let records = self.records.read().await;
        let mut pending: Vec<String> = records
            .values()
            .filter(|r| !r.lifecycle.is_terminal())
            .map(|r| format!("{}:{}", r.job_id, r.lifecycle.as_str()))
            .collect();
        if pending.is_empty() {
            return (true, "no outstanding jobs".to_string());
        }
        pending.sort();
        let total = pending.len();
        pending.truncate(PENDING_PREVIEW_LIMIT);
        (
            false,
            format!("{} job(s) still pending: {}", total, pending.join(", ")),
        )
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records
            .values()
            .filter(|r| !r.lifecycle.is_terminal())
            .map(|r| r.job_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.records.read().await.get(job_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<JobRecord> {
        let records = self.records.read().await;
        let mut all: Vec<JobRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        all
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    RunningLike,
    SuccessLike,
    FailureLike,
    Unknown,
}

fn classify_raw_status(raw: Option<&str>) -> StatusClass {
    let Some(raw) = raw else {
        return StatusClass::Unknown;
    };
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.starts_with("error") {
        return StatusClass::FailureLike;
    }
    match normalized.as_str() {
        "running" | "pending" | "queued" | "monitoring" | "in_progress" | "started" => {
            StatusClass::RunningLike
        }
        "success" | "succeeded" | "completed" | "complete" | "done" | "finished" => {
            StatusClass::SuccessLike
        }
        "failed" | "failure" | "cancelled" | "canceled" | "killed" | "timeout" => {
            StatusClass::FailureLike
        }
        _ => StatusClass::Unknown,
    }
}
