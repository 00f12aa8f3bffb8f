//! Background model downloads.
//!
//! Jobs live in the admin process's memory only — a restart forgets them by
//! design. Each job runs as its own tokio task carrying a cancellation
//! token that is honored at every chunk, every redirect hop, and every
//! sleep; a cancelled or failed job never leaves partial files behind.
//!
//! Sharded filenames trigger set downloads: the hub repository listing is
//! filtered by the derived shard pattern, the count is asserted against the
//! filename's `-of-NNNNN` total, and the shards are fetched sequentially.
//! Failure at any shard unlinks every shard downloaded so far.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures_util::StreamExt as _;
use serde::Serialize;
use tokio::io::AsyncWriteExt as _;
use tokio_util::sync::CancellationToken;

use crate::{
    catalog::parse_shard_name,
    error::Error,
    hub::HubClient,
    store::ModelsDirProvider,
};

/// Finished jobs are evicted this long after settling.
const JOB_TTL: Duration = Duration::from_secs(5 * 60);
/// Cleanup sweep cadence.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Redirect-following bound.
const MAX_REDIRECTS: usize = 10;
/// Speed is recomputed once this much time has elapsed since the last sample.
const SPEED_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub downloaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    pub percentage: f64,
    /// Bytes per second over the recent sample window.
    pub speed: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJob {
    pub id: String,
    pub repo: String,
    pub filename: String,
    pub status: JobStatus,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobEntry {
    job: DownloadJob,
    token: CancellationToken,
}

pub struct DownloadManager {
    jobs: Mutex<HashMap<String, JobEntry>>,
    hub: Arc<HubClient>,
    models: Arc<dyn ModelsDirProvider>,
    client: reqwest::Client,
}

impl DownloadManager {
    pub fn new(hub: Arc<HubClient>, models: Arc<dyn ModelsDirProvider>) -> Self {
        // Redirects are followed by hand so each hop can honor the token
        // and clean up partials.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent("llama-fleet")
            .build()
            .expect("failed to build download client");
        Self {
            jobs: Mutex::new(HashMap::new()),
            hub,
            models,
            client,
        }
    }

    /// Register a job and launch its background task. Returns immediately.
    pub fn create(self: &Arc<Self>, repo: &str, filename: &str) -> DownloadJob {
        let job = DownloadJob {
            id: uuid::Uuid::new_v4().to_string(),
            repo: repo.to_string(),
            filename: filename.to_string(),
            status: JobStatus::Pending,
            progress: Progress::default(),
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        let token = CancellationToken::new();
        self.jobs.lock().expect("jobs lock").insert(
            job.id.clone(),
            JobEntry {
                job: job.clone(),
                token: token.clone(),
            },
        );

        let manager = Arc::clone(self);
        let id = job.id.clone();
        let repo = repo.to_string();
        let filename = filename.to_string();
        tokio::spawn(async move {
            manager.run(&id, &repo, &filename, token).await;
        });

        job
    }

    pub fn list(&self) -> Vec<DownloadJob> {
        let mut jobs: Vec<DownloadJob> = self
            .jobs
            .lock()
            .expect("jobs lock")
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    pub fn get(&self, id: &str) -> Option<DownloadJob> {
        self.jobs
            .lock()
            .expect("jobs lock")
            .get(id)
            .map(|e| e.job.clone())
    }

    /// Request cancellation. The job settles to `cancelled` at its next
    /// token check; the live request is torn down by the worker task.
    pub fn cancel(&self, id: &str) -> Result<DownloadJob, Error> {
        let jobs = self.jobs.lock().expect("jobs lock");
        let entry = jobs
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("download job {id} not found")))?;
        if entry.job.status.is_finished() {
            return Err(Error::Conflict(format!(
                "download job {id} has already finished"
            )));
        }
        entry.token.cancel();
        Ok(entry.job.clone())
    }

    /// Drop finished jobs that settled more than five minutes ago.
    pub fn evict_expired(&self) {
        let cutoff = Utc::now() - chrono::Duration::from_std(JOB_TTL).expect("ttl fits");
        self.jobs.lock().expect("jobs lock").retain(|_, entry| {
            !(entry.job.status.is_finished()
                && entry.job.finished_at.is_some_and(|t| t < cutoff))
        });
    }

    /// Background sweep evicting expired jobs every minute.
    pub fn spawn_cleanup_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.evict_expired();
            }
        });
    }

    // -------------------------------------------------------------------
    // Worker
    // -------------------------------------------------------------------

    fn update<F: FnOnce(&mut DownloadJob)>(&self, id: &str, f: F) {
        if let Some(entry) = self.jobs.lock().expect("jobs lock").get_mut(id) {
            f(&mut entry.job);
        }
    }

    async fn run(self: &Arc<Self>, id: &str, repo: &str, filename: &str, token: CancellationToken) {
        self.update(id, |job| job.status = JobStatus::Downloading);

        let result = if let Some(shard) = parse_shard_name(filename) {
            self.download_shard_set(id, repo, &shard.base, shard.total, &token)
                .await
        } else {
            let dest = self.models.models_dir().join(filename);
            let url = self.hub.resolve_url(repo, filename);
            self.download_file(id, &url, &dest, &token).await
        };

        match result {
            Ok(()) => {
                tracing::info!(job = id, repo, filename, "download completed");
                self.update(id, |job| {
                    job.status = JobStatus::Completed;
                    job.progress.percentage = 100.0;
                    job.finished_at = Some(Utc::now());
                });
            }
            Err(Outcome::Cancelled) => {
                tracing::info!(job = id, repo, filename, "download cancelled");
                self.update(id, |job| {
                    job.status = JobStatus::Cancelled;
                    job.finished_at = Some(Utc::now());
                });
            }
            Err(Outcome::Failed(e)) => {
                tracing::warn!(job = id, repo, filename, error = %e, "download failed");
                self.update(id, |job| {
                    job.status = JobStatus::Failed;
                    job.error = Some(e.to_string());
                    job.finished_at = Some(Utc::now());
                });
            }
        }
    }

    async fn download_shard_set(
        self: &Arc<Self>,
        id: &str,
        repo: &str,
        base: &str,
        total: u32,
        token: &CancellationToken,
    ) -> Result<(), Outcome> {
        let files = self
            .hub
            .list_repo_files(repo)
            .await
            .map_err(|e| Outcome::Failed(e.into()))?;

        let mut shards: Vec<(u32, String)> = files
            .into_iter()
            .filter_map(|f| {
                let shard = parse_shard_name(&f)?;
                (shard.base.eq_ignore_ascii_case(base) && shard.total == total)
                    .then_some((shard.index, f))
            })
            .collect();
        shards.sort_by_key(|(index, _)| *index);

        if shards.len() as u32 != total {
            return Err(Outcome::Failed(anyhow::anyhow!(
                "repository lists {} shard(s) for {base}, expected {total}",
                shards.len()
            )));
        }

        let dir = self.models.models_dir();
        let mut completed: Vec<PathBuf> = Vec::new();

        for (_, shard_file) in &shards {
            let dest = dir.join(shard_file);
            let url = self.hub.resolve_url(repo, shard_file);
            if let Err(outcome) = self.download_file(id, &url, &dest, token).await {
                // All-or-nothing: the partial set is useless, remove it.
                for path in &completed {
                    let _ = tokio::fs::remove_file(path).await;
                }
                return Err(outcome);
            }
            completed.push(dest);
        }
        Ok(())
    }

    /// Download one file, following redirects by hand. On cancellation or
    /// failure the partial destination file is unlinked.
    async fn download_file(
        &self,
        id: &str,
        entry_url: &str,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<(), Outcome> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("creating models directory")
                .map_err(|e| Outcome::Failed(e))?;
        }

        let mut url = entry_url.to_string();
        for _hop in 0..MAX_REDIRECTS {
            if token.is_cancelled() {
                remove_partial(dest).await;
                return Err(Outcome::Cancelled);
            }

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("GET {url}"))
                .map_err(|e| Outcome::Failed(e))?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        Outcome::Failed(anyhow::anyhow!("redirect without Location from {url}"))
                    })?;
                url = absolutize_location(&url, location);
                // Each hop starts over; drop anything a prior hop wrote.
                remove_partial(dest).await;
                continue;
            }

            if !response.status().is_success() {
                remove_partial(dest).await;
                return Err(Outcome::Failed(anyhow::anyhow!(
                    "download returned HTTP {} for {url}",
                    response.status()
                )));
            }

            return self.stream_to_file(id, response, dest, token).await;
        }

        remove_partial(dest).await;
        Err(Outcome::Failed(anyhow::anyhow!(
            "more than {MAX_REDIRECTS} redirects from {entry_url}"
        )))
    }

    async fn stream_to_file(
        &self,
        id: &str,
        response: reqwest::Response,
        dest: &Path,
        token: &CancellationToken,
    ) -> Result<(), Outcome> {
        let content_length = response.content_length();
        // Shard sets accumulate totals file by file.
        self.update(id, |job| {
            if let Some(len) = content_length {
                job.progress.total = Some(job.progress.total.unwrap_or(0) + len);
            }
        });

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))
            .map_err(|e| Outcome::Failed(e))?;

        let mut stream = response.bytes_stream();
        let mut sample_at = tokio::time::Instant::now();
        let mut sample_bytes: u64 = 0;

        loop {
            // Cancellation also tears down the in-flight request: the
            // response stream is dropped on this branch.
            let chunk = tokio::select! {
                _ = token.cancelled() => {
                    drop(stream);
                    let _ = file.flush().await;
                    remove_partial(dest).await;
                    return Err(Outcome::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    remove_partial(dest).await;
                    return Err(Outcome::Failed(
                        anyhow::Error::from(e).context("reading download stream"),
                    ));
                }
            };

            if let Err(e) = file.write_all(&chunk).await {
                remove_partial(dest).await;
                return Err(Outcome::Failed(
                    anyhow::Error::from(e).context(format!("writing {}", dest.display())),
                ));
            }

            sample_bytes += chunk.len() as u64;
            let elapsed = sample_at.elapsed();
            let sample_due = elapsed >= SPEED_SAMPLE_WINDOW;
            self.update(id, |job| {
                job.progress.downloaded += chunk.len() as u64;
                if let Some(total) = job.progress.total.filter(|t| *t > 0) {
                    job.progress.percentage =
                        (job.progress.downloaded as f64 / total as f64) * 100.0;
                }
                if sample_due {
                    job.progress.speed = sample_bytes as f64 / elapsed.as_secs_f64();
                }
            });
            if sample_due {
                sample_at = tokio::time::Instant::now();
                sample_bytes = 0;
            }
        }

        file.flush()
            .await
            .context("flushing download")
            .map_err(|e| Outcome::Failed(e))?;
        Ok(())
    }
}

/// Why a download stopped short of completion.
enum Outcome {
    Cancelled,
    Failed(anyhow::Error),
}

async fn remove_partial(dest: &Path) {
    if let Err(e) = tokio::fs::remove_file(dest).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(file = %dest.display(), error = %e, "could not remove partial download");
        }
    }
}

/// Resolve a possibly-relative Location header against the current URL.
fn absolutize_location(current: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    if let Some(rest) = location.strip_prefix('/') {
        if let Some(scheme_end) = current.find("://") {
            if let Some(host_end) = current[scheme_end + 3..].find('/') {
                return format!("{}/{rest}", &current[..scheme_end + 3 + host_end]);
            }
        }
        return format!("{}/{rest}", current.trim_end_matches('/'));
    }
    // Relative path: replace the final segment.
    match current.rfind('/') {
        Some(idx) if idx > "https://".len() => format!("{}/{location}", &current[..idx]),
        _ => location.to_string(),
    }
}
