// Job orchestration — one worker task per accepted job, strictly sequential
// units inside a job, cooperative cancellation at unit boundaries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::SurfaceProvider;
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::model::StreamLinkInfo;
use crate::resolver::Resolver;
use crate::tasks::TaskTracker;
use crate::transfer::{HttpDownloader, StreamAssembler};

pub struct JobRunner {
    tracker: Arc<TaskTracker>,
    resolver: Arc<Resolver>,
    downloader: Arc<HttpDownloader>,
    assembler: Arc<StreamAssembler>,
}

impl JobRunner {
    pub fn new(config: &EngineConfig, provider: Arc<dyn SurfaceProvider>) -> Result<Self> {
        Ok(Self::from_parts(
            Arc::new(TaskTracker::new()),
            Arc::new(Resolver::new(provider, config.base_origin.clone())),
            Arc::new(HttpDownloader::new(config.retry)?),
            Arc::new(StreamAssembler::new()?),
        ))
    }

    pub fn from_parts(
        tracker: Arc<TaskTracker>,
        resolver: Arc<Resolver>,
        downloader: Arc<HttpDownloader>,
        assembler: Arc<StreamAssembler>,
    ) -> Self {
        Self {
            tracker,
            resolver,
            downloader,
            assembler,
        }
    }

    /// Status and cancel surface for callers; they poll rather than block.
    pub fn tracker(&self) -> Arc<TaskTracker> {
        Arc::clone(&self.tracker)
    }

    /// Accept a batch of intermediate URLs to resolve and download. Returns
    /// the task id immediately; work happens on a spawned worker.
    pub fn submit_download(&self, urls: Vec<String>, directory: PathBuf) -> String {
        let id = self.tracker.create(urls.len() as u32);
        let token = self.tracker.token(&id).unwrap_or_default();

        let tracker = Arc::clone(&self.tracker);
        let resolver = Arc::clone(&self.resolver);
        let downloader = Arc::clone(&self.downloader);
        let task_id = id.clone();
        tokio::spawn(async move {
            run_download_job(tracker, resolver, downloader, task_id, urls, directory, token).await;
        });
        id
    }

    /// Accept a batch of stream episodes to assemble. Episodes are processed
    /// in the order given; a missing or failing episode never aborts its
    /// siblings.
    pub fn submit_stream_batch(
        &self,
        links: HashMap<u32, StreamLinkInfo>,
        episodes: Vec<u32>,
        directory: PathBuf,
    ) -> String {
        let id = self.tracker.create(episodes.len() as u32);
        let token = self.tracker.token(&id).unwrap_or_default();

        let tracker = Arc::clone(&self.tracker);
        let assembler = Arc::clone(&self.assembler);
        let task_id = id.clone();
        tokio::spawn(async move {
            run_stream_job(tracker, assembler, task_id, links, episodes, directory, token).await;
        });
        id
    }
}

async fn run_download_job(
    tracker: Arc<TaskTracker>,
    resolver: Arc<Resolver>,
    downloader: Arc<HttpDownloader>,
    id: String,
    urls: Vec<String>,
    directory: PathBuf,
    token: CancellationToken,
) {
    tracker.mark_running(&id);
    let total = urls.len();
    if total == 0 {
        tracker.complete(&id);
        return;
    }

    let mut failures = 0usize;
    let mut last_error = String::new();
    for (index, url) in urls.iter().enumerate() {
        if token.is_cancelled() {
            return;
        }
        tracker.set_current_unit(&id, (index + 1) as u32);

        let reporter = unit_reporter(&tracker, &id, index, total);
        let result = async {
            let descriptor = resolver.resolve(url).await?;
            downloader
                .download(&descriptor, &directory, &reporter, &token)
                .await
        }
        .await;

        match result {
            Ok(path) => {
                info!("task {}: unit {}/{} done -> {}", id, index + 1, total, path.display());
                tracker.set_progress(&id, (index + 1) as f64 / total as f64 * 100.0);
            }
            Err(PipelineError::Cancelled) => return,
            Err(e) => {
                warn!("task {}: unit {}/{} failed: {}", id, index + 1, total, e);
                failures += 1;
                last_error = e.to_string();
            }
        }
    }

    finish(&tracker, &id, total, failures, last_error);
}

async fn run_stream_job(
    tracker: Arc<TaskTracker>,
    assembler: Arc<StreamAssembler>,
    id: String,
    links: HashMap<u32, StreamLinkInfo>,
    episodes: Vec<u32>,
    directory: PathBuf,
    token: CancellationToken,
) {
    tracker.mark_running(&id);
    let total = episodes.len();
    if total == 0 {
        tracker.complete(&id);
        return;
    }

    let mut failures = 0usize;
    let mut last_error = String::new();
    for (index, episode) in episodes.iter().enumerate() {
        if token.is_cancelled() {
            return;
        }
        tracker.set_current_unit(&id, *episode);

        let Some(link) = links.get(episode) else {
            warn!("task {}: episode {} has no stream link", id, episode);
            failures += 1;
            last_error = format!("episode {episode} has no stream link");
            continue;
        };

        let output = directory.join(format!("episode_{episode}.mp4"));
        let reporter = unit_reporter(&tracker, &id, index, total);
        match assembler
            .fetch_and_assemble(&link.manifest_url, &output, &reporter, &token)
            .await
        {
            Ok(path) => {
                info!("task {}: episode {} assembled -> {}", id, episode, path.display());
                tracker.set_progress(&id, (index + 1) as f64 / total as f64 * 100.0);
            }
            Err(PipelineError::Cancelled) => return,
            Err(e) => {
                warn!("task {}: episode {} failed: {}", id, episode, e);
                failures += 1;
                last_error = e.to_string();
            }
        }
    }

    finish(&tracker, &id, total, failures, last_error);
}

/// Folds a unit-local fraction into the whole-batch percentage.
fn unit_reporter(
    tracker: &Arc<TaskTracker>,
    id: &str,
    index: usize,
    total: usize,
) -> impl Fn(f64) + Send + Sync {
    let tracker = Arc::clone(tracker);
    let id = id.to_string();
    move |fraction: f64| {
        let percent = (index as f64 + fraction.clamp(0.0, 1.0)) / total as f64 * 100.0;
        tracker.set_progress(&id, percent);
    }
}

/// A batch is never all-or-nothing: partial failures complete with per-unit
/// logging; only a fully failed batch fails the task.
fn finish(tracker: &Arc<TaskTracker>, id: &str, total: usize, failures: usize, last_error: String) {
    if failures == total {
        tracker.fail(id, last_error);
    } else {
        if failures > 0 {
            warn!("task {}: completed with {}/{} failed units", id, failures, total);
        }
        tracker.complete(id);
    }
}
