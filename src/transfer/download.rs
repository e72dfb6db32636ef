// Resumable chunked download — POSTs the resolved form and streams the body
// to disk, resuming from whatever is already there on every retry.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE, RANGE};
use reqwest::Client;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{RetryConfig, FALLBACK_FILENAME};
use crate::error::PipelineError;
use crate::model::TransferDescriptor;
use crate::transfer::progress::{ProgressMeter, ProgressReporter};

pub struct HttpDownloader {
    client: Client,
    retry: RetryConfig,
}

impl HttpDownloader {
    pub fn new(retry: RetryConfig) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("build download client")?;
        Ok(Self { client, retry })
    }

    /// Download the descriptor's target into `directory`, resuming any
    /// partial file found there. On exhaustion the partial file is left in
    /// place so the next call picks up where this one stopped.
    pub async fn download(
        &self,
        descriptor: &TransferDescriptor,
        directory: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let filename = descriptor
            .filename
            .clone()
            .unwrap_or_else(|| FALLBACK_FILENAME.to_string());
        let path = directory.join(&filename);
        tokio::fs::create_dir_all(directory)
            .await
            .with_context(|| format!("create {}", directory.display()))?;

        let started = Instant::now();
        let mut last_reason = String::new();
        for attempt in 1..=self.retry.max_attempts {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if attempt > 1 {
                if started.elapsed() >= self.retry.max_elapsed() {
                    warn!("retry wall clock exhausted for {}", path.display());
                    break;
                }
                tokio::time::sleep(self.retry.backoff()).await;
            }

            match self
                .attempt(descriptor, &path, reporter, cancel)
                .await
            {
                Ok(()) => {
                    info!("downloaded {}", path.display());
                    return Ok(path);
                }
                Err(AttemptError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(AttemptError::Retryable(reason)) => {
                    warn!(
                        "download attempt {}/{} for {} failed: {}",
                        attempt,
                        self.retry.max_attempts,
                        path.display(),
                        reason
                    );
                    last_reason = reason;
                }
            }
        }

        Err(PipelineError::TransferExhausted {
            attempts: self.retry.max_attempts,
            reason: last_reason,
        })
    }

    /// One attempt. Re-stats the file so the Range header always reflects
    /// bytes actually on disk, which makes a retried attempt idempotent as
    /// long as the server honors Range semantics.
    async fn attempt(
        &self,
        descriptor: &TransferDescriptor,
        path: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let existing = tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut headers = descriptor_headers(descriptor)
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;
        if existing > 0 {
            let range = format!("bytes={existing}-");
            headers.insert(
                RANGE,
                HeaderValue::from_str(&range)
                    .map_err(|e| AttemptError::Retryable(e.to_string()))?,
            );
            debug!("resuming {} from byte {}", path.display(), existing);
        }

        let response = self
            .client
            .post(&descriptor.url)
            .headers(headers)
            .form(&descriptor.form_data)
            .send()
            .await
            .map_err(|e| AttemptError::Retryable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Retryable(format!("HTTP {status}")));
        }

        let content_length = response.content_length();
        let total = existing + content_length.unwrap_or(0);

        let mut file = if existing > 0 {
            OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .map_err(|e| AttemptError::Retryable(format!("open for append: {e}")))?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)
                .await
                .map_err(|e| AttemptError::Retryable(format!("create file: {e}")))?
        };

        let meter = ProgressMeter::new();
        meter.start(total, existing);
        reporter.report(meter.fraction());

        let mut written: u64 = 0;
        let mut last_log = Instant::now();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                let _ = file.flush().await;
                return Err(AttemptError::Cancelled);
            }
            let chunk = chunk
                .map_err(|e| AttemptError::Retryable(format!("body interrupted: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Retryable(format!("write failed: {e}")))?;
            written += chunk.len() as u64;
            meter.advance(chunk.len() as u64);
            reporter.report(meter.fraction());

            if last_log.elapsed().as_secs() >= 5 {
                let snap = meter.snapshot();
                debug!(
                    "{}: {}/{} bytes, {} B/s, eta {:?}",
                    path.display(),
                    snap.done_bytes,
                    snap.total_bytes,
                    snap.throughput_bps,
                    snap.eta
                );
                last_log = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| AttemptError::Retryable(format!("flush failed: {e}")))?;

        // A short body is a network error in disguise; the next attempt
        // resumes from the bytes that did land.
        if let Some(expected) = content_length {
            if written < expected {
                return Err(AttemptError::Retryable(format!(
                    "short body: {written} of {expected} bytes"
                )));
            }
        }

        reporter.report(1.0);
        Ok(())
    }
}

enum AttemptError {
    Retryable(String),
    Cancelled,
}

fn descriptor_headers(descriptor: &TransferDescriptor) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &descriptor.headers {
        let name: HeaderName = name.parse().with_context(|| format!("header name {name}"))?;
        headers.insert(name, HeaderValue::from_str(value).context("header value")?);
    }
    if !descriptor.cookies.is_empty() {
        let cookie = descriptor
            .cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert(COOKIE, HeaderValue::from_str(&cookie).context("cookie header")?);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn descriptor(cookies: HashMap<String, String>) -> TransferDescriptor {
        TransferDescriptor {
            url: "https://example.com/download".to_string(),
            form_data: HashMap::new(),
            cookies,
            headers: HashMap::from([(
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            )]),
            filename: None,
        }
    }

    #[test]
    fn cookie_header_joins_pairs() {
        let headers = descriptor_headers(&descriptor(HashMap::from([(
            "session".to_string(),
            "abc".to_string(),
        )])))
        .unwrap();
        assert_eq!(headers.get(COOKIE).unwrap(), "session=abc");
        assert_eq!(
            headers.get("content-type").unwrap(),
            "application/x-www-form-urlencoded"
        );
    }

    #[test]
    fn no_cookies_means_no_cookie_header() {
        let headers = descriptor_headers(&descriptor(HashMap::new())).unwrap();
        assert!(headers.get(COOKIE).is_none());
    }
}
