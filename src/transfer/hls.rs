// Encrypted stream assembly — manifest parse, key fetch, per-segment CBC
// decrypt, raw concatenation, then an external ffmpeg remux into a playable
// container.

use std::path::{Path, PathBuf};

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use anyhow::{anyhow, bail, Context, Result};
use reqwest::Client;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::transfer::progress::ProgressReporter;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const BLOCK: usize = 16;

/// Key declaration from an `EXT-X-KEY` line.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRef {
    pub uri: String,
    /// Explicit `IV=0x…` when the manifest declares one.
    pub iv: Option<[u8; BLOCK]>,
}

/// Parsed media playlist: ordered segment URLs plus at most one key.
#[derive(Debug, Clone)]
pub struct EncryptedManifest {
    pub segments: Vec<String>,
    pub key: Option<KeyRef>,
}

/// Parse a media playlist. Segment and key URIs are resolved against the
/// manifest's own URL.
pub fn parse_manifest(text: &str, manifest_url: &str) -> Result<EncryptedManifest> {
    let base = url::Url::parse(manifest_url).context("parse manifest url")?;
    let mut segments = Vec::new();
    let mut key = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(attrs) = line.strip_prefix("#EXT-X-KEY:") {
            if attr_value(attrs, "METHOD").as_deref() == Some("NONE") {
                continue;
            }
            let uri = attr_value(attrs, "URI")
                .ok_or_else(|| anyhow!("EXT-X-KEY without URI: {line}"))?;
            let iv = match attr_value(attrs, "IV") {
                Some(hex) => Some(parse_iv(&hex)?),
                None => None,
            };
            key = Some(KeyRef {
                uri: base.join(&uri).context("resolve key uri")?.to_string(),
                iv,
            });
        } else if !line.starts_with('#') {
            segments.push(base.join(line).context("resolve segment uri")?.to_string());
        }
    }

    if segments.is_empty() {
        bail!("manifest lists no segments");
    }
    Ok(EncryptedManifest { segments, key })
}

/// One attribute from an `EXT-X-KEY` attribute list; quoted or bare.
fn attr_value(attrs: &str, name: &str) -> Option<String> {
    for part in split_attrs(attrs) {
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        if k.trim() == name {
            return Some(v.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Split an attribute list on commas, honoring quotes: quoted values (URIs
/// in particular) may legally contain commas.
fn split_attrs(attrs: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, ch) in attrs.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&attrs[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&attrs[start..]);
    parts
}

/// `IV=0x…` hex value into 16 bytes. The manifest is remote input, so the
/// value is validated as ASCII hex before any fixed-offset slicing.
fn parse_iv(hex: &str) -> Result<[u8; BLOCK]> {
    let hex = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")).unwrap_or(hex);
    if hex.len() != BLOCK * 2 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("IV must be {} hex chars, got {hex:?}", BLOCK * 2);
    }
    let mut iv = [0u8; BLOCK];
    for (i, byte) in iv.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).context("IV hex digit")?;
    }
    Ok(iv)
}

/// Decrypt one segment in place, carrying the CBC chain: the segment's last
/// ciphertext block becomes the next segment's IV, so the whole stream
/// decrypts as one continuous CBC run over the concatenated segments.
fn decrypt_segment(key: &[u8; BLOCK], iv: &mut [u8; BLOCK], data: &mut [u8]) -> Result<()> {
    if data.is_empty() || data.len() % BLOCK != 0 {
        bail!("segment length {} not a block multiple", data.len());
    }
    let mut next_iv = [0u8; BLOCK];
    next_iv.copy_from_slice(&data[data.len() - BLOCK..]);

    Aes128CbcDec::new(key.into(), (&*iv).into())
        .decrypt_padded_mut::<NoPadding>(data)
        .map_err(|e| anyhow!("decrypt failed: {e}"))?;

    *iv = next_iv;
    Ok(())
}

pub struct StreamAssembler {
    client: Client,
}

impl StreamAssembler {
    pub fn new() -> Result<Self> {
        let client = Client::builder().build().context("build stream client")?;
        Ok(Self { client })
    }

    /// Full pipeline for one episode: assemble the raw stream next to
    /// `output_path`, remux it, and delete the raw file on success. An
    /// encode failure preserves the raw file for inspection.
    pub async fn fetch_and_assemble(
        &self,
        manifest_url: &str,
        output_path: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let raw_path = output_path.with_extension("raw.ts");
        self.assemble_raw(manifest_url, &raw_path, reporter, cancel)
            .await?;
        self.remux(&raw_path, output_path).await?;
        if let Err(e) = tokio::fs::remove_file(&raw_path).await {
            warn!("could not remove raw file {}: {}", raw_path.display(), e);
        }
        reporter.report(1.0);
        info!("assembled {}", output_path.display());
        Ok(output_path.to_path_buf())
    }

    /// Fetch every segment in manifest order, decrypt when the manifest
    /// declares a key, and append to a single raw stream file.
    pub async fn assemble_raw(
        &self,
        manifest_url: &str,
        raw_path: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let manifest_text = self
            .fetch_text(manifest_url)
            .await
            .with_context(|| format!("fetch manifest {manifest_url}"))?;
        let manifest = parse_manifest(&manifest_text, manifest_url)?;

        let mut cipher = match &manifest.key {
            Some(key_ref) => {
                let key = self
                    .fetch_key(&key_ref.uri)
                    .await
                    .with_context(|| format!("fetch key {}", key_ref.uri))?;
                // Manifest IV when declared; key-as-IV otherwise, matching
                // the only origin this shim targets.
                let iv = key_ref.iv.unwrap_or(key);
                Some((key, iv))
            }
            None => None,
        };

        if let Some(parent) = raw_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(raw_path)
            .await
            .with_context(|| format!("create {}", raw_path.display()))?;

        let total = manifest.segments.len();
        debug!(
            "assembling {} segments ({}) into {}",
            total,
            if cipher.is_some() { "encrypted" } else { "clear" },
            raw_path.display()
        );

        for (index, segment_url) in manifest.segments.iter().enumerate() {
            if cancel.is_cancelled() {
                let _ = file.flush().await;
                return Err(PipelineError::Cancelled);
            }

            let mut data = self
                .fetch_bytes(segment_url)
                .await
                .map_err(|e| PipelineError::Segment {
                    index,
                    reason: e.to_string(),
                })?;

            if let Some((key, iv)) = cipher.as_mut() {
                decrypt_segment(key, iv, &mut data).map_err(|e| PipelineError::Segment {
                    index,
                    reason: e.to_string(),
                })?;
            }

            file.write_all(&data)
                .await
                .map_err(|e| PipelineError::Segment {
                    index,
                    reason: format!("write failed: {e}"),
                })?;
            reporter.report((index + 1) as f64 / total as f64);
        }

        file.flush().await.context("flush raw stream")?;
        Ok(())
    }

    /// Re-encode the raw stream into a standard container.
    pub async fn remux(&self, raw_path: &Path, output_path: &Path) -> Result<(), PipelineError> {
        let output = tokio::process::Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(raw_path)
            .args(["-c:v", "libx264", "-c:a", "aac", "-preset", "fast", "-crf", "23"])
            .arg(output_path)
            .output()
            .await
            .map_err(|e| PipelineError::Encode {
                raw_path: raw_path.to_path_buf(),
                reason: format!("could not run ffmpeg: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join(" | ");
            return Err(PipelineError::Encode {
                raw_path: raw_path.to_path_buf(),
                reason: format!("ffmpeg exited with {}: {}", output.status, tail),
            });
        }
        Ok(())
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.client.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn fetch_key(&self, url: &str) -> Result<[u8; BLOCK]> {
        let bytes = self.fetch_bytes(url).await?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("key is {} bytes, expected {}", bytes.len(), BLOCK))
    }
}
