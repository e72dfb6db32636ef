// Browser instance creation — serialized process-wide through a
// single-permit construction gate.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use super::chrome::ChromeSurface;
use super::surface::BrowserSurface;
use crate::config::{BROWSER_CREATE_RETRIES, BROWSER_CREATION_DELAY, BROWSER_RETRY_DELAY};

/// Hands out browser surfaces. The indirection exists so resolvers and
/// session managers can be exercised against a fake surface in tests.
#[async_trait]
pub trait SurfaceProvider: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn BrowserSurface>>;
}

/// Single-permit gate around instance construction. Simultaneous
/// construction races on profile storage and crashes the automation layer,
/// so construction windows must never overlap; already-running instances
/// are not limited.
#[derive(Clone)]
pub struct ConstructionGate {
    permits: Arc<Semaphore>,
}

impl ConstructionGate {
    pub fn new() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for exclusive construction access. The window lasts until the
    /// returned permit is dropped.
    pub async fn enter(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| anyhow!("construction gate closed: {e}"))
    }
}

impl Default for ConstructionGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BrowserLauncher {
    gate: ConstructionGate,
    headless: bool,
}

impl BrowserLauncher {
    pub fn new(headless: bool) -> Self {
        Self::with_gate(headless, ConstructionGate::new())
    }

    /// Share one gate across several launchers in the same process.
    pub fn with_gate(headless: bool, gate: ConstructionGate) -> Self {
        Self { gate, headless }
    }
}

#[async_trait]
impl SurfaceProvider for BrowserLauncher {
    async fn acquire(&self) -> Result<Box<dyn BrowserSurface>> {
        let _permit = self.gate.enter().await?;

        let mut last_err = None;
        for attempt in 1..=BROWSER_CREATE_RETRIES {
            match ChromeSurface::launch(self.headless).await {
                Ok(surface) => {
                    // Let the instance finish initializing before use.
                    tokio::time::sleep(BROWSER_CREATION_DELAY).await;
                    return Ok(Box::new(surface));
                }
                Err(e) => {
                    warn!(
                        "browser creation attempt {}/{} failed: {}",
                        attempt, BROWSER_CREATE_RETRIES, e
                    );
                    last_err = Some(e);
                    if attempt < BROWSER_CREATE_RETRIES {
                        tokio::time::sleep(BROWSER_RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("browser creation failed")))
    }
}
