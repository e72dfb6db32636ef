// Chromium-backed browser surface — drives one page over CDP.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::surface::{BrowserSurface, ElementRef};

/// Hides the automation marker that challenge scripts probe for.
const STEALTH_SNIPPET: &str =
    "Object.defineProperty(navigator, 'webdriver', {get: () => undefined})";

pub struct ChromeSurface {
    browser: Mutex<Option<Browser>>,
    page: Page,
    handler_task: JoinHandle<()>,
    elements: Mutex<HashMap<u64, Arc<Element>>>,
    next_ref: AtomicU64,
    // Unique per-instance profile dir; simultaneous instances must never
    // share profile storage. Removed on quit/drop.
    user_data_dir: parking_lot::Mutex<Option<TempDir>>,
}

impl ChromeSurface {
    /// Launch a fresh Chromium with its own scratch profile directory.
    pub async fn launch(headless: bool) -> Result<Self> {
        let user_data_dir =
            TempDir::with_prefix("chrome-profile-").context("create profile dir")?;

        let mut builder = BrowserConfig::builder()
            .user_data_dir(user_data_dir.path())
            .no_sandbox()
            .window_size(1366, 768)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-extensions");
        if !headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(|e| anyhow!("browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("launch browser")?;

        let handler_task = tokio::spawn(async move {
            while handler.next().await.is_some() {}
        });

        let page = browser
            .new_page("about:blank")
            .await
            .context("open initial page")?;

        if let Err(e) = page.evaluate(STEALTH_SNIPPET).await {
            debug!("stealth snippet failed: {}", e);
        }

        debug!(
            "browser launched, profile dir {}",
            user_data_dir.path().display()
        );

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
            handler_task,
            elements: Mutex::new(HashMap::new()),
            next_ref: AtomicU64::new(1),
            user_data_dir: parking_lot::Mutex::new(Some(user_data_dir)),
        })
    }

    async fn element(&self, element: ElementRef) -> Result<Arc<Element>> {
        self.elements
            .lock()
            .await
            .get(&element.0)
            .cloned()
            .ok_or_else(|| anyhow!("stale element handle {:?}", element))
    }
}

#[async_trait]
impl BrowserSurface for ChromeSurface {
    async fn navigate(&self, url: &str) -> Result<()> {
        // Handles from the previous document are useless after navigation.
        self.elements.lock().await.clear();
        self.page
            .goto(url)
            .await
            .with_context(|| format!("navigate to {url}"))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let url = self.page.url().await?;
        Ok(url.unwrap_or_default())
    }

    async fn page_source(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    async fn find_elements(&self, selector: &str) -> Result<Vec<ElementRef>> {
        let found = self.page.find_elements(selector).await.unwrap_or_default();
        let mut registry = self.elements.lock().await;
        let mut refs = Vec::with_capacity(found.len());
        for el in found {
            let id = self.next_ref.fetch_add(1, Ordering::Relaxed);
            registry.insert(id, Arc::new(el));
            refs.push(ElementRef(id));
        }
        Ok(refs)
    }

    async fn is_visible(&self, element: ElementRef) -> Result<bool> {
        let el = self.element(element).await?;
        Ok(el.clickable_point().await.is_ok())
    }

    async fn click(&self, element: ElementRef) -> Result<()> {
        let el = self.element(element).await?;
        if let Err(e) = el.scroll_into_view().await {
            debug!("scroll_into_view failed: {}", e);
        }
        match el.click().await {
            Ok(_) => Ok(()),
            Err(native_err) => {
                // Covered or moving targets often still accept a JS click.
                debug!("native click failed ({}), trying JS click", native_err);
                el.call_js_fn("function() { this.click(); }", false)
                    .await
                    .map_err(|js_err| {
                        anyhow!("click failed: native: {native_err}; js: {js_err}")
                    })?;
                Ok(())
            }
        }
    }

    async fn attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>> {
        let el = self.element(element).await?;
        Ok(el.attribute(name).await?)
    }

    async fn text(&self, element: ElementRef) -> Result<String> {
        let el = self.element(element).await?;
        Ok(el.inner_text().await?.unwrap_or_default())
    }

    async fn cookies(&self) -> Result<HashMap<String, String>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect())
    }

    async fn run_script(&self, snippet: &str) -> Result<serde_json::Value> {
        let result = self.page.evaluate(snippet).await?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn close_extra_tabs(&self) -> Result<()> {
        let guard = self.browser.lock().await;
        let browser = guard.as_ref().ok_or_else(|| anyhow!("browser already quit"))?;
        let own_target = self.page.target_id().clone();
        let mut closed = 0usize;
        for page in browser.pages().await? {
            if *page.target_id() != own_target {
                if let Err(e) = page.close().await {
                    warn!("failed to close extra tab: {}", e);
                } else {
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            debug!("closed {} extra tab(s)", closed);
        }
        // Return focus to the original context.
        let _ = self.page.bring_to_front().await;
        Ok(())
    }

    async fn quit(&self) -> Result<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                warn!("browser close failed: {}", e);
            }
            let _ = browser.wait().await;
        }
        self.handler_task.abort();
        // Dropping the TempDir removes the per-instance scratch storage.
        self.user_data_dir.lock().take();
        Ok(())
    }
}

impl Drop for ChromeSurface {
    fn drop(&mut self) {
        // quit() is the normal path; this is the abort path. The child
        // process is reaped by chromiumoxide's own Drop, the profile dir
        // by TempDir's.
        self.handler_task.abort();
    }
}
