// Link resolution — walks the intermediate-page redirect chain in a
// controlled browser and materializes a transfer descriptor.
//
// Steps 1-4 and 6 are best-effort: their failures are logged and discarded.
// Step 5 (the form action URL) is the only mandatory field; without it
// resolution fails for the whole job.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::{BrowserSurface, ElementRef, SurfaceProvider};
use crate::config::{
    CLICK_RETRIES, CLICK_RETRY_DELAY, CONTINUE_SELECTOR, CONTINUE_SETTLE, CONTINUE_VISIBLE_WAIT,
    DIRECT_EXTENSION, DIRECT_PATH_MARKER, ELEMENT_POLL_INTERVAL, LOAD_PLAYER_SELECTOR,
    RESOLUTION_MENU_SELECTOR, RESOLUTION_MENU_WAIT, SECONDARY_HOST, SESSION_USER_AGENT,
    SUBMIT_SELECTOR, SUBMIT_WAIT, TERMINAL_DEADLINE, TERMINAL_POLL_INTERVAL, TITLE_SELECTOR,
    TITLE_WAIT,
};
use crate::error::{PipelineError, SoftError};
use crate::model::{StreamLinkInfo, TransferDescriptor};

/// Returns the action URL of the form that owns the first submit control.
const FORM_ACTION_SNIPPET: &str = "(() => { \
     const b = document.querySelector(\"button[type='submit']\"); \
     const f = b && b.closest('form'); \
     return f ? f.action : null; })()";

/// Snapshots every named input under any form; duplicate names overwrite.
const FORM_DATA_SNIPPET: &str = "(() => { \
     const out = {}; \
     document.querySelectorAll('form input[name]').forEach(i => { out[i.name] = i.value; }); \
     return out; })()";

const USER_AGENT_SNIPPET: &str = "navigator.userAgent";

/// Whether a URL already points at the downloadable artifact.
pub fn is_direct_url(url: &str) -> bool {
    if url.contains(DIRECT_PATH_MARKER) || url.ends_with(DIRECT_EXTENSION) {
        return true;
    }
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h == SECONDARY_HOST))
        .unwrap_or(false)
}

/// Filesystem-safe filename from a page title: whitespace runs become
/// underscores, path and shell-hostile characters are dropped.
pub fn sanitize_filename(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_was_sep = true;
    for ch in title.trim().chars() {
        if ch.is_whitespace() {
            if !last_was_sep {
                out.push('_');
                last_was_sep = true;
            }
        } else if matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '\0') {
            continue;
        } else {
            out.push(ch);
            last_was_sep = false;
        }
    }
    let out = out.trim_end_matches('_').to_string();
    if out.is_empty() {
        return out;
    }
    if out.to_lowercase().ends_with(DIRECT_EXTENSION) {
        out
    } else {
        format!("{out}{DIRECT_EXTENSION}")
    }
}

pub struct Resolver {
    provider: Arc<dyn SurfaceProvider>,
    base_origin: String,
}

impl Resolver {
    pub fn new(provider: Arc<dyn SurfaceProvider>, base_origin: impl Into<String>) -> Self {
        Self {
            provider,
            base_origin: base_origin.into(),
        }
    }

    /// Walk the redirect chain from an intermediate URL to a transfer
    /// descriptor. The browser surface is torn down on every path.
    pub async fn resolve(
        &self,
        intermediate_url: &str,
    ) -> Result<TransferDescriptor, PipelineError> {
        let surface = self.provider.acquire().await?;
        let result = self.run_chain(surface.as_ref(), intermediate_url).await;
        if let Err(e) = surface.quit().await {
            warn!("browser teardown after resolution failed: {}", e);
        }
        result
    }

    async fn run_chain(
        &self,
        surface: &dyn BrowserSurface,
        intermediate_url: &str,
    ) -> Result<TransferDescriptor, PipelineError> {
        if let Err(e) = self.land(surface, intermediate_url).await {
            warn!("landing on {} failed: {}", intermediate_url, e);
        }

        if let Err(e) = self.dismiss_interstitial(surface).await {
            debug!("no interstitial dismissed: {}", e);
        }
        self.enforce_single_context(surface).await;

        match self.race_to_terminal(surface).await {
            Ok(url) => debug!("terminal url reached: {}", url),
            Err(e) => warn!("terminal url race gave up: {}", e),
        }
        self.enforce_single_context(surface).await;

        let filename = match self.extract_filename(surface).await {
            Ok(name) => Some(name),
            Err(e) => {
                debug!("filename extraction skipped: {}", e);
                None
            }
        };

        let action_url = self.extract_action_url(surface).await?;
        self.enforce_single_context(surface).await;

        let descriptor = self
            .materialize(surface, action_url, filename)
            .await
            .map_err(|e| PipelineError::Resolution(e.to_string()))?;
        info!("resolved {} -> {}", intermediate_url, descriptor.url);
        Ok(descriptor)
    }

    /// Step 1: navigate and restore the single-context invariant if the
    /// landing spawned popups.
    async fn land(&self, surface: &dyn BrowserSurface, url: &str) -> Result<(), SoftError> {
        surface.navigate(url).await?;
        self.enforce_single_context(surface).await;
        Ok(())
    }

    /// Step 2: the continue affordance. Present on some paths only; sites
    /// arm the control a few seconds after it becomes visible.
    async fn dismiss_interstitial(&self, surface: &dyn BrowserSurface) -> Result<(), SoftError> {
        let element = wait_for_visible(surface, CONTINUE_SELECTOR, CONTINUE_VISIBLE_WAIT)
            .await
            .ok_or_else(|| SoftError::new("continue affordance never became visible"))?;
        tokio::time::sleep(CONTINUE_SETTLE).await;
        guarded_click(surface, element, CONTINUE_SELECTOR).await?;
        Ok(())
    }

    /// Step 3: poll the location until it matches a terminal shape.
    async fn race_to_terminal(&self, surface: &dyn BrowserSurface) -> Result<String, SoftError> {
        let deadline = Instant::now() + TERMINAL_DEADLINE;
        while Instant::now() < deadline {
            let url = surface.current_url().await.unwrap_or_default();
            if is_direct_url(&url) {
                return Ok(url);
            }
            tokio::time::sleep(TERMINAL_POLL_INTERVAL).await;
        }
        Err(SoftError::new(format!(
            "no terminal url within {TERMINAL_DEADLINE:?}"
        )))
    }

    /// Step 4: best-effort title read for the suggested filename.
    async fn extract_filename(&self, surface: &dyn BrowserSurface) -> Result<String, SoftError> {
        let element = wait_for_element(surface, TITLE_SELECTOR, TITLE_WAIT)
            .await
            .ok_or_else(|| SoftError::new("title element not found"))?;
        let title = surface.text(element).await?;
        let name = sanitize_filename(&title);
        if name.is_empty() {
            return Err(SoftError::new("title sanitized to nothing"));
        }
        Ok(name)
    }

    /// Step 5: the authoritative form action URL. The only fatal step.
    async fn extract_action_url(
        &self,
        surface: &dyn BrowserSurface,
    ) -> Result<String, PipelineError> {
        let mut last_reason = String::from("submit control never appeared");
        for attempt in 1..=CLICK_RETRIES {
            if wait_for_element(surface, SUBMIT_SELECTOR, SUBMIT_WAIT).await.is_some() {
                match surface.run_script(FORM_ACTION_SNIPPET).await {
                    Ok(serde_json::Value::String(action)) if is_absolute_url(&action) => {
                        return Ok(action);
                    }
                    Ok(other) => {
                        last_reason = format!("form action not an absolute url: {other}");
                    }
                    Err(e) => {
                        last_reason = format!("form action read failed: {e}");
                    }
                }
            }
            warn!(
                "action url attempt {}/{} failed: {}",
                attempt, CLICK_RETRIES, last_reason
            );
            if attempt < CLICK_RETRIES {
                tokio::time::sleep(CLICK_RETRY_DELAY).await;
            }
        }
        Err(PipelineError::Resolution(last_reason))
    }

    /// Step 6: snapshot cookies, form inputs, and headers.
    async fn materialize(
        &self,
        surface: &dyn BrowserSurface,
        url: String,
        filename: Option<String>,
    ) -> Result<TransferDescriptor> {
        let cookies = surface.cookies().await?;

        let form_data: HashMap<String, String> =
            match surface.run_script(FORM_DATA_SNIPPET).await {
                Ok(serde_json::Value::Object(map)) => map
                    .into_iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                    .collect(),
                _ => HashMap::new(),
            };

        let user_agent = match surface.run_script(USER_AGENT_SNIPPET).await {
            Ok(serde_json::Value::String(ua)) if !ua.is_empty() => ua,
            _ => SESSION_USER_AGENT.to_string(),
        };
        let referer = surface.current_url().await.unwrap_or_default();

        let mut headers = HashMap::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded".to_string(),
        );
        headers.insert("User-Agent".to_string(), user_agent);
        headers.insert("Referer".to_string(), referer);

        Ok(TransferDescriptor {
            url,
            form_data,
            cookies,
            headers,
            filename,
        })
    }

    /// Drive the play page for one episode and pick a stream variant.
    /// Prefers the exact quality+language match, then the active entry,
    /// then the first.
    pub async fn stream_link(
        &self,
        anime_session: &str,
        episode_session: &str,
        quality: &str,
        language: &str,
    ) -> Result<StreamLinkInfo, PipelineError> {
        let play_url = format!("{}/play/{}/{}", self.base_origin, anime_session, episode_session);

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=CLICK_RETRIES {
            let surface = self.provider.acquire().await?;
            let result = self
                .read_stream_variants(surface.as_ref(), &play_url, quality, language)
                .await;
            if let Err(e) = surface.quit().await {
                warn!("browser teardown after stream lookup failed: {}", e);
            }
            match result {
                Ok(mut info) => {
                    info.anime_session = anime_session.to_string();
                    info.episode_session = episode_session.to_string();
                    return Ok(info);
                }
                Err(e) => {
                    warn!(
                        "stream link attempt {}/{} failed: {}",
                        attempt, CLICK_RETRIES, e
                    );
                    last_err = Some(e);
                    if attempt < CLICK_RETRIES {
                        tokio::time::sleep(CLICK_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        Err(PipelineError::Resolution(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "stream link lookup failed".to_string()),
        ))
    }

    async fn read_stream_variants(
        &self,
        surface: &dyn BrowserSurface,
        play_url: &str,
        quality: &str,
        language: &str,
    ) -> Result<StreamLinkInfo> {
        surface.navigate(play_url).await?;
        self.enforce_single_context(surface).await;

        // The resolution menu is populated lazily behind a load affordance.
        if let Some(load) = wait_for_visible(surface, LOAD_PLAYER_SELECTOR, RESOLUTION_MENU_WAIT).await
        {
            if let Err(e) = guarded_click(surface, load, LOAD_PLAYER_SELECTOR).await {
                debug!("load affordance click failed: {}", e);
            }
        }

        let deadline = Instant::now() + RESOLUTION_MENU_WAIT;
        let mut buttons = Vec::new();
        while Instant::now() < deadline {
            buttons = surface.find_elements(RESOLUTION_MENU_SELECTOR).await?;
            if !buttons.is_empty() {
                break;
            }
            tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
        }
        if buttons.is_empty() {
            return Err(anyhow!("resolution menu never appeared at {play_url}"));
        }

        let mut exact = None;
        let mut active = None;
        let mut first = None;
        for button in buttons {
            let src = match surface.attribute(button, "data-src").await? {
                Some(src) if !src.is_empty() => src,
                _ => continue,
            };
            let entry = StreamLinkInfo {
                manifest_url: src,
                quality: surface
                    .attribute(button, "data-resolution")
                    .await?
                    .unwrap_or_default(),
                language: surface
                    .attribute(button, "data-audio")
                    .await?
                    .unwrap_or_default(),
                source_label: surface
                    .attribute(button, "data-fansub")
                    .await?
                    .unwrap_or_default(),
                episode_session: String::new(),
                anime_session: String::new(),
            };
            if first.is_none() {
                first = Some(entry.clone());
            }
            let is_active = surface
                .attribute(button, "class")
                .await?
                .map(|c| c.contains("active"))
                .unwrap_or(false);
            if is_active && active.is_none() {
                active = Some(entry.clone());
            }
            if entry.quality == quality && entry.language == language {
                exact = Some(entry);
                break;
            }
        }

        exact
            .or(active)
            .or(first)
            .ok_or_else(|| anyhow!("no stream variant carried a source url"))
    }

    /// Close everything but the original browsing context. Best effort;
    /// a failure here is logged, not propagated.
    async fn enforce_single_context(&self, surface: &dyn BrowserSurface) {
        if let Err(e) = surface.close_extra_tabs().await {
            warn!("could not close extra tabs: {}", e);
        }
    }
}

/// First element matching the selector, polling up to the bound.
async fn wait_for_element(
    surface: &dyn BrowserSurface,
    selector: &str,
    timeout: std::time::Duration,
) -> Option<ElementRef> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(found) = surface.find_elements(selector).await {
            if let Some(first) = found.first() {
                return Some(*first);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
    }
}

/// Like `wait_for_element`, but the element must also be visible.
async fn wait_for_visible(
    surface: &dyn BrowserSurface,
    selector: &str,
    timeout: std::time::Duration,
) -> Option<ElementRef> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(found) = surface.find_elements(selector).await {
            for element in found {
                if surface.is_visible(element).await.unwrap_or(false) {
                    return Some(element);
                }
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(ELEMENT_POLL_INTERVAL).await;
    }
}

/// Click with retries. Covered or re-rendering targets often succeed on a
/// later attempt; the handle is re-queried each time because a re-render
/// invalidates it.
async fn guarded_click(
    surface: &dyn BrowserSurface,
    element: ElementRef,
    selector: &str,
) -> Result<(), SoftError> {
    let mut target = element;
    let mut last_err = None;
    for attempt in 1..=CLICK_RETRIES {
        match surface.click(target).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("click attempt {}/{} on {} failed: {}", attempt, CLICK_RETRIES, selector, e);
                last_err = Some(e);
                if attempt < CLICK_RETRIES {
                    tokio::time::sleep(CLICK_RETRY_DELAY).await;
                    if let Ok(found) = surface.find_elements(selector).await {
                        if let Some(fresh) = found.first() {
                            target = *fresh;
                        }
                    }
                }
            }
        }
    }
    Err(SoftError(format!(
        "click on {selector} failed after {CLICK_RETRIES} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn is_absolute_url(candidate: &str) -> bool {
    matches!(Url::parse(candidate), Ok(u) if u.scheme() == "http" || u.scheme() == "https")
}
