// Authorized HTTP session — detects challenge interstitials and refreshes
// credentials through the browser surface, at most once per request.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION, CONTENT_TYPE, REFERER};
use reqwest::{Client, StatusCode, Url};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::{BrowserSurface, SurfaceProvider};
use crate::config::{
    CHALLENGE_CLEAR_TIMEOUT, CHALLENGE_COOKIE_PREFIX, CHALLENGE_MARKERS, CHALLENGE_PAGE_MARKER,
    CHALLENGE_POLL_INTERVAL, CHALLENGE_SNIFF_BYTES, ELEMENT_POLL_INTERVAL, SESSION_USER_AGENT,
    SITE_READY_SELECTOR, SITE_READY_WAIT,
};
use crate::error::PipelineError;

/// Classify a response as a bot-challenge interstitial: a non-structured
/// content type whose leading body bytes carry a known marker, or a 403.
pub fn looks_like_challenge(status: u16, content_type: Option<&str>, body: &[u8]) -> bool {
    if status == 403 {
        return true;
    }
    if let Some(ct) = content_type {
        if ct.contains("application/json") {
            return false;
        }
    }
    let head = &body[..body.len().min(CHALLENGE_SNIFF_BYTES)];
    let head = String::from_utf8_lossy(head).to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| head.contains(m))
}

/// A buffered response. The body is read eagerly because challenge
/// classification inspects its leading bytes.
#[derive(Debug)]
pub struct SessionResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl SessionResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).context("decode response body")
    }

    fn is_challenge(&self) -> bool {
        looks_like_challenge(self.status.as_u16(), self.content_type(), &self.body)
    }
}

/// One authorized HTTP client: cookie jar minted by the browser plus fixed
/// default headers. Replaced wholesale on challenge, never mutated.
struct AuthorizedSession {
    client: Client,
}

impl AuthorizedSession {
    fn from_cookies(origin: &str, cookies: &HashMap<String, String>) -> Result<Self> {
        let origin_url: Url = origin.parse().context("parse base origin")?;

        let jar = Arc::new(Jar::default());
        for (name, value) in cookies {
            jar.add_cookie_str(&format!("{name}={value}"), &origin_url);
        }

        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_str(&format!("{origin}/"))?);
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert("X-Requested-With", HeaderValue::from_static("XMLHttpRequest"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        let client = Client::builder()
            .user_agent(SESSION_USER_AGENT)
            .default_headers(headers)
            .cookie_provider(jar)
            .build()
            .context("build http client")?;

        Ok(Self { client })
    }
}

pub struct SessionManager {
    provider: Arc<dyn SurfaceProvider>,
    base_origin: String,
    session: RwLock<Option<Arc<AuthorizedSession>>>,
    // Serializes minting so concurrent challenged requests refresh once.
    refresh_lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn SurfaceProvider>, base_origin: impl Into<String>) -> Self {
        Self {
            provider,
            base_origin: base_origin.into(),
            session: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Issue a GET, transparently refreshing credentials on a challenge and
    /// retrying exactly once. A second challenge is surfaced as fatal.
    /// Connection-level errors propagate unchanged.
    pub async fn get(&self, url: &str) -> Result<SessionResponse, PipelineError> {
        let session = self.current_session().await?;
        let resp = Self::issue(&session.client, url).await?;
        if !resp.is_challenge() {
            return Ok(resp);
        }

        warn!("challenge detected for {} (HTTP {}), refreshing session", url, resp.status);
        self.refresh(&session).await?;

        let session = self.current_session().await?;
        let resp = Self::issue(&session.client, url).await?;
        if resp.is_challenge() {
            return Err(PipelineError::ChallengeLoop {
                status: resp.status.as_u16(),
            });
        }
        Ok(resp)
    }

    async fn issue(client: &Client, url: &str) -> Result<SessionResponse> {
        let resp = client.get(url).send().await.context("network error")?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.context("network error reading body")?;
        Ok(SessionResponse {
            status,
            headers,
            body,
        })
    }

    async fn current_session(&self) -> Result<Arc<AuthorizedSession>> {
        if let Some(session) = self.session.read().await.as_ref() {
            return Ok(Arc::clone(session));
        }
        self.mint_if_stale(None).await
    }

    async fn refresh(&self, stale: &Arc<AuthorizedSession>) -> Result<()> {
        self.mint_if_stale(Some(stale)).await?;
        Ok(())
    }

    /// Mint a fresh session unless another task already replaced `stale`.
    /// Replacement is a single atomic swap; callers never observe a
    /// half-updated session.
    async fn mint_if_stale(
        &self,
        stale: Option<&Arc<AuthorizedSession>>,
    ) -> Result<Arc<AuthorizedSession>> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.session.read().await.as_ref() {
            let already_fresh = match stale {
                Some(stale) => !Arc::ptr_eq(current, stale),
                None => true,
            };
            if already_fresh {
                return Ok(Arc::clone(current));
            }
        }

        let cookies = self.mint_cookies().await?;
        let fresh = Arc::new(AuthorizedSession::from_cookies(&self.base_origin, &cookies)?);
        *self.session.write().await = Some(Arc::clone(&fresh));
        info!("authorized session replaced ({} cookies)", cookies.len());
        Ok(fresh)
    }

    /// Drive the browser to the origin and wait for the challenge to clear,
    /// then snapshot the cookies. The surface is torn down on every path.
    async fn mint_cookies(&self) -> Result<HashMap<String, String>> {
        let surface = self.provider.acquire().await?;
        let result = self.wait_for_clearance(surface.as_ref()).await;
        let quit_result = surface.quit().await;
        let cookies = result?;
        if let Err(e) = quit_result {
            warn!("browser teardown after minting failed: {}", e);
        }
        Ok(cookies)
    }

    async fn wait_for_clearance(
        &self,
        surface: &dyn BrowserSurface,
    ) -> Result<HashMap<String, String>> {
        surface.navigate(&self.base_origin).await?;

        // Fast path: the real site rendered.
        let ready_deadline = Instant::now() + SITE_READY_WAIT;
        while Instant::now() < ready_deadline {
            match surface.find_elements(SITE_READY_SELECTOR).await {
                Ok(found) if !found.is_empty() => {
                    debug!("site ready marker found");
                    return surface.cookies().await;
                }
                _ => tokio::time::sleep(ELEMENT_POLL_INTERVAL).await,
            }
        }

        // Slow path: poll for marker disappearance or a solved-challenge
        // cookie, whichever first.
        let deadline = Instant::now() + CHALLENGE_CLEAR_TIMEOUT;
        while Instant::now() < deadline {
            let html = surface.page_source().await.unwrap_or_default();
            if !html.contains(CHALLENGE_PAGE_MARKER) {
                debug!("challenge marker gone from page source");
                return surface.cookies().await;
            }
            let cookies = surface.cookies().await.unwrap_or_default();
            if cookies.keys().any(|n| n.starts_with(CHALLENGE_COOKIE_PREFIX)) {
                debug!("challenge-solved cookie present");
                return Ok(cookies);
            }
            tokio::time::sleep(CHALLENGE_POLL_INTERVAL).await;
        }

        Err(anyhow!(
            "challenge did not clear within {:?}",
            CHALLENGE_CLEAR_TIMEOUT
        ))
    }
}
