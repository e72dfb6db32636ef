use std::time::Duration;

use serde::Deserialize;

/// Origin guarded by the bot challenge; session minting navigates here.
pub const BASE_ORIGIN: &str = "https://animepahe.ru";

/// Markers found in the leading body bytes of a challenge interstitial.
pub const CHALLENGE_MARKERS: &[&str] = &["ddos-guard", "js-challenge"];

/// How many leading body bytes to inspect for challenge markers.
pub const CHALLENGE_SNIFF_BYTES: usize = 1000;

/// Marker that disappears from page source once the challenge is solved.
pub const CHALLENGE_PAGE_MARKER: &str = "DDoS-Guard";

/// Cookie name prefix that signals a solved challenge.
pub const CHALLENGE_COOKIE_PREFIX: &str = "__ddg";

/// Selector that proves the real site rendered behind the challenge.
pub const SITE_READY_SELECTOR: &str = "input[type='search'], input#search, .search";

/// Bound on waiting for the site-ready selector during minting.
pub const SITE_READY_WAIT: Duration = Duration::from_secs(8);

/// Overall bound on waiting for the challenge to clear during minting.
pub const CHALLENGE_CLEAR_TIMEOUT: Duration = Duration::from_secs(20);

/// Sampling interval while polling for challenge clearance.
pub const CHALLENGE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// User agent presented by the authorized HTTP session.
pub const SESSION_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Continue affordance on interstitial pages.
pub const CONTINUE_SELECTOR: &str = ".redirect";

/// Bound on waiting for the continue affordance to become visible.
pub const CONTINUE_VISIBLE_WAIT: Duration = Duration::from_secs(60);

/// Settle time before clicking — sites arm the control after a delay.
pub const CONTINUE_SETTLE: Duration = Duration::from_secs(6);

/// Click attempts for the continue affordance and the submit lookup.
pub const CLICK_RETRIES: u32 = 3;

/// Pause between click attempts when the target was covered.
pub const CLICK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Path segment that marks a direct-download terminal URL.
pub const DIRECT_PATH_MARKER: &str = "/d/";

/// File extension that marks a direct-download terminal URL.
pub const DIRECT_EXTENSION: &str = ".mp4";

/// Known secondary host that terminates the redirect chain.
pub const SECONDARY_HOST: &str = "kwik.si";

/// Deadline for the terminal-URL race.
pub const TERMINAL_DEADLINE: Duration = Duration::from_secs(30);

/// Polling interval for the terminal-URL race.
pub const TERMINAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Title element used for best-effort filename extraction.
pub const TITLE_SELECTOR: &str = ".title";

/// Bound on waiting for the title element.
pub const TITLE_WAIT: Duration = Duration::from_secs(10);

/// Submit control whose ancestor form carries the authoritative action URL.
pub const SUBMIT_SELECTOR: &str = "button[type='submit']";

/// Per-attempt bound on the submit-control lookup.
pub const SUBMIT_WAIT: Duration = Duration::from_secs(45);

/// Interval for visibility polls inside bounded element waits.
pub const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Fallback filename when the resolver could not extract a title.
pub const FALLBACK_FILENAME: &str = "episode.mp4";

/// Load affordance on play pages that reveals the resolution menu.
pub const LOAD_PLAYER_SELECTOR: &str = "div.click-to-load";

/// Resolution menu revealed by the load affordance.
pub const RESOLUTION_MENU_SELECTOR: &str = "#resolutionMenu button.dropdown-item";

/// Bound on waiting for the resolution menu to appear.
pub const RESOLUTION_MENU_WAIT: Duration = Duration::from_secs(10);

/// Attempts for browser instance creation before giving up.
pub const BROWSER_CREATE_RETRIES: u32 = 3;

/// Pause after a successful launch so the instance is fully initialized.
pub const BROWSER_CREATION_DELAY: Duration = Duration::from_millis(500);

/// Pause between failed launch attempts.
pub const BROWSER_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Retry policy for one transfer: bounded attempts and bounded wall clock,
/// fixed backoff between attempts.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Fixed delay between attempts, in seconds.
    pub backoff_secs: u64,
    /// Cap on total elapsed time across all attempts, in seconds.
    pub max_elapsed_secs: u64,
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            backoff_secs: 10,
            max_elapsed_secs: 2 * 60 * 60,
        }
    }
}

/// Top-level configuration for the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Origin of the protected site.
    pub base_origin: String,
    /// Whether browser instances run headless.
    pub headless: bool,
    /// Retry policy applied to resumable transfers.
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_origin: BASE_ORIGIN.to_string(),
            headless: true,
            retry: RetryConfig::default(),
        }
    }
}
