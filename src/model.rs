use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything the transfer engine needs to authorize the actual byte
/// transfer. Produced once by the resolver, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDescriptor {
    /// Authoritative target URL (form action), always absolute.
    pub url: String,
    /// Named inputs snapshotted from the page's forms (last name wins).
    pub form_data: HashMap<String, String>,
    /// Cookies snapshotted from the browsing context.
    pub cookies: HashMap<String, String>,
    /// Fixed content type plus live user agent and current-URL referer.
    pub headers: HashMap<String, String>,
    /// Filesystem-safe filename derived from the page title, when available.
    pub filename: Option<String>,
}

/// One selected stream variant for an episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamLinkInfo {
    #[serde(rename = "m3u8_url")]
    pub manifest_url: String,
    pub quality: String,
    pub language: String,
    #[serde(rename = "fansub")]
    pub source_label: String,
    pub episode_session: String,
    pub anime_session: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are one-way; no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Snapshot of one download job as exposed to status endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: String,
    pub status: TaskStatus,
    /// Percentage in [0, 100]; reaches exactly 100 only on terminal success.
    pub progress: f64,
    /// Unit of work (episode number) currently being processed.
    pub current_unit: Option<u32>,
    pub total_units: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
