use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::dom::ImageElement;

/// Content-derived identifier of an image: a name-based UUID of its resolved URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(Uuid);

impl ImageId {
    pub fn from_url(url: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes()))
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// An image that passed classification and the gate.
#[derive(Debug, Clone)]
pub struct CandidateImage {
    pub id: ImageId,
    pub element: ImageElement,
    pub url: String,
    pub offset_top: f64,
    pub width: u32,
    pub height: u32,
}

impl CandidateImage {
    pub fn new(element: ImageElement, url: String, width: u32, height: u32) -> Self {
        Self {
            id: ImageId::from_url(&url),
            offset_top: element.offset_top(),
            element,
            url,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Fetching,
    Converting,
    Uploading,
    Processing,
    ConvertingResult,
    Completed,
    Error,
}

impl ItemStatus {
    fn rank(self) -> u8 {
        match self {
            ItemStatus::Queued => 0,
            ItemStatus::Fetching => 1,
            ItemStatus::Converting => 2,
            ItemStatus::Uploading => 3,
            ItemStatus::Processing => 4,
            ItemStatus::ConvertingResult => 5,
            ItemStatus::Completed | ItemStatus::Error => 6,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Error)
    }

    /// Forward-only lifecycle; `Error` is reachable from any live state.
    pub fn can_advance_to(self, next: ItemStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            ItemStatus::Error => true,
            // Fetching and Converting are alternatives for the first step.
            ItemStatus::Converting if self == ItemStatus::Queued => true,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn default_progress(self) -> u8 {
        match self {
            ItemStatus::Queued => 0,
            ItemStatus::Fetching => 10,
            ItemStatus::Converting => 30,
            ItemStatus::Uploading => 50,
            ItemStatus::Processing => 70,
            ItemStatus::ConvertingResult => 90,
            ItemStatus::Completed => 100,
            ItemStatus::Error => 0,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Queued => write!(f, "queued"),
            ItemStatus::Fetching => write!(f, "fetching"),
            ItemStatus::Converting => write!(f, "converting"),
            ItemStatus::Uploading => write!(f, "uploading"),
            ItemStatus::Processing => write!(f, "processing"),
            ItemStatus::ConvertingResult => write!(f, "converting result"),
            ItemStatus::Completed => write!(f, "completed"),
            ItemStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: ImageId,
    pub element: ImageElement,
    pub url: String,
    pub status: ItemStatus,
    pub progress: u8,
    pub offset_top: f64,
    pub enqueued_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl QueueItem {
    pub fn from_candidate(candidate: CandidateImage) -> Self {
        Self {
            id: candidate.id,
            element: candidate.element,
            url: candidate.url,
            status: ItemStatus::Queued,
            progress: 0,
            offset_top: candidate.offset_top,
            enqueued_at: Utc::now(),
            error: None,
        }
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            id: self.id,
            url: self.url.clone(),
            status: self.status,
            progress: self.progress,
            enqueued_at: self.enqueued_at,
            error: self.error.clone(),
        }
    }
}

/// Serializable view of a queue item for the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemSnapshot {
    pub id: ImageId,
    pub url: String,
    pub status: ItemStatus,
    pub progress: u8,
    pub enqueued_at: DateTime<Utc>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageStats {
    pub total_detected: u32,
    pub total_upscaled: u32,
    pub total_failed: u32,
    pub elapsed_ms: Vec<u64>,
    pub session_start: DateTime<Utc>,
}

impl PageStats {
    pub fn new() -> Self {
        Self {
            total_detected: 0,
            total_upscaled: 0,
            total_failed: 0,
            elapsed_ms: Vec::new(),
            session_start: Utc::now(),
        }
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.total_upscaled += 1;
        self.elapsed_ms.push(elapsed.as_millis() as u64);
    }

    pub fn average_ms(&self) -> Option<u64> {
        if self.elapsed_ms.is_empty() {
            None
        } else {
            Some(self.elapsed_ms.iter().sum::<u64>() / self.elapsed_ms.len() as u64)
        }
    }
}

impl Default for PageStats {
    fn default() -> Self {
        Self::new()
    }
}

/// What the UI receives on every progress event and on request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub session_id: Uuid,
    pub page_url: String,
    pub enabled: bool,
    pub server_available: bool,
    pub stats: PageStats,
    pub average_ms: Option<u64>,
    pub current: Option<ItemSnapshot>,
    pub queue: Vec<ItemSnapshot>,
    pub recent: Vec<ItemSnapshot>,
}

impl StatsSnapshot {
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.queue.is_empty()
    }
}

/// Row persisted when the queue drains.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionSummary {
    pub id: String,
    pub page_url: String,
    pub site: String,
    pub total_detected: i64,
    pub total_upscaled: i64,
    pub total_failed: i64,
    pub average_ms: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn from_stats(session_id: Uuid, page_url: &str, site: &str, stats: &PageStats) -> Self {
        Self {
            id: session_id.to_string(),
            page_url: page_url.to_string(),
            site: site.to_string(),
            total_detected: stats.total_detected as i64,
            total_upscaled: stats.total_upscaled as i64,
            total_failed: stats.total_failed as i64,
            average_ms: stats.average_ms().map(|ms| ms as i64),
            started_at: stats.session_start,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

/// Outbound, fire-and-forget messages to whatever UI is listening.
#[derive(Debug, Clone)]
pub enum UiEvent {
    Progress(Box<StatsSnapshot>),
    Notice(Notice),
}

/// Inbound commands from the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiCommand {
    SetEnabled(bool),
    GetStats,
}
