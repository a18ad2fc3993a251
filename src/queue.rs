//! The upscale queue.
//!
//! One worker task pulls items in page order, drives the byte extractor and
//! the upscale service, and applies or records the result. All shared page
//! state lives in [`PipelineState`] behind one mutex that is never held
//! across an `.await`.

use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{FailureClass, LiftError, Result};
use crate::extract::ByteExtractor;
use crate::models::{
    CandidateImage, ImageId, ItemSnapshot, ItemStatus, Notice, NoticeLevel, PageStats, QueueItem, SessionSummary,
    StatsSnapshot, UiEvent,
};
use crate::storage::StorageManager;
use crate::traits::{StatsStore, UpscaleService};
use crate::upscaler::ServiceMonitor;
use crate::utils::upload_extension;

const UI_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct PipelineState {
    detected: HashSet<ImageId>,
    processed: HashSet<ImageId>,
    rejected: HashSet<ImageId>,
    failures: HashMap<ImageId, u32>,
    queue: Vec<QueueItem>,
    current: Option<QueueItem>,
    recent: VecDeque<ItemSnapshot>,
    stats: PageStats,
    worker_running: bool,
    enabled: bool,
    halted: bool,
}

impl PipelineState {
    fn new() -> Self {
        Self {
            detected: HashSet::new(),
            processed: HashSet::new(),
            rejected: HashSet::new(),
            failures: HashMap::new(),
            queue: Vec::new(),
            current: None,
            recent: VecDeque::new(),
            stats: PageStats::new(),
            worker_running: false,
            enabled: true,
            halted: false,
        }
    }

    fn is_known(&self, id: ImageId) -> bool {
        self.processed.contains(&id)
            || self.queue.iter().any(|item| item.id == id)
            || self.current.as_ref().map_or(false, |item| item.id == id)
    }

    fn push_recent(&mut self, snapshot: ItemSnapshot, limit: usize) {
        self.recent.push_front(snapshot);
        self.recent.truncate(limit);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { position: usize },
    /// Already processed, queued or in flight.
    Duplicate,
    /// Permanently skipped or out of retries.
    Refused,
    Disabled,
    Halted,
}

/// Outbound UI channel with a cooldown on user-facing notices.
///
/// Each failure class has its own cooldown, so a burst of one kind never
/// hides another. Error notices always go out.
pub struct Notifier {
    tx: broadcast::Sender<UiEvent>,
    cooldown: Duration,
    last_notice: Mutex<HashMap<Option<FailureClass>, Instant>>,
}

impl Notifier {
    pub fn new(cooldown: Duration) -> Self {
        let (tx, _) = broadcast::channel(UI_CHANNEL_CAPACITY);
        Self {
            tx,
            cooldown,
            last_notice: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.tx.subscribe()
    }

    pub fn progress(&self, snapshot: StatsSnapshot) {
        // No listener is fine.
        let _ = self.tx.send(UiEvent::Progress(Box::new(snapshot)));
    }

    /// Returns whether the notice went out or was swallowed by the cooldown.
    pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) -> bool {
        if level != NoticeLevel::Error && !self.claim(None) {
            return false;
        }
        self.send(level, message.into());
        true
    }

    /// Warning for a failed item, throttled per failure class.
    pub fn failure(&self, err: &LiftError) -> bool {
        if !self.claim(Some(err.class())) {
            return false;
        }
        self.send(NoticeLevel::Warning, err.user_message());
        true
    }

    fn claim(&self, class: Option<FailureClass>) -> bool {
        let mut last = self.last_notice.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = last.get(&class) {
            if at.elapsed() < self.cooldown {
                return false;
            }
        }
        last.insert(class, Instant::now());
        true
    }

    fn send(&self, level: NoticeLevel, message: String) {
        let _ = self.tx.send(UiEvent::Notice(Notice { level, message }));
    }
}

/// Identity of the page session the queue works for.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub page_url: String,
    pub site: &'static str,
    pub needs_privileged: bool,
}

pub struct UpscaleQueue {
    state: Mutex<PipelineState>,
    info: SessionInfo,
    config: QueueConfig,
    extractor: ByteExtractor,
    service: Arc<dyn UpscaleService>,
    monitor: Arc<ServiceMonitor>,
    store: Option<Arc<dyn StatsStore>>,
    storage: Option<StorageManager>,
    notifier: Arc<Notifier>,
    idle: watch::Sender<bool>,
}

impl UpscaleQueue {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: SessionInfo,
        config: QueueConfig,
        extractor: ByteExtractor,
        service: Arc<dyn UpscaleService>,
        monitor: Arc<ServiceMonitor>,
        store: Option<Arc<dyn StatsStore>>,
        storage: Option<StorageManager>,
        notifier: Arc<Notifier>,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            state: Mutex::new(PipelineState::new()),
            info,
            config,
            extractor,
            service,
            monitor,
            store,
            storage,
            notifier,
            idle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    /// Whether `id` would be accepted right now.
    pub fn accepts(&self, id: ImageId) -> bool {
        let state = self.lock();
        state.enabled && !state.halted && !state.is_known(id) && !self.is_refused(&state, id)
    }

    fn is_refused(&self, state: &PipelineState, id: ImageId) -> bool {
        state.rejected.contains(&id) || state.failures.get(&id).copied().unwrap_or(0) >= self.config.max_attempts
    }

    /// Inserts by ascending page offset (ties keep arrival order) and makes
    /// sure a worker is running. Dedup and insert happen under one lock.
    pub fn enqueue(self: &Arc<Self>, candidate: CandidateImage) -> EnqueueOutcome {
        let id = candidate.id;
        let (outcome, snapshot) = {
            let mut state = self.lock();
            if state.halted {
                return EnqueueOutcome::Halted;
            }
            if !state.enabled {
                return EnqueueOutcome::Disabled;
            }
            if state.is_known(id) {
                return EnqueueOutcome::Duplicate;
            }
            if self.is_refused(&state, id) {
                return EnqueueOutcome::Refused;
            }

            if state.detected.insert(id) {
                state.stats.total_detected += 1;
            }
            let (width, height) = (candidate.width, candidate.height);
            let item = QueueItem::from_candidate(candidate);
            let position = state.queue.partition_point(|queued| queued.offset_top <= item.offset_top);
            debug!(
                "[QUEUE] enqueued {} ({}x{}) at position {} ({})",
                id, width, height, position, item.url
            );
            state.queue.insert(position, item);

            self.idle.send_replace(false);
            if !state.worker_running {
                state.worker_running = true;
                tokio::spawn(Arc::clone(self).run());
            }
            (EnqueueOutcome::Enqueued { position }, self.build_snapshot(&state))
        };
        self.notifier.progress(snapshot);
        outcome
    }

    async fn run(self: Arc<Self>) {
        info!("[QUEUE] worker started");
        loop {
            let item = {
                let mut state = self.lock();
                if state.halted || state.queue.is_empty() {
                    state.worker_running = false;
                    break;
                }
                let item = state.queue.remove(0);
                state.current = Some(item.clone());
                item
            };

            item.element.set_loading(true);
            let started = Instant::now();
            let result = self.process(&item).await;

            let fatal = match result {
                Ok(()) => {
                    self.complete(&item, started.elapsed());
                    false
                }
                Err(e) => self.fail(&item, e),
            };
            self.emit_progress();

            if fatal {
                break;
            }
            tokio::time::sleep(self.config.inter_item_delay()).await;
        }

        let halted = self.lock().halted;
        if halted {
            self.idle.send_replace(true);
        } else {
            self.on_drain().await;
        }
        info!("[QUEUE] worker stopped");
    }

    async fn process(&self, item: &QueueItem) -> Result<()> {
        self.advance(item.id, ItemStatus::Fetching);
        let data = self.extractor.extract(&item.url, self.info.needs_privileged).await?;

        self.advance(item.id, ItemStatus::Converting);
        if data.len() > self.config.max_image_bytes {
            return Err(LiftError::Oversize {
                bytes: data.len(),
                limit: self.config.max_image_bytes,
            });
        }
        let file_name = format!("{}.{}", item.id, upload_extension(&data));

        self.advance(item.id, ItemStatus::Uploading);
        self.monitor.ensure_available().await?;

        self.advance(item.id, ItemStatus::Processing);
        let upscaled = match self.service.upscale(data, &file_name).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.monitor.mark_unavailable();
                return Err(e);
            }
        };

        self.advance(item.id, ItemStatus::ConvertingResult);
        let url = self.result_url(item.id, &upscaled).await;
        item.element.swap_source(&url, upscaled);
        Ok(())
    }

    /// A file URL when the result was saved to disk, an in-memory blob URL otherwise.
    async fn result_url(&self, id: ImageId, data: &Bytes) -> String {
        let blob = format!("blob:mangalift/{}", id);
        let storage = match &self.storage {
            Some(storage) if storage.is_enabled() => storage,
            _ => return blob,
        };
        let sequence = self.lock().stats.total_upscaled + 1;
        match storage.save_upscaled(sequence, id, data).await {
            Ok(path) => {
                let absolute = std::fs::canonicalize(&path).unwrap_or(path);
                Url::from_file_path(&absolute).map(|u| u.to_string()).unwrap_or(blob)
            }
            Err(e) => {
                warn!("[QUEUE] could not save {}: {}", id, e);
                blob
            }
        }
    }

    fn advance(&self, id: ImageId, status: ItemStatus) {
        let snapshot = {
            let mut state = self.lock();
            match state.current.as_mut() {
                Some(item) if item.id == id && item.status.can_advance_to(status) => {
                    item.status = status;
                    item.progress = status.default_progress();
                }
                _ => return,
            }
            self.build_snapshot(&state)
        };
        self.notifier.progress(snapshot);
    }

    fn complete(&self, item: &QueueItem, elapsed: Duration) {
        let mut state = self.lock();
        state.processed.insert(item.id);
        state.failures.remove(&item.id);
        state.stats.record_success(elapsed);
        if let Some(mut done) = state.current.take() {
            done.status = ItemStatus::Completed;
            done.progress = ItemStatus::Completed.default_progress();
            state.push_recent(done.snapshot(), self.config.recent_status_limit);
        }
        info!(
            "[QUEUE] upscaled {} in {} ms ({} done)",
            item.id,
            elapsed.as_millis(),
            state.stats.total_upscaled
        );
    }

    /// Records a failed item. Returns true when the session must stop.
    fn fail(&self, item: &QueueItem, err: LiftError) -> bool {
        item.element.set_loading(false);
        let fatal = err.is_fatal();
        {
            let mut state = self.lock();
            state.stats.total_failed += 1;
            *state.failures.entry(item.id).or_insert(0) += 1;
            if matches!(err, LiftError::Oversize { .. }) {
                state.rejected.insert(item.id);
            }
            if let Some(mut failed) = state.current.take() {
                failed.status = ItemStatus::Error;
                failed.error = Some(err.to_string());
                state.push_recent(failed.snapshot(), self.config.recent_status_limit);
            }
            if fatal {
                state.halted = true;
                state.queue.clear();
                state.worker_running = false;
            }
        }

        if fatal {
            error!("[QUEUE] {}; halting page session", err);
            self.notifier
                .notice(NoticeLevel::Error, "Extension context lost. Reload the page to continue upscaling.");
        } else {
            warn!("[QUEUE] {} failed: {}", item.url, err);
            self.notifier.failure(&err);
        }
        fatal
    }

    async fn on_drain(&self) {
        {
            let state = self.lock();
            info!(
                "[QUEUE] drained: {} upscaled, {} failed of {} detected",
                state.stats.total_upscaled, state.stats.total_failed, state.stats.total_detected
            );
        }
        if let Err(e) = self.persist().await {
            warn!("[QUEUE] could not persist session stats: {}", e);
        }

        let state = self.lock();
        if !state.worker_running {
            self.idle.send_replace(true);
        }
    }

    /// Writes the current page statistics to the stats store, if any.
    pub async fn persist(&self) -> Result<()> {
        let store = match &self.store {
            Some(store) => store,
            None => return Ok(()),
        };
        let summary = {
            let state = self.lock();
            SessionSummary::from_stats(self.info.id, &self.info.page_url, self.info.site, &state.stats)
        };
        store.record_session(&summary).await
    }

    fn emit_progress(&self) {
        let snapshot = self.snapshot();
        self.notifier.progress(snapshot);
    }

    fn build_snapshot(&self, state: &PipelineState) -> StatsSnapshot {
        StatsSnapshot {
            session_id: self.info.id,
            page_url: self.info.page_url.clone(),
            enabled: state.enabled,
            server_available: self.monitor.is_available(),
            stats: state.stats.clone(),
            average_ms: state.stats.average_ms(),
            current: state.current.as_ref().map(QueueItem::snapshot),
            queue: state.queue.iter().map(QueueItem::snapshot).collect(),
            recent: state.recent.iter().cloned().collect(),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.lock();
        self.build_snapshot(&state)
    }

    pub fn is_processed(&self, id: ImageId) -> bool {
        self.lock().processed.contains(&id)
    }

    pub fn is_halted(&self) -> bool {
        self.lock().halted
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// Enabled and not halted.
    pub fn is_active(&self) -> bool {
        let state = self.lock();
        state.enabled && !state.halted
    }

    /// Disabling drops pending items; the item in flight finishes.
    pub fn set_enabled(&self, enabled: bool) -> usize {
        let dropped = {
            let mut state = self.lock();
            state.enabled = enabled;
            if enabled {
                0
            } else {
                let dropped = state.queue.len();
                state.queue.clear();
                dropped
            }
        };
        if dropped > 0 {
            info!("[QUEUE] disabled, dropped {} pending items", dropped);
        }
        self.emit_progress();
        dropped
    }

    /// Stops the worker after the current item and refuses later work.
    pub fn halt(&self) {
        let mut state = self.lock();
        state.halted = true;
        state.queue.clear();
        if !state.worker_running {
            self.idle.send_replace(true);
        }
    }

    /// Resolves once the queue is empty and the worker has stopped.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }
}
