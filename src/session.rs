//! One page load's worth of pipeline.
//!
//! A [`PageSession`] owns the selected site handler, the queue and its
//! state, the watchers, the mutation bridge, the health poller and the
//! privileged host. Navigation means [`PageSession::dispose`] and a new
//! session; nothing carries over.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::MutationBridge;
use crate::config::Config;
use crate::detect::Detector;
use crate::dom::Document;
use crate::error::Result;
use crate::extract::ByteExtractor;
use crate::gate::ImageGate;
use crate::host::PrivilegedHost;
use crate::models::{StatsSnapshot, UiCommand, UiEvent};
use crate::queue::{Notifier, SessionInfo, UpscaleQueue};
use crate::resolver::Watchers;
use crate::sites::SiteHandler;
use crate::storage::StorageManager;
use crate::traits::{StatsStore, UpscaleService};
use crate::upscaler::ServiceMonitor;
use crate::utils::{origin_of, HttpClient};

pub struct PageSession {
    id: Uuid,
    document: Document,
    detector: Detector,
    queue: Arc<UpscaleQueue>,
    storage: Option<StorageManager>,
    archive: bool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PageSession {
    /// Standard wiring: a privileged host fetching with the page as referer
    /// and the three-tier extractor in front of it.
    pub fn open(
        document: Document,
        config: &Config,
        service: Arc<dyn UpscaleService>,
        store: Option<Arc<dyn StatsStore>>,
    ) -> Result<Self> {
        let location = document.location();
        let fetch_timeout = config.server.request_timeout();
        let host_http = HttpClient::new(&config.extract, fetch_timeout)?;
        let (host, host_task) = PrivilegedHost::new(host_http, Some(location.to_string())).spawn();
        let extractor = ByteExtractor::standard(&config.extract, fetch_timeout, &origin_of(&location), host)?;

        let session = Self::start(document, config, extractor, service, store);
        session.track(host_task);
        Ok(session)
    }

    /// Wires a session around an existing extractor and runs the first scan.
    pub fn start(
        document: Document,
        config: &Config,
        extractor: ByteExtractor,
        service: Arc<dyn UpscaleService>,
        store: Option<Arc<dyn StatsStore>>,
    ) -> Self {
        let location = document.location();
        let site = Arc::new(SiteHandler::for_url(&location));
        let id = Uuid::new_v4();
        info!("[SESSION] {} opened for {} ({})", id, location, site.name());

        let storage = Some(StorageManager::new(&config.storage, &location)).filter(|s| s.is_enabled());
        let monitor = Arc::new(ServiceMonitor::new(service.clone()));
        let notifier = Arc::new(Notifier::new(config.queue.notification_cooldown()));
        let queue = Arc::new(UpscaleQueue::new(
            SessionInfo {
                id,
                page_url: location.to_string(),
                site: site.name(),
                needs_privileged: site.needs_privileged_fetch(),
            },
            config.queue.clone(),
            extractor,
            service,
            monitor.clone(),
            store,
            storage.clone(),
            notifier,
        ));
        let detector = Detector::new(
            site,
            Arc::new(ImageGate::new(config.gate.clone())),
            Watchers::new(),
            queue.clone(),
        );

        let session = Self {
            id,
            document: document.clone(),
            detector: detector.clone(),
            queue,
            storage,
            archive: config.storage.archive,
            tasks: Mutex::new(Vec::new()),
        };
        session.track(MutationBridge::new(document, detector).spawn());
        session.track(monitor.spawn_polling(config.server.health_interval()));
        session.rescan();
        session
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).push(task);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn site(&self) -> &SiteHandler {
        self.detector.site()
    }

    /// Where upscaled pages of this session are written, when saving is on.
    pub fn output_dir(&self) -> Option<&Path> {
        self.storage.as_ref().map(StorageManager::session_dir)
    }

    /// Full detection pass. Returns how many images were enqueued.
    pub fn rescan(&self) -> usize {
        match self.detector.scan(&self.document) {
            Some(enqueued) => {
                info!("[SESSION] scan enqueued {} images", enqueued);
                enqueued
            }
            None => 0,
        }
    }

    pub fn handle(&self, command: UiCommand) -> StatsSnapshot {
        match command {
            UiCommand::SetEnabled(true) => {
                self.queue.set_enabled(true);
                self.rescan();
            }
            UiCommand::SetEnabled(false) => {
                self.queue.set_enabled(false);
                self.detector.watchers().cancel_all();
            }
            UiCommand::GetStats => {}
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.queue.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.queue.notifier().subscribe()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Waits until no load or attribute watcher has fired for `settle` and
    /// the queue is idle.
    pub async fn wait_settled(&self, settle: Duration) {
        loop {
            self.queue.wait_idle().await;
            tokio::time::sleep(settle).await;
            if self.queue.snapshot().is_idle() {
                break;
            }
        }
    }

    /// Tears the session down: watchers, bridge, poller and host stop, the
    /// queue finishes its current item and refuses more work. Returns the
    /// archive path when archiving is on and something was saved.
    pub async fn dispose(self) -> Result<Option<PathBuf>> {
        self.detector.watchers().cancel_all();
        self.queue.halt();
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        self.queue.wait_idle().await;

        if let Err(e) = self.queue.persist().await {
            warn!("[SESSION] could not persist final stats: {}", e);
        }

        let archive = match &self.storage {
            Some(storage) if self.archive => storage.create_archive().await?,
            _ => None,
        };
        info!("[SESSION] {} disposed", self.id);
        Ok(archive)
    }
}
