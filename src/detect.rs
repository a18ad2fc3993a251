//! Detection entry point for a single image element.
//!
//! classify → resolve URL (or watch attributes) → dedup → gate (or watch
//! load) → enqueue. Watchers re-enter [`Detector::process`] exactly once.

use std::sync::Arc;
use tracing::debug;

use crate::dom::{Document, ImageElement};
use crate::gate::{ImageGate, RejectReason, Verdict};
use crate::models::{CandidateImage, ImageId};
use crate::queue::{EnqueueOutcome, UpscaleQueue};
use crate::resolver::Watchers;
use crate::sites::SiteHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Enqueued,
    /// Already processed, queued, in flight, refused, or the pipeline is off.
    Skipped,
    AlreadyUpscaled,
    NotManga,
    /// No real URL yet; an attribute watcher is (or already was) armed.
    AwaitingUrl,
    /// Dimensions unknown; a load watcher is (or already was) armed.
    AwaitingLoad,
    Rejected(RejectReason),
}

#[derive(Clone)]
pub struct Detector {
    site: Arc<SiteHandler>,
    gate: Arc<ImageGate>,
    watchers: Watchers,
    queue: Arc<UpscaleQueue>,
}

impl Detector {
    pub fn new(site: Arc<SiteHandler>, gate: Arc<ImageGate>, watchers: Watchers, queue: Arc<UpscaleQueue>) -> Self {
        Self {
            site,
            gate,
            watchers,
            queue,
        }
    }

    pub fn site(&self) -> &SiteHandler {
        &self.site
    }

    pub fn watchers(&self) -> &Watchers {
        &self.watchers
    }

    pub fn process(&self, element: &ImageElement) -> Detection {
        if !self.queue.is_active() {
            return Detection::Skipped;
        }
        if element.is_upscaled() {
            return Detection::AlreadyUpscaled;
        }
        if !self.site.is_manga_image(element) {
            return Detection::NotManga;
        }

        let url = match self.site.get_image_url(element) {
            Some(url) => url,
            None => {
                let detector = self.clone();
                let watched = element.clone();
                let armed = self.watchers.observe(element, self.site.url_attributes(), move || async move {
                    detector.process(&watched);
                });
                debug!("[DETECT] element {} has no URL yet (watcher armed: {})", element.node_id(), armed);
                return Detection::AwaitingUrl;
            }
        };

        if !self.queue.accepts(ImageId::from_url(&url)) {
            return Detection::Skipped;
        }

        match self.gate.meets_criteria(element, &url) {
            Verdict::Eligible { width, height } => {
                match self.queue.enqueue(CandidateImage::new(element.clone(), url, width, height)) {
                    EnqueueOutcome::Enqueued { .. } => Detection::Enqueued,
                    _ => Detection::Skipped,
                }
            }
            Verdict::NotLoaded => {
                let detector = self.clone();
                let watched = element.clone();
                self.watchers.on_load(element, move || async move {
                    detector.process(&watched);
                });
                Detection::AwaitingLoad
            }
            Verdict::Rejected(reason) => {
                debug!("[DETECT] {} rejected: {:?}", url, reason);
                Detection::Rejected(reason)
            }
        }
    }

    /// Runs detection over every image of a reading page. Returns how many
    /// were enqueued, or `None` when the page is not a reading page.
    pub fn scan(&self, document: &Document) -> Option<usize> {
        if !self.site.is_reading_page(document) {
            debug!("[DETECT] {} is not a reading page", document.location());
            return None;
        }
        let enqueued = document
            .images()
            .iter()
            .filter(|element| self.process(element) == Detection::Enqueued)
            .count();
        Some(enqueued)
    }
}
