use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::detect::{Detection, Detector};
use crate::dom::{Document, Mutation};

/// Feeds images from inserted subtrees back into detection.
pub struct MutationBridge {
    document: Document,
    detector: Detector,
}

impl MutationBridge {
    pub fn new(document: Document, detector: Detector) -> Self {
        Self { document, detector }
    }

    /// Subscribes before returning, so no insertion after this call is missed.
    pub fn spawn(self) -> JoinHandle<()> {
        let mutations = self.document.subscribe_mutations();
        tokio::spawn(self.run(mutations))
    }

    async fn run(self, mut mutations: tokio::sync::broadcast::Receiver<Mutation>) {
        info!("[BRIDGE] watching {} for inserted images", self.document.location());
        loop {
            match mutations.recv().await {
                Ok(Mutation::Inserted(images)) => {
                    if !self.detector.site().is_reading_page(&self.document) {
                        debug!("[BRIDGE] {} images inserted outside a reading page", images.len());
                        continue;
                    }
                    let enqueued = images
                        .iter()
                        .filter(|element| self.detector.process(element) == Detection::Enqueued)
                        .count();
                    debug!("[BRIDGE] {} images inserted, {} enqueued", images.len(), enqueued);
                }
                Err(RecvError::Lagged(skipped)) => {
                    // Missed insertions are recovered by a full pass; dedup makes it safe.
                    warn!("[BRIDGE] lagged {} mutation batches, rescanning", skipped);
                    self.detector.scan(&self.document);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("[BRIDGE] stopped");
    }
}
