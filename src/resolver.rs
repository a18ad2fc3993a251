//! One-shot, per-element watchers for lazy-loaded images.
//!
//! A watcher waits for the first relevant event on a single element (a
//! finished load, or a mutation of one of the URL-bearing attributes), frees
//! its per-element marker and runs the callback exactly once. Each element
//! holds at most one watcher of each kind.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::dom::{ElementEvent, ImageElement, WatchKind};

type WatchKey = (u64, WatchKind);

#[derive(Clone, Default)]
pub struct Watchers {
    active: Arc<Mutex<HashMap<WatchKey, (ImageElement, AbortHandle)>>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watches `attributes` on `element`; `on_change` runs after the first
    /// mutation of any of them. Returns false if a watcher is already armed.
    ///
    /// A lagged watcher cannot tell which mutations it missed, so it fires
    /// and lets the callback re-read the element.
    pub fn observe<F, Fut>(&self, element: &ImageElement, attributes: Vec<&'static str>, on_change: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let matches = move |event: &ElementEvent| match event {
            ElementEvent::AttributeChanged(name) => attributes.contains(&name.as_str()),
            ElementEvent::Loaded => false,
        };
        self.arm(element, WatchKind::Attributes, matches, |_| true, on_change)
    }

    /// Runs `on_load` after the element's next finished load. A lagged
    /// watcher fires if the element finished loading in the meantime.
    pub fn on_load<F, Fut>(&self, element: &ImageElement, on_load: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let matches = |event: &ElementEvent| *event == ElementEvent::Loaded;
        self.arm(element, WatchKind::Load, matches, ImageElement::is_complete, on_load)
    }

    fn arm<M, L, F, Fut>(
        &self,
        element: &ImageElement,
        kind: WatchKind,
        matches: M,
        ready_after_lag: L,
        callback: F,
    ) -> bool
    where
        M: Fn(&ElementEvent) -> bool + Send + 'static,
        L: Fn(&ImageElement) -> bool + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !element.try_arm(kind) {
            return false;
        }
        // Subscribe before spawning so no event slips between arm and listen.
        let mut events = element.subscribe();
        let watched = element.clone();
        let watchers = self.clone();

        // Held across the spawn so the task cannot release before we register.
        let mut active = self.lock();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("[RESOLVER] element {} lagged {} events", watched.node_id(), skipped);
                        if ready_after_lag(&watched) {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        watchers.release(&watched, kind);
                        return;
                    }
                }
            }
            drop(events);
            watchers.release(&watched, kind);
            debug!("[RESOLVER] {:?} watcher fired for element {}", kind, watched.node_id());
            callback().await;
        });

        active.insert((element.node_id(), kind), (element.clone(), handle.abort_handle()));
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WatchKey, (ImageElement, AbortHandle)>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, element: &ImageElement, kind: WatchKind) {
        let mut active = self.lock();
        if let Some((owner, _)) = active.get(&(element.node_id(), kind)) {
            if owner == element {
                active.remove(&(element.node_id(), kind));
            }
        }
        element.disarm(kind);
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Tears down every pending watcher.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        for ((_, kind), (element, handle)) in drained {
            handle.abort();
            element.disarm(kind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use url::Url;

    fn element() -> ImageElement {
        ImageElement::detached(
            &Url::parse("https://reader.example/chapter-1").unwrap(),
            0.0,
            &[("src", "data:image/gif;base64,R0lG")],
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn attribute_watch_fires_once_on_relevant_mutation() {
        let watchers = Watchers::new();
        let img = element();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let armed = watchers.observe(&img, vec!["src", "data-src"], move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(armed);
        assert!(img.is_armed(WatchKind::Attributes));

        img.set_attribute("class", "page");
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        img.set_attribute("data-src", "https://cdn.example/1.jpg");
        img.set_attribute("src", "https://cdn.example/1.jpg");
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!img.is_armed(WatchKind::Attributes));
        assert_eq!(watchers.active_count(), 0);
        assert_eq!(img.listener_count(), 0);
    }

    #[tokio::test]
    async fn second_watch_on_same_element_is_refused() {
        let watchers = Watchers::new();
        let img = element();
        assert!(watchers.on_load(&img, || async {}));
        for _ in 0..5 {
            assert!(!watchers.on_load(&img, || async {}));
        }
        assert_eq!(img.listener_count(), 1);
        assert_eq!(watchers.active_count(), 1);
    }

    #[tokio::test]
    async fn load_watch_fires_after_load() {
        let watchers = Watchers::new();
        let img = element();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        watchers.on_load(&img, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        img.set_attribute("src", "https://cdn.example/1.jpg");
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        img.mark_loaded(800, 1200);
        img.mark_loaded(800, 1200);
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_all_releases_markers() {
        let watchers = Watchers::new();
        let img = element();
        assert!(watchers.on_load(&img, || async {}));
        assert!(watchers.observe(&img, vec!["src"], || async {}));
        assert_eq!(watchers.active_count(), 2);

        watchers.cancel_all();
        assert!(!img.is_armed(WatchKind::Load));
        assert!(!img.is_armed(WatchKind::Attributes));
        assert_eq!(watchers.active_count(), 0);
        assert!(watchers.on_load(&img, || async {}));
    }

    #[tokio::test]
    async fn lagged_load_watch_fires_when_already_loaded() {
        let watchers = Watchers::new();
        let img = element();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        watchers.on_load(&img, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // The load event is pushed out of the buffer before the watcher runs.
        img.mark_loaded(800, 1200);
        for n in 0..40 {
            img.set_attribute("class", &format!("page-{}", n));
        }
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(watchers.active_count(), 0);
    }

    #[tokio::test]
    async fn lagged_attribute_watch_fires() {
        let watchers = Watchers::new();
        let img = element();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        watchers.observe(&img, vec!["data-src"], move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        img.set_attribute("data-src", "https://cdn.example/1.jpg");
        for n in 0..40 {
            img.set_attribute("class", &format!("page-{}", n));
        }
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!img.is_armed(WatchKind::Attributes));
    }
}
