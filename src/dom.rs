//! Live document model.
//!
//! A page is parsed once with `scraper`; every `<img>` becomes an
//! [`ImageElement`] handle that can be shared across tasks. Elements carry
//! mutable attributes and natural dimensions and broadcast load and attribute
//! events, the document broadcasts subtree insertions.

use bytes::Bytes;
use scraper::{Html, Selector};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

const EVENT_CAPACITY: usize = 16;
static NEXT_NODE: AtomicU64 = AtomicU64::new(1);
const MUTATION_CAPACITY: usize = 64;
/// Layout height assumed for images whose size is not declared in markup.
const UNKNOWN_IMAGE_HEIGHT: f64 = 1.0;

pub const LOADING_CLASS: &str = "mangalift-loading";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementEvent {
    Loaded,
    AttributeChanged(String),
}

#[derive(Debug, Clone)]
pub enum Mutation {
    /// Images found in a freshly inserted subtree, in document order.
    Inserted(Vec<ImageElement>),
}

/// Which per-element one-shot watcher a marker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    Load,
    Attributes,
}

#[derive(Debug, Default)]
struct ElementState {
    attrs: BTreeMap<String, String>,
    natural_width: u32,
    natural_height: u32,
    complete: bool,
    loading: bool,
    upscaled: Option<Bytes>,
}

struct ElementInner {
    node_id: u64,
    base: Url,
    offset_top: f64,
    state: Mutex<ElementState>,
    events: broadcast::Sender<ElementEvent>,
    load_armed: AtomicBool,
    attrs_armed: AtomicBool,
}

/// Shared handle to one live `<img>` element.
#[derive(Clone)]
pub struct ImageElement {
    inner: Arc<ElementInner>,
}

impl ImageElement {
    pub fn new(base: Url, offset_top: f64, attrs: BTreeMap<String, String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ElementInner {
                node_id: NEXT_NODE.fetch_add(1, Ordering::Relaxed),
                base,
                offset_top,
                state: Mutex::new(ElementState { attrs, ..Default::default() }),
                events,
                load_armed: AtomicBool::new(false),
                attrs_armed: AtomicBool::new(false),
            }),
        }
    }

    /// Detached element, handy for building pages by hand.
    pub fn detached(base: &Url, offset_top: f64, attrs: &[(&str, &str)]) -> Self {
        let attrs = attrs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Self::new(base.clone(), offset_top, attrs)
    }

    fn state(&self) -> MutexGuard<'_, ElementState> {
        // A poisoned element lock only means a panic elsewhere; the data is still usable.
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn node_id(&self) -> u64 {
        self.inner.node_id
    }

    pub fn offset_top(&self) -> f64 {
        self.inner.offset_top
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        self.state().attrs.get(name).cloned()
    }

    pub fn src(&self) -> String {
        self.attr("src").unwrap_or_default()
    }

    pub fn class_name(&self) -> String {
        self.attr("class").unwrap_or_default()
    }

    pub fn alt(&self) -> String {
        self.attr("alt").unwrap_or_default()
    }

    pub fn id_attr(&self) -> String {
        self.attr("id").unwrap_or_default()
    }

    /// Sets an attribute and notifies watchers. Changing `src` resets load
    /// state just like a browser starting a new fetch.
    pub fn set_attribute(&self, name: &str, value: &str) {
        {
            let mut state = self.state();
            if state.attrs.get(name).map(String::as_str) == Some(value) {
                return;
            }
            state.attrs.insert(name.to_string(), value.to_string());
            if name == "src" {
                state.complete = false;
                state.natural_width = 0;
                state.natural_height = 0;
            }
        }
        let _ = self.inner.events.send(ElementEvent::AttributeChanged(name.to_string()));
    }

    /// Resolves a possibly relative URL against the owning page.
    pub fn resolve_url(&self, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.starts_with("blob:") {
            return Some(raw.to_string());
        }
        self.inner.base.join(raw).ok().map(|u| u.to_string())
    }

    pub fn natural_size(&self) -> (u32, u32) {
        let state = self.state();
        (state.natural_width, state.natural_height)
    }

    pub fn is_complete(&self) -> bool {
        self.state().complete
    }

    /// Declared `width`/`height` attributes, if both parse to positive numbers.
    pub fn declared_size(&self) -> Option<(u32, u32)> {
        let parse = |name: &str| {
            self.attr(name)
                .and_then(|v| v.trim().trim_end_matches("px").parse::<f64>().ok())
                .filter(|v| *v > 0.0)
                .map(|v| v.round() as u32)
        };
        Some((parse("width")?, parse("height")?))
    }

    /// Records a finished load of the current `src` and fires `Loaded`.
    pub fn mark_loaded(&self, width: u32, height: u32) {
        {
            let mut state = self.state();
            state.natural_width = width;
            state.natural_height = height;
            state.complete = true;
        }
        let _ = self.inner.events.send(ElementEvent::Loaded);
    }

    /// A failed load: complete, but without dimensions.
    pub fn mark_broken(&self) {
        self.mark_loaded(0, 0);
    }

    /// Toggles the loading decoration. Decoration is not a mutation watchers see.
    pub fn set_loading(&self, loading: bool) {
        let mut state = self.state();
        state.loading = loading;
        let class = state.attrs.get("class").cloned().unwrap_or_default();
        let mut classes: Vec<&str> = class.split_whitespace().filter(|c| *c != LOADING_CLASS).collect();
        if loading {
            classes.push(LOADING_CLASS);
        }
        state.attrs.insert("class".to_string(), classes.join(" "));
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    /// Swaps the displayed image for `url` while pinning the layout box to
    /// the size the original occupied.
    pub fn swap_source(&self, url: &str, data: Bytes) {
        let (width, height) = {
            let mut state = self.state();
            state.upscaled = Some(data);
            (state.natural_width, state.natural_height)
        };
        self.set_loading(false);
        if self.declared_size().is_none() && width > 0 && height > 0 {
            self.set_attribute("width", &width.to_string());
            self.set_attribute("height", &height.to_string());
        }
        self.set_attribute("data-mangalift", "upscaled");
        self.set_attribute("src", url);
        // The replacement is already in memory; keep the box at its old size.
        let mut state = self.state();
        state.natural_width = width;
        state.natural_height = height;
        state.complete = true;
    }

    pub fn upscaled_bytes(&self) -> Option<Bytes> {
        self.state().upscaled.clone()
    }

    pub fn is_upscaled(&self) -> bool {
        self.state().upscaled.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ElementEvent> {
        self.inner.events.subscribe()
    }

    /// Number of watchers currently listening to this element.
    pub fn listener_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    fn marker(&self, kind: WatchKind) -> &AtomicBool {
        match kind {
            WatchKind::Load => &self.inner.load_armed,
            WatchKind::Attributes => &self.inner.attrs_armed,
        }
    }

    /// Claims the per-element marker; `false` if a watcher is already armed.
    pub fn try_arm(&self, kind: WatchKind) -> bool {
        self.marker(kind)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn disarm(&self, kind: WatchKind) {
        self.marker(kind).store(false, Ordering::Release);
    }

    pub fn is_armed(&self, kind: WatchKind) -> bool {
        self.marker(kind).load(Ordering::Acquire)
    }
}

impl PartialEq for ImageElement {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ImageElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageElement")
            .field("node_id", &self.inner.node_id)
            .field("src", &self.src())
            .field("offset_top", &self.inner.offset_top)
            .finish()
    }
}

struct DocumentInner {
    location: RwLock<Url>,
    html: RwLock<String>,
    images: Mutex<Vec<ImageElement>>,
    /// Running layout position of the bottom of the last image.
    flow_bottom: Mutex<f64>,
    mutations: broadcast::Sender<Mutation>,
}

/// Shared handle to the live page.
#[derive(Clone)]
pub struct Document {
    inner: Arc<DocumentInner>,
}

impl Document {
    pub fn parse(location: Url, html: &str) -> Self {
        let (mutations, _) = broadcast::channel(MUTATION_CAPACITY);
        let document = Self {
            inner: Arc::new(DocumentInner {
                location: RwLock::new(location),
                html: RwLock::new(String::new()),
                images: Mutex::new(Vec::new()),
                flow_bottom: Mutex::new(0.0),
                mutations,
            }),
        };
        let images = document.adopt(html, false);
        debug!("[DOM] parsed page with {} images", images.len());
        document
    }

    pub fn location(&self) -> Url {
        self.inner.location.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Client-side route change: location changes, the DOM does not.
    pub fn navigate(&self, location: Url) {
        *self.inner.location.write().unwrap_or_else(|e| e.into_inner()) = location;
    }

    pub fn images(&self) -> Vec<ImageElement> {
        self.inner.images.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn has_selector(&self, css: &str) -> bool {
        let selector = match Selector::parse(css) {
            Ok(selector) => selector,
            Err(e) => {
                warn!("[DOM] invalid selector '{}': {:?}", css, e);
                return false;
            }
        };
        let html = self.inner.html.read().unwrap_or_else(|e| e.into_inner());
        let document = Html::parse_document(&html);
        let found = document.select(&selector).next().is_some();
        found
    }

    /// Appends markup at the end of the body and announces the inserted
    /// images to mutation subscribers.
    pub fn insert_html(&self, fragment: &str) -> Vec<ImageElement> {
        let images = self.adopt(fragment, true);
        if !images.is_empty() {
            let _ = self.inner.mutations.send(Mutation::Inserted(images.clone()));
        }
        images
    }

    pub fn subscribe_mutations(&self) -> broadcast::Receiver<Mutation> {
        self.inner.mutations.subscribe()
    }

    fn adopt(&self, markup: &str, fragment: bool) -> Vec<ImageElement> {
        let parsed = if fragment {
            Html::parse_fragment(markup)
        } else {
            Html::parse_document(markup)
        };
        let base = self.location();
        let mut created = Vec::new();
        // "img" always parses.
        if let Ok(selector) = Selector::parse("img") {
            let mut bottom = self.inner.flow_bottom.lock().unwrap_or_else(|e| e.into_inner());
            for node in parsed.select(&selector) {
                let attrs: BTreeMap<String, String> = node
                    .value()
                    .attrs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                let element = ImageElement::new(base.clone(), *bottom, attrs);
                *bottom += element
                    .declared_size()
                    .map(|(_, h)| h as f64)
                    .unwrap_or(UNKNOWN_IMAGE_HEIGHT);
                created.push(element);
            }
        }

        self.inner.html.write().unwrap_or_else(|e| e.into_inner()).push_str(markup);
        self.inner
            .images
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(created.iter().cloned());
        created
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document").field("location", &self.location().as_str()).finish()
    }
}
