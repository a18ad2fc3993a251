//! Site classification.
//!
//! Every supported reader gets a [`SiteRules`] table; the tables are data,
//! the logic that walks them lives on [`SiteHandler`]. A handler is picked
//! once per page from the hostname and never changes afterwards.

use regex::Regex;
use tracing::{debug, warn};
use url::Url;

use crate::dom::{Document, ImageElement};

/// Substrings marking a `src` that is only a stand-in for the real image.
pub const PLACEHOLDER_MARKERS: &[&str] = &[
    "bg_transparency",
    "data:image",
    "placeholder",
    "blank.gif",
    "blank.png",
    "spacer.gif",
    "transparent.png",
    "1x1",
    "loading.",
    "lazyload",
    "about:blank",
];

/// Attributes that lazy loaders commonly park the real URL in.
pub const LAZY_ATTRIBUTES: &[&str] = &[
    "data-src",
    "data-url",
    "data-original",
    "data-lazy-src",
    "data-lazy",
    "data-cfsrc",
];

/// UI chrome that is never reading content.
const CHROME_DENYLIST: &[&str] = &[
    "icon", "avatar", "logo", "banner", "advert", "ads", "sponsor", "nav", "thumb", "emoji",
    "profile", "button", "badge", "sprite", "comment", "footer", "header",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    Webtoon,
    MangaDex,
    Tapas,
    AsuraScans,
    Generic,
}

#[derive(Debug)]
pub struct SiteRules {
    pub kind: SiteKind,
    pub name: &'static str,
    /// Hostname substrings that select this table.
    pub domains: &'static [&'static str],
    pub reading_paths: &'static [&'static str],
    pub content_selectors: &'static [&'static str],
    pub class_hints: &'static [&'static str],
    pub url_patterns: &'static [&'static str],
    pub alt_keywords: &'static [&'static str],
    /// Extra lazy-load attributes checked before [`LAZY_ATTRIBUTES`].
    pub lazy_attributes: &'static [&'static str],
    /// The image CDN refuses cross-origin byte access.
    pub privileged_fetch: bool,
}

pub static WEBTOON: SiteRules = SiteRules {
    kind: SiteKind::Webtoon,
    name: "Webtoon",
    domains: &["webtoons.com", "webtoon.com"],
    reading_paths: &[r"/viewer", r"episode_no=\d+"],
    content_selectors: &["#_imageList", ".viewer_img"],
    class_hints: &["_images"],
    url_patterns: &[r"webtoon-phinf\.pstatic\.net", r"pstatic\.net/.+\.(jpe?g|png|webp)"],
    alt_keywords: &["image"],
    lazy_attributes: &["data-url"],
    privileged_fetch: true,
};

pub static MANGADEX: SiteRules = SiteRules {
    kind: SiteKind::MangaDex,
    name: "MangaDex",
    domains: &["mangadex.org"],
    reading_paths: &[r"^/chapter/[0-9a-f-]+"],
    content_selectors: &[".md--reader-pages", ".reader--page"],
    class_hints: &["img", "reader"],
    url_patterns: &[r"^blob:", r"/data(-saver)?/[0-9a-f]+/"],
    alt_keywords: &[],
    lazy_attributes: &[],
    privileged_fetch: false,
};

pub static TAPAS: SiteRules = SiteRules {
    kind: SiteKind::Tapas,
    name: "Tapas",
    domains: &["tapas.io"],
    reading_paths: &[r"^/episode/\d+"],
    content_selectors: &[".viewer__body", ".js-episode-article"],
    class_hints: &["content__img", "art-image"],
    url_patterns: &[r"tapas\.io/.+/pc/", r"/episode/"],
    alt_keywords: &["episode"],
    lazy_attributes: &["data-src"],
    privileged_fetch: false,
};

pub static ASURA: SiteRules = SiteRules {
    kind: SiteKind::AsuraScans,
    name: "Asura Scans",
    domains: &["asuracomic.net", "asurascans.com", "asuratoon.com"],
    reading_paths: &[r"/chapter/\d+", r"-chapter-\d+"],
    content_selectors: &["#readerarea", ".reading-content"],
    class_hints: &["ts-main-image", "reader"],
    url_patterns: &[r"/storage/media/\d+", r"/wp-content/uploads/.+\.(jpe?g|png|webp)"],
    alt_keywords: &["chapter", "page"],
    lazy_attributes: &[],
    privileged_fetch: true,
};

pub static GENERIC: SiteRules = SiteRules {
    kind: SiteKind::Generic,
    name: "Generic",
    domains: &[],
    reading_paths: &[
        r"/(chapter|chapitre|capitulo|episode|viewer|read)(/|-|_|$)",
        r"/ch(apter)?[-_/]?\d+",
        r"/read/",
    ],
    content_selectors: &[
        ".reading-content",
        "#readerarea",
        ".chapter-content",
        ".reader-area",
        ".page-break",
        ".container-chapter-reader",
    ],
    class_hints: &["page", "chapter", "manga", "comic", "reader", "wp-manga-chapter-img"],
    url_patterns: &[r"/(chapter|manga|comic|scans?)/", r"/\d{1,4}\.(jpe?g|png|webp)(\?|$)"],
    alt_keywords: &["page", "chapter", "manga", "comic", "scan"],
    lazy_attributes: &[],
    privileged_fetch: false,
};

/// Registered tables in lookup order. The first domain match wins.
pub static REGISTERED: &[&SiteRules] = &[&WEBTOON, &MANGADEX, &TAPAS, &ASURA];

/// Handler for one page: a rule table plus its compiled patterns.
#[derive(Debug, Clone)]
pub struct SiteHandler {
    rules: &'static SiteRules,
    reading_paths: Vec<Regex>,
    url_patterns: Vec<Regex>,
}

fn compile(name: &str, patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!("[SITES] {}: skipping bad pattern '{}': {}", name, p, e);
                None
            }
        })
        .collect()
}

pub fn is_placeholder(src: &str) -> bool {
    let lower = src.to_lowercase();
    PLACEHOLDER_MARKERS.iter().any(|m| lower.contains(m))
}

impl SiteHandler {
    pub fn from_rules(rules: &'static SiteRules) -> Self {
        Self {
            reading_paths: compile(rules.name, rules.reading_paths),
            url_patterns: compile(rules.name, rules.url_patterns),
            rules,
        }
    }

    pub fn for_host(host: &str) -> Self {
        let host = host.to_lowercase();
        let rules = REGISTERED
            .iter()
            .copied()
            .find(|r| r.domains.iter().any(|d| host.contains(d)))
            .unwrap_or(&GENERIC);
        debug!("[SITES] host '{}' handled by {}", host, rules.name);
        Self::from_rules(rules)
    }

    pub fn for_url(url: &Url) -> Self {
        Self::for_host(url.host_str().unwrap_or_default())
    }

    pub fn name(&self) -> &'static str {
        self.rules.name
    }

    pub fn needs_privileged_fetch(&self) -> bool {
        self.rules.privileged_fetch
    }

    /// Evaluated on every call: client-side routing can change the answer.
    pub fn is_reading_page(&self, document: &Document) -> bool {
        let location = document.location();
        let target = match location.query() {
            Some(query) => format!("{}?{}", location.path(), query),
            None => location.path().to_string(),
        };
        if self.reading_paths.iter().any(|re| re.is_match(&target)) {
            return true;
        }
        self.rules.content_selectors.iter().any(|css| document.has_selector(css))
    }

    pub fn is_manga_image(&self, element: &ImageElement) -> bool {
        match self.rules.kind {
            SiteKind::Webtoon => self.is_webtoon_image(element),
            SiteKind::MangaDex => self.is_mangadex_image(element),
            _ => self.decision_list(element),
        }
    }

    /// Resolved source URL, or `None` while only a placeholder is visible.
    pub fn get_image_url(&self, element: &ImageElement) -> Option<String> {
        let src = element.src();
        if !src.trim().is_empty() && !is_placeholder(&src) {
            return element.resolve_url(&src);
        }
        self.rules
            .lazy_attributes
            .iter()
            .chain(LAZY_ATTRIBUTES.iter())
            .filter_map(|name| element.attr(name))
            .find(|value| !value.trim().is_empty() && !is_placeholder(value))
            .and_then(|value| element.resolve_url(&value))
    }

    /// Attributes whose mutation may reveal the real URL.
    pub fn url_attributes(&self) -> Vec<&'static str> {
        let mut names = vec!["src", "srcset"];
        for name in self.rules.lazy_attributes.iter().chain(LAZY_ATTRIBUTES.iter()) {
            if !names.contains(name) {
                names.push(name);
            }
        }
        names
    }

    fn is_denylisted(&self, element: &ImageElement) -> bool {
        let haystacks = [
            element.class_name().to_lowercase(),
            element.id_attr().to_lowercase(),
            element.alt().to_lowercase(),
            file_name(&element.src()).to_lowercase(),
        ];
        haystacks
            .iter()
            .any(|text| CHROME_DENYLIST.iter().any(|word| contains_word(text, word)))
    }

    fn matches_url(&self, element: &ImageElement) -> bool {
        match self.get_image_url(element) {
            Some(url) => self.url_patterns.iter().any(|re| re.is_match(&url)),
            None => false,
        }
    }

    fn matches_class(&self, element: &ImageElement) -> bool {
        let class = element.class_name().to_lowercase();
        self.rules.class_hints.iter().any(|hint| class.contains(hint))
    }

    fn matches_alt(&self, element: &ImageElement) -> bool {
        let alt = element.alt().to_lowercase();
        self.rules.alt_keywords.iter().any(|kw| alt.contains(kw))
    }

    /// Denylist first, then class, URL and alt signals. Generic pages accept
    /// anything that is not chrome and leave the rest to the size gate.
    fn decision_list(&self, element: &ImageElement) -> bool {
        if self.is_denylisted(element) {
            return false;
        }
        if self.matches_class(element) || self.matches_url(element) || self.matches_alt(element) {
            return true;
        }
        self.rules.kind == SiteKind::Generic
    }

    fn is_webtoon_image(&self, element: &ImageElement) -> bool {
        if self.is_denylisted(element) {
            return false;
        }
        // Episode strips always carry `_images`; everything else is chrome.
        self.matches_class(element) || self.matches_url(element)
    }

    fn is_mangadex_image(&self, element: &ImageElement) -> bool {
        if self.is_denylisted(element) {
            return false;
        }
        let src = element.src();
        src.starts_with("blob:") || self.matches_url(element) || self.matches_class(element)
    }
}

fn file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

/// `word` occurring as a separate token (split on non-alphanumerics), so
/// "nav" hits "site-nav" but not "canvas".
fn contains_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| {
            token == word || token.strip_suffix('s') == Some(word) || token.starts_with(word) && word.len() >= 4
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(url: &str, html: &str) -> Document {
        Document::parse(Url::parse(url).unwrap(), html)
    }

    fn img(page: &str, attrs: &[(&str, &str)]) -> ImageElement {
        ImageElement::detached(&Url::parse(page).unwrap(), 0.0, attrs)
    }

    #[test]
    fn selects_handler_by_domain_substring() {
        assert_eq!(SiteHandler::for_host("www.webtoons.com").rules.kind, SiteKind::Webtoon);
        assert_eq!(SiteHandler::for_host("m.webtoons.com").rules.kind, SiteKind::Webtoon);
        assert_eq!(SiteHandler::for_host("mangadex.org").rules.kind, SiteKind::MangaDex);
        assert_eq!(SiteHandler::for_host("asuracomic.net").rules.kind, SiteKind::AsuraScans);
        assert_eq!(SiteHandler::for_host("random-reader.net").rules.kind, SiteKind::Generic);
        assert!(SiteHandler::for_host("www.webtoons.com").needs_privileged_fetch());
        assert!(!SiteHandler::for_host("tapas.io").needs_privileged_fetch());
    }

    #[test]
    fn placeholder_src_defers_to_lazy_attribute() {
        let page = "https://www.webtoons.com/en/fantasy/x/ep-1/viewer?title_no=1&episode_no=1";
        let handler = SiteHandler::for_host("www.webtoons.com");
        let element = img(
            page,
            &[
                ("src", "https://webtoons-static.pstatic.net/image/bg_transparency.png"),
                ("data-url", "https://cdn.example/real.jpg"),
                ("class", "_images"),
            ],
        );
        assert_eq!(handler.get_image_url(&element).as_deref(), Some("https://cdn.example/real.jpg"));
    }

    #[test]
    fn real_src_wins_and_relative_urls_resolve() {
        let handler = SiteHandler::for_host("reader.example");
        let element = img(
            "https://reader.example/manga/a/chapter-2/",
            &[("src", "../chapter-2/03.jpg"), ("data-src", "https://other/03.jpg")],
        );
        assert_eq!(
            handler.get_image_url(&element).as_deref(),
            Some("https://reader.example/manga/a/chapter-2/03.jpg")
        );
    }

    #[test]
    fn placeholder_without_lazy_url_is_not_ready() {
        let handler = SiteHandler::for_host("reader.example");
        let element = img("https://reader.example/read/1", &[("src", "data:image/gif;base64,R0lGOD")]);
        assert_eq!(handler.get_image_url(&element), None);
    }

    #[test]
    fn reading_page_by_path_or_selector() {
        let generic = SiteHandler::for_host("reader.example");
        assert!(generic.is_reading_page(&doc("https://reader.example/manga/x/chapter-12", "<p></p>")));
        assert!(generic.is_reading_page(&doc(
            "https://reader.example/series/x",
            r#"<div class="reading-content"></div>"#
        )));
        assert!(!generic.is_reading_page(&doc("https://reader.example/series/x", "<div></div>")));

        let webtoon = SiteHandler::for_host("www.webtoons.com");
        assert!(webtoon.is_reading_page(&doc(
            "https://www.webtoons.com/en/drama/t/ep/viewer?title_no=9&episode_no=3",
            ""
        )));
    }

    #[test]
    fn reading_page_follows_client_side_navigation() {
        let generic = SiteHandler::for_host("reader.example");
        let page = doc("https://reader.example/series/x", "<div></div>");
        assert!(!generic.is_reading_page(&page));
        page.navigate(Url::parse("https://reader.example/series/x/chapter-1").unwrap());
        assert!(generic.is_reading_page(&page));
    }

    #[test]
    fn generic_rejects_chrome_and_accepts_content() {
        let handler = SiteHandler::for_host("reader.example");
        let page = "https://reader.example/read/1";
        assert!(!handler.is_manga_image(&img(page, &[("src", "/img/avatar_42.png")])));
        assert!(!handler.is_manga_image(&img(page, &[("src", "/a.png"), ("class", "site-logo")])));
        assert!(!handler.is_manga_image(&img(page, &[("src", "/a.png"), ("alt", "Thumbnail")])));
        assert!(handler.is_manga_image(&img(page, &[("src", "/uploads/07.jpg"), ("class", "wp-manga-chapter-img")])));
        assert!(handler.is_manga_image(&img(page, &[("src", "/x/canvas.jpg")])));
    }

    #[test]
    fn webtoon_only_accepts_episode_strips() {
        let handler = SiteHandler::for_host("www.webtoons.com");
        let page = "https://www.webtoons.com/en/x/viewer";
        assert!(handler.is_manga_image(&img(page, &[("class", "_images"), ("src", "https://a/b.jpg")])));
        assert!(handler.is_manga_image(&img(
            page,
            &[("src", "https://webtoon-phinf.pstatic.net/2024/001.jpg")]
        )));
        assert!(!handler.is_manga_image(&img(page, &[("src", "https://a/promo.jpg")])));
    }

    #[test]
    fn mangadex_accepts_blob_pages() {
        let handler = SiteHandler::for_host("mangadex.org");
        let page = "https://mangadex.org/chapter/abc";
        assert!(handler.is_manga_image(&img(page, &[("src", "blob:https://mangadex.org/1234")])));
        assert!(!handler.is_manga_image(&img(page, &[("src", "/avatar.png")])));
    }

    #[test]
    fn classification_is_deterministic() {
        let handler = SiteHandler::for_host("tapas.io");
        let element = img("https://tapas.io/episode/1", &[("class", "content__img"), ("data-src", "https://x/1.jpg")]);
        let first = (handler.is_manga_image(&element), handler.get_image_url(&element));
        for _ in 0..5 {
            assert_eq!((handler.is_manga_image(&element), handler.get_image_url(&element)), first);
        }
    }
}
