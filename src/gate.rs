use crate::config::GateConfig;
use crate::dom::ImageElement;
use crate::sites::is_placeholder;

/// URL fragments that give away animated or decorative content.
const ANIMATION_MARKERS: &[&str] = &[".gif", "animated", "animation", "emoji", "spinner", "loader"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Animated,
    TooSmall { width: u32, height: u32 },
    TooLarge { width: u32, height: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Eligible { width: u32, height: u32 },
    /// Dimensions are not observable yet. Not a rejection.
    NotLoaded,
    Rejected(RejectReason),
}

#[derive(Debug, Clone)]
pub struct ImageGate {
    config: GateConfig,
}

pub fn is_animated(url: &str) -> bool {
    let lower = url.to_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    path.ends_with(".gif") || ANIMATION_MARKERS.iter().any(|m| lower.contains(m))
}

impl ImageGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Eligibility of `element`, whose real source is `resolved_url`.
    ///
    /// Natural dimensions only count when they belong to the resolved image;
    /// while a placeholder is displayed the declared `width`/`height`
    /// attributes stand in. Registering a load watcher on [`Verdict::NotLoaded`]
    /// is the caller's job.
    pub fn meets_criteria(&self, element: &ImageElement, resolved_url: &str) -> Verdict {
        // Placeholder sources are often `blank.gif`; only the real URL counts.
        if is_animated(resolved_url) {
            return Verdict::Rejected(RejectReason::Animated);
        }

        let showing_real_image = !is_placeholder(&element.src());
        let natural = element.natural_size();
        let (width, height) = if showing_real_image && natural.0 > 0 && natural.1 > 0 {
            natural
        } else if !showing_real_image {
            match element.declared_size() {
                Some(size) => size,
                None => return Verdict::NotLoaded,
            }
        } else {
            return Verdict::NotLoaded;
        };

        self.check_bounds(width, height)
    }

    pub fn check_bounds(&self, width: u32, height: u32) -> Verdict {
        let c = &self.config;
        if width < c.min_width || height < c.min_height {
            Verdict::Rejected(RejectReason::TooSmall { width, height })
        } else if width > c.max_width || height > c.max_height {
            Verdict::Rejected(RejectReason::TooLarge { width, height })
        } else {
            Verdict::Eligible { width, height }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn element(attrs: &[(&str, &str)]) -> ImageElement {
        ImageElement::detached(&Url::parse("https://reader.example/chapter-1").unwrap(), 0.0, attrs)
    }

    fn gate() -> ImageGate {
        ImageGate::new(GateConfig::default())
    }

    #[test]
    fn small_loaded_image_is_rejected_outright() {
        let img = element(&[("src", "https://cdn.example/a.jpg")]);
        img.mark_loaded(150, 300);
        assert_eq!(
            gate().meets_criteria(&img, "https://cdn.example/a.jpg"),
            Verdict::Rejected(RejectReason::TooSmall { width: 150, height: 300 })
        );
        assert!(!img.is_armed(crate::dom::WatchKind::Load));
    }

    #[test]
    fn tall_strips_are_accepted_up_to_the_height_limit() {
        let img = element(&[("src", "https://cdn.example/strip.jpg")]);
        img.mark_loaded(800, 19_000);
        assert!(matches!(
            gate().meets_criteria(&img, "https://cdn.example/strip.jpg"),
            Verdict::Eligible { .. }
        ));

        img.mark_loaded(800, 25_000);
        assert!(matches!(
            gate().meets_criteria(&img, "https://cdn.example/strip.jpg"),
            Verdict::Rejected(RejectReason::TooLarge { .. })
        ));
        img.mark_loaded(3500, 1000);
        assert!(!matches!(
            gate().meets_criteria(&img, "https://cdn.example/strip.jpg"),
            Verdict::Eligible { .. }
        ));
    }

    #[test]
    fn animated_content_is_rejected_regardless_of_size() {
        let img = element(&[("src", "https://cdn.example/page.gif?v=2")]);
        img.mark_loaded(900, 1200);
        assert_eq!(
            gate().meets_criteria(&img, "https://cdn.example/page.gif?v=2"),
            Verdict::Rejected(RejectReason::Animated)
        );
        assert!(is_animated("https://cdn.example/spinner-large.png"));
        assert!(!is_animated("https://cdn.example/giffard/01.jpg"));
    }

    #[test]
    fn unloaded_image_is_deferred() {
        let img = element(&[("src", "https://cdn.example/a.jpg")]);
        assert_eq!(gate().meets_criteria(&img, "https://cdn.example/a.jpg"), Verdict::NotLoaded);
    }

    #[test]
    fn placeholder_uses_declared_size() {
        let img = element(&[
            ("src", "data:image/gif;base64,R0lG"),
            ("data-src", "https://cdn.example/a.jpg"),
            ("width", "720"),
            ("height", "1040"),
        ]);
        // The 1x1 placeholder's natural size must not count.
        img.mark_loaded(1, 1);
        assert_eq!(
            gate().meets_criteria(&img, "https://cdn.example/a.jpg"),
            Verdict::Eligible { width: 720, height: 1040 }
        );

        let bare = element(&[("src", "data:image/gif;base64,R0lG"), ("data-src", "https://cdn.example/b.jpg")]);
        bare.mark_loaded(1, 1);
        assert_eq!(gate().meets_criteria(&bare, "https://cdn.example/b.jpg"), Verdict::NotLoaded);
    }
}
