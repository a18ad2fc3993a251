use thiserror::Error;

#[derive(Error, Debug)]
pub enum LiftError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ZIP compression error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Image extraction failed: {}", .0.join("; "))]
    ExtractionFailed(Vec<String>),

    #[error("Cross-origin taint: {0}")]
    Tainted(String),

    #[error("Upscale service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Upscale service error: {0}")]
    Upscale(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Image too large: {bytes} bytes (limit {limit})")]
    Oversize { bytes: usize, limit: usize },

    #[error("Privileged host did not respond")]
    HostUnavailable,

    #[error("Privileged fetch failed: {0}")]
    PrivilegedFetchFailed(String),

    #[error("Privileged host channel invalidated")]
    HostInvalidated,
}

/// Coarse grouping used for user-facing notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    ServiceUnavailable,
    Timeout,
    Oversize,
    Generic,
}

impl LiftError {
    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::ServiceUnavailable(msg.into())
    }

    pub fn upscale(msg: impl Into<String>) -> Self {
        Self::Upscale(msg.into())
    }

    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }

    pub fn tainted(msg: impl Into<String>) -> Self {
        Self::Tainted(msg.into())
    }

    pub fn privileged_fetch_failed(msg: impl Into<String>) -> Self {
        Self::PrivilegedFetchFailed(msg.into())
    }

    /// Maps a reqwest failure from the upscale service onto the taxonomy:
    /// timeouts stay timeouts, connection problems mean the service is gone.
    pub fn from_service(err: reqwest::Error, what: &str) -> Self {
        if err.is_timeout() {
            Self::Timeout(what.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::ServiceUnavailable(format!("{}: {}", what, err))
        } else {
            Self::Http(err)
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::ServiceUnavailable(_) => FailureClass::ServiceUnavailable,
            Self::Timeout(_) => FailureClass::Timeout,
            Self::Http(e) if e.is_timeout() => FailureClass::Timeout,
            Self::Oversize { .. } => FailureClass::Oversize,
            _ => FailureClass::Generic,
        }
    }

    /// Fatal for the rest of the page session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::HostInvalidated)
    }

    pub fn user_message(&self) -> String {
        match self.class() {
            FailureClass::ServiceUnavailable => {
                "Upscale server is not reachable. Is it running on the configured address?".to_string()
            }
            FailureClass::Timeout => "Upscaling timed out. The server may be overloaded.".to_string(),
            FailureClass::Oversize => format!("Skipped an image that is too large to upscale ({})", self),
            FailureClass::Generic => format!("Upscaling failed: {}", self),
        }
    }
}

pub type Result<T> = std::result::Result<T, LiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_failures_for_notifications() {
        assert_eq!(LiftError::service_unavailable("down").class(), FailureClass::ServiceUnavailable);
        assert_eq!(LiftError::timeout("upload").class(), FailureClass::Timeout);
        assert_eq!(LiftError::Oversize { bytes: 30, limit: 20 }.class(), FailureClass::Oversize);
        assert_eq!(LiftError::upscale("HTTP 500").class(), FailureClass::Generic);
    }

    #[test]
    fn only_host_invalidation_is_fatal() {
        assert!(LiftError::HostInvalidated.is_fatal());
        assert!(!LiftError::HostUnavailable.is_fatal());
        assert!(!LiftError::ExtractionFailed(vec!["a".into()]).is_fatal());
    }

    #[test]
    fn extraction_failure_lists_every_tier() {
        let err = LiftError::ExtractionFailed(vec!["redraw: tainted".into(), "direct: 403".into()]);
        assert_eq!(err.to_string(), "Image extraction failed: redraw: tainted; direct: 403");
    }
}
