//! Content classes for upstream responses.
//!
//! Every caching and `Cache-Control` decision is driven by a single table keyed by
//! [`ContentClass`], so the decision stays total: adding a class forces a table entry.
//!
//! | Class              | Cache TTL | Static asset |
//! |--------------------|-----------|--------------|
//! | Image, Font, Svg   | 30 min    | yes          |
//! | Script, Stylesheet | 30 s      | yes          |
//! | Html               | 3 s       | no           |
//! | Json, Other        | 10 s      | no           |

use std::time::Duration;

/// `Cache-Control` sent for static assets.
pub const STATIC_CACHE_CONTROL: &str = "public, max-age=60, must-revalidate";

/// `Cache-Control` sent for documents and fragments.
pub const DYNAMIC_CACHE_CONTROL: &str = "no-store, no-cache, must-revalidate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentClass {
    Html,
    Script,
    Stylesheet,
    Image,
    Font,
    Svg,
    Json,
    Other,
}

struct ClassPolicy {
    ttl: Duration,
    static_asset: bool,
}

const fn policy(class: ContentClass) -> ClassPolicy {
    match class {
        ContentClass::Image | ContentClass::Font | ContentClass::Svg => ClassPolicy {
            ttl: Duration::from_secs(30 * 60),
            static_asset: true,
        },
        ContentClass::Script | ContentClass::Stylesheet => ClassPolicy {
            ttl: Duration::from_secs(30),
            static_asset: true,
        },
        ContentClass::Html => ClassPolicy {
            ttl: Duration::from_secs(3),
            static_asset: false,
        },
        ContentClass::Json | ContentClass::Other => ClassPolicy {
            ttl: Duration::from_secs(10),
            static_asset: false,
        },
    }
}

impl ContentClass {
    /// Classify a response from its content type, falling back to the request path's
    /// extension when the content type is absent or generic.
    pub fn classify(content_type: Option<&str>, path: &str) -> Self {
        let from_type = content_type.map(Self::from_content_type);
        match from_type {
            Some(Self::Other) | None => Self::from_path(path).unwrap_or(Self::Other),
            Some(class) => class,
        }
    }

    /// Classify from a `Content-Type` header value. Parameters (`; charset=...`) are ignored.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "text/html" | "application/xhtml+xml" => Self::Html,
            "image/svg+xml" => Self::Svg,
            "text/css" => Self::Stylesheet,
            "application/javascript" | "text/javascript" | "application/x-javascript"
            | "application/ecmascript" | "text/ecmascript" | "module/javascript" => Self::Script,
            "application/json" | "application/ld+json" | "text/json" => Self::Json,
            "application/font-woff" | "application/font-woff2" | "application/vnd.ms-fontobject"
            | "application/x-font-ttf" | "application/x-font-otf" => Self::Font,
            other if other.starts_with("image/") => Self::Image,
            other if other.starts_with("font/") => Self::Font,
            other if other.ends_with("+json") => Self::Json,
            _ => Self::Other,
        }
    }

    /// Classify from a path extension. Query strings and fragments are ignored.
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let file = path.rsplit('/').next().unwrap_or_default();
        let (_, ext) = file.rsplit_once('.')?;

        let class = match ext.to_ascii_lowercase().as_str() {
            "js" | "mjs" => Self::Script,
            "css" => Self::Stylesheet,
            "svg" => Self::Svg,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" | "ico" | "bmp" => Self::Image,
            "woff" | "woff2" | "ttf" | "otf" | "eot" => Self::Font,
            "json" => Self::Json,
            "html" | "htm" => Self::Html,
            _ => return None,
        };
        Some(class)
    }

    /// How long a cached response of this class stays fresh.
    pub fn ttl(self) -> Duration {
        policy(self).ttl
    }

    pub fn is_static_asset(self) -> bool {
        policy(self).static_asset
    }

    /// Synthesized `Cache-Control` for responses of this class.
    pub fn cache_control(self) -> &'static str {
        if self.is_static_asset() {
            STATIC_CACHE_CONTROL
        } else {
            DYNAMIC_CACHE_CONTROL
        }
    }

    pub fn is_html(self) -> bool {
        matches!(self, Self::Html)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Script => "script",
            Self::Stylesheet => "stylesheet",
            Self::Image => "image",
            Self::Font => "font",
            Self::Svg => "svg",
            Self::Json => "json",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ContentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_table() {
        assert_eq!(ContentClass::Image.ttl(), Duration::from_secs(1800));
        assert_eq!(ContentClass::Font.ttl(), Duration::from_secs(1800));
        assert_eq!(ContentClass::Script.ttl(), Duration::from_secs(30));
        assert_eq!(ContentClass::Stylesheet.ttl(), Duration::from_secs(30));
        assert_eq!(ContentClass::Html.ttl(), Duration::from_secs(3));
        assert_eq!(ContentClass::Json.ttl(), Duration::from_secs(10));
        assert_eq!(ContentClass::Other.ttl(), Duration::from_secs(10));
    }

    #[test]
    fn content_type_parameters_are_ignored() {
        assert_eq!(
            ContentClass::from_content_type("text/html; charset=utf-8"),
            ContentClass::Html
        );
        assert_eq!(
            ContentClass::from_content_type("Application/JavaScript"),
            ContentClass::Script
        );
        assert_eq!(
            ContentClass::from_content_type("image/svg+xml"),
            ContentClass::Svg
        );
        assert_eq!(ContentClass::from_content_type("font/woff2"), ContentClass::Font);
        assert_eq!(
            ContentClass::from_content_type("application/vnd.api+json"),
            ContentClass::Json
        );
    }

    #[test]
    fn generic_type_falls_back_to_extension() {
        assert_eq!(
            ContentClass::classify(Some("application/octet-stream"), "/cdn/theme.css?v=3"),
            ContentClass::Stylesheet
        );
        assert_eq!(
            ContentClass::classify(None, "/assets/logo.PNG"),
            ContentClass::Image
        );
        assert_eq!(ContentClass::classify(None, "/products/foo"), ContentClass::Other);
    }

    #[test]
    fn cache_control_by_class() {
        for class in [
            ContentClass::Script,
            ContentClass::Stylesheet,
            ContentClass::Image,
            ContentClass::Font,
            ContentClass::Svg,
        ] {
            assert_eq!(class.cache_control(), STATIC_CACHE_CONTROL, "{class}");
        }
        for class in [ContentClass::Html, ContentClass::Json, ContentClass::Other] {
            assert_eq!(class.cache_control(), DYNAMIC_CACHE_CONTROL, "{class}");
        }
    }
}
