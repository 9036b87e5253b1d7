//! HTTP request/response model.
//!
//! Cache entries must survive a round-trip through JSON storage and the
//! strategy engine must work against mock networks in tests, so the engine
//! operates on these owned value types rather than on `reqwest` types
//! directly. The `net` module converts at the wire boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
        }
    }

    /// Whether a request with this method changes server state.
    /// Mutating requests are never served from cache; while offline they are
    /// diverted to the sync queue instead.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

/// What kind of resource a request is for, derived from the URL and headers.
/// Drives partition selection and strategy assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Document,
    Script,
    Style,
    Image,
    Font,
    Other,
}

/// An intercepted outbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    /// True for top-level navigations (address bar, link clicks).
    #[serde(default)]
    pub is_navigation: bool,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: BTreeMap::new(),
            body: None,
            is_navigation: false,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn navigation(url: impl Into<String>) -> Self {
        let mut request = Self::get(url);
        request.is_navigation = true;
        request
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the request would accept an HTML response.
    pub fn accepts_html(&self) -> bool {
        self.header("accept")
            .map(|accept| accept.contains("text/html"))
            .unwrap_or(false)
    }

    /// The cache key for this request. Method plus URL uniquely identifies an
    /// entry within a partition.
    pub fn cache_key(&self) -> String {
        format!("{} {}", self.method.as_str(), self.url)
    }

    /// Classify the resource this request targets.
    pub fn destination(&self) -> Destination {
        if self.is_navigation || self.accepts_html() {
            return Destination::Document;
        }
        match path_extension(&self.url) {
            Some("js") | Some("mjs") => Destination::Script,
            Some("css") => Destination::Style,
            Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("webp")
            | Some("svg") | Some("ico") | Some("avif") => Destination::Image,
            Some("woff") | Some("woff2") | Some("ttf") | Some("otf") | Some("eot") => {
                Destination::Font
            }
            Some("html") | Some("htm") => Destination::Document,
            _ => Destination::Other,
        }
    }

    /// Whether this request stays within the given origin. Relative URLs are
    /// always same-origin; absolute URLs must share scheme and authority.
    pub fn is_same_origin(&self, origin: &str) -> bool {
        if self.url.starts_with('/') {
            return true;
        }
        match url_origin(&self.url) {
            Some(request_origin) => request_origin == origin.trim_end_matches('/'),
            None => false,
        }
    }
}

/// A response as stored in a partition or returned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_text: status_text_for(status).to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_body(status: u16, body: impl Into<Vec<u8>>) -> Self {
        let mut response = Self::new(status);
        response.body = body.into();
        response
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// The canned response served when neither cache nor network can satisfy
    /// a request and no pre-cached fallback applies.
    pub fn service_unavailable(message: &str) -> Self {
        Self::with_body(503, message.as_bytes().to_vec())
            .with_header("content-type", "text/plain; charset=utf-8")
    }
}

fn status_text_for(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Extract the lowercase file extension from a URL path, ignoring query and
/// fragment.
fn path_extension(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty() || ext.chars().any(|c| !c.is_ascii_alphanumeric()) {
        None
    } else {
        Some(ext)
    }
}

/// Extract `scheme://authority` from an absolute URL.
fn url_origin(url: &str) -> Option<&str> {
    let scheme_end = url.find("://")?;
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').map(|i| scheme_end + 3 + i).unwrap_or(url.len());
    Some(&url[..authority_end])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_is_mutating() {
        assert!(!Method::Get.is_mutating());
        assert!(!Method::Head.is_mutating());
        assert!(Method::Post.is_mutating());
        assert!(Method::Delete.is_mutating());
    }

    #[test]
    fn test_cache_key_includes_method() {
        let get = Request::get("/api/items");
        let post = Request::new(Method::Post, "/api/items");
        assert_ne!(get.cache_key(), post.cache_key());
        assert_eq!(get.cache_key(), "GET /api/items");
    }

    #[test]
    fn test_destination_from_extension() {
        assert_eq!(Request::get("/app.js").destination(), Destination::Script);
        assert_eq!(Request::get("/style.css?v=2").destination(), Destination::Style);
        assert_eq!(Request::get("/logo.png").destination(), Destination::Image);
        assert_eq!(Request::get("/font.woff2").destination(), Destination::Font);
        assert_eq!(Request::get("/index.html").destination(), Destination::Document);
        assert_eq!(Request::get("/api/items").destination(), Destination::Other);
    }

    #[test]
    fn test_destination_navigation_and_accept() {
        assert_eq!(Request::navigation("/about").destination(), Destination::Document);
        let req = Request::get("/page").with_header("Accept", "text/html,application/xhtml+xml");
        assert_eq!(req.destination(), Destination::Document);
    }

    #[test]
    fn test_same_origin() {
        let origin = "https://app.example.com";
        assert!(Request::get("/api/items").is_same_origin(origin));
        assert!(Request::get("https://app.example.com/api/items").is_same_origin(origin));
        assert!(!Request::get("https://cdn.example.com/lib.js").is_same_origin(origin));
        assert!(!Request::get("not a url").is_same_origin(origin));
    }

    #[test]
    fn test_response_success_range() {
        assert!(Response::new(200).is_success());
        assert!(Response::new(204).is_success());
        assert!(!Response::new(304).is_success());
        assert!(!Response::new(404).is_success());
        assert!(!Response::new(503).is_success());
    }

    #[test]
    fn test_service_unavailable_fallback() {
        let resp = Response::service_unavailable("offline");
        assert_eq!(resp.status, 503);
        assert_eq!(resp.status_text, "Service Unavailable");
        assert_eq!(resp.body, b"offline");
        assert_eq!(resp.header("Content-Type"), Some("text/plain; charset=utf-8"));
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let req = Request::get("/x").with_header("Accept", "text/html");
        assert_eq!(req.header("ACCEPT"), Some("text/html"));
    }

    #[test]
    fn test_path_extension_edge_cases() {
        assert_eq!(path_extension("/file.tar.gz"), Some("gz"));
        assert_eq!(path_extension("/no-extension"), None);
        assert_eq!(path_extension("/trailing."), None);
        assert_eq!(path_extension("/a.js#frag"), Some("js"));
    }
}
