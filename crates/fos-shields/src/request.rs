//! Request Details
//!
//! The immutable description of one network request that the network
//! stack hands to every filter stage.

use hyper::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Lifecycle event a stage can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    BeforeRequest,
    BeforeSendHeaders,
    HeadersReceived,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[Phase::BeforeRequest, Phase::BeforeSendHeaders, Phase::HeadersReceived]
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeRequest => write!(f, "beforeRequest"),
            Self::BeforeSendHeaders => write!(f, "beforeSendHeaders"),
            Self::HeadersReceived => write!(f, "headersReceived"),
        }
    }
}

/// Type of resource being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceType {
    /// Top-level document
    MainFrame,
    /// Document loaded into a frame
    SubFrame,
    /// CSS stylesheet
    Stylesheet,
    /// JavaScript
    Script,
    /// Image
    Image,
    /// Plugin content
    Object,
    /// XHR/Fetch request
    Xhr,
    /// Font
    Font,
    /// Media (video/audio)
    Media,
    /// WebSocket
    WebSocket,
    /// Other/Unknown
    Other,
}

impl ResourceType {
    /// Parse from Accept header or file extension
    pub fn from_accept_or_path(accept: Option<&str>, path: &str) -> Self {
        let path = path.split(|c: char| c == '?' || c == '#').next().unwrap_or(path);
        if path.ends_with(".js") { return Self::Script; }
        if path.ends_with(".css") { return Self::Stylesheet; }
        if path.ends_with(".woff") || path.ends_with(".woff2") || path.ends_with(".ttf") {
            return Self::Font;
        }
        if path.ends_with(".png") || path.ends_with(".jpg") ||
           path.ends_with(".jpeg") || path.ends_with(".gif") ||
           path.ends_with(".webp") || path.ends_with(".svg") {
            return Self::Image;
        }
        if path.ends_with(".mp4") || path.ends_with(".webm") ||
           path.ends_with(".mp3") || path.ends_with(".ogg") {
            return Self::Media;
        }

        if let Some(accept) = accept {
            if accept.contains("text/html") { return Self::SubFrame; }
            if accept.contains("text/css") { return Self::Stylesheet; }
            if accept.contains("javascript") { return Self::Script; }
            if accept.contains("image/") { return Self::Image; }
            if accept.contains("font/") { return Self::Font; }
        }

        Self::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainFrame => "mainFrame",
            Self::SubFrame => "subFrame",
            Self::Stylesheet => "stylesheet",
            Self::Script => "script",
            Self::Image => "image",
            Self::Object => "object",
            Self::Xhr => "xhr",
            Self::Font => "font",
            Self::Media => "media",
            Self::WebSocket => "webSocket",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mainFrame" | "document" => Self::MainFrame,
            "subFrame" | "subdocument" => Self::SubFrame,
            "stylesheet" => Self::Stylesheet,
            "script" => Self::Script,
            "image" => Self::Image,
            "object" => Self::Object,
            "xhr" | "xmlhttprequest" => Self::Xhr,
            "font" => Self::Font,
            "media" => Self::Media,
            "webSocket" | "websocket" => Self::WebSocket,
            "other" => Self::Other,
            _ => return Err(format!("unknown resource type: {}", s)),
        })
    }
}

/// Session partition a request belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId(String);

impl PartitionId {
    pub const DEFAULT: &'static str = "persist:default";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Partitions without the `persist:` prefix live in memory only
    pub fn is_private(&self) -> bool {
        !self.0.starts_with("persist:")
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One network request under evaluation
#[derive(Debug, Clone)]
pub struct RequestDetails {
    /// Network-stack request id, stable across redirects
    pub id: u64,
    pub url: String,
    pub resource_type: ResourceType,
    /// URL of the top-level document; `None` once the owning tab is gone
    pub first_party_url: Option<String>,
    pub request_headers: HeaderMap,
    pub partition: PartitionId,
    pub tab_id: Option<u32>,
    /// Address the response came from, known from `headersReceived` on
    pub ip: Option<IpAddr>,
}

impl RequestDetails {
    pub fn new(id: u64, url: impl Into<String>, resource_type: ResourceType) -> Self {
        Self {
            id,
            url: url.into(),
            resource_type,
            first_party_url: None,
            request_headers: HeaderMap::new(),
            partition: PartitionId::default(),
            tab_id: None,
            ip: None,
        }
    }

    pub fn with_first_party(mut self, url: impl Into<String>) -> Self {
        self.first_party_url = Some(url.into());
        self
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_tab(mut self, tab_id: u32) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    /// Whether this request loads the top-level document
    pub fn is_main_frame(&self) -> bool {
        self.resource_type == ResourceType::MainFrame
    }

    /// URL of the top-level document this request was made for. A
    /// main-frame request is its own main frame.
    pub fn main_frame_url(&self) -> Option<&str> {
        if self.is_main_frame() {
            Some(&self.url)
        } else {
            self.first_party_url.as_deref()
        }
    }

    pub fn is_private(&self) -> bool {
        self.partition.is_private()
    }
}

/// Redirect notification observed from the network stack
#[derive(Debug, Clone)]
pub struct RedirectDetails {
    pub id: u64,
    /// URL being redirected away from
    pub url: String,
    pub redirect_url: String,
    pub partition: PartitionId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_type_detection() {
        assert_eq!(ResourceType::from_accept_or_path(None, "/script.js?v=2"), ResourceType::Script);
        assert_eq!(ResourceType::from_accept_or_path(None, "/style.css"), ResourceType::Stylesheet);
        assert_eq!(ResourceType::from_accept_or_path(None, "/image.png"), ResourceType::Image);
        assert_eq!(ResourceType::from_accept_or_path(Some("text/html"), "/page"), ResourceType::SubFrame);
    }

    #[test]
    fn test_resource_type_names_roundtrip() {
        for name in ["mainFrame", "subFrame", "script", "xhr", "other"] {
            let parsed: ResourceType = name.parse().unwrap();
            assert_eq!(parsed.as_str(), name);
        }
        assert!("bogus".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_main_frame_url() {
        let main = RequestDetails::new(1, "https://brave.com/", ResourceType::MainFrame);
        assert_eq!(main.main_frame_url(), Some("https://brave.com/"));

        let orphan = RequestDetails::new(2, "https://cdn.example/a.js", ResourceType::Script);
        assert_eq!(orphan.main_frame_url(), None);

        let sub = orphan.with_first_party("https://brave.com/");
        assert_eq!(sub.main_frame_url(), Some("https://brave.com/"));
    }

    #[test]
    fn test_private_partition() {
        assert!(!PartitionId::default().is_private());
        assert!(PartitionId::new("partition-1").is_private());
    }
}
