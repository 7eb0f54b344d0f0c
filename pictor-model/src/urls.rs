use std::time::Duration;

use url::Url;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Cache policy attached to an outgoing URL request.
///
/// The transport itself has no protocol cache; the policy exists so that
/// requests which must bypass intermediaries coalesce separately from
/// requests which may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CachePolicy {
    /// Follow whatever the protocol and intermediaries decide.
    #[default]
    UseProtocolCachePolicy,
    /// Force a fresh load, ignoring any cached responses along the way.
    ReloadIgnoringCacheData,
}

/// A URL plus the transport-level knobs the pipeline honors.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlRequest {
    pub url: Url,
    pub cache_policy: CachePolicy,
    /// Whether the load may run over a metered cellular link.
    pub allows_cellular_access: bool,
    /// Extra request headers, appended in order.
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl UrlRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            cache_policy: CachePolicy::default(),
            allows_cellular_access: true,
            headers: Vec::new(),
            timeout: None,
        }
    }

    /// First header value with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace or append a header.
    pub fn set_header(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        let name = name.into();
        let value = value.into();
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(&name))
        {
            existing.1 = value;
        } else {
            self.headers.push((name, value));
        }
    }
}

/// The response envelope a transport attaches to every emitted chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlResponse {
    pub url: Option<Url>,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Body length the server advertised for this exchange, if any.
    pub expected_content_length: Option<u64>,
}

impl UrlResponse {
    pub fn new(url: Option<Url>, status: u16) -> Self {
        Self {
            url,
            status,
            headers: Vec::new(),
            expected_content_length: None,
        }
    }

    /// First header value with the given name, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
