//! Seam between a synthesis session and the physical duplex connection.
//!
//! A [`Connector`] opens one connection per session and hands back a [`Link`]
//! for outbound frames. Inbound frames are pushed to a [`FrameHandler`] from
//! the connection's own reader thread.

use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Frame received from the service (or a local transport notification).
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// JSON control message.
    Text(String),
    /// Raw audio payload, forwarded verbatim.
    Binary(Vec<u8>),
    /// Remote side closed the connection.
    Closed { reason: Option<String> },
    /// Transport-level failure; the connection is gone.
    Error(String),
}

/// Receives inbound frames on the connection's reader thread.
pub trait FrameHandler: Send + Sync {
    fn on_frame(&self, frame: InboundFrame);
}

/// Outbound half of an open connection.
///
/// Sends are non-blocking and delivered in call order. Implementations never
/// deliver inbound frames from inside a `send_text` call. Dropping the link
/// closes the connection.
pub trait Link: Send + Sync {
    fn send_text(&self, frame: String) -> Result<()>;

    /// Close immediately without waiting for further inbound frames.
    fn close(&self);
}

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectRequest {
    /// Build the request with bearer auth and the client user agent.
    pub fn new(url: &str, api_key: &str) -> Self {
        Self {
            url: url.to_string(),
            headers: vec![
                ("user-agent".to_string(), user_agent()),
                ("Authorization".to_string(), format!("bearer {}", api_key)),
            ],
        }
    }

    pub fn with_workspace(mut self, workspace: Option<&str>) -> Self {
        if let Some(ws) = workspace {
            self.headers
                .push(("X-DashScope-WorkSpace".to_string(), ws.to_string()));
        }
        self
    }

    /// Add extra headers; a header with an existing name replaces it.
    pub fn with_headers(mut self, extra: &[(String, String)]) -> Self {
        for (name, value) in extra {
            self.headers
                .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            self.headers.push((name.clone(), value.clone()));
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// `saysh/<version>; rust; platform/<os>-<arch>`
pub fn user_agent() -> String {
    format!(
        "saysh/{}; rust; platform/{}-{}",
        crate::version_string(),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Opens duplex connections.
pub trait Connector: Send + Sync {
    /// Connect within `timeout`, delivering inbound frames to `handler`.
    ///
    /// Fails with a `Timeout` error when the transport handshake does not
    /// complete in time.
    fn connect(
        &self,
        request: &ConnectRequest,
        handler: Arc<dyn FrameHandler>,
        timeout: Duration,
    ) -> Result<Box<dyn Link>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_carries_bearer_and_user_agent() {
        let req = ConnectRequest::new("wss://example.invalid/ws", "sk-test");
        assert_eq!(req.header("authorization"), Some("bearer sk-test"));
        assert!(req.header("User-Agent").unwrap().starts_with("saysh/"));
        assert_eq!(req.header("X-DashScope-WorkSpace"), None);
    }

    #[test]
    fn workspace_header_is_optional() {
        let req = ConnectRequest::new("wss://x", "k").with_workspace(Some("ws-1"));
        assert_eq!(req.header("x-dashscope-workspace"), Some("ws-1"));
    }

    #[test]
    fn extra_headers_replace_existing() {
        let req = ConnectRequest::new("wss://x", "k").with_headers(&[
            ("user-agent".to_string(), "custom".to_string()),
            ("X-Trace".to_string(), "1".to_string()),
        ]);
        assert_eq!(req.header("user-agent"), Some("custom"));
        assert_eq!(req.header("x-trace"), Some("1"));
        assert_eq!(
            req.headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case("user-agent"))
                .count(),
            1
        );
    }
}
