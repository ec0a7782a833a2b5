//! Error taxonomy (§7) and the HTML error renderer (C10).

use std::fmt;

/// Which of the four inbound pipeline phases an error happened in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Mapping,
    Connection,
    Send,
    Receive,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Mapping => "mapping",
            Phase::Connection => "connection",
            Phase::Send => "send",
            Phase::Receive => "receive",
        };
        f.write_str(s)
    }
}

/// The error kinds from §7, one per `thiserror` variant so C10 can match on
/// kind instead of sniffing message strings.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("No mapping found in config file")]
    NoMapping,

    #[error("Could not connect downstream: {0}")]
    ConnectionFailed(String),

    #[error("Protocol fallback: {0}")]
    ProtocolFallback(String),

    #[error("Downstream error: {0}")]
    DownstreamError(String),

    #[error("Unsupported content-encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("No corresponding mock found in the server.")]
    MockMiss,

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("I/O error reading file: {0}")]
    FileIOError(String),
}

impl ProxyError {
    /// The phase this error is surfaced as, per §7's per-kind table.
    pub fn phase(&self) -> Phase {
        match self {
            ProxyError::NoMapping => Phase::Mapping,
            ProxyError::ConnectionFailed(_) => Phase::Connection,
            ProxyError::ProtocolFallback(_) => Phase::Connection,
            ProxyError::DownstreamError(_) => Phase::Receive,
            ProxyError::UnsupportedEncoding(_) => Phase::Receive,
            ProxyError::MockMiss => Phase::Connection,
            ProxyError::ConfigInvalid(_) => Phase::Mapping,
            ProxyError::FileNotFound(_) => Phase::Connection,
            ProxyError::FileIOError(_) => Phase::Connection,
        }
    }

    /// HTTP status this error should be surfaced to the inbound client as.
    pub fn status(&self) -> http::StatusCode {
        match self {
            ProxyError::FileNotFound(_) => http::StatusCode::NOT_FOUND,
            ProxyError::FileIOError(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            _ => http::StatusCode::BAD_GATEWAY,
        }
    }

    fn emoji(&self) -> &'static str {
        match self {
            ProxyError::NoMapping => "🗺️",
            ProxyError::ConnectionFailed(_) => "🔌",
            ProxyError::ProtocolFallback(_) => "↩️",
            ProxyError::DownstreamError(_) => "💥",
            ProxyError::UnsupportedEncoding(_) => "📦",
            ProxyError::MockMiss => "🎭",
            ProxyError::ConfigInvalid(_) => "⚙️",
            ProxyError::FileNotFound(_) => "🔎",
            ProxyError::FileIOError(_) => "💾",
        }
    }
}

/// Renders the styled HTML error page described in §4.10.
///
/// `requested_url` and `downstream_url` are best-effort: a route that never
/// resolved has no downstream URL to show.
pub fn render_error_page(
    err: &ProxyError,
    requested_url: &str,
    downstream_url: Option<&str>,
) -> String {
    let phase = err.phase();
    let downstream = downstream_url.unwrap_or("(none)");
    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>{emoji} Proxy error</title>
<style>
body {{ font-family: sans-serif; background: #1e1e1e; color: #eee; padding: 2em; }}
h1 {{ font-size: 1.4em; }}
code, pre {{ background: #2d2d2d; padding: 0.2em 0.4em; border-radius: 4px; }}
.note {{ color: #999; margin-top: 2em; font-size: 0.9em; }}
</style>
</head>
<body>
<h1>{emoji} An error happened while trying to proxy a remote exchange</h1>
<p><strong>Phase:</strong> {phase}</p>
<p><strong>Requested URL:</strong> <code>{requested_url}</code></p>
<p><strong>Downstream URL:</strong> <code>{downstream}</code></p>
<p><strong>Message:</strong> {message}</p>
<pre>{debug}</pre>
<p class="note">This issue is local to the proxy; the downstream service may be fine.</p>
</body>
</html>"#,
        emoji = err.emoji(),
        phase = phase,
        requested_url = html_escape(requested_url),
        downstream = html_escape(downstream),
        message = html_escape(&err.to_string()),
        debug = html_escape(&format!("{:?}", err)),
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn no_mapping_renders_expected_strings() {
        let page = render_error_page(&ProxyError::NoMapping, "/foo/bar", None);
        assert!(page.contains("An error happened while trying to proxy a remote exchange"));
        assert!(page.contains("No mapping found in config file"));
    }

    #[test]
    pub fn mock_miss_renders_literal_message() {
        let page = render_error_page(&ProxyError::MockMiss, "/x", Some("https://example.com/x"));
        assert!(page.contains("No corresponding mock found in the server."));
    }

    #[test]
    pub fn status_codes_match_taxonomy() {
        assert_eq!(ProxyError::NoMapping.status(), http::StatusCode::BAD_GATEWAY);
        assert_eq!(
            ProxyError::FileNotFound("x".into()).status(),
            http::StatusCode::NOT_FOUND
        );
    }
}
