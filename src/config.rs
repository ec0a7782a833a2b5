//! Config Store & Watcher (C1): load, normalize, and hot-reload the mapping
//! file described in §3/§4.1.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// One mapping destination. A plain string in the JSON file is shorthand for
/// `{ downstreamUrl: <string> }`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Destination {
    Simple(String),
    Detailed {
        #[serde(rename = "downstreamUrl")]
        downstream_url: String,
        #[serde(rename = "replaceBody", skip_serializing_if = "Option::is_none")]
        replace_body: Option<String>,
    },
}

impl Destination {
    pub fn downstream_url(&self) -> &str {
        match self {
            Destination::Simple(u) => u,
            Destination::Detailed { downstream_url, .. } => downstream_url,
        }
    }

    pub fn replace_body(&self) -> Option<&str> {
        match self {
            Destination::Simple(_) => None,
            Destination::Detailed { replace_body, .. } => replace_body.as_deref(),
        }
    }

    fn with_downstream_url(&self, url: String) -> Destination {
        match self {
            Destination::Simple(_) => Destination::Simple(url),
            Destination::Detailed { replace_body, .. } => Destination::Detailed {
                downstream_url: url,
                replace_body: replace_body.clone(),
            },
        }
    }

    fn append_wildcard(&self) -> Destination {
        let url = format!("{}/$$1", self.downstream_url());
        match self {
            Destination::Simple(_) => Destination::Simple(url),
            Destination::Detailed { replace_body, .. } => Destination::Detailed {
                downstream_url: url,
                replace_body: replace_body
                    .as_ref()
                    .map(|b| format!("{}/$$1", b)),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub key: String,
    pub cert: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossOrigin {
    #[serde(rename = "urlPattern", default)]
    pub url_pattern: String,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub credentials: bool,
    #[serde(rename = "serverSide", default)]
    pub server_side: bool,
}

impl Default for CrossOrigin {
    fn default() -> Self {
        CrossOrigin {
            url_pattern: String::new(),
            whitelist: Vec::new(),
            credentials: false,
            server_side: false,
        }
    }
}

fn default_connect_timeout() -> u64 {
    3000
}
fn default_socket_timeout() -> u64 {
    5000
}
fn default_port() -> u16 {
    8080
}

/// The single source of truth (§3). Field order of `mapping` is significant:
/// first match wins, and the empty-string default key must sort last.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub mapping: IndexMap<String, Destination>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: Option<TlsMaterial>,

    #[serde(rename = "connectTimeout", default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    #[serde(rename = "socketTimeout", default = "default_socket_timeout")]
    pub socket_timeout_ms: u64,

    #[serde(rename = "replaceRequestBodyUrls", default)]
    pub replace_request_body_urls: bool,
    #[serde(rename = "replaceResponseBodyUrls", default)]
    pub replace_response_body_urls: bool,
    #[serde(rename = "dontUseHttp2Downstream", default)]
    pub dont_use_http2_downstream: bool,
    #[serde(rename = "dontTranslateLocationHeader", default)]
    pub dont_translate_location_header: bool,
    #[serde(rename = "simpleLogs", default)]
    pub simple_logs: bool,
    #[serde(rename = "logAccessInTerminal", default)]
    pub log_access_in_terminal: bool,
    #[serde(default)]
    pub websocket: bool,
    #[serde(rename = "disableWebSecurity", default)]
    pub disable_web_security: bool,

    #[serde(rename = "unwantedHeaderNamesInMocks", default)]
    pub unwanted_header_names_in_mocks: HashSet<String>,

    #[serde(rename = "crossOrigin", default)]
    pub cross_origin: CrossOrigin,
}

impl Default for Configuration {
    fn default() -> Self {
        let mut mapping = IndexMap::new();
        mapping.insert("/config/".to_string(), Destination::Simple("config://".to_string()));
        mapping.insert("/logs/".to_string(), Destination::Simple("logs://".to_string()));
        mapping.insert(
            "/recorder/".to_string(),
            Destination::Simple("recorder://".to_string()),
        );
        mapping.insert(
            "/local-traffic-worker.js".to_string(),
            Destination::Simple("worker://".to_string()),
        );
        Configuration {
            mapping,
            port: default_port(),
            ssl: None,
            connect_timeout_ms: default_connect_timeout(),
            socket_timeout_ms: default_socket_timeout(),
            replace_request_body_urls: false,
            replace_response_body_urls: false,
            dont_use_http2_downstream: false,
            dont_translate_location_header: false,
            simple_logs: false,
            log_access_in_terminal: false,
            websocket: true,
            disable_web_security: false,
            unwanted_header_names_in_mocks: HashSet::new(),
            cross_origin: CrossOrigin::default(),
        }
    }
}

const BUILTIN_ROUTES: &[(&str, &str)] = &[
    ("/config/", "config://"),
    ("/logs/", "logs://"),
    ("/recorder/", "recorder://"),
    ("/local-traffic-worker.js", "worker://"),
];

/// Directory-wildcard detection: a destination that looks like a directory
/// (no dot in the final path segment, or an explicit trailing slash) gets its
/// pattern and destination rewritten to a `/(.*)` wildcard (§4.1, S7).
fn looks_like_directory(destination_url: &str) -> bool {
    if destination_url.ends_with('/') {
        return true;
    }
    let last_segment = destination_url.rsplit('/').next().unwrap_or("");
    !last_segment.is_empty() && !last_segment.contains('.')
}

/// Only `file://` destinations are eligible for the auto-wildcard rule: a
/// `http(s)://` destination ending in `/` is a perfectly ordinary literal
/// mapping (C4's URL rewriter handles the "rest of the path carries
/// through" behavior for those without any help from the compiled regex —
/// see `url_rewrite.rs`), whereas a bare filesystem directory has no
/// natural "whatever comes after" semantics unless we give it one.
fn is_wildcardable_destination(destination_url: &str) -> bool {
    destination_url.starts_with("file://")
}

/// Apply §4.1's normalization rules in place: directory wildcarding, built-in
/// route insertion, and moving the default (`""`) key to the end.
pub fn normalize(mut config: Configuration) -> Configuration {
    let mut normalized: IndexMap<String, Destination> = IndexMap::new();

    for (key, destination) in config.mapping.drain(..) {
        if key.is_empty() {
            // default route; reinserted last below
            normalized.insert(key, destination);
            continue;
        }
        if is_wildcardable_destination(destination.downstream_url())
            && looks_like_directory(destination.downstream_url())
            && !key.ends_with("(.*)")
        {
            let trimmed_key = key.trim_end_matches('/');
            let new_key = format!("{}/(.*)", trimmed_key);
            let new_destination = destination.append_wildcard();
            normalized.insert(new_key, new_destination);
        } else {
            normalized.insert(key, destination);
        }
    }

    for (path, scheme) in BUILTIN_ROUTES {
        if !normalized.contains_key(*path) {
            normalized.insert(path.to_string(), Destination::Simple(scheme.to_string()));
        }
    }

    // Move default route to the end, if present.
    if let Some(default_dest) = normalized.shift_remove("") {
        normalized.insert(String::new(), default_dest);
    }

    config.mapping = normalized;
    config
}

/// Read the config file at `path`. On a missing file: write defaults if
/// `write_if_missing`, else return defaults silently. On parse failure:
/// return defaults and log at warn (§4.1 Failure rules).
pub async fn load(path: &Path, write_if_missing: bool) -> Configuration {
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<Configuration>(&bytes) {
            Ok(parsed) => normalize(merge_over_defaults(parsed)),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "config file is not valid JSON, falling back to defaults");
                normalize(Configuration::default())
            }
        },
        Err(_) if write_if_missing => {
            let defaults = normalize(Configuration::default());
            if let Err(e) = write(path, &defaults).await {
                tracing::warn!(error = %e, path = %path.display(), "failed to write default config file");
            }
            defaults
        }
        Err(_) => normalize(Configuration::default()),
    }
}

/// `serde`'s `#[serde(default)]` already fills per-field defaults; this exists
/// to name the "merge parsed values over defaults" step from §4.1 explicitly.
fn merge_over_defaults(parsed: Configuration) -> Configuration {
    parsed
}

pub async fn write(path: &Path, config: &Configuration) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(config)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(path, json).await?;
    Ok(())
}

pub fn default_config_path() -> PathBuf {
    if let Ok(p) = std::env::var("LOCAL_TRAFFIC_CONFIG") {
        return PathBuf::from(p);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local-traffic.json")
}

/// Watch the config file for changes, debounced to "latest wins", invoking
/// `on_change` with the freshly loaded+normalized configuration.
///
/// Grounded in the teacher's general pattern of a background OS thread
/// bridged into the tokio runtime (`tls.rs`'s `TlsHyperAcceptor` similarly
/// wraps a non-async primitive for use from async code); `notify`'s watcher
/// is synchronous so we relay its events over a channel.
pub fn watch<F>(path: PathBuf, debounce: Duration, on_change: F) -> notify::Result<notify::RecommendedWatcher>
where
    F: Fn(Configuration) + Send + 'static,
{
    use notify::{Event, RecursiveMode, Watcher};

    let (tx, rx) = std::sync::mpsc::channel::<Event>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;

    if let Some(parent) = path.parent() {
        watcher.watch(parent, RecursiveMode::NonRecursive)?;
    }

    let watched_path = path.clone();
    std::thread::spawn(move || {
        let mut last_fired = std::time::Instant::now() - debounce;
        while let Ok(event) = rx.recv() {
            if !event.paths.iter().any(|p| p == &watched_path) {
                continue;
            }
            // Drain any events queued up within the debounce window so the
            // latest one wins.
            while rx.try_recv().is_ok() {}
            let now = std::time::Instant::now();
            if now.duration_since(last_fired) < debounce {
                continue;
            }
            last_fired = now;

            let runtime = tokio::runtime::Handle::try_current();
            let path = watched_path.clone();
            match runtime {
                Ok(handle) => {
                    let on_change = &on_change;
                    handle.block_on(async {
                        let cfg = load(&path, false).await;
                        on_change(cfg);
                    });
                }
                Err(_) => {
                    tracing::warn!("config watcher fired outside a tokio runtime; skipping reload");
                }
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn defaults_include_builtin_routes() {
        let config = normalize(Configuration::default());
        assert!(config.mapping.contains_key("/config/"));
        assert!(config.mapping.contains_key("/logs/"));
        assert!(config.mapping.contains_key("/recorder/"));
        assert!(config.mapping.contains_key("/local-traffic-worker.js"));
    }

    #[test]
    pub fn default_route_is_moved_to_last() {
        let mut config = Configuration::default();
        config.mapping.insert(
            String::new(),
            Destination::Simple("https://fallback.example.com".to_string()),
        );
        config.mapping.insert(
            "/api/".to_string(),
            Destination::Simple("https://api.example.com".to_string()),
        );
        let normalized = normalize(config);
        let (last_key, _) = normalized.mapping.last().unwrap();
        assert_eq!(last_key, "");
    }

    #[test]
    pub fn directory_destination_is_rewritten_to_wildcard() {
        let mut config = Configuration::default();
        config.mapping.clear();
        config.mapping.insert(
            "/static-webapp".to_string(),
            Destination::Simple("file://home/User/i/am/a/folder".to_string()),
        );
        let normalized = normalize(config);
        assert!(normalized.mapping.contains_key("/static-webapp/(.*)"));
        let dest = normalized.mapping.get("/static-webapp/(.*)").unwrap();
        assert_eq!(dest.downstream_url(), "file://home/User/i/am/a/folder/$$1");
    }

    #[test]
    pub fn http_destination_with_trailing_slash_is_left_literal() {
        let mut config = Configuration::default();
        config.mapping.clear();
        config.mapping.insert(
            "/donate/".to_string(),
            Destination::Simple("https://www.mysite.org/donate/".to_string()),
        );
        let normalized = normalize(config);
        assert!(normalized.mapping.contains_key("/donate/"));
        assert!(!normalized.mapping.contains_key("/donate/(.*)"));
    }

    #[test]
    pub fn pseudo_protocol_destinations_are_never_wildcarded() {
        let config = Configuration::default();
        let normalized = normalize(config);
        assert!(normalized.mapping.contains_key("/config/"));
        assert!(!normalized.mapping.contains_key("/config/(.*)"));
    }

    #[test]
    pub fn non_directory_file_destination_is_untouched() {
        let mut config = Configuration::default();
        config.mapping.clear();
        config.mapping.insert(
            "/favicon.ico".to_string(),
            Destination::Simple("file://home/User/favicon.ico".to_string()),
        );
        let normalized = normalize(config);
        assert!(normalized.mapping.contains_key("/favicon.ico"));
    }

    #[tokio::test]
    pub async fn missing_file_without_write_returns_defaults_silently() {
        let path = std::path::Path::new("/nonexistent/path/that/does/not/exist.json");
        let config = load(path, false).await;
        assert!(config.mapping.contains_key("/config/"));
    }

    #[tokio::test]
    pub async fn missing_file_with_write_creates_it_once() {
        let dir = std::env::temp_dir().join(format!("local-traffic-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("config.json");
        let _ = tokio::fs::remove_file(&path).await;

        let config = load(&path, true).await;
        assert!(config.mapping.contains_key("/config/"));
        assert!(tokio::fs::metadata(&path).await.is_ok());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    pub async fn corrupt_json_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("local-traffic-test-corrupt-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("config.json");
        tokio::fs::write(&path, b"{ not valid json").await.unwrap();

        let config = load(&path, false).await;
        assert!(config.mapping.contains_key("/config/"));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
