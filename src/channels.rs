//! Feature Channels (C9): the four built-in pseudo-scheme handlers —
//! `config://`, `logs://`, `recorder://`, `worker://`. GET returns the
//! (out-of-scope, here placeholder) static asset verbatim; `config://` and
//! `recorder://` also accept a JSON `POST` that mutates process state.

use std::sync::Arc;

use http::{HeaderValue, Method, StatusCode};
use serde::Deserialize;

use crate::dispatch::DispatchResponse;
use crate::error::ProxyError;
use crate::recorder::Mode;
use crate::state::{ConfigPatch, State};

const CONFIG_HTML: &str = include_str!("../assets/config.html");
const LOGS_HTML: &str = include_str!("../assets/logs.html");
const RECORDER_HTML: &str = include_str!("../assets/recorder.html");
const WORKER_JS: &str = include_str!("../assets/local-traffic-worker.js");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Config,
    Logs,
    Recorder,
    Worker,
}

/// Identify a built-in pseudo-scheme from a resolved destination string
/// (§4.5's "Built-in pseudo-schemes... delegate to C9").
pub fn channel_for_scheme(target: &str) -> Option<Channel> {
    match target.split("://").next()? {
        "config" => Some(Channel::Config),
        "logs" => Some(Channel::Logs),
        "recorder" => Some(Channel::Recorder),
        "worker" => Some(Channel::Worker),
        _ => None,
    }
}

fn html_response(body: &str) -> DispatchResponse {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
    DispatchResponse {
        status: StatusCode::OK,
        headers,
        body: body.as_bytes().to_vec(),
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> DispatchResponse {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    DispatchResponse { status, headers, body }
}

/// §4.9's CORS clause: "respect `disableWebSecurity` by dropping CORS
/// checks when true." We only ever serve same-origin assets here, so the
/// "check" that would normally run is simply skipped; this function exists
/// as the single place that decision is made, so C9 handlers don't each
/// reimplement it.
pub fn cors_enforced(disable_web_security: bool) -> bool {
    !disable_web_security
}

/// `config://` GET: return the active configuration, with defaults already
/// filled in by `serde`, as JSON.
pub fn handle_config_get(config: &crate::config::Configuration) -> Result<DispatchResponse, ProxyError> {
    let json = serde_json::to_vec_pretty(config)
        .map_err(|e| ProxyError::ConfigInvalid(format!("failed to serialize config: {}", e)))?;
    Ok(json_response(StatusCode::OK, json))
}

/// `config://` POST: parse the body as a full `Configuration`, apply it via
/// `State::update`, and persist it to the on-disk config file.
pub async fn handle_config_post(
    state: &Arc<State>,
    config_path: &std::path::Path,
    body: &[u8],
) -> Result<DispatchResponse, ProxyError> {
    let new_config: crate::config::Configuration = serde_json::from_slice(body)
        .map_err(|e| ProxyError::ConfigInvalid(format!("invalid config POST body: {}", e)))?;
    let normalized = crate::config::normalize(new_config);

    state
        .update(ConfigPatch {
            new_config: normalized.clone(),
        })
        .await
        .map_err(|e| ProxyError::ConfigInvalid(e.to_string()))?;

    crate::config::write(config_path, &normalized)
        .await
        .map_err(|e| ProxyError::ConfigInvalid(format!("failed to persist config: {}", e)))?;

    Ok(json_response(StatusCode::OK, b"{\"ok\":true}".to_vec()))
}

pub fn handle_logs_get() -> DispatchResponse {
    html_response(LOGS_HTML)
}

pub fn handle_recorder_get() -> DispatchResponse {
    html_response(RECORDER_HTML)
}

#[derive(Deserialize)]
struct RecorderPatch {
    mode: String,
    #[serde(rename = "autoRecord")]
    auto_record: Option<bool>,
    #[serde(default)]
    strict: bool,
}

/// `recorder://` POST: switch between `proxy`/`mock` mode and optionally
/// set `autoRecord`/`strict` (§4.8 mode transitions).
pub async fn handle_recorder_post(state: &Arc<State>, body: &[u8]) -> Result<DispatchResponse, ProxyError> {
    let patch: RecorderPatch = serde_json::from_slice(body)
        .map_err(|e| ProxyError::ConfigInvalid(format!("invalid recorder POST body: {}", e)))?;

    let new_mode = match patch.mode.as_str() {
        "mock" => Mode::Mock,
        "proxy" => Mode::Proxy,
        other => return Err(ProxyError::ConfigInvalid(format!("unknown recorder mode: {}", other))),
    };

    let current_mode = state.mode().await;
    let current_auto_record = state.mock_store.lock().await.auto_record;
    let next_auto_record =
        crate::recorder::apply_mode_transition(current_mode, new_mode, current_auto_record, patch.auto_record);

    {
        let mut store = state.mock_store.lock().await;
        store.auto_record = next_auto_record;
        store.strict = patch.strict;
    }
    state.set_mode(new_mode).await;

    Ok(json_response(StatusCode::OK, b"{\"ok\":true}".to_vec()))
}

pub fn handle_worker_get() -> DispatchResponse {
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/javascript; charset=utf-8"),
    );
    DispatchResponse {
        status: StatusCode::OK,
        headers,
        body: WORKER_JS.as_bytes().to_vec(),
    }
}

/// Dispatch a request already known to target a built-in channel. `server.rs`
/// calls this once C2 has resolved the scheme via `channel_for_scheme`.
pub async fn dispatch_channel(
    channel: Channel,
    method: &Method,
    body: &[u8],
    state: &Arc<State>,
    config_path: &std::path::Path,
) -> Result<DispatchResponse, ProxyError> {
    match (channel, method) {
        (Channel::Config, &Method::GET) => {
            let (config, _) = state.snapshot().await;
            handle_config_get(&config)
        }
        (Channel::Config, &Method::POST) => handle_config_post(state, config_path, body).await,
        (Channel::Logs, &Method::GET) => Ok(handle_logs_get()),
        (Channel::Recorder, &Method::GET) => Ok(handle_recorder_get()),
        (Channel::Recorder, &Method::POST) => handle_recorder_post(state, body).await,
        (Channel::Worker, &Method::GET) => Ok(handle_worker_get()),
        _ => Ok(DispatchResponse {
            status: StatusCode::METHOD_NOT_ALLOWED,
            headers: http::HeaderMap::new(),
            body: Vec::new(),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Configuration;

    #[test]
    pub fn channel_for_scheme_identifies_all_four_builtins() {
        assert_eq!(channel_for_scheme("config://"), Some(Channel::Config));
        assert_eq!(channel_for_scheme("logs://"), Some(Channel::Logs));
        assert_eq!(channel_for_scheme("recorder://"), Some(Channel::Recorder));
        assert_eq!(channel_for_scheme("worker://"), Some(Channel::Worker));
        assert_eq!(channel_for_scheme("https://example.com"), None);
    }

    #[test]
    pub fn config_get_serializes_active_configuration() {
        let response = handle_config_get(&Configuration::default()).unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(String::from_utf8(response.body).unwrap().contains("\"port\""));
    }

    #[test]
    pub fn worker_get_serves_embedded_script() {
        let response = handle_worker_get();
        assert_eq!(response.status, StatusCode::OK);
        assert!(!response.body.is_empty());
    }

    #[tokio::test]
    pub async fn recorder_post_mock_to_proxy_clears_auto_record_by_default() {
        let state = State::new(Configuration::default()).unwrap();
        state.set_mode(Mode::Mock).await;
        state.mock_store.lock().await.auto_record = true;

        let response = handle_recorder_post(&state, br#"{"mode":"proxy"}"#).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert!(!state.mock_store.lock().await.auto_record);
        assert_eq!(state.mode().await, Mode::Proxy);
    }

    #[test]
    pub fn cors_is_skipped_when_web_security_disabled() {
        assert!(!cors_enforced(true));
        assert!(cors_enforced(false));
    }
}
