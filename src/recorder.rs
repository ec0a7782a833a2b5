//! Recorder / Mock Engine (C8): canonical-digest capture and scored replay
//! matching (§4.8).

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Proxy,
    Mock,
}

/// The mutable mock/replay state; `src/state.rs` owns one of these as part
/// of the process-wide `State`.
#[derive(Default)]
pub struct MockStore {
    /// digest (base64) -> value (base64); preserves insertion order so
    /// duplicate-key replay and "latest wins" tie-breaks are well-defined
    /// (§3 Mock Entry / §4.8).
    pub mocks: IndexMap<String, String>,
    pub auto_record: bool,
    pub strict: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
struct CanonicalExchangeKey {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    #[serde(rename = "bodyBase64")]
    body_base64: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CanonicalExchangeValue {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(rename = "bodyBase64")]
    pub body_base64: String,
}

/// §4.8 canonicalization: lowercase header names, drop anything in
/// `unwanted`, sort by name then value.
pub fn canonicalize_headers(
    headers: &[(String, String)],
    unwanted: &HashSet<String>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .filter(|(name, _)| !unwanted.iter().any(|u| u.eq_ignore_ascii_case(name)))
        .collect();
    out.sort();
    out
}

fn digest_key(method: &str, url: &str, headers: &[(String, String)], body: &[u8]) -> String {
    let key = CanonicalExchangeKey {
        method: method.to_string(),
        url: url.to_string(),
        headers: headers.to_vec(),
        body_base64: BASE64.encode(body),
    };
    let json = serde_json::to_vec(&key).expect("canonical key is always serializable");
    BASE64.encode(json)
}

fn decode_key(digest: &str) -> Option<CanonicalExchangeKey> {
    let bytes = BASE64.decode(digest).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn encode_value(status: u16, headers: &[(String, String)], body: &[u8]) -> String {
    let value = CanonicalExchangeValue {
        status,
        headers: headers.to_vec(),
        body_base64: BASE64.encode(body),
    };
    let json = serde_json::to_vec(&value).expect("canonical value is always serializable");
    BASE64.encode(json)
}

pub fn decode_value(value: &str) -> Result<CanonicalExchangeValue, ProxyError> {
    let bytes = BASE64
        .decode(value)
        .map_err(|e| ProxyError::ConfigInvalid(format!("corrupt mock value: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| ProxyError::ConfigInvalid(format!("corrupt mock value: {}", e)))
}

/// §4.8 Recording: append a completed proxy-mode exchange to the mock map,
/// keyed by its canonical digest. Only called when `auto_record` is set.
pub fn record(
    store: &mut MockStore,
    method: &str,
    url: &str,
    request_headers: &[(String, String)],
    request_body: &[u8],
    status: u16,
    response_headers: &[(String, String)],
    response_body: &[u8],
    unwanted: &HashSet<String>,
) {
    let canonical_headers = canonicalize_headers(request_headers, unwanted);
    let digest = digest_key(method, url, &canonical_headers, request_body);
    let value = encode_value(status, response_headers, response_body);
    store.mocks.insert(digest, value);
}

/// §4.8 Matching: candidates are every stored mock whose (canonicalized,
/// ignore-list-filtered) headers are a *subset* of the incoming request's
/// headers and whose method/url/body match exactly. The candidate with the
/// highest count of matching header+value pairs wins; ties favor the latest
/// insertion.
pub fn find_mock(
    store: &MockStore,
    method: &str,
    url: &str,
    request_headers: &[(String, String)],
    request_body: &[u8],
    unwanted: &HashSet<String>,
) -> Option<&str> {
    let request_canonical = canonicalize_headers(request_headers, unwanted);
    let request_set: HashSet<&(String, String)> = request_canonical.iter().collect();

    let mut best: Option<(usize, &str)> = None;
    for (digest, value) in store.mocks.iter() {
        let Some(key) = decode_key(digest) else { continue };
        if key.method != method || key.url != url {
            continue;
        }
        if key.body_base64 != BASE64.encode(request_body) {
            continue;
        }
        let is_subset = key.headers.iter().all(|pair| request_set.contains(pair));
        if !is_subset {
            continue;
        }

        let score = key
            .headers
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
            .count();

        match best {
            Some((best_score, _)) if best_score > score => {}
            _ => best = Some((score, value.as_str())),
        }
    }

    best.map(|(_, value)| value)
}

/// §4.8 mode transitions / §8 invariant 7: switching from `mock` to `proxy`
/// clears `autoRecord` unless the patch explicitly re-asserts it.
pub fn apply_mode_transition(from: Mode, to: Mode, current_auto_record: bool, patch_auto_record: Option<bool>) -> bool {
    match (from, to, patch_auto_record) {
        (Mode::Mock, Mode::Proxy, Some(explicit)) => explicit,
        (Mode::Mock, Mode::Proxy, None) => false,
        (_, _, Some(explicit)) => explicit,
        (_, _, None) => current_auto_record,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    pub fn canonicalization_lowercases_filters_and_sorts() {
        let unwanted: HashSet<String> = ["X-Trace-Id".to_string()].into_iter().collect();
        let canonical = canonicalize_headers(
            &headers(&[("Host", "example.com"), ("X-Trace-Id", "abc"), ("Accept", "*/*")]),
            &unwanted,
        );
        assert_eq!(
            canonical,
            vec![("accept".to_string(), "*/*".to_string()), ("host".to_string(), "example.com".to_string())]
        );
    }

    #[test]
    pub fn recorded_exchange_is_found_by_exact_request() {
        let mut store = MockStore::default();
        let unwanted = HashSet::new();
        record(
            &mut store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("host", "example.com")]),
            b"",
            200,
            &headers(&[("content-type", "text/plain")]),
            b"matched a mock",
            &unwanted,
        );

        let found = find_mock(
            &store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("host", "example.com")]),
            b"",
            &unwanted,
        );
        assert!(found.is_some());
        let decoded = decode_value(found.unwrap()).unwrap();
        assert_eq!(decoded.body_base64, BASE64.encode(b"matched a mock"));
    }

    #[test]
    pub fn s6_request_with_superset_headers_still_matches() {
        let mut store = MockStore::default();
        let unwanted = HashSet::new();
        record(
            &mut store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("host", "example.com")]),
            b"",
            200,
            &[],
            b"matched a mock",
            &unwanted,
        );

        let found = find_mock(
            &store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("X-My-Header", "My-Value"), ("host", "example.com")]),
            b"",
            &unwanted,
        );
        assert!(found.is_some());
    }

    #[test]
    pub fn s6_reverse_mock_with_extra_header_does_not_match() {
        let mut store = MockStore::default();
        let unwanted = HashSet::new();
        record(
            &mut store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("host", "example.com"), ("x-my-header", "my-value")]),
            b"",
            200,
            &[],
            b"matched a mock",
            &unwanted,
        );

        let found = find_mock(
            &store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("host", "example.com")]),
            b"",
            &unwanted,
        );
        assert!(found.is_none());
    }

    #[test]
    pub fn higher_overlap_score_wins_over_lower() {
        let mut store = MockStore::default();
        let unwanted = HashSet::new();
        record(
            &mut store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("host", "example.com")]),
            b"",
            200,
            &[],
            b"low score",
            &unwanted,
        );
        record(
            &mut store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("host", "example.com"), ("accept", "text/html")]),
            b"",
            200,
            &[],
            b"high score",
            &unwanted,
        );

        let found = find_mock(
            &store,
            "GET",
            "http://localhost:8080/x",
            &headers(&[("host", "example.com"), ("accept", "text/html")]),
            b"",
            &unwanted,
        );
        let decoded = decode_value(found.unwrap()).unwrap();
        assert_eq!(decoded.body_base64, BASE64.encode(b"high score"));
    }

    #[test]
    pub fn mode_switch_from_mock_to_proxy_clears_auto_record_by_default() {
        let result = apply_mode_transition(Mode::Mock, Mode::Proxy, true, None);
        assert!(!result);
    }

    #[test]
    pub fn mode_switch_from_mock_to_proxy_keeps_auto_record_when_explicit() {
        let result = apply_mode_transition(Mode::Mock, Mode::Proxy, true, Some(true));
        assert!(result);
    }
}
