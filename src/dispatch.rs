//! Downstream Dispatcher (C5): HTTP/2-attempt-then-HTTP/1.1-fallback against
//! remote origins, plus the `file://` and `data:` synthesized-response
//! handlers. Built-in pseudo-schemes are handled by `channels.rs`; this
//! module only decides *that* a scheme is one of those and leaves the
//! dispatch to the caller (`server.rs`), matching §4.5's "delegate to C9".

use std::convert::TryFrom;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::ProxyError;

/// A buffered HTTP exchange result. Bodies are fully buffered (not streamed)
/// because C3/C4 need the whole payload in hand to decode, rewrite, and
/// re-encode it — the same tradeoff the teacher makes for WASM stdin/stdout
/// in `stream_writer.rs`, which buffers the full guest output before it is
/// ever written to the client.
#[derive(Debug)]
pub struct DispatchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Headers that make no sense to forward to an HTTP/2 peer, or that hyper /
/// h2 compute for themselves from the connection and must not be duplicated
/// by hand (§4.5 "drop forbidden HTTP/2 headers").
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-connection",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// §4.5 outbound header translation: drop hop-by-hop headers and replace
/// occurrences of the inbound hostname in header *values* with the
/// downstream target host (e.g. a `Referer` header pointing back at the
/// proxy).
pub fn translate_outbound_headers(
    headers: &HeaderMap,
    inbound_host: &str,
    downstream_host: &str,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        let translated = match value.to_str() {
            Ok(s) if s.contains(inbound_host) => {
                HeaderValue::from_str(&s.replace(inbound_host, downstream_host)).unwrap_or_else(|_| value.clone())
            }
            _ => value.clone(),
        };
        out.append(name, translated);
    }
    out
}

/// §4.5 inbound header translation: strip HTTP/2 pseudo-headers (defensive;
/// `h2`/`hyper` generally keep these out of the `HeaderMap` already), rewrite
/// `Set-Cookie` `Domain=` attributes from the downstream host (and its
/// dot-subdomains) back to the inbound hostname, and leave `Location` to the
/// mapping-aware rewrite in `mapping::rewrite_response_location`.
pub fn translate_inbound_headers(
    headers: &HeaderMap,
    downstream_host: &str,
    inbound_host: &str,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if name.as_str().starts_with(':') {
            continue;
        }
        if name == http::header::SET_COOKIE {
            if let Ok(s) = value.to_str() {
                let rewritten = rewrite_set_cookie_domain(s, downstream_host, inbound_host);
                if let Ok(hv) = HeaderValue::from_str(&rewritten) {
                    out.append(name, hv);
                    continue;
                }
            }
        }
        out.append(name, value.clone());
    }
    out
}

/// `host` and each of its parent domains, down to (but excluding) the bare
/// top-level label — e.g. `api.example.com` yields `["api.example.com",
/// "example.com"]`, never a lone `"com"`. A single-label host (e.g.
/// `localhost`) yields just itself.
fn host_and_parent_domains(host: &str) -> Vec<String> {
    let labels: Vec<&str> = host.split('.').collect();
    let mut suffixes = Vec::new();
    for start in 0..labels.len() {
        if start > 0 && labels.len() - start < 2 {
            break;
        }
        suffixes.push(labels[start..].join("."));
    }
    suffixes
}

/// §4.5: "rewrite `Set-Cookie` `Domain=` attributes from the target host
/// (and each of its dot-subdomains) to the inbound hostname." Tries every
/// `Domain=`/`domain=` form — bare and leading-dot — for the downstream host
/// and each of its parent domains, preserving whether the matched form
/// carried a leading dot.
fn rewrite_set_cookie_domain(cookie: &str, downstream_host: &str, inbound_host: &str) -> String {
    let downstream_bare = downstream_host.split(':').next().unwrap_or(downstream_host);
    let inbound_bare = inbound_host.split(':').next().unwrap_or(inbound_host);

    let mut result = cookie.to_string();
    for suffix in host_and_parent_domains(downstream_bare) {
        let candidates = [
            (format!("Domain={}", suffix), false),
            (format!("domain={}", suffix), false),
            (format!("Domain=.{}", suffix), true),
            (format!("domain=.{}", suffix), true),
        ];
        for (candidate, has_leading_dot) in &candidates {
            if result.contains(candidate.as_str()) {
                let replacement = if *has_leading_dot {
                    format!("Domain=.{}", inbound_bare)
                } else {
                    format!("Domain={}", inbound_bare)
                };
                result = result.replace(candidate.as_str(), &replacement);
            }
        }
    }
    result
}

fn authority_of(uri: &Uri) -> Option<String> {
    uri.authority().map(|a| a.as_str().to_string())
}

/// The outbound attempt state machine of §4.5, reduced to its externally
/// observable outcome: which protocol actually carried the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolUsed {
    Http2,
    Http1,
}

/// Dispatch a request whose target scheme is `http`/`https` (§4.5).
///
/// Attempts HTTP/2 first (unless `dont_use_http2_downstream`), racing the
/// connection attempt against `connect_timeout`. A timeout unconditionally
/// falls back to HTTP/1.1 (`TimedOut` transition); a connection error before
/// any response bytes are read is retried once as HTTP/1.1
/// (`ErroredConnection` transition); an error after bytes have started
/// arriving is terminal.
pub async fn dispatch_http(
    target: &Uri,
    method: &Method,
    headers: &HeaderMap,
    body: Vec<u8>,
    connect_timeout: Duration,
    dont_use_http2_downstream: bool,
) -> Result<(DispatchResponse, ProtocolUsed), ProxyError> {
    let authority = authority_of(target)
        .ok_or_else(|| ProxyError::ConnectionFailed(format!("no authority in target URL {}", target)))?;
    let ssl = target.scheme_str() == Some("https");

    if !dont_use_http2_downstream {
        match tokio::time::timeout(
            connect_timeout,
            attempt_http2(target, &authority, ssl, method, headers, &body),
        )
        .await
        {
            Ok(Ok(response)) => return Ok((response, ProtocolUsed::Http2)),
            Ok(Err(_)) | Err(_) => {
                // TimedOut or ErroredConnection before bytes: fall back to H1.
            }
        }
    }

    let response = attempt_http1(target, &authority, ssl, method, headers, &body).await?;
    Ok((response, ProtocolUsed::Http1))
}

async fn connect_tcp(authority: &str, default_port: u16) -> Result<TcpStream, ProxyError> {
    let host_port = if authority.contains(':') {
        authority.to_string()
    } else {
        format!("{}:{}", authority, default_port)
    };
    TcpStream::connect(&host_port)
        .await
        .map_err(|e| ProxyError::ConnectionFailed(format!("{}: {}", host_port, e)))
}

async fn tls_connect(
    stream: TcpStream,
    host: &str,
    alpn: &[&str],
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ProxyError> {
    let root_store = tokio_rustls::rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let mut client_config = tokio_rustls::rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    client_config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::ConnectionFailed(format!("invalid server name {}: {}", host, e)))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProxyError::ConnectionFailed(format!("TLS handshake: {}", e)))
}

fn host_only(authority: &str) -> &str {
    authority.split(':').next().unwrap_or(authority)
}

async fn attempt_http2(
    target: &Uri,
    authority: &str,
    ssl: bool,
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<DispatchResponse, ProxyError> {
    let default_port = if ssl { 443 } else { 80 };
    let tcp = connect_tcp(authority, default_port).await?;

    let mut request_builder = http::Request::builder().method(method.clone()).uri(target.clone());
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            request_builder = request_builder.header(name, value);
        }
    }

    if ssl {
        let tls_stream = tls_connect(tcp, host_only(authority), &["h2"]).await?;
        let (_, session) = tls_stream.get_ref();
        if session.alpn_protocol() != Some(b"h2") {
            return Err(ProxyError::ProtocolFallback("downstream did not negotiate h2".into()));
        }
        run_h2(TokioIo::new(tls_stream), request_builder, body).await
    } else {
        run_h2(TokioIo::new(tcp), request_builder, body).await
    }
}

async fn run_h2<T>(
    io: T,
    request_builder: http::request::Builder,
    body: &[u8],
) -> Result<DispatchResponse, ProxyError>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut send_request, connection) = h2::client::handshake(io)
        .await
        .map_err(|e| ProxyError::ProtocolFallback(format!("h2 handshake: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "h2 connection task ended");
        }
    });

    let request = request_builder
        .body(())
        .map_err(|e| ProxyError::ConnectionFailed(format!("building h2 request: {}", e)))?;

    let end_of_stream = body.is_empty();
    let (response_future, mut send_stream) = send_request
        .send_request(request, end_of_stream)
        .map_err(|e| ProxyError::DownstreamError(format!("h2 send_request: {}", e)))?;

    if !end_of_stream {
        send_stream
            .send_data(Bytes::copy_from_slice(body), true)
            .map_err(|e| ProxyError::DownstreamError(format!("h2 send_data: {}", e)))?;
    }

    let response = response_future
        .await
        .map_err(|e| ProxyError::DownstreamError(format!("h2 response: {}", e)))?;
    let (parts, mut recv_stream) = response.into_parts();

    let mut body_bytes = Vec::new();
    while let Some(chunk) = recv_stream.data().await {
        let chunk = chunk.map_err(|e| ProxyError::DownstreamError(format!("h2 body: {}", e)))?;
        let _ = recv_stream.flow_control().release_capacity(chunk.len());
        body_bytes.extend_from_slice(&chunk);
    }

    Ok(DispatchResponse {
        status: parts.status,
        headers: parts.headers,
        body: body_bytes,
    })
}

async fn attempt_http1(
    target: &Uri,
    authority: &str,
    ssl: bool,
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<DispatchResponse, ProxyError> {
    let default_port = if ssl { 443 } else { 80 };
    let tcp = connect_tcp(authority, default_port).await?;

    if ssl {
        let tls_stream = tls_connect(tcp, host_only(authority), &["http/1.1"]).await?;
        run_h1(TokioIo::new(tls_stream), target, authority, method, headers, body).await
    } else {
        run_h1(TokioIo::new(tcp), target, authority, method, headers, body).await
    }
}

async fn run_h1<T>(
    io: T,
    target: &Uri,
    authority: &str,
    method: &Method,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<DispatchResponse, ProxyError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| ProxyError::ConnectionFailed(format!("h1 handshake: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "h1 connection task ended");
        }
    });

    let path_and_query = target.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let mut builder = http::Request::builder()
        .method(method.clone())
        .uri(path_and_query)
        .header(http::header::HOST, authority);
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    let request = builder
        .body(Full::new(Bytes::copy_from_slice(body)))
        .map_err(|e| ProxyError::ConnectionFailed(format!("building h1 request: {}", e)))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ProxyError::DownstreamError(format!("h1 send_request: {}", e)))?;
    let (parts, body) = response.into_parts();
    let collected = body
        .collect()
        .await
        .map_err(|e| ProxyError::DownstreamError(format!("h1 body: {}", e)))?;

    Ok(DispatchResponse {
        status: parts.status,
        headers: parts.headers,
        body: collected.to_bytes().to_vec(),
    })
}

/// `file://` handler (§4.5): the authority+path addresses a filesystem path;
/// directory listings are not served here (a wildcard mapping resolves a
/// directory destination into a per-file `$1` capture before dispatch ever
/// sees it, per C1's normalization).
pub async fn dispatch_file(target: &str) -> Result<DispatchResponse, ProxyError> {
    let path = file_url_to_path(target);
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut headers = HeaderMap::new();
            headers.insert(http::header::SERVER, HeaderValue::from_static("local"));
            let mime = mime_guess_from_path(&path);
            if let Ok(value) = HeaderValue::from_str(mime) {
                headers.insert(http::header::CONTENT_TYPE, value);
            }
            Ok(DispatchResponse {
                status: StatusCode::OK,
                headers,
                body: bytes,
            })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ProxyError::FileNotFound(path.display().to_string()))
        }
        Err(e) => Err(ProxyError::FileIOError(format!("{}: {}", path.display(), e))),
    }
}

fn file_url_to_path(target: &str) -> std::path::PathBuf {
    let rest = target.strip_prefix("file://").unwrap_or(target);
    std::path::PathBuf::from(format!("/{}", rest.trim_start_matches('/')))
}

fn mime_guess_from_path(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" => "text/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// `data:` handler (§4.5): parse the RFC 2397 URI and synthesize a response
/// carrying the declared MIME type and inline body.
pub fn dispatch_data(target: &str) -> Result<DispatchResponse, ProxyError> {
    let url = data_url::DataUrl::process(target)
        .map_err(|e| ProxyError::ConnectionFailed(format!("invalid data: URI: {:?}", e)))?;
    let (body, _fragment) = url
        .decode_to_vec()
        .map_err(|e| ProxyError::ConnectionFailed(format!("invalid data: URI body: {:?}", e)))?;

    let mime = url.mime_type().to_string();
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&mime) {
        headers.insert(http::header::CONTENT_TYPE, value);
    }

    Ok(DispatchResponse {
        status: StatusCode::OK,
        headers,
        body,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn hop_by_hop_headers_are_dropped_outbound() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::HOST, HeaderValue::from_static("localhost:8080"));
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(http::header::ACCEPT, HeaderValue::from_static("text/html"));

        let translated = translate_outbound_headers(&headers, "localhost:8080", "example.com");
        assert!(!translated.contains_key(http::header::HOST));
        assert!(!translated.contains_key(http::header::CONNECTION));
        assert!(translated.contains_key(http::header::ACCEPT));
    }

    #[test]
    pub fn inbound_hostname_in_header_value_is_replaced_outbound() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::REFERER,
            HeaderValue::from_static("http://localhost:8080/page"),
        );
        let translated = translate_outbound_headers(&headers, "localhost:8080", "example.com");
        assert_eq!(
            translated.get(http::header::REFERER).unwrap().to_str().unwrap(),
            "http://example.com/page"
        );
    }

    #[test]
    pub fn pseudo_headers_are_stripped_inbound() {
        let mut headers = HeaderMap::new();
        // HeaderMap itself can't hold a literal `:status` name (invalid per
        // the http crate), but translate_inbound_headers defends against a
        // permissive upstream anyway; exercise the ordinary path here.
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/html"));
        let translated = translate_inbound_headers(&headers, "example.com", "localhost:8080");
        assert!(translated.contains_key(http::header::CONTENT_TYPE));
    }

    #[test]
    pub fn set_cookie_domain_is_rewritten_inbound() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::SET_COOKIE,
            HeaderValue::from_static("session=abc; Domain=example.com; Path=/"),
        );
        let translated = translate_inbound_headers(&headers, "example.com", "localhost:8080");
        let value = translated.get(http::header::SET_COOKIE).unwrap().to_str().unwrap();
        // Domain attributes don't carry ports, so only the bare host survives.
        assert!(value.contains("Domain=localhost"));
        assert!(!value.contains("Domain=localhost:8080"));
    }

    #[test]
    pub fn set_cookie_dot_subdomain_keeps_leading_dot() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::SET_COOKIE,
            HeaderValue::from_static("session=abc; Domain=.example.com; Path=/"),
        );
        let translated = translate_inbound_headers(&headers, "example.com", "localhost:8080");
        let value = translated.get(http::header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(value.contains("Domain=.localhost"));
    }

    #[test]
    pub fn set_cookie_domain_rewrites_parent_domain_of_downstream_host() {
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::SET_COOKIE,
            HeaderValue::from_static("session=abc; Domain=.api.example.com; Path=/"),
        );
        let translated = translate_inbound_headers(&headers, "api.example.com", "localhost:8080");
        let value = translated.get(http::header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(value.contains("Domain=.localhost"));
    }

    #[test]
    pub fn host_and_parent_domains_stops_before_bare_tld() {
        assert_eq!(
            host_and_parent_domains("api.example.com"),
            vec!["api.example.com".to_string(), "example.com".to_string()]
        );
        assert_eq!(host_and_parent_domains("localhost"), vec!["localhost".to_string()]);
    }

    #[tokio::test]
    pub async fn file_handler_reads_existing_file() {
        let dir = std::env::temp_dir().join(format!("local-traffic-dispatch-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("hello.txt");
        tokio::fs::write(&path, b"hello file").await.unwrap();

        let target = format!("file://{}", path.display());
        let response = dispatch_file(&target).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, b"hello file");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    pub async fn file_handler_missing_file_is_not_found() {
        let err = dispatch_file("file:///definitely/not/a/real/path.txt").await.unwrap_err();
        assert!(matches!(err, ProxyError::FileNotFound(_)));
    }

    #[test]
    pub fn data_uri_handler_decodes_body_and_mime() {
        let response = dispatch_data("data:text/plain;base64,aGVsbG8=").unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, b"hello");
        assert_eq!(
            response.headers.get(http::header::CONTENT_TYPE).unwrap().to_str().unwrap(),
            "text/plain"
        );
    }
}
