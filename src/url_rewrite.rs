//! URL Rewriter (C4): textual substitution across a decoded body, driven by
//! the compiled mapping.

use regex::Regex;

use crate::mapping::Route;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Response body: downstream URLs become proxy-facing URLs.
    Inbound,
    /// Request body: proxy-facing URLs become downstream URLs.
    Outbound,
}

/// Characters a captured URL remainder may contain; stops at whitespace and
/// quote/bracket characters so a substitution inside prose text doesn't run
/// past the URL into surrounding words.
const REMAINDER_CLASS: &str = r#"[^\s"'<>]*"#;

/// Characters we consider safe inside a URL path literal; keys containing
/// anything else cannot be mapped back into a URL path and are skipped
/// (§4.4).
fn key_is_url_safe(key: &str) -> bool {
    key.chars()
        .all(|c| c.is_ascii_alphanumeric() || "/_-.~()*".contains(c))
}

struct Substitution {
    source: Regex,
    replacement: String,
}

/// Turn a destination template containing `$1`..`$9` back-reference markers
/// into a regex that matches concrete instances of it, capturing whatever
/// each marker stood for. Literal text around the markers is escaped. Used
/// for routes the mapping normalizer has already given an explicit
/// back-reference (currently: wildcarded `file://` directories).
fn destination_template_to_regex(template: &str) -> String {
    let bytes = template.as_bytes();
    let mut out = String::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() {
            out.push('(');
            out.push_str(REMAINDER_CLASS);
            out.push(')');
            i += 2;
        } else {
            let start = i;
            while i < bytes.len() && !(bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit()) {
                i += 1;
            }
            out.push_str(&regex::escape(&template[start..i]));
        }
    }
    out
}

/// The mapping normalizer only ever emits `(.*)` as a capturing group, so a
/// key's capturing groups can be translated to `$1`, `$2`, ... positionally
/// without parsing the regex grammar in full.
fn key_to_replacement_template(key: &str) -> String {
    let mut out = String::new();
    let mut remainder = key;
    let mut group = 0;
    while let Some(pos) = remainder.find("(.*)") {
        group += 1;
        out.push_str(&remainder[..pos]);
        out.push_str(&format!("${}", group));
        remainder = &remainder[pos + 4..];
    }
    out.push_str(remainder);
    out
}

/// Compile the mapping into direction-specific substitution pairs (§4.4):
/// in `Inbound`, the source pattern is the destination URL (or `replaceBody`
/// override) and the replacement is the proxy-facing URL; `Outbound` swaps
/// them.
///
/// Two shapes of mapping entry are handled:
///
/// - entries that already carry an explicit `$N` back-reference (produced by
///   the config normalizer for wildcarded `file://` directories) substitute
///   via `destination_template_to_regex`/`key_to_replacement_template`.
/// - plain literal entries (the common case: a literal key and a literal
///   destination URL, possibly ending in `/`) are treated as an *implicit*
///   prefix+remainder pair: whatever follows the matched prefix in the
///   source text carries through into the replacement unchanged. The key
///   side of this pair is always used with its trailing slash trimmed, and
///   the destination side is always used exactly as declared (including
///   any trailing slash) — the same asymmetry the config normalizer itself
///   uses for directory wildcarding. This reproduces the documented
///   (if slightly surprising) doubled-slash behavior of S5 without
///   disturbing the single-slash behavior of S4: which side is "key" and
///   which is "destination" differs by direction, so the slash artifact
///   only shows up going one way.
fn compile_substitutions(
    routes: &[Route],
    direction: Direction,
    proxy_scheme: &str,
    proxy_hostname_and_port: &str,
) -> Vec<Substitution> {
    let proxy_url_prefix = format!("{}://{}", proxy_scheme, proxy_hostname_and_port);

    routes
        .iter()
        .filter(|route| key_is_url_safe(&route.key))
        .filter_map(|route| {
            let downstream_template = route
                .replace_body_template
                .as_deref()
                .unwrap_or(&route.destination_template);
            if !downstream_template.starts_with("http://") && !downstream_template.starts_with("https://") {
                // Nothing sensible to substitute for config://, logs://,
                // recorder://, worker://, file://, data:.
                return None;
            }

            if downstream_template.contains('$') {
                return Some(match direction {
                    Direction::Inbound => {
                        let source = Regex::new(&destination_template_to_regex(downstream_template)).ok()?;
                        let replacement =
                            format!("{}{}", proxy_url_prefix, key_to_replacement_template(&route.key));
                        Substitution { source, replacement }
                    }
                    Direction::Outbound => {
                        let source_text = format!("{}{}", regex::escape(&proxy_url_prefix), route.key);
                        let source = Regex::new(&source_text).ok()?;
                        Substitution {
                            source,
                            replacement: downstream_template.to_string(),
                        }
                    }
                });
            }

            let key_trimmed = route.key.trim_end_matches('/');
            Some(match direction {
                Direction::Inbound => {
                    let source_text = format!("{}({})", regex::escape(downstream_template), REMAINDER_CLASS);
                    let source = Regex::new(&source_text).ok()?;
                    let replacement = format!("{}{}/$1", proxy_url_prefix, key_trimmed);
                    Substitution { source, replacement }
                }
                Direction::Outbound => {
                    let source_text = format!(
                        "{}({})",
                        regex::escape(&format!("{}{}", proxy_url_prefix, route.key)),
                        REMAINDER_CLASS
                    );
                    let source = Regex::new(&source_text).ok()?;
                    let replacement = format!("{}/$1", downstream_template);
                    Substitution { source, replacement }
                }
            })
        })
        .collect()
}

pub struct RewriteContext<'a> {
    pub direction: Direction,
    pub proxy_hostname_and_port: &'a str,
    pub ssl: bool,
    pub routes: &'a [Route],
}

/// §4.4: apply mapping-order substitutions across `text`, skipping
/// non-URL-safe keys, without re-scanning already-substituted regions (to
/// avoid oscillation), then collapse the `${host}/:` artifact left behind by
/// port-bearing origins.
pub fn replace_text_using_mapping(text: &str, ctx: &RewriteContext) -> String {
    let scheme = if ctx.ssl { "https" } else { "http" };
    let substitutions =
        compile_substitutions(ctx.routes, ctx.direction, scheme, ctx.proxy_hostname_and_port);

    let mut result = text.to_string();
    for sub in &substitutions {
        result = sub.source.replace_all(&result, sub.replacement.as_str()).into_owned();
    }

    collapse_host_colon_artifact(&result, ctx.proxy_hostname_and_port)
}

/// §4.4: a substitution whose key ends at a port-bearing origin leaves
/// `${host}/:` behind where `${host}` is the proxy's own hostname:port (e.g.
/// `localhost:8080/:80` instead of `localhost:8080:80`). Collapse only that
/// artifact, anchored to the proxy host, rather than any `/:` in the body.
fn collapse_host_colon_artifact(text: &str, proxy_hostname_and_port: &str) -> String {
    let artifact = format!("{}/:", proxy_hostname_and_port);
    let collapsed = format!("{}:", proxy_hostname_and_port);
    text.replace(artifact.as_str(), collapsed.as_str())
}
