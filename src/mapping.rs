//! Mapping Resolver (C2): compile routes, match incoming paths, rewrite
//! destination templates with back-references.

use regex::Regex;

use crate::config::{Configuration, Destination};

/// A compiled mapping entry. Back-references in the on-disk config use the
/// `$$n` escape (§9) to survive JSON quoting; we translate to the regex
/// crate's `$n` syntax once, at compile time.
#[derive(Clone, Debug)]
pub struct Route {
    pub key: String,
    pub pattern: Regex,
    pub destination_template: String,
    pub replace_body_template: Option<String>,
}

fn translate_backrefs(template: &str) -> String {
    template.replace("$$", "$")
}

/// Compile every mapping entry into a `Route`, in declared order. A pattern
/// that fails to compile as a regex is an error (§3 invariant): every
/// pattern either is a literal prefix or compiles as a regex, and in
/// practice every literal prefix *is* a valid (if metacharacter-free) regex.
pub fn compile(config: &Configuration) -> anyhow::Result<Vec<Route>> {
    config
        .mapping
        .iter()
        .map(|(key, destination)| {
            let pattern = Regex::new(key)
                .map_err(|e| anyhow::anyhow!("mapping key '{}' is not a valid regex: {}", key, e))?;
            Ok(Route {
                key: key.clone(),
                pattern,
                destination_template: translate_backrefs(destination.downstream_url()),
                replace_body_template: destination.replace_body().map(translate_backrefs),
            })
        })
        .collect()
}

/// The result of resolving a request against the compiled mapping.
pub struct Matched {
    pub route: Route,
    pub target: String,
}

/// §4.2: iterate the mapping in declared order; the first key (as regex)
/// that matches `path` wins. Back-references in the destination template are
/// substituted from the match.
pub fn determine_mapping(routes: &[Route], path: &str) -> Option<Matched> {
    for route in routes {
        if let Some(captures) = route.pattern.captures(path) {
            let mut target = String::new();
            captures.expand(&route.destination_template, &mut target);
            return Some(Matched {
                route: route.clone(),
                target,
            });
        }
    }
    None
}

/// §4.2: rewrite an absolute `Location` header pointing at the downstream
/// origin back to the inbound proxy's origin; relative locations are
/// resolved against the downstream target first.
pub fn rewrite_response_location(
    location: &str,
    downstream_target: &str,
    inbound_origin: &str,
) -> Option<String> {
    let downstream_url = url::Url::parse(downstream_target).ok()?;
    let downstream_origin = format!(
        "{}://{}",
        downstream_url.scheme(),
        downstream_url.host_str().unwrap_or_default()
    );
    let downstream_origin_with_port = match downstream_url.port() {
        Some(p) => format!("{}:{}", downstream_origin, p),
        None => downstream_origin.clone(),
    };

    if let Ok(absolute) = url::Url::parse(location) {
        let location_origin = format!(
            "{}://{}",
            absolute.scheme(),
            absolute.host_str().unwrap_or_default()
        );
        let location_origin_with_port = match absolute.port() {
            Some(p) => format!("{}:{}", location_origin, p),
            None => location_origin.clone(),
        };
        if location_origin_with_port == downstream_origin_with_port
            || location_origin == downstream_origin
        {
            let rest = &location[location.find(absolute.path()).unwrap_or(0)..];
            return Some(format!("{}{}", inbound_origin, rest));
        }
        // Absolute, but pointing somewhere else entirely: leave untouched.
        return Some(location.to_string());
    }

    // Relative location: resolve against the downstream target, then the
    // resulting path is what the client should see under the inbound origin.
    let resolved = downstream_url.join(location).ok()?;
    Some(format!("{}{}", inbound_origin, resolved.path()))
}
