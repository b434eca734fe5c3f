use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use reqwest::Url;
use serde::Serialize;
use tracing::debug;

use crate::config::ResolverRules;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub original: String,
    pub resolved: String,
    pub proxy_decoded: bool,
    pub upgraded: bool,
}

impl Resolution {
    pub fn changed(&self) -> bool {
        self.original != self.resolved
    }
}

/// Apply proxy decoding and then the quality upgrade to `address`.
pub fn resolve_address(address: &str, rules: &ResolverRules) -> Resolution {
    let decoded = decode_proxy(address, rules);
    let proxy_decoded = decoded.is_some();
    let base = decoded.unwrap_or_else(|| address.to_string());
    let upgraded = upgrade_quality(&base, rules);
    let was_upgraded = upgraded.is_some();
    Resolution {
        original: address.to_string(),
        resolved: upgraded.unwrap_or(base),
        proxy_decoded,
        upgraded: was_upgraded,
    }
}

/// Origin address wrapped by an image proxy, if it decodes to a trusted host.
///
/// Failure to decode is not an error: the caller keeps the proxy address.
pub fn decode_proxy(address: &str, rules: &ResolverRules) -> Option<String> {
    let url = Url::parse(address).ok()?;

    for (key, value) in url.query_pairs() {
        if rules
            .proxy_query_params
            .iter()
            .any(|param| param.eq_ignore_ascii_case(&key))
            && let Some(origin) = trusted_origin_address(&value, rules)
        {
            return Some(origin);
        }
    }

    let segments = url
        .path_segments()
        .map(|segments| segments.collect::<Vec<_>>())
        .unwrap_or_default();
    let marker = segments.iter().position(|segment| {
        rules
            .proxy_markers
            .iter()
            .any(|marker| segment.eq_ignore_ascii_case(marker))
    })?;

    for start in marker + 1..segments.len() {
        // Standard base64 may itself contain '/', so try the joined tail too.
        let tail = segments[start..].join("/");
        for payload in [tail, segments[start].to_string()] {
            if let Some(origin) = decode_payload(&payload)
                .and_then(|decoded| trusted_origin_address(&decoded, rules))
            {
                debug!(proxy = address, origin = %origin, "decoded proxy address");
                return Some(origin);
            }
        }
    }
    None
}

/// Raise size/quality query parameters to the configured floor.
pub fn upgrade_quality(address: &str, rules: &ResolverRules) -> Option<String> {
    let mut url = Url::parse(address).ok()?;
    let lower_path = url.path().to_ascii_lowercase();
    if rules
        .protected_markers
        .iter()
        .any(|marker| lower_path.contains(&marker.to_ascii_lowercase()))
    {
        return None;
    }
    url.query()?;

    let mut changed = false;
    let pairs = url
        .query_pairs()
        .map(|(key, value)| {
            let key = key.into_owned();
            let value = value.into_owned();
            let target = if contains_ignore_case(&rules.dimension_params, &key) {
                Some(rules.quality_floor)
            } else if contains_ignore_case(&rules.quality_params, &key) {
                Some(rules.quality_target)
            } else {
                None
            };
            match (target, value.trim().parse::<u32>()) {
                (Some(target), Ok(current)) if current < target => {
                    changed = true;
                    (key, target.to_string())
                }
                _ => (key, value),
            }
        })
        .collect::<Vec<_>>();

    if !changed {
        return None;
    }
    url.query_pairs_mut().clear().extend_pairs(pairs);
    Some(url.to_string())
}

fn decode_payload(segment: &str) -> Option<String> {
    let trimmed = strip_extension(segment.trim());
    if trimmed.len() < 8 {
        return None;
    }
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(bytes) = engine.decode(trimmed)
            && let Ok(text) = String::from_utf8(bytes)
        {
            return Some(text);
        }
    }
    None
}

fn strip_extension(segment: &str) -> &str {
    match segment.rfind('.') {
        Some(dot) if segment.len() - dot <= 5 && dot > 0 => {
            let extension = &segment[dot + 1..];
            if extension.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                &segment[..dot]
            } else {
                segment
            }
        }
        _ => segment,
    }
}

fn trusted_origin_address(candidate: &str, rules: &ResolverRules) -> Option<String> {
    let url = Url::parse(candidate.trim()).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    let trusted = rules.trusted_origins.iter().any(|origin| {
        let origin = origin.trim().to_ascii_lowercase();
        !origin.is_empty() && (host == origin || host.ends_with(&format!(".{origin}")))
    });
    if trusted {
        Some(candidate.trim().to_string())
    } else {
        None
    }
}

fn contains_ignore_case(values: &[String], needle: &str) -> bool {
    values.iter().any(|value| value.eq_ignore_ascii_case(needle))
}
