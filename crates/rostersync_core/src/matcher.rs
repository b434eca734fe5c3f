use std::collections::BTreeSet;

use reqwest::Url;
use serde::Serialize;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::store::Athlete;

/// Transient roster entry discovered during one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapedEntry {
    pub profile_address: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched(Athlete),
    NoMatch,
    /// More than one canonical record claims this entry.
    Duplicate(Vec<i64>),
}

/// Case-, accent-, whitespace- and punctuation-folded form used for identity.
///
/// Names are compatibility-decomposed first so precomposed and combining
/// spellings of the same name fold to one key.
pub fn normalize_name(name: &str) -> String {
    name.nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .flat_map(char::to_lowercase)
        .filter(|ch| ch.is_alphanumeric() && !is_combining_mark(*ch))
        .collect()
}

/// `john-o-brien` -> `John O Brien`.
pub fn deslugify(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|segment| !segment.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ")
}

fn capitalize(segment: &str) -> String {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Comparable form of a profile address: host lower-cased, scheme, query,
/// fragment and trailing slash dropped.
pub fn normalize_profile_address(address: &str) -> String {
    match Url::parse(address.trim()) {
        Ok(url) => {
            let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
            let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
            let path = url.path().trim_end_matches('/');
            format!("{host}{path}")
        }
        Err(_) => address.trim().trim_end_matches('/').to_ascii_lowercase(),
    }
}

/// Match one scraped entry against the canonical athletes of its team.
///
/// Only exact normalized-name equality and exact profile-address equality
/// count. Any disagreement between candidates is reported as a duplicate
/// instead of being resolved here.
pub fn match_entry(entry: &ScrapedEntry, athletes: &[Athlete]) -> MatchOutcome {
    let wanted_name = normalize_name(&entry.display_name);
    let wanted_address = normalize_profile_address(&entry.profile_address);

    let by_name = athletes
        .iter()
        .filter(|athlete| !wanted_name.is_empty() && normalize_name(&athlete.name) == wanted_name)
        .collect::<Vec<_>>();
    let by_address = athletes
        .iter()
        .filter(|athlete| {
            athlete
                .profile_address
                .as_deref()
                .is_some_and(|stored| normalize_profile_address(stored) == wanted_address)
        })
        .collect::<Vec<_>>();

    let ids = by_name
        .iter()
        .chain(by_address.iter())
        .map(|athlete| athlete.id)
        .collect::<BTreeSet<_>>();

    match ids.len() {
        0 => MatchOutcome::NoMatch,
        1 => {
            let athlete = by_name
                .first()
                .or_else(|| by_address.first())
                .map(|athlete| (*athlete).clone());
            match athlete {
                Some(athlete) => MatchOutcome::Matched(athlete),
                None => MatchOutcome::NoMatch,
            }
        }
        _ => MatchOutcome::Duplicate(ids.into_iter().collect()),
    }
}
