use std::collections::HashMap;

use reqwest::Url;

use crate::config::RosterRules;
use crate::document::Document;
use crate::matcher::{ScrapedEntry, deslugify, normalize_profile_address};

const MAX_NAME_CHARS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum NameOrigin {
    Slug,
    AnchorText,
}

/// Collect one entry per athlete profile linked from a roster page, in page
/// order. Anchor text is preferred over the URL slug for the display name.
pub fn discover_entries(document: &dyn Document, rules: &RosterRules) -> Vec<ScrapedEntry> {
    let page_key = normalize_profile_address(document.address());
    let mut order = Vec::<String>::new();
    let mut found = HashMap::<String, (ScrapedEntry, NameOrigin)>::new();

    for anchor in document.anchors() {
        let Some(profile_address) = profile_address(&anchor.href, rules) else {
            continue;
        };
        let key = normalize_profile_address(&profile_address);
        if key == page_key {
            continue;
        }

        let named = clean_anchor_name(&anchor.text, rules)
            .map(|name| (name, NameOrigin::AnchorText))
            .or_else(|| slug_name(&profile_address, rules).map(|name| (name, NameOrigin::Slug)));
        let Some((display_name, origin)) = named else {
            continue;
        };

        match found.get_mut(&key) {
            Some((existing, existing_origin)) => {
                if origin > *existing_origin {
                    existing.display_name = display_name;
                    *existing_origin = origin;
                }
            }
            None => {
                order.push(key.clone());
                found.insert(
                    key,
                    (
                        ScrapedEntry {
                            profile_address,
                            display_name,
                        },
                        origin,
                    ),
                );
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| found.remove(&key).map(|(entry, _)| entry))
        .collect()
}

/// Absolute profile address when `href` points below a profile marker.
fn profile_address(href: &str, rules: &RosterRules) -> Option<String> {
    let mut url = Url::parse(href).ok()?;
    url.set_fragment(None);
    let path = url.path().to_ascii_lowercase();
    let marker_end = rules.profile_path_markers.iter().find_map(|marker| {
        let marker = marker.to_ascii_lowercase();
        path.find(&marker).map(|index| index + marker.len())
    })?;
    let rest = path[marker_end..].trim_matches('/');
    if rest.is_empty() || rest.starts_with("coaches") || rest.starts_with("staff") {
        return None;
    }
    Some(url.to_string())
}

fn slug_name(profile_address: &str, rules: &RosterRules) -> Option<String> {
    let url = Url::parse(profile_address).ok()?;
    let path = url.path();
    let lower = path.to_ascii_lowercase();
    let marker_end = rules.profile_path_markers.iter().find_map(|marker| {
        let marker = marker.to_ascii_lowercase();
        lower.find(&marker).map(|index| index + marker.len())
    })?;
    let slug = path[marker_end..]
        .split('/')
        .filter(|segment| !segment.is_empty())
        .filter(|segment| !segment.chars().all(|ch| ch.is_ascii_digit()))
        .find(|segment| segment.chars().any(|ch| ch.is_alphabetic()))?;
    let slug = slug.split('.').next().unwrap_or(slug);
    let name = deslugify(slug);
    if name.is_empty() { None } else { Some(name) }
}

fn clean_anchor_name(text: &str, rules: &RosterRules) -> Option<String> {
    let mut value = text.trim();
    // Jersey prefixes such as "#12" or "12".
    if let Some((first, rest)) = value.split_once(' ') {
        let number = first.trim_start_matches('#');
        if !number.is_empty() && number.chars().all(|ch| ch.is_ascii_digit()) {
            value = rest.trim();
        }
    }
    if value.is_empty() || value.chars().count() > MAX_NAME_CHARS {
        return None;
    }
    if !value.chars().any(char::is_alphabetic) {
        return None;
    }
    if rules
        .ignored_anchor_texts
        .iter()
        .any(|ignored| ignored.eq_ignore_ascii_case(value))
    {
        return None;
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::{clean_anchor_name, discover_entries, slug_name};
    use crate::config::RosterRules;
    use crate::document::HtmlDocument;

    #[test]
    fn discovers_entries_with_anchor_names_and_slug_fallback() {
        let document = HtmlDocument::new(
            "https://gohuskies.example.edu/sports/mens-basketball/roster",
            r#"
<a href="/sports/mens-basketball/roster">Roster</a>
<ul>
  <li><a href="/sports/mens-basketball/roster/john-o-brien/101"><img src="/x.jpg"></a>
      <a href="/sports/mens-basketball/roster/john-o-brien/101">John O'Brien</a></li>
  <li><a href="/sports/mens-basketball/roster/amy-lee/102">Full Bio</a></li>
  <li><a href="/sports/mens-basketball/roster/coaches/mark-few/5">Mark Few</a></li>
  <li><a href="/news/2024/story">Story</a></li>
  <li><a href="/sports/mens-basketball/roster/zed-park/103#stats">#23 Zed Park</a></li>
</ul>"#,
        );
        let entries = discover_entries(&document, &RosterRules::default());
        let summary = entries
            .iter()
            .map(|entry| (entry.display_name.as_str(), entry.profile_address.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (
                    "John O'Brien",
                    "https://gohuskies.example.edu/sports/mens-basketball/roster/john-o-brien/101"
                ),
                (
                    "Amy Lee",
                    "https://gohuskies.example.edu/sports/mens-basketball/roster/amy-lee/102"
                ),
                (
                    "Zed Park",
                    "https://gohuskies.example.edu/sports/mens-basketball/roster/zed-park/103"
                ),
            ]
        );
    }

    #[test]
    fn slug_name_skips_numeric_segments() {
        let rules = RosterRules::default();
        assert_eq!(
            slug_name("https://a.example.edu/roster/12345/jane-doe", &rules).as_deref(),
            Some("Jane Doe")
        );
        assert_eq!(
            slug_name("https://a.example.edu/roster/john-o-brien.aspx", &rules).as_deref(),
            Some("John O Brien")
        );
        assert_eq!(slug_name("https://a.example.edu/roster/77", &rules), None);
    }

    #[test]
    fn anchor_cleanup_rejects_generic_labels() {
        let rules = RosterRules::default();
        assert_eq!(clean_anchor_name("View Profile", &rules), None);
        assert_eq!(clean_anchor_name("12", &rules), None);
        assert_eq!(clean_anchor_name("12 Ana Ruiz", &rules).as_deref(), Some("Ana Ruiz"));
        assert_eq!(clean_anchor_name("Ana Ruiz", &rules).as_deref(), Some("Ana Ruiz"));
    }
}
