use std::collections::BTreeMap;

use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

/// Image-bearing element found on a page. `address` is absolute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageElement {
    pub address: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnchorElement {
    pub href: String,
    pub text: String,
}

/// Read-only view of a rendered page.
///
/// One implementation exists per rendering technology; everything downstream
/// (extraction, roster discovery) only sees these typed elements.
pub trait Document {
    fn address(&self) -> &str;
    fn images(&self) -> Vec<ImageElement>;
    fn anchors(&self) -> Vec<AnchorElement>;
}

/// Static HTML document parsed with `scraper`.
///
/// Text nodes and attribute values come back with every character reference
/// already decoded, so `O&#8217;Brien` and `O&rsquo;Brien` read the same.
#[derive(Debug, Clone)]
pub struct HtmlDocument {
    address: String,
    html: String,
}

impl HtmlDocument {
    pub fn new(address: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            html: html.into(),
        }
    }
}

impl Document for HtmlDocument {
    fn address(&self) -> &str {
        &self.address
    }

    fn images(&self) -> Vec<ImageElement> {
        let Ok(selector) = Selector::parse("img, source") else {
            return Vec::new();
        };
        let parsed = Html::parse_document(&self.html);
        parsed
            .select(&selector)
            .filter_map(|element| image_from_attrs(&collect_attrs(element), &self.address))
            .collect()
    }

    fn anchors(&self) -> Vec<AnchorElement> {
        let Ok(selector) = Selector::parse("a[href]") else {
            return Vec::new();
        };
        let parsed = Html::parse_document(&self.html);
        let mut output = Vec::new();
        for element in parsed.select(&selector) {
            let Some(href) = element
                .value()
                .attr("href")
                .and_then(|href| absolutize(href, &self.address))
            else {
                continue;
            };
            let mut text = normalize_ws(&element.text().collect::<Vec<_>>().join(" "));
            if text.is_empty() {
                text = element
                    .value()
                    .attr("title")
                    .or_else(|| element.value().attr("aria-label"))
                    .map(normalize_ws)
                    .unwrap_or_default();
            }
            output.push(AnchorElement { href, text });
        }
        output
    }
}

fn collect_attrs(element: ElementRef<'_>) -> BTreeMap<String, String> {
    element
        .value()
        .attrs()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.to_string()))
        .collect()
}

const LAZY_ATTRS: &[&str] = &["data-src", "data-lazy-src", "data-original", "data-lazy"];
const SRCSET_ATTRS: &[&str] = &["data-srcset", "srcset"];

fn image_from_attrs(attrs: &BTreeMap<String, String>, base_url: &str) -> Option<ImageElement> {
    let primary = attrs
        .get("src")
        .map(|value| value.trim().to_string())
        .filter(|value| !is_placeholder_src(value));

    let mut srcset_width = None::<u32>;
    let raw = match primary {
        Some(value) => value,
        None => {
            let from_lazy = LAZY_ATTRS.iter().find_map(|name| {
                attrs
                    .get(*name)
                    .map(|value| value.trim().to_string())
                    .filter(|value| !is_placeholder_src(value))
            });
            match from_lazy {
                Some(value) => value,
                None => {
                    let (value, width) = SRCSET_ATTRS
                        .iter()
                        .find_map(|name| attrs.get(*name).and_then(|value| largest_srcset(value)))?;
                    srcset_width = width;
                    value
                }
            }
        }
    };

    let address = absolutize(&raw, base_url)?;

    let attr_width = dimension_attr(attrs, "width").or_else(|| dimension_attr(attrs, "data-width"));
    let attr_height =
        dimension_attr(attrs, "height").or_else(|| dimension_attr(attrs, "data-height"));

    let (width, height) = match (srcset_width, attr_width, attr_height) {
        (Some(sw), Some(aw), Some(ah)) if aw > 0 => {
            let scaled = u64::from(sw) * u64::from(ah) / u64::from(aw);
            (Some(sw), u32::try_from(scaled).ok())
        }
        (_, Some(aw), Some(ah)) => (Some(aw), Some(ah)),
        _ => {
            let (qw, qh) = dimensions_from_query(&address);
            (attr_width.or(qw), attr_height.or(qh))
        }
    };

    Some(ImageElement {
        address,
        width,
        height,
    })
}

fn is_placeholder_src(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    lower.is_empty()
        || lower.starts_with("data:")
        || lower.starts_with("javascript:")
        || lower.ends_with("blank.gif")
        || lower.ends_with("spacer.gif")
        || lower.ends_with("transparent.gif")
}

fn dimension_attr(attrs: &BTreeMap<String, String>, name: &str) -> Option<u32> {
    let value = attrs.get(name)?.trim();
    let digits = value
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() || value[digits.len()..].trim_start().starts_with('%') {
        return None;
    }
    digits.parse::<u32>().ok().filter(|value| *value > 0)
}

/// Width/height hints carried in the query string of CDN resize URLs.
pub fn dimensions_from_query(address: &str) -> (Option<u32>, Option<u32>) {
    let Ok(parsed) = Url::parse(address) else {
        return (None, None);
    };
    let mut width = None;
    let mut height = None;
    for (key, value) in parsed.query_pairs() {
        let parsed_value = value.trim().parse::<u32>().ok().filter(|value| *value > 0);
        match key.to_ascii_lowercase().as_str() {
            "width" | "w" => width = width.or(parsed_value),
            "height" | "h" => height = height.or(parsed_value),
            _ => {}
        }
    }
    (width, height)
}

/// Pick the widest entry of a srcset, returning its address and `w` descriptor.
fn largest_srcset(srcset: &str) -> Option<(String, Option<u32>)> {
    let mut best = None::<(String, Option<u32>, f64)>;
    for entry in srcset.split(',') {
        let mut parts = entry.split_whitespace();
        let Some(address) = parts.next() else {
            continue;
        };
        if is_placeholder_src(address) {
            continue;
        }
        let descriptor = parts.next().unwrap_or("1x");
        let (width, weight) = if let Some(value) = descriptor.strip_suffix('w') {
            let width = value.parse::<u32>().ok();
            (width, width.map(f64::from).unwrap_or(0.0))
        } else if let Some(value) = descriptor.strip_suffix('x') {
            (None, value.parse::<f64>().unwrap_or(1.0))
        } else {
            (None, 0.0)
        };
        let replace = match &best {
            Some((_, _, best_weight)) => weight > *best_weight,
            None => true,
        };
        if replace {
            best = Some((address.to_string(), width, weight));
        }
    }
    best.map(|(address, width, _)| (address, width))
}

pub(crate) fn absolutize(raw: &str, base_url: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("data:") || lower.starts_with("javascript:") || lower.starts_with("mailto:")
    {
        return None;
    }
    let url = Url::parse(trimmed)
        .or_else(|_| Url::parse(base_url).and_then(|base| base.join(trimmed)))
        .ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    Some(url.to_string())
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::{Document, HtmlDocument, dimensions_from_query, largest_srcset};

    #[test]
    fn images_skip_comments_and_read_mixed_case_markup() {
        let document = HtmlDocument::new(
            "https://a.example.edu/",
            r#"<div><!-- <img src="/hidden.jpg"> --><IMG SRC='/a.jpg' Width=200 height="300"/></div>"#,
        );
        let images = document.images();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].address, "https://a.example.edu/a.jpg");
        assert_eq!((images[0].width, images[0].height), (Some(200), Some(300)));
    }

    #[test]
    fn images_resolve_relative_and_lazy_sources() {
        let document = HtmlDocument::new(
            "https://athletics.example.edu/sports/soccer/roster/jane-doe/42",
            r#"
<img src="/images/2024/jane.jpg" width="240" height="360">
<img src="data:image/gif;base64,R0lGOD" data-src="https://cdn.example.edu/lazy.jpg" width="300" height="400">
<img class="x" data-srcset="https://cdn.example.edu/s.jpg 400w, https://cdn.example.edu/l.jpg 800w" width="400" height="600">
"#,
        );
        let images = document.images();
        assert_eq!(images.len(), 3);
        assert_eq!(
            images[0].address,
            "https://athletics.example.edu/images/2024/jane.jpg"
        );
        assert_eq!(images[1].address, "https://cdn.example.edu/lazy.jpg");
        assert_eq!(images[2].address, "https://cdn.example.edu/l.jpg");
        assert_eq!((images[2].width, images[2].height), (Some(800), Some(1200)));
    }

    #[test]
    fn image_dimensions_fall_back_to_query_parameters() {
        let document = HtmlDocument::new(
            "https://a.example.edu/",
            r#"<img src="https://cdn.example.edu/crop?url=x&width=300&height=450">"#,
        );
        let images = document.images();
        assert_eq!((images[0].width, images[0].height), (Some(300), Some(450)));
        assert_eq!(
            dimensions_from_query("https://cdn.example.edu/a.jpg?w=10"),
            (Some(10), None)
        );
    }

    #[test]
    fn anchors_carry_text_or_title() {
        let document = HtmlDocument::new(
            "https://a.example.edu/roster",
            r#"<a href="/roster/john-o-brien/7"><span>John</span> O&#39;Brien</a>
<a href="/roster/amy-lee/8" title="Amy Lee"><img src="/x.jpg"></a>
<a href="mailto:coach@example.edu">Coach</a>"#,
        );
        let anchors = document.anchors();
        assert_eq!(anchors.len(), 2);
        assert_eq!(anchors[0].href, "https://a.example.edu/roster/john-o-brien/7");
        assert_eq!(anchors[0].text, "John O'Brien");
        assert_eq!(anchors[1].text, "Amy Lee");
    }

    #[test]
    fn anchor_text_decodes_numeric_and_named_references() {
        let document = HtmlDocument::new(
            "https://a.example.edu/roster",
            r#"<a href="/roster/john-o-brien/7">John O&#8217;Brien</a>
<a href="/roster/john-o-brien/8">John O&#x2019;Brien</a>
<a href="/roster/jose-nunez/9">Jos&eacute; N&uacute;&ntilde;ez</a>"#,
        );
        let anchors = document.anchors();
        assert_eq!(anchors[0].text, "John O\u{2019}Brien");
        assert_eq!(anchors[1].text, "John O\u{2019}Brien");
        assert_eq!(anchors[2].text, "Jos\u{e9} N\u{fa}\u{f1}ez");
    }

    #[test]
    fn image_attributes_are_decoded_before_joining() {
        let document = HtmlDocument::new(
            "https://a.example.edu/",
            r#"<img src="https://cdn.example.edu/crop?width=300&amp;height=450&amp;id=7">"#,
        );
        let images = document.images();
        assert_eq!(
            images[0].address,
            "https://cdn.example.edu/crop?width=300&height=450&id=7"
        );
        assert_eq!((images[0].width, images[0].height), (Some(300), Some(450)));
    }

    #[test]
    fn srcset_prefers_widest_descriptor() {
        assert_eq!(
            largest_srcset("a.jpg 1x, b.jpg 2x"),
            Some(("b.jpg".to_string(), None))
        );
        assert_eq!(
            largest_srcset("a.jpg 640w, b.jpg 320w"),
            Some(("a.jpg".to_string(), Some(640)))
        );
    }
}
