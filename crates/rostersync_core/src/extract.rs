//! Photo candidate extraction.
//!
//! Every image on a profile page is run through substring predicates, a size
//! floor and a portrait aspect band, then ranked by closeness to the ideal
//! portrait ratio with pixel area as the tie-breaker. The result is a
//! best-effort guess; callers fall back to the team logo when nothing
//! survives.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use reqwest::Url;
use serde::Serialize;
use tracing::debug;

use crate::config::ExtractionRules;
use crate::document::{Document, ImageElement};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateImage {
    pub address: String,
    pub width: u32,
    pub height: u32,
    pub aspect_ratio: f64,
    pub ratio_distance: f64,
    pub score: f64,
}

impl CandidateImage {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotIncluded,
    Excluded,
    UnknownDimensions,
    TooSmall,
    OutsideRatioBand,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub address: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractionReport {
    pub ranked: Vec<CandidateImage>,
    pub rejected: Vec<Rejection>,
}

impl ExtractionReport {
    pub fn best(&self) -> Option<&CandidateImage> {
        self.ranked.first()
    }
}

/// Top-ranked candidate, or `None` when nothing passes the filters.
pub fn extract_candidate(document: &dyn Document, rules: &ExtractionRules) -> Option<CandidateImage> {
    extract_ranked(document, rules).ranked.into_iter().next()
}

pub fn extract_ranked(document: &dyn Document, rules: &ExtractionRules) -> ExtractionReport {
    rank_images(document.images(), rules)
}

pub fn rank_images(images: Vec<ImageElement>, rules: &ExtractionRules) -> ExtractionReport {
    let mut rejected = Vec::new();
    let mut accepted = BTreeMap::<String, CandidateImage>::new();

    for image in dedupe_images(images) {
        match evaluate(&image, rules) {
            Ok(candidate) => {
                accepted.insert(candidate.address.clone(), candidate);
            }
            Err(reason) => {
                debug!(address = %image.address, ?reason, "image rejected");
                rejected.push(Rejection {
                    address: image.address,
                    reason,
                });
            }
        }
    }

    let ranked = order_candidates(accepted.into_values().collect(), rules.tie_tolerance);
    ExtractionReport { ranked, rejected }
}

fn evaluate(image: &ImageElement, rules: &ExtractionRules) -> Result<CandidateImage, RejectReason> {
    let lower = image.address.to_ascii_lowercase();
    if !rules.include.is_empty()
        && !rules
            .include
            .iter()
            .any(|needle| lower.contains(&needle.to_ascii_lowercase()))
    {
        return Err(RejectReason::NotIncluded);
    }
    if rules
        .exclude
        .iter()
        .any(|needle| lower.contains(&needle.to_ascii_lowercase()))
        || is_vector_format(&image.address)
    {
        return Err(RejectReason::Excluded);
    }

    let (Some(width), Some(height)) = (image.width, image.height) else {
        return Err(RejectReason::UnknownDimensions);
    };
    if width < rules.min_width || height < rules.min_height {
        return Err(RejectReason::TooSmall);
    }

    let aspect_ratio = f64::from(width) / f64::from(height);
    if aspect_ratio < rules.min_ratio || aspect_ratio > rules.max_ratio {
        return Err(RejectReason::OutsideRatioBand);
    }

    let ratio_distance = (aspect_ratio - rules.ideal_ratio).abs();
    Ok(CandidateImage {
        address: image.address.clone(),
        width,
        height,
        aspect_ratio,
        ratio_distance,
        score: 1.0 - ratio_distance,
    })
}

/// Order candidates so that the first element is the pick.
///
/// Candidates within `tolerance` of the best ratio distance form the leading
/// band and are ordered by area; the rest follow by distance. Ties fall back
/// to the address so the order never depends on input order.
fn order_candidates(mut candidates: Vec<CandidateImage>, tolerance: f64) -> Vec<CandidateImage> {
    let Some(best_distance) = candidates
        .iter()
        .map(|candidate| candidate.ratio_distance)
        .min_by(f64::total_cmp)
    else {
        return candidates;
    };
    let band_limit = best_distance + tolerance;
    candidates.sort_by(|left, right| {
        let left_in_band = left.ratio_distance <= band_limit;
        let right_in_band = right.ratio_distance <= band_limit;
        right_in_band
            .cmp(&left_in_band)
            .then_with(|| {
                if left_in_band && right_in_band {
                    right.area().cmp(&left.area())
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| left.ratio_distance.total_cmp(&right.ratio_distance))
            .then_with(|| left.address.cmp(&right.address))
    });
    candidates
}

/// Collapse repeated addresses, keeping the largest dimensions reported.
fn dedupe_images(images: Vec<ImageElement>) -> Vec<ImageElement> {
    let mut by_address = BTreeMap::<String, ImageElement>::new();
    for image in images {
        match by_address.get_mut(&image.address) {
            Some(existing) => {
                let existing_area = area_of(existing);
                if area_of(&image) > existing_area {
                    *existing = image;
                }
            }
            None => {
                by_address.insert(image.address.clone(), image);
            }
        }
    }
    by_address.into_values().collect()
}

fn area_of(image: &ImageElement) -> u64 {
    match (image.width, image.height) {
        (Some(width), Some(height)) => u64::from(width) * u64::from(height),
        _ => 0,
    }
}

fn is_vector_format(address: &str) -> bool {
    let path = Url::parse(address)
        .map(|url| url.path().to_ascii_lowercase())
        .unwrap_or_else(|_| address.to_ascii_lowercase());
    path.ends_with(".svg") || path.ends_with(".svgz")
}

#[cfg(test)]
mod tests {
    use super::{RejectReason, extract_candidate, rank_images};
    use crate::config::ExtractionRules;
    use crate::document::{HtmlDocument, ImageElement};

    fn image(address: &str, width: u32, height: u32) -> ImageElement {
        ImageElement {
            address: address.to_string(),
            width: Some(width),
            height: Some(height),
        }
    }

    #[test]
    fn closer_ratio_beats_larger_square() {
        let rules = ExtractionRules::default();
        let report = rank_images(
            vec![
                image("https://cdn.example.edu/square.jpg", 800, 800),
                image("https://cdn.example.edu/portrait.jpg", 120, 160),
            ],
            &rules,
        );
        assert_eq!(report.ranked.len(), 2);
        assert_eq!(
            report.best().map(|candidate| candidate.address.as_str()),
            Some("https://cdn.example.edu/portrait.jpg")
        );
    }

    #[test]
    fn area_breaks_ties_within_tolerance() {
        let rules = ExtractionRules::default();
        let report = rank_images(
            vec![
                image("https://cdn.example.edu/small.jpg", 200, 300),
                image("https://cdn.example.edu/large.jpg", 700, 1000),
            ],
            &rules,
        );
        // 0.667 vs 0.70: both inside the 0.1 band, larger wins.
        assert_eq!(report.ranked[0].address, "https://cdn.example.edu/large.jpg");
    }

    #[test]
    fn ranking_is_independent_of_input_order() {
        let rules = ExtractionRules::default();
        let images = vec![
            image("https://cdn.example.edu/a.jpg", 300, 450),
            image("https://cdn.example.edu/b.jpg", 450, 300),
            image("https://cdn.example.edu/c.jpg", 300, 450),
            image("https://cdn.example.edu/d.jpg", 600, 800),
            image("https://cdn.example.edu/e.jpg", 240, 480),
        ];
        let expected = rank_images(images.clone(), &rules).ranked;
        let mut reversed = images.clone();
        reversed.reverse();
        let mut rotated = images.clone();
        rotated.rotate_left(2);
        for permutation in [reversed, rotated] {
            assert_eq!(rank_images(permutation, &rules).ranked, expected);
        }
        assert_eq!(expected[0].address, "https://cdn.example.edu/d.jpg");
    }

    #[test]
    fn filters_report_their_reasons() {
        let rules = ExtractionRules {
            include: vec!["cdn.example.edu".to_string()],
            ..ExtractionRules::default()
        };
        let mut no_dimensions = image("https://cdn.example.edu/unsized.jpg", 1, 1);
        no_dimensions.width = None;
        let report = rank_images(
            vec![
                image("https://elsewhere.test/p.jpg", 300, 400),
                image("https://cdn.example.edu/team-logo.png", 300, 400),
                image("https://cdn.example.edu/mark.SVG", 300, 400),
                image("https://cdn.example.edu/thumb.jpg", 60, 80),
                image("https://cdn.example.edu/banner.jpg", 1200, 300),
                no_dimensions,
            ],
            &rules,
        );
        assert!(report.ranked.is_empty());
        let reasons = report
            .rejected
            .iter()
            .map(|rejection| (rejection.address.as_str(), rejection.reason))
            .collect::<Vec<_>>();
        assert!(reasons.contains(&("https://elsewhere.test/p.jpg", RejectReason::NotIncluded)));
        assert!(reasons.contains(&("https://cdn.example.edu/team-logo.png", RejectReason::Excluded)));
        assert!(reasons.contains(&("https://cdn.example.edu/mark.SVG", RejectReason::Excluded)));
        assert!(reasons.contains(&("https://cdn.example.edu/thumb.jpg", RejectReason::TooSmall)));
        assert!(reasons.contains(&(
            "https://cdn.example.edu/banner.jpg",
            RejectReason::OutsideRatioBand
        )));
        assert!(reasons.contains(&(
            "https://cdn.example.edu/unsized.jpg",
            RejectReason::UnknownDimensions
        )));
    }

    #[test]
    fn band_edges_are_inclusive() {
        let rules = ExtractionRules::default();
        let report = rank_images(
            vec![
                image("https://cdn.example.edu/tall.jpg", 400, 1000),
                image("https://cdn.example.edu/wide.jpg", 1100, 1000),
            ],
            &rules,
        );
        assert_eq!(report.ranked.len(), 2);
    }

    #[test]
    fn extracts_from_a_profile_document() {
        let document = HtmlDocument::new(
            "https://athletics.example.edu/sports/soccer/roster/jane-doe/42",
            r#"
<header><img src="/images/logos/site.png" width="200" height="200"></header>
<div class="bio"><img src="/images/2024/doe_jane.jpg" alt="Jane Doe" width="320" height="480"></div>
<footer><img src="/images/sponsors/bank.jpg" width="300" height="300"></footer>
"#,
        );
        let candidate =
            extract_candidate(&document, &ExtractionRules::default()).expect("candidate");
        assert_eq!(
            candidate.address,
            "https://athletics.example.edu/images/2024/doe_jane.jpg"
        );
        assert_eq!((candidate.width, candidate.height), (320, 480));
    }

    #[test]
    fn no_candidate_when_page_has_only_chrome() {
        let document = HtmlDocument::new(
            "https://athletics.example.edu/roster/x",
            r#"<img src="/logo.png" width="300" height="300"><img src="/icon-twitter.png" width="24" height="24">"#,
        );
        assert!(extract_candidate(&document, &ExtractionRules::default()).is_none());
    }
}
