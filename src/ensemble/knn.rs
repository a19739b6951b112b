//! Turns a k-NN result list into a class probability vector.
//!
//! Every neighbour votes for its stage with weight `exp(score / T)`, normalised
//! over the whole result list. Neighbours whose stage cannot be resolved, or
//! resolves outside `1..=num_classes`, are dropped without redistributing their
//! weight before the final renormalisation.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::probabilities::ClassProbabilities;
use crate::models::SearchMatch;

/// Metadata fields consulted, in order, when `stage` is absent or unusable.
const LABEL_FIELDS: [&str; 3] = ["level", "class", "label"];

static LABELLED_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:stage|level|class|lv|norwood)[_\-\s]?(\d+)").expect("valid regex")
});

static FIRST_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("valid regex"));

/// A probability vector plus the number of neighbours that could not vote.
#[derive(Debug, Clone, PartialEq)]
pub struct KnnVote {
    pub probabilities: ClassProbabilities,
    pub dropped: usize,
}

/// Convert top-k matches into class probabilities with temperature `T > 0`.
///
/// Returns an all-zero vector when `matches` is empty, no match carries an
/// in-range stage label, or `T` is not a positive finite number.
pub fn knn_to_probs(matches: &[SearchMatch], num_classes: usize, temperature: f64) -> ClassProbabilities {
    knn_vote(matches, num_classes, temperature).probabilities
}

/// [`knn_to_probs`] that also reports how many matches were dropped.
pub fn knn_vote(matches: &[SearchMatch], num_classes: usize, temperature: f64) -> KnnVote {
    let mut probabilities = ClassProbabilities::zeros(num_classes);
    if !temperature.is_finite() || temperature <= 0.0 {
        tracing::warn!("Ignoring neighbour vote with unusable temperature {temperature}");
        return KnnVote {
            probabilities,
            dropped: matches.len(),
        };
    }

    let usable: Vec<&SearchMatch> = matches.iter().filter(|m| m.score.is_finite()).collect();
    let mut dropped = matches.len() - usable.len();

    if usable.is_empty() {
        return KnnVote {
            probabilities,
            dropped,
        };
    }

    // Shift by the best score so exp() cannot overflow; the normalised weights are unchanged.
    let best = usable
        .iter()
        .map(|m| f64::from(m.score))
        .fold(f64::NEG_INFINITY, f64::max);
    let weights: Vec<f64> = usable
        .iter()
        .map(|m| ((f64::from(m.score) - best) / temperature).exp())
        .collect();
    let total: f64 = weights.iter().sum();

    let mut buckets = vec![0.0; num_classes];
    for (m, w) in usable.iter().zip(&weights) {
        match resolve_stage(m).and_then(|stage| class_index(stage, num_classes)) {
            Some(idx) => buckets[idx] += w / total,
            None => {
                tracing::debug!(id = %m.id, "Dropping neighbour without an in-range stage label");
                dropped += 1;
            }
        }
    }

    probabilities = ClassProbabilities::from_raw(buckets).normalized();
    KnnVote {
        probabilities,
        dropped,
    }
}

/// Map a 1-based stage to a 0-based class index, if it is in range.
pub fn class_index(stage: u64, num_classes: usize) -> Option<usize> {
    let idx = usize::try_from(stage).ok()?.checked_sub(1)?;
    (idx < num_classes).then_some(idx)
}

/// Resolve the stage label of a match: explicit `stage` metadata first, then
/// the first integer in `level` / `class` / `label`, then a number in the id.
pub fn resolve_stage(m: &SearchMatch) -> Option<u64> {
    if let Some(stage) = m.metadata.get("stage").and_then(stage_from_value) {
        return Some(stage);
    }
    LABEL_FIELDS
        .iter()
        .filter_map(|field| m.metadata.get(*field))
        .find_map(label_from_value)
        .or_else(|| stage_from_text(&m.id))
}

/// Pull a stage number out of free text such as `stage_3`, `LEVEL-2` or `norwood4_017.jpg`.
/// A labelled number wins over the first bare number.
pub fn stage_from_text(text: &str) -> Option<u64> {
    labelled_stage(text).or_else(|| FIRST_NUMBER.find(text).and_then(|m| m.as_str().parse().ok()))
}

/// Only a `stage`/`level`/`class`/`lv`/`norwood`-prefixed number.
pub fn labelled_stage(text: &str) -> Option<u64> {
    LABELLED_NUMBER
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn stage_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn label_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => FIRST_NUMBER.find(s).and_then(|m| m.as_str().parse().ok()),
        other => stage_from_value(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_stage(score: f32, stage: u64) -> SearchMatch {
        SearchMatch {
            id: format!("img-{stage}-{score}"),
            score,
            metadata: json!({ "stage": stage }).as_object().unwrap().clone(),
        }
    }

    fn with_meta(id: &str, score: f32, meta: serde_json::Value) -> SearchMatch {
        SearchMatch {
            id: id.to_string(),
            score,
            metadata: meta.as_object().unwrap().clone(),
        }
    }

    #[test]
    fn test_empty_matches_give_zero_vector() {
        let p = knn_to_probs(&[], 7, 0.2);
        assert_eq!(p.len(), 7);
        assert_eq!(p.sum(), 0.0);
    }

    #[test]
    fn test_unusable_temperature_gives_zero_vector() {
        let matches = vec![with_stage(0.9, 3), with_stage(0.5, 2)];
        for t in [0.0, -0.2, f64::NAN, f64::INFINITY] {
            let vote = knn_vote(&matches, 7, t);
            assert!(vote.probabilities.is_zero());
            assert_eq!(vote.dropped, 2);
        }
    }

    #[test]
    fn test_dominant_stage_scenario() {
        let matches = vec![with_stage(0.9, 3), with_stage(0.5, 3), with_stage(0.1, 5)];
        let p = knn_to_probs(&matches, 7, 0.2);
        assert!((p.sum() - 1.0).abs() < 1e-6);
        assert_eq!(p.argmax(), Some(2));
        assert!(p.get(2) > 0.95);
        assert!(p.get(4) > 0.0);
    }

    #[test]
    fn test_weights_follow_temperature_softmax() {
        let matches = vec![with_stage(0.75, 1), with_stage(0.5, 2)];
        let p = knn_to_probs(&matches, 2, 0.125);
        let e = (-2.0f64).exp();
        assert!((p.get(0) - 1.0 / (1.0 + e)).abs() < 1e-9);
        assert!((p.get(1) - e / (1.0 + e)).abs() < 1e-9);
    }

    #[test]
    fn test_high_temperature_flattens_votes() {
        let matches = vec![with_stage(0.9, 1), with_stage(0.1, 2)];
        let sharp = knn_to_probs(&matches, 2, 0.05);
        let flat = knn_to_probs(&matches, 2, 100.0);
        assert!(sharp.get(0) > flat.get(0));
        assert!((flat.get(0) - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_out_of_range_stage_is_dropped_and_rest_renormalized() {
        let matches = vec![with_stage(0.9, 9), with_stage(0.5, 2)];
        let vote = knn_vote(&matches, 7, 0.2);
        assert_eq!(vote.dropped, 1);
        assert!((vote.probabilities.get(1) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_stage_zero_is_out_of_range() {
        let vote = knn_vote(&[with_stage(0.9, 0)], 7, 0.2);
        assert_eq!(vote.dropped, 1);
        assert!(vote.probabilities.is_zero());
    }

    #[test]
    fn test_all_unlabelled_gives_zero_vector() {
        let matches = vec![with_meta("abc", 0.9, json!({"filename": "x.jpg"}))];
        let vote = knn_vote(&matches, 5, 0.2);
        assert_eq!(vote.probabilities.sum(), 0.0);
        assert_eq!(vote.dropped, 1);
    }

    #[test]
    fn test_large_scores_do_not_overflow() {
        let matches = vec![with_stage(1.0, 1), with_stage(0.99, 2)];
        let p = knn_to_probs(&matches, 2, 1e-4);
        assert!(p.as_slice().iter().all(|v| v.is_finite()));
        assert!((p.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_nan_score_is_dropped() {
        let matches = vec![with_stage(f32::NAN, 1), with_stage(0.4, 2)];
        let vote = knn_vote(&matches, 3, 0.2);
        assert_eq!(vote.dropped, 1);
        assert_eq!(vote.probabilities.argmax(), Some(1));
    }

    #[test]
    fn test_resolve_stage_prefers_stage_field() {
        let m = with_meta("stage_5_001", 0.5, json!({"stage": 2, "level": "level 4"}));
        assert_eq!(resolve_stage(&m), Some(2));
    }

    #[test]
    fn test_resolve_stage_accepts_string_and_float() {
        assert_eq!(resolve_stage(&with_meta("a", 0.1, json!({"stage": "3"}))), Some(3));
        assert_eq!(resolve_stage(&with_meta("a", 0.1, json!({"stage": 4.0}))), Some(4));
        assert_eq!(resolve_stage(&with_meta("a", 0.1, json!({"stage": 4.5, "level": "LV6"}))), Some(6));
    }

    #[test]
    fn test_resolve_stage_falls_back_through_label_fields() {
        let m = with_meta("x", 0.5, json!({"class": "class_6", "label": "2"}));
        assert_eq!(resolve_stage(&m), Some(6));
        let m = with_meta("x", 0.5, json!({"label": "norwood 3"}));
        assert_eq!(resolve_stage(&m), Some(3));
    }

    #[test]
    fn test_resolve_stage_from_id() {
        let m = with_meta("male_0412_stage4.jpg", 0.5, json!({}));
        assert_eq!(resolve_stage(&m), Some(4));
        let m = with_meta("7_abc", 0.5, json!({}));
        assert_eq!(resolve_stage(&m), Some(7));
        let m = with_meta("no-digits", 0.5, json!({}));
        assert_eq!(resolve_stage(&m), None);
    }

    #[test]
    fn test_class_index_bounds() {
        assert_eq!(class_index(1, 7), Some(0));
        assert_eq!(class_index(7, 7), Some(6));
        assert_eq!(class_index(8, 7), None);
        assert_eq!(class_index(0, 7), None);
    }
}
