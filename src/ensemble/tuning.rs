//! Offline calibration of the ensemble against a labelled validation set:
//! a temperature grid sweep and per-class rule derivation from model recall.

use serde::{Deserialize, Serialize};

use super::combine::combine;
use super::knn::{class_index, knn_to_probs};
use super::probabilities::ClassProbabilities;
use super::table::{ClassRule, EnsembleConfig, Weighting};
use crate::models::SearchMatch;

/// Temperatures tried when the caller does not supply a grid.
pub const DEFAULT_TEMPERATURE_GRID: [f64; 6] = [0.05, 0.1, 0.15, 0.2, 0.3, 0.5];

/// One labelled validation image with the neighbours each model retrieved for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSample {
    pub stage: u32,
    pub conv_matches: Vec<SearchMatch>,
    pub vit_matches: Vec<SearchMatch>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Evaluation {
    /// Samples whose stage was in range.
    pub samples: usize,
    pub correct: usize,
    pub accuracy: f64,
    /// Ensemble recall per class; `None` when the class has no samples.
    pub per_class_recall: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Copy)]
pub struct TuningOptions {
    /// Recall lead one model needs over the other to be flagged strong.
    pub strong_margin: f64,
    /// Minimum recall for a model to be flagged strong.
    pub min_recall: f64,
}

impl Default for TuningOptions {
    fn default() -> Self {
        Self {
            strong_margin: 0.1,
            min_recall: 0.6,
        }
    }
}

/// Probabilities of both models for one sample at the config's temperatures.
struct Scored {
    class: usize,
    conv: ClassProbabilities,
    vit: ClassProbabilities,
}

fn score_samples(samples: &[ValidationSample], config: &EnsembleConfig) -> Vec<Scored> {
    samples
        .iter()
        .filter_map(|s| {
            let class = class_index(u64::from(s.stage), config.num_classes)?;
            Some(Scored {
                class,
                conv: knn_to_probs(&s.conv_matches, config.num_classes, config.temperature_conv),
                vit: knn_to_probs(&s.vit_matches, config.num_classes, config.temperature_vit),
            })
        })
        .collect()
}

/// Top-1 accuracy and per-class recall of the full ensemble.
pub fn evaluate(samples: &[ValidationSample], config: &EnsembleConfig) -> Evaluation {
    let scored = score_samples(samples, config);
    let mut support = vec![0usize; config.num_classes];
    let mut hits = vec![0usize; config.num_classes];

    for s in &scored {
        support[s.class] += 1;
        if combine(&s.conv, &s.vit, config).argmax() == Some(s.class) {
            hits[s.class] += 1;
        }
    }

    let correct: usize = hits.iter().sum();
    Evaluation {
        samples: scored.len(),
        correct,
        accuracy: ratio(correct, scored.len()),
        per_class_recall: support
            .iter()
            .zip(&hits)
            .map(|(&n, &h)| (n > 0).then(|| ratio(h, n)))
            .collect(),
    }
}

/// Try every `(T_conv, T_vit)` pair with the confidence-weighted ensemble and
/// return the best pair with its accuracy. The first pair wins ties.
pub fn sweep_temperatures(
    samples: &[ValidationSample],
    grid: &[f64],
    base: &EnsembleConfig,
) -> Option<(f64, f64, f64)> {
    let mut best: Option<(f64, f64, f64)> = None;
    for &t_conv in grid.iter().filter(|t| t.is_finite() && **t > 0.0) {
        for &t_vit in grid.iter().filter(|t| t.is_finite() && **t > 0.0) {
            let candidate = EnsembleConfig::confidence(base.num_classes, t_conv, t_vit);
            let accuracy = evaluate(samples, &candidate).accuracy;
            if best.map_or(true, |(_, _, b)| accuracy > b) {
                best = Some((t_conv, t_vit, accuracy));
            }
        }
    }
    best
}

/// Derive one [`ClassRule`] per class from each model's recall on that class.
///
/// Weights are proportional to recall (even split when both are zero). A model
/// is strong for a class when its recall leads by `strong_margin` and reaches
/// `min_recall`; its threshold is the mean probability it gave the class on
/// the samples it got right.
pub fn derive_class_rules(
    samples: &[ValidationSample],
    config: &EnsembleConfig,
    options: TuningOptions,
) -> Vec<ClassRule> {
    let scored = score_samples(samples, config);

    (0..config.num_classes)
        .map(|c| {
            let of_class: Vec<&Scored> = scored.iter().filter(|s| s.class == c).collect();
            let conv_hits: Vec<f64> = of_class
                .iter()
                .filter(|s| s.conv.argmax() == Some(c))
                .map(|s| s.conv.get(c))
                .collect();
            let vit_hits: Vec<f64> = of_class
                .iter()
                .filter(|s| s.vit.argmax() == Some(c))
                .map(|s| s.vit.get(c))
                .collect();

            let recall_conv = ratio(conv_hits.len(), of_class.len());
            let recall_vit = ratio(vit_hits.len(), of_class.len());
            let total = recall_conv + recall_vit;
            let (conv_weight, vit_weight) = if total > 0.0 {
                (recall_conv / total, recall_vit / total)
            } else {
                (0.5, 0.5)
            };

            let conv_strong = recall_conv >= recall_vit + options.strong_margin
                && recall_conv >= options.min_recall;
            let vit_strong = recall_vit >= recall_conv + options.strong_margin
                && recall_vit >= options.min_recall;
            let threshold = if conv_strong {
                mean(&conv_hits)
            } else if vit_strong {
                mean(&vit_hits)
            } else {
                0.0
            };

            ClassRule {
                conv_weight,
                vit_weight,
                conv_strong,
                vit_strong,
                threshold: threshold.clamp(0.0, 1.0),
            }
        })
        .collect()
}

/// Sweep temperatures, then derive per-class rules at the winning pair.
pub fn tune(
    samples: &[ValidationSample],
    base: &EnsembleConfig,
    grid: &[f64],
    options: TuningOptions,
) -> EnsembleConfig {
    let (temperature_conv, temperature_vit) = sweep_temperatures(samples, grid, base)
        .map(|(c, v, _)| (c, v))
        .unwrap_or((base.temperature_conv, base.temperature_vit));

    let mut tuned = EnsembleConfig {
        num_classes: base.num_classes,
        temperature_conv,
        temperature_vit,
        override_enabled: true,
        weighting: Weighting::Confidence,
    };
    let rules = derive_class_rules(samples, &tuned, options);
    tuned.weighting = Weighting::PerClass { rules };
    tuned
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
