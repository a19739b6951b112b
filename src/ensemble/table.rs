//! Ensemble configuration: temperatures, weighting strategy and the
//! per-class rule table.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-class blending rule for the ConvNeXt / ViT pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassRule {
    pub conv_weight: f64,
    pub vit_weight: f64,
    /// ConvNeXt is historically reliable for this class.
    #[serde(default)]
    pub conv_strong: bool,
    /// ViT is historically reliable for this class.
    #[serde(default)]
    pub vit_strong: bool,
    /// Override threshold τ. `0.0` disables the override for this class.
    #[serde(default)]
    pub threshold: f64,
}

impl ClassRule {
    pub const fn blend(conv_weight: f64, vit_weight: f64) -> Self {
        Self {
            conv_weight,
            vit_weight,
            conv_strong: false,
            vit_strong: false,
            threshold: 0.0,
        }
    }
}

/// How the two model distributions are combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Weighting {
    /// Static per-class weights derived from a validation set, with optional overrides.
    PerClass { rules: Vec<ClassRule> },
    /// Weights derived per request from each model's peak probability.
    Confidence,
}

impl Weighting {
    pub fn name(&self) -> &'static str {
        match self {
            Weighting::PerClass { .. } => "per_class",
            Weighting::Confidence => "confidence",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub num_classes: usize,
    pub temperature_conv: f64,
    pub temperature_vit: f64,
    #[serde(default = "default_true")]
    pub override_enabled: bool,
    pub weighting: Weighting,
}

/// Upper bound on `num_classes`; every probability vector is allocated at this size.
pub const MAX_CLASSES: usize = 32;

fn default_true() -> bool {
    true
}

#[derive(Debug, Error, PartialEq)]
pub enum EnsembleConfigError {
    #[error("ensemble requires num_classes > 0")]
    ZeroClasses,
    #[error("num_classes {0} exceeds the maximum of {max}", max = MAX_CLASSES)]
    TooManyClasses(usize),
    #[error("{model} temperature must be finite and > 0, got {value}")]
    InvalidTemperature { model: &'static str, value: f64 },
    #[error("per-class table has {actual} rules but num_classes is {expected}")]
    RuleCount { expected: usize, actual: usize },
    #[error("class {class}: weights must be finite and non-negative")]
    InvalidWeight { class: usize },
    #[error("class {class}: threshold {value} is outside [0, 1]")]
    InvalidThreshold { class: usize, value: f64 },
}

impl Default for EnsembleConfig {
    /// Seven Norwood stages with the validation-derived table.
    fn default() -> Self {
        Self {
            num_classes: 7,
            temperature_conv: 0.2,
            temperature_vit: 0.15,
            override_enabled: true,
            weighting: Weighting::PerClass {
                rules: vec![
                    ClassRule {
                        conv_strong: true,
                        threshold: 0.7,
                        ..ClassRule::blend(0.6, 0.4)
                    },
                    ClassRule::blend(0.5, 0.5),
                    ClassRule {
                        vit_strong: true,
                        threshold: 0.65,
                        ..ClassRule::blend(0.4, 0.6)
                    },
                    ClassRule::blend(0.45, 0.55),
                    ClassRule {
                        conv_strong: true,
                        threshold: 0.6,
                        ..ClassRule::blend(0.55, 0.45)
                    },
                    ClassRule::blend(0.5, 0.5),
                    ClassRule {
                        vit_strong: true,
                        threshold: 0.6,
                        ..ClassRule::blend(0.3, 0.7)
                    },
                ],
            },
        }
    }
}

impl EnsembleConfig {
    /// Confidence-weighted ensemble with no per-class table.
    pub fn confidence(num_classes: usize, temperature_conv: f64, temperature_vit: f64) -> Self {
        Self {
            num_classes,
            temperature_conv,
            temperature_vit,
            override_enabled: false,
            weighting: Weighting::Confidence,
        }
    }

    /// Check the table is consistent and every number is usable.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), EnsembleConfigError> {
        if self.num_classes == 0 {
            return Err(EnsembleConfigError::ZeroClasses);
        }
        if self.num_classes > MAX_CLASSES {
            return Err(EnsembleConfigError::TooManyClasses(self.num_classes));
        }
        for (model, value) in [("conv", self.temperature_conv), ("vit", self.temperature_vit)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(EnsembleConfigError::InvalidTemperature { model, value });
            }
        }
        if let Weighting::PerClass { rules } = &self.weighting {
            if rules.len() != self.num_classes {
                return Err(EnsembleConfigError::RuleCount {
                    expected: self.num_classes,
                    actual: rules.len(),
                });
            }
            for (class, rule) in rules.iter().enumerate() {
                let weights_ok = [rule.conv_weight, rule.vit_weight]
                    .iter()
                    .all(|w| w.is_finite() && *w >= 0.0);
                if !weights_ok {
                    return Err(EnsembleConfigError::InvalidWeight { class });
                }
                if !(0.0..=1.0).contains(&rule.threshold) {
                    return Err(EnsembleConfigError::InvalidThreshold {
                        class,
                        value: rule.threshold,
                    });
                }
            }
        }
        Ok(())
    }

    /// Load and validate a JSON table.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ensemble config {}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse ensemble config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// The JSON table at `path` when it exists, otherwise the built-in table.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_json_file(p),
            Some(p) => {
                tracing::info!("No ensemble config at {}, using built-in table", p.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn strategy(&self) -> &'static str {
        self.weighting.name()
    }
}
