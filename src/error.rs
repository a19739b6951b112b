use thiserror::Error;

use crate::vision::backbone::Backbone;

/// Why an analysis produced no result at all.
///
/// An analysis that ran but found no usable neighbours is not an error: it
/// returns the no-prediction sentinel instead.
#[derive(Debug, Error)]
pub enum AnalyzeError {
    #[error("image payload is empty")]
    EmptyImage,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{backbone} embedding failed: {cause:#}")]
    Embedding { backbone: Backbone, cause: anyhow::Error },
    #[error("{backbone} index unavailable: {cause:#}")]
    IndexUnavailable { backbone: Backbone, cause: anyhow::Error },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_backbone_and_cause() {
        let err = AnalyzeError::Embedding {
            backbone: Backbone::Vit,
            cause: anyhow::anyhow!("connection refused"),
        };
        assert_eq!(err.to_string(), "vit embedding failed: connection refused");

        let err = AnalyzeError::IndexUnavailable {
            backbone: Backbone::ConvNext,
            cause: anyhow::anyhow!("disk full").context("persist failed"),
        };
        assert_eq!(
            err.to_string(),
            "convnext index unavailable: persist failed: disk full"
        );
    }
}
