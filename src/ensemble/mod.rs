pub mod combine;
pub mod knn;
pub mod probabilities;
pub mod table;
pub mod tuning;

pub use combine::{apply_ensemble, combine, confidence_weighted, Prediction};
pub use knn::{knn_to_probs, knn_vote, KnnVote};
pub use probabilities::ClassProbabilities;
pub use table::{ClassRule, EnsembleConfig, EnsembleConfigError, Weighting};
