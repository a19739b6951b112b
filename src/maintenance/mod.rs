pub mod batch;
pub mod reindex;
