//! # hairscan
//!
//! Backend for classifying the stage of pattern hair loss from a scalp photo.
//! Two vision backbones embed the image, each embedding is matched against a
//! labelled reference index, and the two neighbour votes are combined by a
//! per-class ensemble.
//!
//! ## Architecture
//!
//! ```text
//!                         ┌──────────────┐
//!                         │ Image upload │
//!                         └──────┬───────┘
//!                                │
//!                 ┌──────────────┴──────────────┐
//!                 ▼                             ▼
//!        ┌────────────────┐            ┌────────────────┐
//!        │ ConvNeXt embed │            │   ViT embed    │
//!        │   (sidecar)    │            │   (sidecar)    │
//!        └───────┬────────┘            └───────┬────────┘
//!                ▼                             ▼
//!        ┌────────────────┐            ┌────────────────┐
//!        │  k-NN search   │            │  k-NN search   │
//!        │ convnext index │            │   vit index    │
//!        └───────┬────────┘            └───────┬────────┘
//!                ▼                             ▼
//!        ┌────────────────┐            ┌────────────────┐
//!        │ softmax vote   │            │ softmax vote   │
//!        │   T = 0.20     │            │   T = 0.15     │
//!        └───────┬────────┘            └───────┬────────┘
//!                └──────────────┬──────────────┘
//!                               ▼
//!                  ┌────────────────────────┐
//!                  │  Per-class ensemble    │
//!                  │  weighted blend, then  │
//!                  │  strong-model override │
//!                  └───────────┬────────────┘
//!                              ▼
//!                  ┌────────────────────────┐
//!                  │ argmax → stage, conf.  │
//!                  │ + explanation (LLM or  │
//!                  │   template fallback)   │
//!                  └────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration for server, sidecar, LLM and batching
//! - [`models`] - Shared data types: matches, vector records, request/response types
//! - [`vision`] - Backbone identifiers and the embedding sidecar client
//! - [`search`] - The `VectorIndex` seam and a flat cosine index persisted as JSON
//! - [`ensemble`] - k-NN voting, the per-class ensemble, and offline tuning
//! - [`analyzer`] - Request-scoped pipeline from image to prediction
//! - [`llm`] - Explanations and streamed advisory chat via Ollama, OpenAI or Gemini
//! - [`maintenance`] - Batched upsert/delete, index stats, dataset re-indexing
//! - [`api`] - Axum HTTP handlers and the router
//! - [`state`] - Shared application state

pub mod analyzer;
pub mod api;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod llm;
pub mod maintenance;
pub mod models;
pub mod search;
pub mod state;
pub mod vision;
