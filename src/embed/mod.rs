//! Embedding provider abstraction.
//!
//! The daemon treats embedding generation as an external collaborator: a
//! provider can health-check itself, embed a single text, and embed a batch
//! with its own token-aware sub-batching. The worker pool consumes this
//! trait; the concrete HTTP client lives in [`voyage`].

pub mod voyage;

use std::time::Duration;

use crate::error::Result;

pub use voyage::VoyageClient;

/// Rate-limit posture reported by a provider. Informational only: the
/// worker pool folds it into the throttle signal shown in progress text.
#[derive(Debug, Clone, Default)]
pub struct ThrottleState {
    /// Estimated wait before the next request may proceed
    pub current_wait: Duration,
    /// Remaining request quota in the current window, if the provider tracks one
    pub requests_remaining: Option<u32>,
}

/// An embedding provider shared across the daemon's worker pool.
///
/// Implementations are responsible for their own rate limiting and for
/// sub-batching oversized inputs. The one contract the indexer relies on:
/// a batch call must return exactly one vector per input text.
pub trait EmbeddingProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    fn current_model(&self) -> String;

    fn dimensions(&self) -> usize;

    fn supports_batch(&self) -> bool;

    /// Verify the provider is usable. `test_api` additionally performs a
    /// round-trip request instead of a configuration-only check.
    fn health_check(&self, test_api: bool) -> Result<bool>;

    fn get_embedding(&self, text: &str) -> Result<Vec<f32>>;

    fn get_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn throttle_state(&self) -> ThrottleState {
        ThrottleState::default()
    }
}
