//! Query-side helpers shared by the semantic and temporal pipelines.

pub mod filters;
pub mod staleness;

pub use filters::{FilterConditions, LanguageMapper, PathFilterBuilder};
pub use staleness::{Staleness, StalenessDetector};

/// Map the RPC `accuracy` parameter to the ANN `ef` search knob.
/// Unknown values fall back to balanced.
pub fn accuracy_to_ef(accuracy: &str) -> usize {
    match accuracy {
        "fast" => 50,
        "balanced" => 100,
        "high" => 200,
        _ => 100,
    }
}
