//! Descriptor matching and the cascaded correspondence filters.

pub mod engine;
pub mod filters;
pub mod pipeline;

pub use engine::MatchEngine;
pub use pipeline::match_and_filter;
