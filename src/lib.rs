pub mod cache;
pub mod config;
pub mod error;
pub mod features;
pub mod geometry;
pub mod matching;
pub mod optimizer;
pub mod submap;
pub mod system;
