//! Geometry utilities: SE3 transforms and rigid alignment.

pub mod rigid;
pub mod se3;

pub use rigid::{fit_rigid, mean_residual_sq};
pub use se3::SE3;
