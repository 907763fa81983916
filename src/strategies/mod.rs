//! Bundled reference strategies

pub mod sma_cross;

pub use sma_cross::{SmaCrossConfig, SmaCrossStrategy};
