//! Multi-scale thought generator on candle.
//!
//! A backbone produces a pyramid of feature maps, finest first. The
//! [`ThoughtGenerator`] fuses it top-down with cross-scale attention carrying a
//! learned relative position bias, then emits raw logits for every fused stage.

pub mod config;
pub mod debug;
pub mod error;
pub mod model;
pub mod synthetic;

pub use config::{NumClasses, ThoughtGeneratorConfig};
pub use error::{FusionError, Result};
pub use model::ThoughtGenerator;
