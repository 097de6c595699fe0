//! Chat bot that turns social-media links into uploaded videos.

pub mod bot;
pub mod config;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod recorder;
pub mod slideshow;
pub mod telegram;
pub mod utils;

pub use error::{Error, Result};
