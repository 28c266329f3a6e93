#![doc = include_str!("../README.md")]

// private mods (will be partly re-exported)
mod buffer;
mod clock;
mod error;
mod grain;
mod player;
mod source;

// public mods
pub mod utils;

// -------------------------------------------------------------------------------------------------

// Re-export public interfaces in a flat hierarchy

pub use buffer::SampleBuffer;
pub use error::Error;
pub use grain::GrainVoice;
pub use player::{GrainPlayer, GrainPlayerOptions, PlaybackState, PlaybackStatusEvent};
pub use source::{Source, SourceId, SourceTime};
