//! Plan model, status rules, media primitives and command execution
//! shared by the storyloom crates.

pub mod assembly;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod plan;
pub mod process;
pub mod status;
