//! Audio file I/O for elastic - decoding, WAV output, saved defaults

mod config;
mod loader;
mod writer;

pub use config::Config;
pub use loader::{load, AudioData, LoadError};
pub use writer::{write_wav, WriteError};
