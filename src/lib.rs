pub mod analyzer;
pub mod batch;
pub mod chain;
pub mod config;
pub mod engine;
pub mod math;
pub mod profile;
pub mod reference;
pub mod render;

#[cfg(test)]
pub(crate) mod testing;

/// Audio file extensions picked up when walking directories
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "wav", "mp3", "flac", "ogg", "opus", "m4a", "aac", "aif", "aiff", "wma", "webm", "mp4",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "voxlevel";
