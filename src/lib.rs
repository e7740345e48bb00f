pub mod bits;
pub mod cancel;
pub mod decoder;
pub mod demo;
mod extract;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod output;
pub mod player;
pub mod stringtable;
pub mod structs;
pub mod timeline;
pub mod tracks;
pub mod voice;

#[cfg(test)]
mod testutil;

pub use cancel::CancelToken;
pub use extract::*;
pub use output::supported_formats;
pub use player::SteamId;
