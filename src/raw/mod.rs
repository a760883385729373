//! RAW file access
//!
//! - Locating supported files and reading their bytes (`loader`)
//! - Rendering derivatives from embedded previews (`thumbnail`)

pub mod loader;
pub mod thumbnail;

pub use loader::FileSource;
pub use thumbnail::RawCodec;
