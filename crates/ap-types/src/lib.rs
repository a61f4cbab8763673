pub mod config;
pub mod errors;
pub mod knobs;

pub use config::*;
pub use errors::*;
pub use knobs::*;
