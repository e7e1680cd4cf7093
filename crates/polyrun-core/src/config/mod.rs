//! Engine configuration: types, YAML loading and environment overrides

pub mod loader;
pub mod types;


pub use loader::ConfigLoader;
pub use types::*;
