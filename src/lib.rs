mod errors;
pub mod callsite;
pub mod config;
pub mod extension;
pub mod intercept;
pub mod memory;
pub mod patcher;
pub mod pattern;
pub mod symbols;
pub mod table;
pub use errors::PatchError;
pub type Result<T> = std::result::Result<T, PatchError>;
