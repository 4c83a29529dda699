//! Resource schemas, adapter settings and their loading and validation.

pub mod types;
pub mod adapter;
pub mod loader;
pub mod validator;

pub use types::*;
pub use adapter::*;
pub use loader::*;
pub use validator::*;
