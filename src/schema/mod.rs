//! Runtime table descriptors compiled from the declarative resource domain.

mod compiled;
mod compiler;

pub use compiled::*;
pub use compiler::compile;
