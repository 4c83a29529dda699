//! Result materialization, document validation and mutations over a driver.

pub mod materialize;
mod mutation;
mod validation;
pub use materialize::ResultSet;
pub use mutation::MutationExecutor;
pub(crate) use mutation::finish;
pub use validation::DocumentValidator;
