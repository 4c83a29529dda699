//! Query translation: abstract filter/sort/projection/pagination → plan.

mod filter;
mod plan;
pub mod request;
mod translate;

pub use filter::*;
pub use plan::*;
pub use request::{parse_projection, parse_sort, Pagination, ParsedRequest, Projection, QueryRequest};
pub use translate::{resolve_order, resolve_projection, FilterSource, Translator};
pub(crate) use translate::coerce;
