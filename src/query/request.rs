//! Inbound request shapes: the framework's raw request and the typed form the
//! translator consumes.

use crate::error::AppError;
use crate::query::{FilterExpression, SortDirection};
use serde_json::{Map, Value};

/// Raw request as handed over by the REST framework.
#[derive(Clone, Debug, Default)]
pub struct ParsedRequest {
    pub where_: Option<String>,
    pub sort: Option<String>,
    pub projection: Option<String>,
    pub max_results: Option<u64>,
    pub page: Option<u64>,
    pub show_deleted: bool,
}

/// Ordered field → include flag.
pub type Projection = Vec<(String, bool)>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pagination {
    pub max_results: Option<u64>,
    /// 1-based; values <= 1 mean the first page.
    pub page: u64,
}

#[derive(Clone, Debug, Default)]
pub struct QueryRequest {
    pub filter: FilterExpression,
    pub sort: Vec<(String, SortDirection)>,
    pub projection: Option<Projection>,
    pub pagination: Pagination,
    pub show_deleted: bool,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parsed(req: &ParsedRequest) -> Result<Self, AppError> {
        let filter = match req.where_.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => FilterExpression::parse(text)?,
            _ => FilterExpression::new(),
        };
        let sort = match req.sort.as_deref() {
            Some(text) => parse_sort(text)?,
            None => Vec::new(),
        };
        let projection = match req.projection.as_deref() {
            Some(text) => Some(parse_projection(text)?),
            None => None,
        };
        Ok(QueryRequest {
            filter,
            sort,
            projection,
            pagination: Pagination {
                max_results: req.max_results,
                page: req.page.unwrap_or(1),
            },
            show_deleted: req.show_deleted,
        })
    }

    pub fn filter(mut self, filter: FilterExpression) -> Self {
        self.filter = filter;
        self
    }

    pub fn sort_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.sort.push((field.to_string(), direction));
        self
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn page(mut self, max_results: u64, page: u64) -> Self {
        self.pagination = Pagination {
            max_results: Some(max_results),
            page,
        };
        self
    }

    pub fn show_deleted(mut self, show: bool) -> Self {
        self.show_deleted = show;
        self
    }
}

/// Parse a sort spec: `[("name", 1), ("age", -1)]`, its JSON form
/// `[["name", 1], ...]`, or `name,-age`.
pub fn parse_sort(text: &str) -> Result<Vec<(String, SortDirection)>, AppError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    if text.starts_with('[') {
        let normalized = text.replace('(', "[").replace(')', "]").replace('\'', "\"");
        let pairs: Vec<(String, i64)> = serde_json::from_str(&normalized)
            .map_err(|_| AppError::Validation(format!("unable to parse sort '{}'", text)))?;
        return pairs
            .into_iter()
            .map(|(field, dir)| {
                SortDirection::from_i64(dir)
                    .map(|d| (field.clone(), d))
                    .ok_or_else(|| AppError::Validation(format!("invalid sort direction {} for '{}'", dir, field)))
            })
            .collect();
    }
    text.split(',')
        .map(|part| {
            let part = part.trim();
            let (field, dir) = match part.strip_prefix('-') {
                Some(f) => (f, SortDirection::Desc),
                None => (part, SortDirection::Asc),
            };
            if field.is_empty() {
                return Err(AppError::Validation(format!("unable to parse sort '{}'", text)));
            }
            Ok((field.to_string(), dir))
        })
        .collect()
}

pub fn parse_projection(text: &str) -> Result<Projection, AppError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => projection_from_map(&map),
        _ => Err(AppError::Validation("unable to parse `projection`".into())),
    }
}

/// Accepts booleans or 0/1 values.
pub fn projection_from_map(map: &Map<String, Value>) -> Result<Projection, AppError> {
    map.iter()
        .map(|(field, v)| {
            let include = match v {
                Value::Bool(b) => *b,
                Value::Number(n) if n.as_i64() == Some(1) => true,
                Value::Number(n) if n.as_i64() == Some(0) => false,
                _ => {
                    return Err(AppError::Validation(format!(
                        "projection value for '{}' must be 0, 1, true or false",
                        field
                    )))
                }
            };
            Ok((field.clone(), include))
        })
        .collect()
}
