//! Raw resource configuration, as declared by the application (JSON or code).

use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;

/// Name-keyed map in declaration order. Field order drives column order.
pub type OrderedMap<V> = IndexMap<String, V>;

struct UniqueKeys<V>(PhantomData<V>);

impl<'de, V: Deserialize<'de>> Visitor<'de> for UniqueKeys<V> {
    type Value = OrderedMap<V>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map keyed by name")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut out = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((key, value)) = access.next_entry::<String, V>()? {
            if out.contains_key(&key) {
                return Err(de::Error::custom(format!("duplicate key '{}'", key)));
            }
            out.insert(key, value);
        }
        Ok(out)
    }
}

/// Like the `IndexMap` impl, but a name declared twice is an error.
fn unique_keys<'de, D, V>(deserializer: D) -> Result<OrderedMap<V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    deserializer.deserialize_map(UniqueKeys(PhantomData))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRelation {
    pub resource: String,
}

/// One field of a resource schema. `type` stays a string here; the schema compiler
/// rejects names it does not know.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    /// Defaults to `!required` when absent.
    #[serde(default)]
    pub nullable: Option<bool>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub minlength: Option<u32>,
    #[serde(default)]
    pub maxlength: Option<u32>,
    #[serde(default)]
    pub data_relation: Option<DataRelation>,
}

impl FieldSpec {
    pub fn new(type_: &str) -> Self {
        FieldSpec {
            type_: type_.to_string(),
            ..Default::default()
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn max_length(mut self, n: u32) -> Self {
        self.maxlength = Some(n);
        self
    }

    pub fn min_length(mut self, n: u32) -> Self {
        self.minlength = Some(n);
        self
    }

    pub fn relation(mut self, resource: &str) -> Self {
        self.data_relation = Some(DataRelation {
            resource: resource.to_string(),
        });
        self
    }

    pub fn is_list(&self) -> bool {
        self.type_.eq_ignore_ascii_case("list")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    /// Scalar field holding the target's key (foreign key column in place).
    OneToMany,
    /// List field realized through a link table.
    ManyToMany,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    pub target: String,
    pub cardinality: Cardinality,
}

/// Where a resource reads from, and what it always applies on read.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    /// Back this resource with another resource's table.
    #[serde(default)]
    pub source: Option<String>,
    /// Filter expression AND-ed into every read.
    #[serde(default)]
    pub filter: Option<serde_json::Map<String, Value>>,
    /// Projection used when the request has none.
    #[serde(default)]
    pub projection: Option<serde_json::Map<String, Value>>,
    /// Sort used when the request has none, as `[["field", 1 | -1], ...]`.
    #[serde(default)]
    pub default_sort: Option<Vec<(String, i64)>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default, deserialize_with = "unique_keys")]
    pub schema: OrderedMap<FieldSpec>,
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default = "default_allowed_filters")]
    pub allowed_filters: Vec<String>,
    /// Fields a projection can never drop.
    #[serde(default)]
    pub auto_fields: Vec<String>,
    #[serde(default)]
    pub datasource: Option<DatasourceConfig>,
    #[serde(default = "default_true")]
    pub pagination: bool,
}

fn default_allowed_filters() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for ResourceConfig {
    fn default() -> Self {
        ResourceConfig {
            schema: OrderedMap::new(),
            soft_delete: false,
            allowed_filters: default_allowed_filters(),
            auto_fields: Vec::new(),
            datasource: None,
            pagination: true,
        }
    }
}

impl ResourceConfig {
    pub fn field(mut self, name: &str, spec: FieldSpec) -> Self {
        self.schema.insert(name.to_string(), spec);
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    pub fn allowed_filters(mut self, fields: &[&str]) -> Self {
        self.allowed_filters = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn auto_fields(mut self, fields: &[&str]) -> Self {
        self.auto_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn datasource(mut self, datasource: DatasourceConfig) -> Self {
        self.datasource = Some(datasource);
        self
    }

    /// Relations declared through `data_relation`, in field order.
    pub fn relations(&self) -> Vec<(&str, Relation)> {
        self.schema
            .iter()
            .filter_map(|(name, spec)| {
                let rel = spec.data_relation.as_ref()?;
                let cardinality = if spec.is_list() {
                    Cardinality::ManyToMany
                } else {
                    Cardinality::OneToMany
                };
                Some((
                    name.as_str(),
                    Relation {
                        target: rel.resource.clone(),
                        cardinality,
                    },
                ))
            })
            .collect()
    }

    pub fn source(&self) -> Option<&str> {
        self.datasource.as_ref().and_then(|d| d.source.as_deref())
    }
}

/// All resources of an application, in declaration order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Domain {
    #[serde(deserialize_with = "unique_keys")]
    pub resources: OrderedMap<ResourceConfig>,
}

impl Domain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource(mut self, name: &str, config: ResourceConfig) -> Self {
        self.resources.insert(name.to_string(), config);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_keeps_declaration_order() {
        let json = r#"{"schema": {"zeta": {"type": "string"}, "alpha": {"type": "integer"}, "mid": {"type": "float"}}}"#;
        let cfg: ResourceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.schema.keys().collect::<Vec<_>>(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let json = r#"{"schema": {"a": {"type": "string"}, "a": {"type": "integer"}}}"#;
        let err = serde_json::from_str::<ResourceConfig>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate key 'a'"));
        let json = r#"{"people": {}, "people": {}}"#;
        let err = serde_json::from_str::<Domain>(json).unwrap_err();
        assert!(err.to_string().contains("duplicate key 'people'"));
    }

    #[test]
    fn resource_defaults() {
        let cfg: ResourceConfig = serde_json::from_str(r#"{"schema": {}}"#).unwrap();
        assert_eq!(cfg.allowed_filters, vec!["*"]);
        assert!(cfg.pagination);
        assert!(!cfg.soft_delete);
    }

    #[test]
    fn relations_follow_field_type() {
        let cfg = ResourceConfig::default()
            .field("owner", FieldSpec::new("integer").relation("people"))
            .field("tags", FieldSpec::new("list").relation("tags"))
            .field("title", FieldSpec::new("string"));
        let rels = cfg.relations();
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].0, "owner");
        assert_eq!(rels[0].1.cardinality, Cardinality::OneToMany);
        assert_eq!(rels[1].1.target, "tags");
        assert_eq!(rels[1].1.cardinality, Cardinality::ManyToMany);
    }
}
