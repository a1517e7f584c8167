//! Compiles dashboard filter descriptors into a single Druid filter tree.

use crate::template::VariableSubstitution;
use serde::{
    de::{self, Deserializer},
    ser::SerializeMap,
    Deserialize, Serialize, Serializer,
};
use serde_json::{json, Map, Value};

/// Druid filter `type`, closed over the kinds that need variable expansion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum FilterKind {
    Selector,
    Regex,
    JavaScript,
    Search,
    Other(String),
}

impl FilterKind {
    /// Field that carries user text subject to template expansion.
    pub fn substituted_field(&self) -> Option<&'static str> {
        match self {
            FilterKind::Selector => Some("value"),
            FilterKind::Regex => Some("pattern"),
            FilterKind::JavaScript => Some("function"),
            FilterKind::Search | FilterKind::Other(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FilterKind::Selector => "selector",
            FilterKind::Regex => "regex",
            FilterKind::JavaScript => "javascript",
            FilterKind::Search => "search",
            FilterKind::Other(name) => name,
        }
    }
}

impl From<String> for FilterKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "selector" => FilterKind::Selector,
            "regex" => FilterKind::Regex,
            "javascript" => FilterKind::JavaScript,
            "search" => FilterKind::Search,
            _ => FilterKind::Other(value),
        }
    }
}

impl From<FilterKind> for String {
    fn from(kind: FilterKind) -> Self {
        match kind {
            FilterKind::Other(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FilterDescriptor {
    #[serde(rename = "type")]
    pub kind: FilterKind,
    #[serde(
        default,
        deserialize_with = "lenient_bool",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub negate: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(false),
        Value::Bool(flag) => Ok(flag),
        Value::String(text) => match text.trim() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(de::Error::custom(format!("invalid negate flag '{other}'"))),
        },
        other => Err(de::Error::custom(format!("invalid negate flag {other}"))),
    }
}

impl FilterDescriptor {
    /// `search` filter matching `text` case-insensitively within `dimension`.
    pub fn insensitive_search(dimension: &str, text: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("dimension".into(), Value::String(dimension.to_string()));
        fields.insert(
            "query".into(),
            json!({ "type": "insensitive_contains", "value": text }),
        );
        Self {
            kind: FilterKind::Search,
            negate: false,
            fields,
        }
    }

    fn substituted(&self, vars: &dyn VariableSubstitution) -> Map<String, Value> {
        let target = self.kind.substituted_field();
        let mut out = Map::with_capacity(self.fields.len() + 1);
        out.insert("type".into(), Value::String(self.kind.as_str().to_string()));
        for (key, value) in &self.fields {
            let value = match value {
                Value::String(text) if Some(key.as_str()) == target => {
                    Value::String(vars.replace(text))
                }
                other => other.clone(),
            };
            out.insert(key.clone(), value);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterTree {
    Leaf(Map<String, Value>),
    Not(Box<FilterTree>),
    And(Vec<FilterTree>),
}

impl Serialize for FilterTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FilterTree::Leaf(fields) => fields.serialize(serializer),
            FilterTree::Not(inner) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "not")?;
                map.serialize_entry("field", inner)?;
                map.end()
            }
            FilterTree::And(children) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("type", "and")?;
                map.serialize_entry("fields", children)?;
                map.end()
            }
        }
    }
}

/// Expands variables, applies negation and joins the result with `and`.
/// No filters yields `None` so the query carries no `filter` key at all.
pub fn compile(filters: &[FilterDescriptor], vars: &dyn VariableSubstitution) -> Option<FilterTree> {
    let mut nodes: Vec<FilterTree> = filters
        .iter()
        .map(|filter| {
            let leaf = FilterTree::Leaf(filter.substituted(vars));
            if filter.negate {
                FilterTree::Not(Box::new(leaf))
            } else {
                leaf
            }
        })
        .collect();

    match nodes.len() {
        0 => None,
        1 => nodes.pop(),
        _ => Some(FilterTree::And(nodes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateVariables;
    use pretty_assertions::assert_eq;

    fn descriptor(value: Value) -> FilterDescriptor {
        serde_json::from_value(value).expect("descriptor should deserialize")
    }

    fn vars() -> TemplateVariables {
        [("country", "NZ"), ("re", "^api-.*")].into_iter().collect()
    }

    #[test]
    fn empty_input_compiles_to_nothing() {
        assert!(compile(&[], &vars()).is_none());
    }

    #[test]
    fn single_filter_is_not_wrapped() {
        let filters = [descriptor(
            json!({"type": "selector", "dimension": "country", "value": "$country"}),
        )];
        let tree = compile(&filters, &vars()).unwrap();
        assert_eq!(
            serde_json::to_value(tree).unwrap(),
            json!({"type": "selector", "dimension": "country", "value": "NZ"})
        );
    }

    #[test]
    fn multiple_filters_join_with_and_in_order() {
        let filters = [
            descriptor(json!({"type": "regex", "dimension": "page", "pattern": "$re"})),
            descriptor(json!({"type": "selector", "dimension": "country", "value": "US"})),
        ];
        let tree = compile(&filters, &vars()).unwrap();
        assert_eq!(
            serde_json::to_value(tree).unwrap(),
            json!({
                "type": "and",
                "fields": [
                    {"type": "regex", "dimension": "page", "pattern": "^api-.*"},
                    {"type": "selector", "dimension": "country", "value": "US"}
                ]
            })
        );
    }

    #[test]
    fn negate_wraps_in_not_and_is_stripped() {
        let filters = [descriptor(
            json!({"type": "selector", "dimension": "country", "value": "NZ", "negate": true}),
        )];
        let tree = compile(&filters, &vars()).unwrap();
        assert_eq!(
            serde_json::to_value(tree).unwrap(),
            json!({
                "type": "not",
                "field": {"type": "selector", "dimension": "country", "value": "NZ"}
            })
        );
    }

    #[test]
    fn string_negate_flags_are_accepted() {
        let filter = descriptor(json!({"type": "selector", "dimension": "d", "value": "v", "negate": "true"}));
        assert!(filter.negate);
        let filter = descriptor(json!({"type": "selector", "dimension": "d", "value": "v", "negate": null}));
        assert!(!filter.negate);
    }

    #[test]
    fn javascript_substitutes_function_only() {
        let filters = [descriptor(json!({
            "type": "javascript",
            "dimension": "$country",
            "function": "function(x) { return x == '$country'; }"
        }))];
        let tree = compile(&filters, &vars()).unwrap();
        assert_eq!(
            serde_json::to_value(tree).unwrap(),
            json!({
                "type": "javascript",
                "dimension": "$country",
                "function": "function(x) { return x == 'NZ'; }"
            })
        );
    }

    #[test]
    fn other_kinds_pass_through_untouched() {
        let raw = json!({
            "type": "in",
            "dimension": "country",
            "values": ["$country", "US"]
        });
        let tree = compile(&[descriptor(raw.clone())], &vars()).unwrap();
        assert_eq!(serde_json::to_value(tree).unwrap(), raw);

        let search = FilterDescriptor::insensitive_search("page", "$country");
        let tree = compile(&[search], &vars()).unwrap();
        assert_eq!(
            serde_json::to_value(tree).unwrap(),
            json!({
                "type": "search",
                "dimension": "page",
                "query": {"type": "insensitive_contains", "value": "$country"}
            })
        );
    }

    #[test]
    fn non_string_values_are_left_alone() {
        let filters = [descriptor(json!({"type": "selector", "dimension": "code", "value": 404}))];
        let tree = compile(&filters, &vars()).unwrap();
        assert_eq!(
            serde_json::to_value(tree).unwrap(),
            json!({"type": "selector", "dimension": "code", "value": 404})
        );
    }
}
