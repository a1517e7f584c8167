//! Dashboard template-variable expansion.

use serde::Deserialize;
use std::collections::HashMap;

pub trait VariableSubstitution: Send + Sync {
    /// Expands variables in `text`. Text without variables comes back unchanged.
    fn replace(&self, text: &str) -> String;
}

/// Variables supplied with a panel request, expanded in `$name`, `${name}`,
/// `${name:format}` and `[[name]]` form. Unknown names are left as written.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct TemplateVariables {
    values: HashMap<String, String>,
}

impl TemplateVariables {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TemplateVariables {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

impl VariableSubstitution for TemplateVariables {
    fn replace(&self, text: &str) -> String {
        if self.values.is_empty() || !(text.contains('$') || text.contains("[[")) {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("${") {
                if let Some(end) = after.find('}') {
                    let inner = &after[..end];
                    let name = inner.split(':').next().unwrap_or_default();
                    if let Some(value) = self.lookup(name) {
                        out.push_str(value);
                        rest = &after[end + 1..];
                        continue;
                    }
                }
            } else if let Some(after) = rest.strip_prefix("[[") {
                if let Some(end) = after.find("]]") {
                    let name = after[..end].split(':').next().unwrap_or_default();
                    if let Some(value) = self.lookup(name) {
                        out.push_str(value);
                        rest = &after[end + 2..];
                        continue;
                    }
                }
            } else if let Some(after) = rest.strip_prefix('$') {
                let len = after
                    .char_indices()
                    .find(|(_, ch)| !is_name_char(*ch))
                    .map(|(idx, _)| idx)
                    .unwrap_or(after.len());
                if len > 0 {
                    if let Some(value) = self.lookup(&after[..len]) {
                        out.push_str(value);
                        rest = &after[len..];
                        continue;
                    }
                }
            }

            let mut chars = rest.chars();
            if let Some(ch) = chars.next() {
                out.push(ch);
            }
            rest = chars.as_str();
        }

        out
    }
}
