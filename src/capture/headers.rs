//! Header block snapshots for logging.

use axum::http::HeaderMap;

/// Snapshot of a header map: one entry per distinct name (first-seen
/// order), values in their original order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderBlock {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderBlock {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let entries = headers
            .keys()
            .map(|name| {
                let values = headers
                    .get_all(name)
                    .iter()
                    .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                    .collect();
                (name.as_str().to_string(), values)
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values logged for `name` (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }

    /// One-line JSON-style rendering; multi-valued names become arrays.
    pub fn render(&self) -> String {
        let fields: Vec<String> = self
            .entries
            .iter()
            .map(|(name, values)| {
                let value = match values.as_slice() {
                    [single] => serde_json::Value::from(single.as_str()),
                    many => serde_json::Value::from(many.to_vec()),
                };
                format!("{}: {}", serde_json::Value::from(name.as_str()), value)
            })
            .collect();
        format!("{{{}}}", fields.join(", "))
    }
}
