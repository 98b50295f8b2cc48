// Helpers for reading and layering request context objects

use serde_json::{Map, Value};

/// Look up a dotted path (`"workspace.settings.region"`) in a context object
pub fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.').filter(|segment| !segment.is_empty());
    let first = segments.next()?;
    let mut current = context.get(first)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// A path counts as present only when it resolves to a non-null value
pub fn is_present(context: &Map<String, Value>, path: &str) -> bool {
    lookup(context, path).map_or(false, |value| !value.is_null())
}

pub fn all_present<'a, I>(context: &Map<String, Value>, paths: I) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    paths.into_iter().all(|path| is_present(context, path))
}

/// Request values win over defaults
pub fn layered(defaults: &Map<String, Value>, request: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = defaults.clone();
    for (key, value) in request {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_dotted_lookup() {
        let context = object(json!({
            "workspace": { "id": "w1", "tags": ["a", "b"] },
            "user": null
        }));

        assert_eq!(lookup(&context, "workspace.id"), Some(&json!("w1")));
        assert_eq!(lookup(&context, "workspace.tags.1"), Some(&json!("b")));
        assert!(lookup(&context, "workspace.missing").is_none());
        assert!(!is_present(&context, "user"));
        assert!(is_present(&context, "workspace"));
    }

    #[test]
    fn test_request_values_override_defaults() {
        let defaults = object(json!({ "tone": "formal", "lang": "en" }));
        let request = object(json!({ "tone": "casual" }));

        let merged = layered(&defaults, &request);
        assert_eq!(merged["tone"], json!("casual"));
        assert_eq!(merged["lang"], json!("en"));
    }
}
