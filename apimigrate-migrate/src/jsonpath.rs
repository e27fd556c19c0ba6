//! Minimal JSON path evaluation for response extraction.
//!
//! Paths look like `id`, `$.data.id`, `items[0].id`, `items.0.id` or
//! `items[*].id`. A wildcard yields the first element for which the rest of
//! the path resolves.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
}

/// Evaluate `path` against `root`.
pub fn select<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse(path)?;
    walk(root, &segments)
}

/// Evaluate `path` and render the hit as a plain string.
///
/// Strings are returned without quotes; `null` counts as missing; every other
/// value is returned as compact JSON.
pub fn select_string(root: &Value, path: &str) -> Option<String> {
    match select(root, path)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn walk<'a>(current: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(current);
    };

    match head {
        Segment::Field(name) => match current {
            Value::Object(map) => walk(map.get(name)?, rest),
            Value::Array(items) => {
                let index: usize = name.parse().ok()?;
                walk(items.get(index)?, rest)
            }
            _ => None,
        },
        Segment::Index(index) => match current {
            Value::Array(items) => walk(items.get(*index)?, rest),
            _ => None,
        },
        Segment::Wildcard => match current {
            Value::Array(items) => items.iter().find_map(|item| walk(item, rest)),
            Value::Object(map) => map.values().find_map(|item| walk(item, rest)),
            _ => None,
        },
    }
}

fn parse(path: &str) -> Option<Vec<Segment>> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);

    let mut segments = Vec::new();
    if path.is_empty() {
        return Some(segments);
    }

    for part in path.split('.') {
        let (field, mut brackets) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };

        match field {
            "" if brackets.is_empty() => return None,
            "" => {}
            "*" => segments.push(Segment::Wildcard),
            name => segments.push(Segment::Field(name.to_string())),
        }

        while !brackets.is_empty() {
            let inner_end = brackets.find(']')?;
            let inner = brackets[1..inner_end].trim();
            let inner = inner.trim_matches(|c| c == '\'' || c == '"');
            if inner == "*" {
                segments.push(Segment::Wildcard);
            } else if let Ok(index) = inner.parse() {
                segments.push(Segment::Index(index));
            } else if !inner.is_empty() {
                segments.push(Segment::Field(inner.to_string()));
            } else {
                return None;
            }
            brackets = &brackets[inner_end + 1..];
            if !brackets.is_empty() && !brackets.starts_with('[') {
                return None;
            }
        }
    }

    Some(segments)
}
