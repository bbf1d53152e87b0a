//! Dotted/indexed path resolution against responses.
//!
//! Resolution never fails loudly: any missing segment, wrong type
//! or bad index yields `None`.

use crate::model::Response;
use serde_json::Value;

/// Resolve `path` against a response.
///
/// `status` and `statusText` address the response fields,
/// `headers.<name>` a header (case-insensitive), and everything
/// else the response data. A leading `data` segment is optional, so
/// `data.id` and `id` are the same path.
pub fn resolve_path(path: &str, response: &Response) -> Option<Value> {
    match path {
        "status" => return Some(Value::from(response.status)),
        "statusText" => {
            return Some(Value::String(response.status_text.clone()))
        }
        _ => {}
    }

    if let Some(name) = path.strip_prefix("headers.") {
        return response
            .header(name)
            .map(|value| Value::String(value.to_string()));
    }

    let rest = if path == "data" {
        ""
    } else if let Some(rest) = path.strip_prefix("data.") {
        rest
    } else if path.starts_with("data[") {
        &path["data".len()..]
    } else {
        path
    };
    resolve_value(rest, &response.data).cloned()
}

/// Resolve `path` against an arbitrary JSON value. An empty path
/// yields the value itself.
pub fn resolve_value<'a>(path: &str, root: &'a Value) -> Option<&'a Value> {
    let mut current = root;

    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (name, indices) = parse_segment(segment)?;

        if !name.is_empty() {
            current = match current {
                Value::Object(map) => map.get(name)?,
                Value::Array(items) => items.get(name.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        for idx in indices {
            current = current.as_array()?.get(idx)?;
        }
    }

    Some(current)
}

/// Split `name[1][2]` into the field name and its indices.
fn parse_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };

    let (name, mut rest) = segment.split_at(open);
    let mut indices = Vec::new();
    while let Some(inner) = rest.strip_prefix('[') {
        let close = inner.find(']')?;
        indices.push(inner[..close].trim().parse::<usize>().ok()?);
        rest = &inner[close + 1..];
    }

    rest.is_empty().then_some((name, indices))
}
