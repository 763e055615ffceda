use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Parse a marker -> channel index mapping given as inline JSON
/// (`{"Ki67":7,"DNA1":1}`) or as a path to a JSON file. Sorted by marker.
pub fn parse_markers(arg: &str) -> Result<Vec<(String, usize)>> {
    let trimmed = arg.trim();
    let text = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        let path = Path::new(trimmed);
        if !path.is_file() {
            return Err(Error::InvalidInput(format!(
                "markers must be a JSON object or a path to one, got {:?}",
                arg
            )));
        }
        fs::read_to_string(path)?
    };

    let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&text)?;
    let mut markers = Vec::with_capacity(raw.len());
    for (name, value) in raw {
        let channel = match &value {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            Error::InvalidInput(format!(
                "channel for marker {:?} must be a non-negative integer, got {}",
                name, value
            ))
        })?;
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::InvalidInput(format!("invalid marker name {:?}", name)));
        }
        markers.push((name, channel as usize));
    }
    if markers.is_empty() {
        return Err(Error::InvalidInput("no markers given".into()));
    }
    Ok(markers)
}

/// Read a header-less one-column CSV of channel names, one per channel.
pub fn read_channel_names(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut names = Vec::new();
    for record in reader.records() {
        let record = record?;
        if let Some(name) = record.get(0).map(str::trim).filter(|n| !n.is_empty()) {
            names.push(name.to_string());
        }
    }
    if names.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no channel names in {}",
            path.display()
        )));
    }
    Ok(dedupe_names(names))
}

/// Every occurrence of a repeated name gets `_<k>`, its 1-based occurrence
/// number; unique names are untouched.
pub fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut totals: HashMap<&str, usize> = HashMap::new();
    for n in &names {
        *totals.entry(n.as_str()).or_default() += 1;
    }
    let mut seen: HashMap<&str, usize> = HashMap::new();
    names
        .iter()
        .map(|n| {
            if totals[n.as_str()] > 1 {
                let k = seen.entry(n.as_str()).or_default();
                *k += 1;
                format!("{}_{}", n, k)
            } else {
                n.clone()
            }
        })
        .collect()
}
