use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::info;

use crate::errors::{AppError, AppResult};

const ID_COLUMNS: [&str; 3] = ["place_id", "placeid", "id"];
const ID_KEYS: [&str; 3] = ["place_ids", "placeIds", "ids"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorklistFormat {
    Text,
    Csv,
    Json,
}

impl WorklistFormat {
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("csv") => WorklistFormat::Csv,
            Some("json") => WorklistFormat::Json,
            _ => WorklistFormat::Text,
        }
    }
}

/// Reads place ids from a file, picking the format from its extension. Any
/// parse failure aborts the whole load.
pub fn load_worklist<P: AsRef<Path>>(path: P) -> AppResult<Vec<String>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)?;
    let ids = parse_worklist(&raw, WorklistFormat::from_path(path))?;
    info!(path = %path.display(), ids = ids.len(), "worklist loaded");
    Ok(ids)
}

pub fn parse_worklist(raw: &str, format: WorklistFormat) -> AppResult<Vec<String>> {
    let ids = match format {
        WorklistFormat::Text => raw.lines().map(str::to_string).collect(),
        WorklistFormat::Csv => parse_csv(raw)?,
        WorklistFormat::Json => parse_json(raw)?,
    };
    Ok(clean(ids))
}

/// The first row names the columns unless it already holds a place id.
fn parse_csv(raw: &str) -> AppResult<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(raw.as_bytes());

    let mut column = 0;
    let mut ids = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        if row == 0 {
            let named = record.iter().position(|header| {
                ID_COLUMNS
                    .iter()
                    .any(|name| header.eq_ignore_ascii_case(name))
            });
            match named {
                Some(position) => {
                    column = position;
                    continue;
                }
                None if !record.get(0).is_some_and(looks_like_place_id) => continue,
                None => {}
            }
        }
        if let Some(value) = record.get(column) {
            ids.push(value.to_string());
        }
    }
    Ok(ids)
}

/// Place ids are long opaque tokens mixing digits and capitals, which
/// column names never are.
fn looks_like_place_id(value: &str) -> bool {
    if value.starts_with("ChIJ") {
        return true;
    }
    value.len() >= 16
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && value.chars().any(|c| c.is_ascii_digit())
        && value.chars().any(|c| c.is_ascii_uppercase())
}

fn parse_json(raw: &str) -> AppResult<Vec<String>> {
    let value: Value = serde_json::from_str(raw)?;
    let items = match &value {
        Value::Array(items) => items,
        Value::Object(map) => ID_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
            .or_else(|| map.values().find_map(Value::as_array))
            .ok_or_else(|| AppError::Parse("worklist object without an id array".into()))?,
        _ => {
            return Err(AppError::Parse(
                "worklist must be an array or an object holding one".into(),
            ))
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::String(id) => Ok(id.clone()),
            Value::Object(map) => ID_COLUMNS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::to_string)
                .ok_or_else(|| AppError::Parse(format!("worklist entry without an id: {item}"))),
            other => Err(AppError::Parse(format!("worklist entry {other}"))),
        })
        .collect()
}

fn clean(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn text_lines_are_trimmed_and_deduplicated() {
        let ids = parse_worklist("ChIJ1\n\n  ChIJ2 \nChIJ1\r\n", WorklistFormat::Text).unwrap();
        assert_eq!(ids, vec!["ChIJ1", "ChIJ2"]);
    }

    #[test]
    fn csv_prefers_named_id_column() {
        let raw = "name,Place_ID,city\nGolden Dragon,ChIJ1,Springfield\nPanda,ChIJ2,Peoria\n";
        assert_eq!(
            parse_worklist(raw, WorklistFormat::Csv).unwrap(),
            vec!["ChIJ1", "ChIJ2"]
        );
    }

    #[test]
    fn csv_without_id_header_uses_first_column() {
        let raw = "identifier,name\nChIJ1,Golden Dragon\nChIJ2,Panda\n";
        assert_eq!(
            parse_worklist(raw, WorklistFormat::Csv).unwrap(),
            vec!["ChIJ1", "ChIJ2"]
        );
    }

    #[test]
    fn headerless_csv_keeps_first_row() {
        let raw = "ChIJN1t_tDeuEmsRUsoyG83frY4,Sydney\nEhtHb2xkZW4gRHJhZ29uIEJ1ZmZldDEy9,Springfield\n";
        assert_eq!(
            parse_worklist(raw, WorklistFormat::Csv).unwrap(),
            vec!["ChIJN1t_tDeuEmsRUsoyG83frY4", "EhtHb2xkZW4gRHJhZ29uIEJ1ZmZldDEy9"]
        );
        assert!(looks_like_place_id("ChIJ1"));
        assert!(!looks_like_place_id("google_place_identifier"));
        assert!(!looks_like_place_id("name"));
    }

    #[test]
    fn json_accepts_array_or_object_with_array() {
        assert_eq!(
            parse_worklist(r#"["a", "b", "a"]"#, WorklistFormat::Json).unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(
            parse_worklist(r#"{"source": "export", "place_ids": ["c"]}"#, WorklistFormat::Json)
                .unwrap(),
            vec!["c"]
        );
        assert_eq!(
            parse_worklist(r#"{"rows": [{"place_id": "d"}]}"#, WorklistFormat::Json).unwrap(),
            vec!["d"]
        );
    }

    #[test]
    fn malformed_json_aborts_the_load() {
        assert!(parse_worklist(r#"["a", 3]"#, WorklistFormat::Json).is_err());
        assert!(parse_worklist(r#"{"count": 2}"#, WorklistFormat::Json).is_err());
        assert!(parse_worklist("[\"a\",", WorklistFormat::Json).is_err());
    }

    #[test]
    fn loads_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "id\nChIJ9").unwrap();
        assert_eq!(load_worklist(&path).unwrap(), vec!["ChIJ9"]);
    }
}
