//! Structural validation of job submissions.
//!
//! Every problem is collected, not just the first, and rendered in the
//! `"field" must be ...` style callers already parse.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

const FILE_ID_LEN: usize = 24;
const TOP_LEVEL_KEYS: [&str; 4] = ["name", "files", "priority", "retries"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    #[serde(rename = "podcast-part")]
    PodcastPart,
    #[serde(rename = "storage-file")]
    StorageFile,
}

impl FileType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "podcast-part" => Some(FileType::PodcastPart),
            "storage-file" => Some(FileType::StorageFile),
            _ => None,
        }
    }
}

/// Offsets in seconds into a source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Seek {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    #[serde(rename = "type")]
    pub file_type: FileType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seek: Option<Seek>,
}

/// A validated `<prefix>/add` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub name: String,
    pub files: Vec<FileRef>,
    pub priority: Option<i64>,
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// Path of the offending value, e.g. `files[0].seek.start`.
    pub path: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn paths(&self) -> Vec<&str> {
        self.0.iter().map(|e| e.path.as_str()).collect()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&messages.join(". "))
    }
}

impl std::error::Error for ValidationErrors {}

struct Collector {
    errors: Vec<ValidationError>,
}

impl Collector {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn is_file_id(id: &str) -> bool {
    id.len() == FILE_ID_LEN && id.chars().all(|c| c.is_ascii_hexdigit())
}

fn check_offset(c: &mut Collector, path: String, value: Option<&Value>) -> Option<f64> {
    match value {
        None => None,
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v >= 0.0 => Some(v),
            _ => {
                c.push(path, "must be greater than or equal to 0");
                None
            }
        },
        Some(_) => {
            c.push(path, "must be a number");
            None
        }
    }
}

fn check_seek(c: &mut Collector, path: &str, value: &Value) -> Option<Seek> {
    let Value::Object(seek) = value else {
        c.push(path, "must be of type object");
        return None;
    };
    for key in seek.keys() {
        if key != "start" && key != "end" {
            c.push(format!("{}.{}", path, key), "is not allowed");
        }
    }
    let start = check_offset(c, format!("{}.start", path), seek.get("start"));
    let end = check_offset(c, format!("{}.end", path), seek.get("end"));
    Some(Seek { start, end })
}

fn check_file(c: &mut Collector, index: usize, value: &Value) -> Option<FileRef> {
    let path = format!("files[{}]", index);
    let Value::Object(file) = value else {
        c.push(path, "must be of type object");
        return None;
    };
    let before = c.errors.len();

    let id = match file.get("id") {
        None => {
            c.push(format!("{}.id", path), "is required");
            None
        }
        Some(Value::String(id)) if is_file_id(id) => Some(id.clone()),
        Some(Value::String(id)) => {
            c.push(
                format!("{}.id", path),
                format!(
                    "with value \"{}\" fails to match the required pattern: /^[0-9a-fA-F]{{24}}$/",
                    id
                ),
            );
            None
        }
        Some(_) => {
            c.push(format!("{}.id", path), "must be a string");
            None
        }
    };

    let file_type = match file.get("type") {
        None => {
            c.push(format!("{}.type", path), "is required");
            None
        }
        Some(value) => {
            let parsed = value.as_str().and_then(FileType::parse);
            if parsed.is_none() {
                c.push(
                    format!("{}.type", path),
                    "must be one of [podcast-part, storage-file]",
                );
            }
            parsed
        }
    };

    let seek = match file.get("seek") {
        None => None,
        Some(value) => check_seek(c, &format!("{}.seek", path), value),
    };

    for key in file.keys() {
        if !matches!(key.as_str(), "id" | "type" | "seek") {
            c.push(format!("{}.{}", path, key), "is not allowed");
        }
    }

    if c.errors.len() > before {
        return None;
    }
    Some(FileRef {
        id: id?,
        file_type: file_type?,
        seek,
    })
}

fn check_files(c: &mut Collector, body: &Map<String, Value>) -> Vec<FileRef> {
    let files = match body.get("files") {
        None => {
            c.push("files", "is required");
            return Vec::new();
        }
        Some(Value::Array(files)) => files,
        Some(_) => {
            c.push("files", "must be an array");
            return Vec::new();
        }
    };
    if files.is_empty() {
        c.push("files", "must contain at least 1 items");
    }
    files
        .iter()
        .enumerate()
        .filter_map(|(i, file)| check_file(c, i, file))
        .collect()
}

/// Validate a raw submission payload.
pub fn validate_join_request(payload: &Value) -> Result<JoinRequest, ValidationErrors> {
    let mut c = Collector { errors: Vec::new() };

    let Value::Object(body) = payload else {
        c.push("value", format!("must be of type object, got {}", type_name(payload)));
        return Err(ValidationErrors(c.errors));
    };

    let name = match body.get("name") {
        None => {
            c.push("name", "is required");
            None
        }
        Some(Value::String(name)) if name.trim().is_empty() => {
            c.push("name", "is not allowed to be empty");
            None
        }
        Some(Value::String(name)) => Some(name.clone()),
        Some(_) => {
            c.push("name", "must be a string");
            None
        }
    };

    let files = check_files(&mut c, body);

    let priority = match body.get("priority") {
        None => None,
        Some(value) => {
            let priority = value.as_i64();
            if priority.is_none() {
                c.push("priority", "must be an integer");
            }
            priority
        }
    };

    let retries = match body.get("retries") {
        None => None,
        Some(value) => {
            let retries = value.as_u64().and_then(|r| u32::try_from(r).ok());
            if retries.is_none() {
                c.push("retries", "must be a non-negative integer");
            }
            retries
        }
    };

    for key in body.keys() {
        if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
            c.push(key.as_str(), "is not allowed");
        }
    }

    match name {
        Some(name) if c.errors.is_empty() => Ok(JoinRequest {
            name,
            files,
            priority,
            retries,
        }),
        _ => Err(ValidationErrors(c.errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FILE_ID: &str = "aaaaaaaaaaaaaaaaaaaaaaaa";

    #[test]
    fn accepts_minimal_submission() {
        let request = validate_join_request(&json!({
            "name": "episode-12",
            "files": [{"id": FILE_ID, "type": "podcast-part"}]
        }))
        .unwrap();

        assert_eq!(request.name, "episode-12");
        assert_eq!(request.files[0].file_type, FileType::PodcastPart);
        assert_eq!(request.files[0].seek, None);
        assert_eq!(request.priority, None);
    }

    #[test]
    fn accepts_seek_and_scheduling_options() {
        let request = validate_join_request(&json!({
            "name": "episode-12",
            "files": [
                {"id": FILE_ID, "type": "storage-file", "seek": {"start": 1.5}},
                {"id": "0123456789abcdefABCDEF01", "type": "podcast-part", "seek": {"start": 0, "end": 30}}
            ],
            "priority": 200,
            "retries": 2
        }))
        .unwrap();

        assert_eq!(request.files.len(), 2);
        assert_eq!(
            request.files[0].seek,
            Some(Seek {
                start: Some(1.5),
                end: None
            })
        );
        assert_eq!(request.priority, Some(200));
        assert_eq!(request.retries, Some(2));
    }

    #[test]
    fn null_files_names_files() {
        let errors = validate_join_request(&json!({"files": null})).unwrap_err();

        assert!(errors.paths().contains(&"files"));
        assert!(errors.to_string().contains("\"files\" must be an array"));
    }

    #[test]
    fn collects_every_problem() {
        let errors = validate_join_request(&json!({
            "name": "",
            "files": [
                {"id": "short", "type": "video"},
                {"id": FILE_ID, "type": "podcast-part", "seek": {"start": -1}}
            ],
            "retries": -1,
            "extra": true
        }))
        .unwrap_err();

        assert_eq!(
            errors.paths(),
            vec![
                "name",
                "files[0].id",
                "files[0].type",
                "files[1].seek.start",
                "retries",
                "extra"
            ]
        );
    }

    #[test]
    fn rejects_non_object_payload() {
        let errors = validate_join_request(&Value::Null).unwrap_err();
        assert_eq!(errors.paths(), vec!["value"]);
    }

    #[test]
    fn empty_file_list_is_rejected() {
        let errors = validate_join_request(&json!({"name": "x", "files": []})).unwrap_err();
        assert_eq!(
            errors.to_string(),
            "\"files\" must contain at least 1 items"
        );
    }

    #[test]
    fn file_refs_serialize_with_wire_names() {
        let file = FileRef {
            id: FILE_ID.to_string(),
            file_type: FileType::StorageFile,
            seek: None,
        };
        assert_eq!(
            serde_json::to_value(&file).unwrap(),
            json!({"id": FILE_ID, "type": "storage-file"})
        );
    }
}
