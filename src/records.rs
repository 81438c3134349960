//! Tabular source rows and the loader that reads them from disk.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RecordsError;

/// One source row: column name to scalar value, in column order.
pub type Record = Map<String, Value>;

/// Which input a chunk originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Curated DFMEA knowledge bank rows.
    KnowledgeBank,
    /// Field-reported failure issues.
    FieldIssues,
}

impl Source {
    /// Wire/payload spelling of the tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KnowledgeBank => "knowledge_bank",
            Self::FieldIssues => "field_issues",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated pair of input paths for the two sources.
#[derive(Debug, Clone)]
pub struct SourceFiles {
    knowledge_bank: PathBuf,
    field_issues: PathBuf,
}

impl SourceFiles {
    /// Fails with [`RecordsError::NotFound`] unless both paths are files.
    pub fn new<K, F>(knowledge_bank: K, field_issues: F) -> Result<Self, RecordsError>
    where
        K: Into<PathBuf>,
        F: Into<PathBuf>,
    {
        let knowledge_bank = knowledge_bank.into();
        let field_issues = field_issues.into();
        for path in [&knowledge_bank, &field_issues] {
            if !path.is_file() {
                return Err(RecordsError::NotFound(path.clone()));
            }
        }
        Ok(Self {
            knowledge_bank,
            field_issues,
        })
    }

    /// Knowledge bank path.
    pub fn knowledge_bank(&self) -> &Path {
        &self.knowledge_bank
    }

    /// Field issues path.
    pub fn field_issues(&self) -> &Path {
        &self.field_issues
    }

    /// Loads both files, knowledge bank first.
    pub fn load(&self) -> Result<(Vec<Record>, Vec<Record>), RecordsError> {
        tracing::info!(path = %self.knowledge_bank.display(), "loading knowledge bank");
        let kb = load_records(&self.knowledge_bank)?;
        tracing::info!(path = %self.field_issues.display(), "loading field issues");
        let fi = load_records(&self.field_issues)?;
        Ok((kb, fi))
    }
}

/// Reads rows from a `.json` array file or a JSONL file (any other extension).
pub fn load_records(path: &Path) -> Result<Vec<Record>, RecordsError> {
    if !path.is_file() {
        return Err(RecordsError::NotFound(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|source| RecordsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let is_array = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_array {
        read_array(path, reader)
    } else {
        read_lines(path, reader)
    }
}

fn read_array<R: BufRead>(path: &Path, reader: R) -> Result<Vec<Record>, RecordsError> {
    let rows: Vec<Value> = serde_json::from_reader(reader).map_err(|err| RecordsError::Parse {
        path: path.to_path_buf(),
        line: err.line(),
        reason: err.to_string(),
    })?;
    rows.into_iter()
        .enumerate()
        .map(|(idx, row)| into_record(path, 1, row).map_err(|err| with_row(err, idx)))
        .collect()
}

fn read_lines<R: BufRead>(path: &Path, reader: R) -> Result<Vec<Record>, RecordsError> {
    let mut records = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| RecordsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(&line).map_err(|err| RecordsError::Parse {
            path: path.to_path_buf(),
            line: line_no + 1,
            reason: err.to_string(),
        })?;
        records.push(into_record(path, line_no + 1, value)?);
    }
    Ok(records)
}

fn into_record(path: &Path, line: usize, value: Value) -> Result<Record, RecordsError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(RecordsError::Parse {
            path: path.to_path_buf(),
            line,
            reason: format!("expected an object row, found {}", kind_of(&other)),
        }),
    }
}

fn with_row(err: RecordsError, idx: usize) -> RecordsError {
    match err {
        RecordsError::Parse { path, line, reason } => RecordsError::Parse {
            path,
            line,
            reason: format!("row {idx}: {reason}"),
        },
        other => other,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
