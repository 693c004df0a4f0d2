//! Raw batch decoding
//!
//! A batch arrives either as JSON records or as delimited text. Delimited text
//! uses the delimiter (comma, semicolon or tab) that occurs most often in the
//! header line, with RFC 4180 quoting (`""` escapes a quote; quoted cells may
//! span lines).

use serde_json::Value;
use std::collections::HashSet;

use crate::error::{PipelineError, PipelineResult};
use crate::fields;
use crate::models::{RawRecord, StudyState};

const DELIMITERS: [char; 3] = [',', ';', '\t'];

/// Submitted batch before decoding
#[derive(Debug, Clone, PartialEq)]
pub enum RawBatch {
    Records(Vec<Value>),
    Text(String),
}

fn invalid(message: String) -> PipelineError {
    PipelineError::InvalidConfiguration(message)
}

/// Decode a batch into ordered raw records; an empty batch is rejected
pub fn decode_batch(batch: RawBatch) -> PipelineResult<Vec<RawRecord>> {
    let records = match batch {
        RawBatch::Records(values) => decode_records(values)?,
        RawBatch::Text(text) => decode_delimited(&text)?,
    };
    if records.is_empty() {
        return Err(invalid("batch contains no records".to_string()));
    }
    Ok(records)
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn decode_records(values: Vec<Value>) -> PipelineResult<Vec<RawRecord>> {
    values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| match value {
            Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), cell_text(v))).collect()),
            other => Err(invalid(format!(
                "record {} is not an object (got {})",
                idx + 1,
                json_kind(&other)
            ))),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Delimiter with the most unquoted occurrences in the first line
pub fn detect_delimiter(text: &str) -> char {
    let header = text.lines().next().unwrap_or_default();
    let mut counts = [0usize; 3];
    let mut in_quotes = false;
    for ch in header.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if !in_quotes {
            if let Some(pos) = DELIMITERS.iter().position(|d| *d == ch) {
                counts[pos] += 1;
            }
        }
    }

    let mut best = 0;
    for idx in 1..DELIMITERS.len() {
        if counts[idx] > counts[best] {
            best = idx;
        }
    }
    DELIMITERS[best]
}

/// Split delimited text into rows of cells
pub fn split_rows(text: &str, delimiter: char) -> PipelineResult<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    cell.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                cell.push(ch);
            }
            continue;
        }

        match ch {
            '"' if cell.is_empty() => in_quotes = true,
            c if c == delimiter => row.push(std::mem::take(&mut cell)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                row.push(std::mem::take(&mut cell));
                rows.push(std::mem::take(&mut row));
            }
            c => cell.push(c),
        }
    }

    if in_quotes {
        return Err(invalid("unterminated quoted cell".to_string()));
    }
    if !cell.is_empty() || !row.is_empty() {
        row.push(cell);
        rows.push(row);
    }

    // Blank lines carry no record
    rows.retain(|r| !(r.len() == 1 && r[0].trim().is_empty()));
    Ok(rows)
}

fn decode_delimited(text: &str) -> PipelineResult<Vec<RawRecord>> {
    let delimiter = detect_delimiter(text);
    let mut rows = split_rows(text, delimiter)?.into_iter();

    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();
    if header.iter().any(|h| h.is_empty()) {
        return Err(invalid("header contains an empty column name".to_string()));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = header.iter().find(|h| !seen.insert(h.as_str())) {
        return Err(invalid(format!("duplicate column '{}'", dup)));
    }

    rows.enumerate()
        .map(|(idx, cells)| {
            if cells.len() > header.len() {
                return Err(invalid(format!(
                    "row {} has {} cells but the header has {}",
                    idx + 2,
                    cells.len(),
                    header.len()
                )));
            }
            let mut record = RawRecord::new();
            for (pos, name) in header.iter().enumerate() {
                record.insert(name.clone(), cells.get(pos).cloned().unwrap_or_default());
            }
            Ok(record)
        })
        .collect()
}

/// Column holding caller-assigned study ids, if any
fn id_column(records: &[RawRecord]) -> Option<String> {
    let first = records.first()?;
    let column = first
        .keys()
        .find(|k| fields::canonical_field(k) == Some(fields::STUDY_ID))?
        .clone();

    let mut seen = HashSet::new();
    let usable = records.iter().all(|r| {
        r.get(&column)
            .map(|v| v.trim())
            .is_some_and(|v| !v.is_empty() && seen.insert(v.to_string()))
    });
    usable.then_some(column)
}

/// One pending study per record
///
/// Ids come from an `id`/`study_id` column when every value is present and
/// unique, otherwise `study-<n>` by 1-based position.
pub fn build_studies(records: Vec<RawRecord>) -> Vec<StudyState> {
    let column = id_column(&records);
    records
        .into_iter()
        .enumerate()
        .map(|(position, raw)| {
            let study_id = column
                .as_ref()
                .and_then(|c| raw.get(c))
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| format!("study-{}", position + 1));
            StudyState::new(study_id, position, raw)
        })
        .collect()
}
