//! Deterministic offline inference
//!
//! Rule-based answers for every task, used when no inference endpoint is
//! configured (and as the fallback behind scripted test clients). Never fails
//! with `Unreachable`; a payload missing its expected keys is `Malformed`.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{InferenceClient, InferenceFailure, TaskType};
use crate::fields::{self, as_f64};

/// Minimum title similarity before two studies are reported as candidates
const TITLE_SIMILARITY_FLOOR: f64 = 0.85;

/// Unknown publication year lowers duplicate confidence by this factor
const MISSING_YEAR_PENALTY: f64 = 0.9;

/// Column names typical of RevMan exports
const REVMAN_MARKERS: [&str; 4] = ["comparison", "subgroup", "outcome_number", "study_data"];

#[derive(Debug, Default, Clone)]
pub struct HeuristicInferenceClient;

impl HeuristicInferenceClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InferenceClient for HeuristicInferenceClient {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn infer(
        &self,
        task: TaskType,
        payload: Value,
        _model_id: &str,
    ) -> Result<Value, InferenceFailure> {
        debug!(task = %task, study_id = ?payload.get("study_id"), "Heuristic inference");
        match task {
            TaskType::FormatDetect => detect_format(&payload),
            TaskType::FieldMap => map_fields(&payload),
            TaskType::AutoFix => propose_fixes(&payload),
            TaskType::Validate => validate_fields(&payload),
            TaskType::Dedup => find_duplicate(&payload),
            TaskType::QualityAssess => assess_quality(&payload),
        }
    }
}

fn object<'a>(payload: &'a Value, key: &str) -> Result<&'a Map<String, Value>, InferenceFailure> {
    payload
        .get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| InferenceFailure::malformed(format!("payload missing object '{}'", key)))
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn issue(severity: &str, message: String) -> Value {
    json!({ "severity": severity, "message": message })
}

fn issue_with_fix(severity: &str, message: String, field: &str, value: String) -> Value {
    json!({
        "severity": severity,
        "message": message,
        "suggestion": { "field": field, "value": value },
    })
}

// ---------------------------------------------------------------------------
// formatDetect
// ---------------------------------------------------------------------------

fn detect_format(payload: &Value) -> Result<Value, InferenceFailure> {
    let record = object(payload, "record")?;
    let declared = payload
        .get("declared_format")
        .and_then(Value::as_str)
        .unwrap_or("csv");

    let headers: Vec<String> = record.keys().map(|k| fields::normalize_header(k)).collect();
    let revman_hits = headers
        .iter()
        .filter(|h| REVMAN_MARKERS.contains(&h.as_str()))
        .count();

    let mut issues = Vec::new();
    if record.values().all(|v| text(v).trim().is_empty()) {
        issues.push(issue("warning", "record has no values".to_string()));
    }

    let (format, confidence) = if revman_hits >= 2 {
        ("revman", 0.95)
    } else if revman_hits == 1 && declared == "revman" {
        ("revman", 0.8)
    } else if declared == "revman" {
        // RevMan declared but nothing RevMan-shaped: treat as generic table
        ("csv", 0.6)
    } else {
        (declared, 0.9)
    };

    Ok(json!({ "format": format, "confidence": confidence, "issues": issues }))
}

// ---------------------------------------------------------------------------
// fieldMap
// ---------------------------------------------------------------------------

fn strip_doi_prefix(doi: &str) -> Option<String> {
    let trimmed = doi.trim();
    let lower = trimmed.to_ascii_lowercase();
    for prefix in ["https://doi.org/", "http://doi.org/", "https://dx.doi.org/", "http://dx.doi.org/", "doi:"] {
        if lower.starts_with(prefix) {
            return Some(trimmed[prefix.len()..].trim().to_string());
        }
    }
    None
}

/// "n=120", "N = 120" → "120"
fn strip_count_label(value: &str) -> Option<String> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let rest = compact
        .strip_prefix("n=")
        .or_else(|| compact.strip_prefix("N="))?;
    (!rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())).then(|| rest.to_string())
}

/// "2019a" → "2019"
fn strip_year_suffix(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.len() != 5 {
        return None;
    }
    let (digits, suffix) = trimmed.split_at(4);
    (digits.chars().all(|c| c.is_ascii_digit()) && suffix.chars().all(|c| c.is_ascii_lowercase()))
        .then(|| digits.to_string())
}

/// Collapse whitespace, doubled separators and trailing punctuation
pub(crate) fn tidy_reference(reference: &str) -> String {
    let collapsed = reference.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = String::with_capacity(collapsed.len());
    for ch in collapsed.chars() {
        if (ch == ',' || ch == '.' || ch == ';') && out.ends_with(ch) {
            continue;
        }
        if (ch == ',' || ch == '.' || ch == ';') && out.ends_with(' ') {
            out.pop();
        }
        out.push(ch);
    }
    out.trim_end_matches([',', ';', ' ']).to_string()
}

fn map_fields(payload: &Value) -> Result<Value, InferenceFailure> {
    let record = object(payload, "record")?;

    let mut mapped = Map::new();
    let mut unmapped = Vec::new();
    let mut issues = Vec::new();

    for (header, cell) in record {
        let cell = text(cell);
        let Some(field) = fields::canonical_field(header) else {
            unmapped.push(header.clone());
            continue;
        };
        if mapped.contains_key(field) {
            issues.push(issue(
                "warning",
                format!("column '{}' maps to '{}' which is already set", header, field),
            ));
            continue;
        }
        let Some(value) = fields::coerce(field, &cell) else {
            continue;
        };

        match field {
            fields::DOI => {
                if let Some(bare) = strip_doi_prefix(&cell) {
                    issues.push(issue_with_fix(
                        "warning",
                        format!("DOI '{}' carries a URL prefix", cell.trim()),
                        field,
                        bare,
                    ));
                }
            }
            fields::SAMPLE_SIZE | fields::TREATMENT_N | fields::CONTROL_N => {
                if let Some(count) = strip_count_label(&cell) {
                    issues.push(issue_with_fix(
                        "warning",
                        format!("{} '{}' has a label prefix", field, cell.trim()),
                        field,
                        count,
                    ));
                }
            }
            fields::YEAR => {
                if let Some(year) = strip_year_suffix(&cell) {
                    issues.push(issue_with_fix(
                        "warning",
                        format!("year '{}' has a disambiguation suffix", cell.trim()),
                        field,
                        year,
                    ));
                }
            }
            fields::REFERENCE => {
                let tidy = tidy_reference(&cell);
                if tidy != cell {
                    issues.push(issue_with_fix(
                        "warning",
                        "reference string is malformed".to_string(),
                        field,
                        tidy,
                    ));
                }
            }
            _ => {}
        }

        mapped.insert(field.to_string(), value);
    }

    Ok(json!({ "fields": mapped, "unmapped": unmapped, "issues": issues }))
}

// ---------------------------------------------------------------------------
// autoFix
// ---------------------------------------------------------------------------

fn propose_fixes(payload: &Value) -> Result<Value, InferenceFailure> {
    let current = object(payload, "fields")?;
    let suggestions = payload
        .get("suggestions")
        .and_then(Value::as_array)
        .ok_or_else(|| InferenceFailure::malformed("payload missing array 'suggestions'"))?;

    let fixes: Vec<Value> = suggestions
        .iter()
        .filter_map(|s| {
            let field = s.get("field")?.as_str()?;
            let corrected = s.get("value")?.as_str()?;
            let original = current.get(field).map(text).unwrap_or_default();
            Some(json!({ "field": field, "original": original, "corrected": corrected }))
        })
        .collect();

    Ok(json!({ "fixes": fixes }))
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate_fields(payload: &Value) -> Result<Value, InferenceFailure> {
    let record = object(payload, "fields")?;
    // Fields awaiting a suggested fix carry their finding already
    let pending: Vec<&str> = payload
        .get("pending_fixes")
        .and_then(Value::as_array)
        .map(|fields| fields.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let checked = |field: &str| record.get(field).filter(|_| !pending.contains(&field));
    let mut issues = Vec::new();

    match record.get(fields::EFFECT_SIZE) {
        None => issues.push(issue("error", "effect size is missing".to_string())),
        Some(v) if as_f64(v).is_none() && !pending.contains(&fields::EFFECT_SIZE) => issues.push(
            issue("error", format!("effect size '{}' is not numeric", text(v))),
        ),
        Some(_) => {}
    }

    if let Some(v) = checked(fields::STANDARD_ERROR) {
        match as_f64(v) {
            None => issues.push(issue(
                "error",
                format!("standard error '{}' is not numeric", text(v)),
            )),
            Some(se) if se <= 0.0 => issues.push(issue(
                "error",
                format!("standard error must be positive, got {}", se),
            )),
            Some(_) => {}
        }
    }

    for field in [fields::SAMPLE_SIZE, fields::TREATMENT_N, fields::CONTROL_N] {
        if let Some(v) = checked(field) {
            let valid = v.as_i64().is_some_and(|n| n > 0);
            if !valid {
                issues.push(issue(
                    "error",
                    format!("{} '{}' is not a positive whole number", field, text(v)),
                ));
            }
        }
    }

    if let Some(v) = checked(fields::YEAR) {
        if !v.as_i64().is_some_and(|y| (1900..=2100).contains(&y)) {
            issues.push(issue(
                "warning",
                format!("year '{}' is not a plausible publication year", text(v)),
            ));
        }
    }

    let lower = record.get(fields::CI_LOWER).and_then(as_f64);
    let upper = record.get(fields::CI_UPPER).and_then(as_f64);
    if let (Some(lo), Some(hi)) = (lower, upper) {
        if lo > hi {
            issues.push(issue(
                "error",
                format!("confidence interval is inverted ({} > {})", lo, hi),
            ));
        } else if let Some(es) = record.get(fields::EFFECT_SIZE).and_then(as_f64) {
            if es < lo || es > hi {
                issues.push(issue(
                    "warning",
                    format!("effect size {} lies outside its interval [{}, {}]", es, lo, hi),
                ));
            }
        }
    }

    if !record.contains_key(fields::TITLE) {
        issues.push(issue("warning", "title is missing".to_string()));
    }

    Ok(json!({ "issues": issues }))
}

// ---------------------------------------------------------------------------
// dedup
// ---------------------------------------------------------------------------

fn normalized_title(value: &Value) -> String {
    text(value)
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn match_confidence(study: &Map<String, Value>, other: &Map<String, Value>) -> f64 {
    let doi = |m: &Map<String, Value>| {
        m.get(fields::DOI)
            .map(|v| text(v).trim().to_ascii_lowercase())
            .filter(|d| !d.is_empty())
    };
    if let (Some(a), Some(b)) = (doi(study), doi(other)) {
        if a == b {
            return 1.0;
        }
    }

    let (Some(a), Some(b)) = (study.get(fields::TITLE), other.get(fields::TITLE)) else {
        return 0.0;
    };
    let (a, b) = (normalized_title(a), normalized_title(b));
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let similarity = strsim::normalized_levenshtein(&a, &b);
    if similarity < TITLE_SIMILARITY_FLOOR {
        return 0.0;
    }

    match (study.get(fields::YEAR), other.get(fields::YEAR)) {
        (Some(x), Some(y)) if text(x) != text(y) => 0.0,
        (Some(_), Some(_)) => similarity,
        _ => similarity * MISSING_YEAR_PENALTY,
    }
}

fn find_duplicate(payload: &Value) -> Result<Value, InferenceFailure> {
    let study = object(payload, "fields")?;
    let candidates = payload
        .get("candidates")
        .and_then(Value::as_array)
        .ok_or_else(|| InferenceFailure::malformed("payload missing array 'candidates'"))?;

    let mut best: Option<(&str, f64)> = None;
    for candidate in candidates {
        let (Some(id), Some(other)) = (
            candidate.get("study_id").and_then(Value::as_str),
            candidate.get("fields").and_then(Value::as_object),
        ) else {
            continue;
        };
        let confidence = match_confidence(study, other);
        if confidence > 0.0 && best.map_or(true, |(_, c)| confidence > c) {
            best = Some((id, confidence));
        }
    }

    Ok(match best {
        Some((id, confidence)) => json!({
            "duplicate_of": id,
            "confidence": (confidence * 1000.0).round() / 1000.0,
        }),
        None => json!({ "confidence": 0.0 }),
    })
}

// ---------------------------------------------------------------------------
// qualityAssess
// ---------------------------------------------------------------------------

fn assess_quality(payload: &Value) -> Result<Value, InferenceFailure> {
    let record = object(payload, "fields")?;
    let has = |field: &str| record.contains_key(field);
    let numeric = |field: &str| record.get(field).and_then(as_f64).is_some();

    let has_precision =
        numeric(fields::STANDARD_ERROR) || (numeric(fields::CI_LOWER) && numeric(fields::CI_UPPER));
    let has_size =
        numeric(fields::SAMPLE_SIZE) || (numeric(fields::TREATMENT_N) && numeric(fields::CONTROL_N));

    let criteria = [
        has(fields::TITLE),
        has(fields::AUTHORS),
        numeric(fields::YEAR),
        numeric(fields::EFFECT_SIZE),
        has_precision,
        has_size,
        has(fields::OUTCOME),
    ];
    let met = criteria.iter().filter(|c| **c).count();
    let score = ((met as f64 / criteria.len() as f64) * 100.0).round() / 100.0;

    let rating = if score >= 0.8 {
        "high"
    } else if score >= 0.5 {
        "moderate"
    } else {
        "low"
    };

    let mut issues = Vec::new();
    if !has_precision {
        issues.push(issue(
            "info",
            "no standard error or confidence interval; study cannot be weighted".to_string(),
        ));
    }

    Ok(json!({ "score": score, "rating": rating, "issues": issues }))
}
