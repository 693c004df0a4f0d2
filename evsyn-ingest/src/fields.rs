//! Canonical study fields
//!
//! Column headers are normalized (lowercase, runs of non-alphanumerics → `_`)
//! and looked up in an alias table. Values of numeric fields are stored as
//! JSON numbers when the cell parses, otherwise as the original text so that
//! validation can report it.

use serde_json::Value;

pub const STUDY_ID: &str = "study_id";
pub const TITLE: &str = "title";
pub const AUTHORS: &str = "authors";
pub const YEAR: &str = "year";
pub const EFFECT_SIZE: &str = "effect_size";
pub const STANDARD_ERROR: &str = "standard_error";
pub const CI_LOWER: &str = "ci_lower";
pub const CI_UPPER: &str = "ci_upper";
pub const SAMPLE_SIZE: &str = "sample_size";
pub const TREATMENT_N: &str = "treatment_n";
pub const CONTROL_N: &str = "control_n";
pub const OUTCOME: &str = "outcome";
pub const REFERENCE: &str = "reference";
pub const DOI: &str = "doi";

/// Fields holding real numbers
pub const DECIMAL_FIELDS: [&str; 4] = [EFFECT_SIZE, STANDARD_ERROR, CI_LOWER, CI_UPPER];

/// Fields holding counts or years
pub const INTEGER_FIELDS: [&str; 4] = [YEAR, SAMPLE_SIZE, TREATMENT_N, CONTROL_N];

/// Fields whose text is kept verbatim (whitespace included)
const VERBATIM_FIELDS: [&str; 1] = [REFERENCE];

const ALIASES: &[(&str, &[&str])] = &[
    (STUDY_ID, &["id", "study_id", "studyid", "study"]),
    (TITLE, &["title", "study_title", "article_title"]),
    (AUTHORS, &["author", "authors", "first_author"]),
    (YEAR, &["year", "publication_year", "pub_year"]),
    (
        EFFECT_SIZE,
        &[
            "effect_size",
            "effect",
            "es",
            "smd",
            "md",
            "log_or",
            "logor",
            "log_rr",
            "estimate",
        ],
    ),
    (STANDARD_ERROR, &["se", "standard_error", "std_err", "stderr"]),
    (CI_LOWER, &["ci_lower", "lower_ci", "ci_low", "lower", "lcl"]),
    (CI_UPPER, &["ci_upper", "upper_ci", "ci_high", "upper", "ucl"]),
    (SAMPLE_SIZE, &["n", "sample_size", "total_n", "n_total"]),
    (
        TREATMENT_N,
        &["treatment_n", "n_treatment", "n_exp", "experimental_n", "n1"],
    ),
    (CONTROL_N, &["control_n", "n_control", "n_ctrl", "n2"]),
    (OUTCOME, &["outcome", "outcome_name", "endpoint"]),
    (REFERENCE, &["reference", "citation", "ref"]),
    (DOI, &["doi"]),
];

/// Lowercase and collapse separators: "Effect Size (SMD)" → "effect_size_smd"
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut pending_sep = false;
    for ch in header.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Canonical field for a column header, if known
pub fn canonical_field(header: &str) -> Option<&'static str> {
    let normalized = normalize_header(header);
    ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&normalized.as_str()))
        .map(|(canonical, _)| *canonical)
}

pub fn is_numeric_field(field: &str) -> bool {
    DECIMAL_FIELDS.contains(&field) || INTEGER_FIELDS.contains(&field)
}

/// Convert cell text to the stored value for a canonical field
///
/// Returns None for blank cells.
pub fn coerce(field: &str, text: &str) -> Option<Value> {
    if VERBATIM_FIELDS.contains(&field) {
        return (!text.trim().is_empty()).then(|| Value::String(text.to_string()));
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if INTEGER_FIELDS.contains(&field) {
        if let Ok(n) = trimmed.parse::<i64>() {
            return Some(Value::from(n));
        }
    }
    if is_numeric_field(field) {
        if let Some(n) = trimmed
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .and_then(serde_json::Number::from_f64)
        {
            return Some(Value::Number(n));
        }
    }
    Some(Value::String(trimmed.to_string()))
}

/// Numeric reading of a stored value
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
