// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lucene-style structured query builder.
//!
//! Encoded as a nested JSON object under the [`super::PARAM_LUCENE_SEARCH`]
//! key. The storage layer evaluates `must` clauses as a conjunction and
//! `should` clauses as a disjunction.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LuceneFilter {
    Wildcard { field: String, value: String },
    Regexp { field: String, value: String },
    Match { field: String, value: Value },
    Contains { field: String, values: Vec<Value> },
    Range {
        field: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        lower: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        upper: Option<Value>,
        include_lower: bool,
        include_upper: bool,
    },
}

impl LuceneFilter {
    pub fn wildcard(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Wildcard { field: field.into(), value: value.into() }
    }

    pub fn regexp(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Regexp { field: field.into(), value: value.into() }
    }

    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Match { field: field.into(), value: value.into() }
    }

    pub fn contains<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::Contains {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Inclusive range; either bound may be open.
    pub fn range(field: impl Into<String>, lower: Option<Value>, upper: Option<Value>) -> Self {
        Self::Range {
            field: field.into(),
            lower,
            upper,
            include_lower: true,
            include_upper: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LuceneSorter {
    pub field: String,
    pub reverse: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BooleanQuery {
    #[serde(rename = "type", default)]
    kind: BooleanKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must: Vec<LuceneFilter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub should: Vec<LuceneFilter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BooleanKind {
    #[default]
    Boolean,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LuceneSearch {
    #[serde(default)]
    pub query: BooleanQuery,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<LuceneSorter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_fields: Vec<String>,
}

impl LuceneSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn must(mut self, filter: LuceneFilter) -> Self {
        self.query.must.push(filter);
        self
    }

    pub fn should(mut self, filter: LuceneFilter) -> Self {
        self.query.should.push(filter);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, reverse: bool) -> Self {
        self.sort.push(LuceneSorter { field: field.into(), reverse });
        self
    }

    /// Free-text search: one `should` wildcard per field.
    pub fn search(mut self, text: &str, fields: &[&str]) -> Self {
        let pattern = format!("*{}*", text.trim_start_matches('~').to_lowercase());
        for field in fields {
            self.search_fields.push(field.to_string());
            self.query.should.push(LuceneFilter::wildcard(*field, pattern.clone()));
        }
        self
    }

    pub fn is_valid(&self) -> bool {
        !self.query.must.is_empty() || !self.query.should.is_empty() || !self.sort.is_empty()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Evaluate the query against a row. Used by in-memory stores.
    pub fn matches(&self, row: &serde_json::Map<String, Value>) -> bool {
        let must = self.query.must.iter().all(|f| filter_matches(f, row));
        let should = self.query.should.is_empty() || self.query.should.iter().any(|f| filter_matches(f, row));
        must && should
    }
}

fn field_text(row: &serde_json::Map<String, Value>, field: &str) -> Option<String> {
    row.get(field).map(|v| match v {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string(),
    })
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

fn regex_matches(pattern: &str, text: &str) -> bool {
    regex::Regex::new(pattern)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn filter_matches(filter: &LuceneFilter, row: &serde_json::Map<String, Value>) -> bool {
    match filter {
        LuceneFilter::Wildcard { field, value } => field_text(row, field)
            .map(|text| regex_matches(&wildcard_to_regex(&value.to_lowercase()), &text))
            .unwrap_or(false),
        LuceneFilter::Regexp { field, value } => field_text(row, field)
            .map(|text| regex_matches(&format!("^({})$", value), &text))
            .unwrap_or(false),
        LuceneFilter::Match { field, value } => row.get(field) == Some(value),
        LuceneFilter::Contains { field, values } => row.get(field).map(|v| values.contains(v)).unwrap_or(false),
        LuceneFilter::Range { field, lower, upper, include_lower, include_upper } => {
            let Some(actual) = row.get(field) else { return false };
            let lower_ok = match lower {
                None => true,
                Some(l) => match compare(actual, l) {
                    Some(std::cmp::Ordering::Greater) => true,
                    Some(std::cmp::Ordering::Equal) => *include_lower,
                    _ => false,
                },
            };
            let upper_ok = match upper {
                None => true,
                Some(u) => match compare(actual, u) {
                    Some(std::cmp::Ordering::Less) => true,
                    Some(std::cmp::Ordering::Equal) => *include_upper,
                    _ => false,
                },
            };
            lower_ok && upper_ok
        }
    }
}
