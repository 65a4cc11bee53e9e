//! Long and wide table shapes for time-series results.

use crate::{
    error::QueryError,
    models::ResultRow,
    value::{Value, ValueKind},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

pub const FRAME_NAME: &str = "response";
pub const TIME_FIELD: &str = "time";
pub const VALUE_FIELD: &str = "value";
pub const LABEL_FIELD: &str = "label";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Frame {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn row_count(&self) -> usize {
        self.fields.first().map(|field| field.values.len()).unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Time,
    Number,
    Boolean,
    String,
}

impl From<ValueKind> for FieldType {
    fn from(kind: ValueKind) -> Self {
        match kind {
            ValueKind::Int | ValueKind::Float => FieldType::Number,
            ValueKind::Bool => FieldType::Boolean,
            ValueKind::Text => FieldType::String,
            ValueKind::Timestamp => FieldType::Time,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LongEntry {
    pub time: DateTime<Utc>,
    pub value: Value,
    pub label: Value,
}

/// One entry per result row, in arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LongTable {
    pub entries: Vec<LongEntry>,
}

impl LongTable {
    pub fn from_rows(rows: Vec<ResultRow>) -> Self {
        Self {
            entries: rows
                .into_iter()
                .map(|row| LongEntry {
                    time: row.time,
                    value: row.value,
                    label: row.label,
                })
                .collect(),
        }
    }

    /// Renders the table as-is. Column types come from the first non-null
    /// cell, so a column that failed to pivot still serializes.
    pub fn to_frame(&self) -> Frame {
        let times = self
            .entries
            .iter()
            .map(|entry| Value::Timestamp(entry.time))
            .collect();
        let values: Vec<Value> = self.entries.iter().map(|e| e.value.clone()).collect();
        let labels: Vec<Value> = self.entries.iter().map(|e| e.label.clone()).collect();

        Frame {
            name: FRAME_NAME.to_string(),
            fields: vec![
                Field {
                    name: TIME_FIELD.to_string(),
                    field_type: FieldType::Time,
                    labels: None,
                    values: times,
                },
                Field {
                    name: VALUE_FIELD.to_string(),
                    field_type: first_kind(&values).map_or(FieldType::Number, FieldType::from),
                    labels: None,
                    values,
                },
                Field {
                    name: LABEL_FIELD.to_string(),
                    field_type: first_kind(&labels).map_or(FieldType::String, FieldType::from),
                    labels: None,
                    values: labels,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShapeOptions {
    /// Reject duplicate (timestamp, label) pairs instead of keeping the last.
    pub strict_duplicates: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SeriesKey {
    Default,
    Named(String),
}

impl SeriesKey {
    fn describe(&self) -> String {
        match self {
            SeriesKey::Default => "default series".to_string(),
            SeriesKey::Named(name) => format!("label '{name}'"),
        }
    }
}

/// Pivots a long table into one row per timestamp and one column per label.
///
/// Rows are ascending by timestamp, columns follow first-seen label order,
/// and combinations missing from the input are null.
pub fn long_to_wide(long: &LongTable, options: ShapeOptions) -> Result<Frame, QueryError> {
    let mut series: Vec<SeriesKey> = Vec::new();
    let mut series_index: HashMap<SeriesKey, usize> = HashMap::new();
    let mut label_kind: Option<ValueKind> = None;
    let mut times: BTreeMap<DateTime<Utc>, usize> = BTreeMap::new();
    let mut cells: HashMap<(DateTime<Utc>, usize), Value> = HashMap::new();

    for entry in &long.entries {
        let key = match entry.label.resolved() {
            None => SeriesKey::Default,
            Some(label) => {
                let kind = label.kind();
                match (label_kind, kind) {
                    (Some(expected), Some(actual)) if expected != actual => {
                        return Err(QueryError::Shaping(format!(
                            "label column mixes {expected} and {actual} values"
                        )));
                    }
                    (None, kind) => label_kind = kind,
                    _ => {}
                }
                SeriesKey::Named(label.to_string())
            }
        };

        let next = series.len();
        let column = *series_index.entry(key.clone()).or_insert_with(|| {
            series.push(key.clone());
            next
        });

        let next_row = times.len();
        times.entry(entry.time).or_insert(next_row);

        let previous = cells.insert((entry.time, column), entry.value.clone());
        if previous.is_some() && options.strict_duplicates {
            return Err(QueryError::Shaping(format!(
                "duplicate observation for {} at {}",
                key.describe(),
                entry.time.to_rfc3339()
            )));
        }
    }

    let mut fields = Vec::with_capacity(series.len() + 1);
    fields.push(Field {
        name: TIME_FIELD.to_string(),
        field_type: FieldType::Time,
        labels: None,
        values: times.keys().map(|ts| Value::Timestamp(*ts)).collect(),
    });

    if series.is_empty() {
        fields.push(Field {
            name: VALUE_FIELD.to_string(),
            field_type: FieldType::Number,
            labels: None,
            values: Vec::new(),
        });
    }

    let names = field_names(&series);
    for (column, (key, name)) in series.iter().zip(names).enumerate() {
        let values: Vec<Value> = times
            .keys()
            .map(|ts| cells.remove(&(*ts, column)).unwrap_or(Value::Null))
            .collect();
        let (field_type, values) = settle_column(key, values)?;

        fields.push(Field {
            name,
            field_type,
            labels: match key {
                SeriesKey::Default => None,
                SeriesKey::Named(label) => {
                    Some(BTreeMap::from([(LABEL_FIELD.to_string(), label.clone())]))
                }
            },
            values,
        });
    }

    Ok(Frame {
        name: FRAME_NAME.to_string(),
        fields,
    })
}

// `time` and the default series' `value` are reserved; a label that collides
// with a reserved or earlier name gets a numeric suffix. The raw label text is
// always kept in the field's `labels`.
fn field_names(series: &[SeriesKey]) -> Vec<String> {
    let mut used = HashSet::from([TIME_FIELD.to_string()]);
    if series.contains(&SeriesKey::Default) {
        used.insert(VALUE_FIELD.to_string());
    }

    series
        .iter()
        .map(|key| match key {
            SeriesKey::Default => VALUE_FIELD.to_string(),
            SeriesKey::Named(label) => {
                let mut name = label.clone();
                let mut suffix = 1;
                while !used.insert(name.clone()) {
                    name = format!("{label} ({suffix})");
                    suffix += 1;
                }
                name
            }
        })
        .collect()
}

fn first_kind(values: &[Value]) -> Option<ValueKind> {
    values.iter().find_map(Value::kind)
}

// Int cells in a column that also holds floats are widened; any other mix of
// kinds cannot be represented as one typed column.
fn settle_column(key: &SeriesKey, values: Vec<Value>) -> Result<(FieldType, Vec<Value>), QueryError> {
    let mut kind: Option<ValueKind> = None;
    for value in &values {
        let Some(actual) = value.kind() else { continue };
        kind = match (kind, actual) {
            (None, actual) => Some(actual),
            (Some(expected), actual) if expected == actual => Some(expected),
            (Some(ValueKind::Int), ValueKind::Float) | (Some(ValueKind::Float), ValueKind::Int) => {
                Some(ValueKind::Float)
            }
            (Some(expected), actual) => {
                return Err(QueryError::Shaping(format!(
                    "{} mixes {expected} and {actual} values",
                    key.describe()
                )));
            }
        };
    }

    let values = if kind == Some(ValueKind::Float) {
        values
            .into_iter()
            .map(|value| match value.as_f64() {
                Some(v) => Value::Float(v),
                None => Value::Null,
            })
            .collect()
    } else {
        values
            .into_iter()
            .map(|value| value.resolved().cloned().unwrap_or(Value::Null))
            .collect()
    };

    Ok((kind.map_or(FieldType::Number, FieldType::from), values))
}
