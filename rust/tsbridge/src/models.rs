use crate::value::Value;
use chrono::{DateTime, Utc};

/// Column-addressed rows as returned by a backing engine session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

/// One observation produced by a time-series query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub id: Value,
    pub time: DateTime<Utc>,
    pub value: Value,
    pub label: Value,
}

impl ResultRow {
    pub fn new(time: DateTime<Utc>, value: impl Into<Value>, label: Option<&str>) -> Self {
        Self {
            id: Value::Null,
            time,
            value: value.into(),
            label: label.map(Value::from).unwrap_or(Value::Null),
        }
    }
}

/// Maps a row set onto [`ResultRow`]s by column name.
///
/// `time` and `value` are required; `id` and `label` may be missing, in which
/// case every row carries a null for them.
pub fn decode_rows(set: RowSet) -> Result<Vec<ResultRow>, String> {
    let time_idx = set
        .column_index("time")
        .ok_or_else(|| "query result has no 'time' column".to_string())?;
    let value_idx = set
        .column_index("value")
        .ok_or_else(|| "query result has no 'value' column".to_string())?;
    let id_idx = set.column_index("id");
    let label_idx = set.column_index("label");

    set.rows
        .into_iter()
        .enumerate()
        .map(|(n, mut cells)| {
            if cells.len() != set.columns.len() {
                return Err(format!(
                    "row {n} has {} cells but the result declares {} columns",
                    cells.len(),
                    set.columns.len()
                ));
            }

            let time = cells[time_idx]
                .as_timestamp()
                .ok_or_else(|| format!("row {n}: 'time' is not a timestamp ({})", cells[time_idx]))?;

            let mut take = |idx: Option<usize>| {
                idx.map(|i| std::mem::replace(&mut cells[i], Value::Null))
                    .unwrap_or(Value::Null)
            };

            Ok(ResultRow {
                time,
                id: take(id_idx),
                label: take(label_idx),
                value: take(Some(value_idx)),
            })
        })
        .collect()
}
