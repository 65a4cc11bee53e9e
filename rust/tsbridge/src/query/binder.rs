use super::{QueryModel, TimeRange};
use crate::value::Value;
use std::collections::{btree_map, BTreeMap};
use tracing::debug;

pub const ARG_FROM: &str = "from";
pub const ARG_TO: &str = "to";
pub const ARG_INTERVAL_MS: &str = "interval_ms";
pub const ARG_MAX_DATA_POINTS: &str = "max_data_points";

/// Named parameters handed to the backing engine with a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArguments(BTreeMap<String, Value>);

impl BoundArguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(name.into(), value)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }
}

/// Builds the parameter set for one query.
///
/// Caller nulls become absent markers. The four injected parameters are
/// written last and replace caller arguments of the same name.
pub fn bind_arguments(model: &QueryModel, range: &TimeRange) -> BoundArguments {
    let mut bound = BoundArguments::new();

    for (name, value) in &model.args {
        let value = if value.is_null() {
            Value::absent()
        } else {
            value.clone()
        };
        bound.insert(name.clone(), value);
    }

    let injected = [
        (ARG_FROM, Value::Timestamp(range.from)),
        (ARG_TO, Value::Timestamp(range.to)),
        (ARG_INTERVAL_MS, Value::Int(model.interval_ms)),
        (ARG_MAX_DATA_POINTS, Value::Int(model.max_data_points)),
    ];

    for (name, value) in injected {
        if bound.insert(name, value).is_some() {
            debug!(argument = name, "caller argument replaced by injected parameter");
        }
    }

    bound
}
