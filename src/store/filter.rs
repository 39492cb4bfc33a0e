use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Neq,
    Lt,
    In,
}

impl Op {
    const fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "_eq",
            Op::Neq => "_neq",
            Op::Lt => "_lt",
            Op::In => "_in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

/// Конъюнкция условий на поля записи, сериализуется в JSON-фильтр хранилища:
/// `{"_and":[{"status":{"_eq":"pending"}}, ...]}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(self, field: &str, value: impl Serialize) -> Self {
        self.push(field, Op::Eq, value)
    }

    pub fn neq(self, field: &str, value: impl Serialize) -> Self {
        self.push(field, Op::Neq, value)
    }

    pub fn lt(self, field: &str, value: impl Serialize) -> Self {
        self.push(field, Op::Lt, value)
    }

    pub fn is_in<T: Serialize>(self, field: &str, values: &[T]) -> Self {
        self.push(field, Op::In, values)
    }

    fn push(mut self, field: &str, op: Op, value: impl Serialize) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn to_json(&self) -> Value {
        let clauses: Vec<Value> = self
            .conditions
            .iter()
            .map(|c| {
                let mut inner = Map::new();
                inner.insert(c.op.as_str().to_string(), c.value.clone());
                let mut outer = Map::new();
                outer.insert(c.field.clone(), Value::Object(inner));
                Value::Object(outer)
            })
            .collect();
        json!({ "_and": clauses })
    }

    /// Локальная проверка записи. Та же семантика, что у фильтра на стороне хранилища.
    pub fn matches(&self, record: &Value) -> bool {
        self.conditions.iter().all(|c| {
            let actual = record.get(&c.field).unwrap_or(&Value::Null);
            match c.op {
                Op::Eq => actual == &c.value,
                Op::Neq => actual != &c.value,
                Op::Lt => compare_values(actual, &c.value) == Some(Ordering::Less),
                Op::In => c
                    .value
                    .as_array()
                    .is_some_and(|options| options.contains(actual)),
            }
        })
    }
}

/// Сравнение скаляров: даты как даты, числа как числа, строки лексикографически.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (x.parse::<DateTime<Utc>>(), y.parse::<DateTime<Utc>>()) {
                (Ok(x), Ok(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        _ => None,
    }
}
