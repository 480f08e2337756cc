//! Per-call trace records
//!
//! The simulator pushes one record per function invocation: the ordered
//! arguments, the last value bound to every local and the returned values.
//! The extractor merges them into function signatures.

use indexmap::IndexMap;

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub function: String,
    pub args: Vec<(String, Value)>,
    /// Last observed value per local, in first-bound order
    pub locals: IndexMap<String, Value>,
    /// `None` when the call returned nothing
    pub returns: Option<Vec<Value>>,
}

impl TraceRecord {
    pub fn new(function: impl Into<String>, args: Vec<(String, Value)>) -> Self {
        Self {
            function: function.into(),
            args,
            locals: IndexMap::new(),
            returns: None,
        }
    }

    /// Record an assignment to a local; a later binding replaces the value
    /// but keeps the original position.
    pub fn bind(&mut self, name: &str, value: &Value) {
        if let Some(slot) = self.locals.get_mut(name) {
            *slot = value.clone();
        } else {
            self.locals.insert(name.to_string(), value.clone());
        }
    }

    pub fn set_returns(&mut self, values: Vec<Value>) {
        self.returns = Some(values);
    }

    pub fn is_arg(&self, name: &str) -> bool {
        self.args.iter().any(|(n, _)| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bind_keeps_last_value_and_first_position() {
        let mut record = TraceRecord::new("main", vec![("x".to_string(), Value::Int(1))]);
        record.bind("a", &Value::Int(1));
        record.bind("b", &Value::Bool(true));
        record.bind("a", &Value::Int(7));

        let names: Vec<&String> = record.locals.keys().collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(record.locals["a"], Value::Int(7));
        assert!(record.is_arg("x"));
        assert!(!record.is_arg("a"));
    }
}
