//! Simulation inputs read from JSON
//!
//! A stimulus file is an array of calls, each an array of arguments:
//! ```json
//! [[0.5], [{"sfix": [1.5, 2, -10], "overflow": "saturate"}], [[1, 2, 3]]]
//! ```
//!
//! Complex arguments give both parts before the bounds:
//! `{"complex": [0.5, -0.25, 1, -12]}`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::complex::ComplexSfix;
use crate::error::{CompileError, CompileResult};
use crate::fixed::{Overflow, Round, Sfix};
use crate::value::Value;

/// One argument as written in JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Fixed {
        sfix: (f64, i32, i32),
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overflow: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<String>,
    },
    Complex {
        complex: (f64, f64, i32, i32),
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overflow: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        round: Option<String>,
    },
    List(Vec<InputValue>),
}

impl InputValue {
    pub fn to_value(&self) -> CompileResult<Value> {
        Ok(match self {
            InputValue::Bool(b) => Value::Bool(*b),
            InputValue::Int(n) => Value::Int(*n),
            InputValue::Float(v) => Value::Float(*v),
            InputValue::Fixed {
                sfix: (value, left, right),
                overflow,
                round,
            } => {
                let (overflow, round) = policies(overflow, round)?;
                let fix = Sfix::checked(*value, *left, *right, overflow, round)
                    .map_err(|e| CompileError::config(format!("invalid fixed-point input: {}", e)))?;
                Value::Fixed(fix)
            }
            InputValue::Complex {
                complex: (re, im, left, right),
                overflow,
                round,
            } => {
                let (overflow, round) = policies(overflow, round)?;
                let c = ComplexSfix::checked(*re, *im, *left, *right, overflow, round)
                    .map_err(|e| CompileError::config(format!("invalid complex input: {}", e)))?;
                Value::Complex(c)
            }
            InputValue::List(items) => {
                Value::List(items.iter().map(InputValue::to_value).collect::<CompileResult<_>>()?)
            }
        })
    }
}

/// Wrap and Truncate unless named
fn policies(overflow: &Option<String>, round: &Option<String>) -> CompileResult<(Overflow, Round)> {
    let overflow = match overflow.as_deref() {
        None => Overflow::Wrap,
        Some(word) => Overflow::from_keyword(word)
            .ok_or_else(|| CompileError::config(format!("unknown overflow policy '{}'", word)))?,
    };
    let round = match round.as_deref() {
        None => Round::Truncate,
        Some(word) => Round::from_keyword(word)
            .ok_or_else(|| CompileError::config(format!("unknown rounding policy '{}'", word)))?,
    };
    Ok((overflow, round))
}

/// Arguments of one call, e.g. constructor arguments
pub fn parse_arguments(text: &str) -> CompileResult<Vec<Value>> {
    let args: Vec<InputValue> = serde_json::from_str(text)
        .map_err(|e| CompileError::config(format!("invalid arguments: {}", e)))?;
    args.iter().map(InputValue::to_value).collect()
}

pub fn parse_stimulus(text: &str) -> CompileResult<Vec<Vec<Value>>> {
    let calls: Vec<Vec<InputValue>> = serde_json::from_str(text)
        .map_err(|e| CompileError::config(format!("invalid stimulus: {}", e)))?;
    calls
        .iter()
        .map(|call| call.iter().map(InputValue::to_value).collect())
        .collect()
}

pub fn load_stimulus(path: &Path) -> CompileResult<Vec<Vec<Value>>> {
    let text = fs::read_to_string(path)?;
    parse_stimulus(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_stimulus() {
        let calls = parse_stimulus(
            r#"[[1, true, 0.5], [{"sfix": [1.5, 2, -10], "overflow": "saturate", "round": "round"}], [[1, 2]]]"#,
        )
        .unwrap();

        assert_eq!(calls[0], vec![Value::Int(1), Value::Bool(true), Value::Float(0.5)]);
        assert_eq!(
            calls[1],
            vec![Value::Fixed(Sfix::with_policy(1.5, 2, -10, Overflow::Saturate, Round::Round))]
        );
        assert_eq!(calls[2], vec![Value::List(vec![Value::Int(1), Value::Int(2)])]);
    }

    #[test]
    fn test_fixed_defaults_to_wrap_truncate() {
        let args = parse_arguments(r#"[{"sfix": [0.25, 0, -8]}]"#).unwrap();
        assert_eq!(args, vec![Value::Fixed(Sfix::new(0.25, 0, -8))]);
    }

    #[test]
    fn test_bad_input() {
        assert!(matches!(
            parse_arguments(r#"[{"sfix": [0.25, 0, -8], "overflow": "clip"}]"#),
            Err(CompileError::ConfigError { .. })
        ));
        assert!(matches!(parse_stimulus("[1, 2]"), Err(CompileError::ConfigError { .. })));
        assert!(parse_stimulus(r#"[["text"]]"#).is_err());
    }

    #[test]
    fn test_complex_input() {
        let args = parse_arguments(r#"[{"complex": [0.5, -0.25, 1, -12], "overflow": "saturate"}]"#).unwrap();
        assert_eq!(
            args,
            vec![Value::Complex(ComplexSfix::with_policy(0.5, -0.25, 1, -12, Overflow::Saturate, Round::Truncate))]
        );
        assert!(matches!(
            parse_arguments(r#"[{"complex": [0.5, 0.5, -12, 1]}]"#),
            Err(CompileError::ConfigError { ref message }) if message.contains("invalid complex input")
        ));
    }

    #[test]
    fn test_inverted_fixed_bounds() {
        let err = parse_stimulus(r#"[[{"sfix": [0.5, -5, 0]}]]"#).unwrap_err();
        assert!(matches!(
            err,
            CompileError::ConfigError { ref message } if message.contains("left bound -5 is below right bound 0")
        ));
    }
}
