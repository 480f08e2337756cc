//! Runtime values of the simulator

use std::fmt;

use crate::complex::ComplexSfix;
use crate::fixed::Sfix;
use crate::sim::Instance;

/// A value produced by evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    /// Simulation-only bookkeeping; has no hardware type
    Float(f64),
    Fixed(Sfix),
    Complex(ComplexSfix),
    List(Vec<Value>),
    Enum {
        name: String,
        variant: String,
        ordinal: i64,
    },
    /// A sub-module, by value (a detached copy of the instance)
    Module(Box<Instance>),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
            Value::Float(_) => "float",
            Value::Fixed(_) => "fixed-point",
            Value::Complex(_) => "complex",
            Value::List(_) => "list",
            Value::Enum { .. } => "enum",
            Value::Module(_) => "module",
            Value::Tuple(_) => "tuple",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Enum { ordinal, .. } => Some(*ordinal),
            _ => None,
        }
    }

    /// Numeric value as a float, for mixed arithmetic and comparisons
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Fixed(fix) => Some(fix.value()),
            _ => None,
        }
    }

    pub fn truthy(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Same kind, fixed-point bounds, list length and enum type. Values
    /// and policies may differ.
    pub fn same_shape(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(_), Value::Int(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Float(_), Value::Float(_)) => true,
            (Value::Fixed(a), Value::Fixed(b)) => a.same_format(b),
            (Value::Complex(a), Value::Complex(b)) => a.same_format(b),
            (Value::List(a), Value::List(b)) | (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_shape(y))
            }
            (Value::Enum { name: a, .. }, Value::Enum { name: b, .. }) => a == b,
            (Value::Module(a), Value::Module(b)) => a.class_name() == b.class_name(),
            _ => false,
        }
    }

    /// Convert `self` to the shape of `template` the way a register write
    /// would: fixed-point values are resized to the register's format.
    pub fn coerce_like(self, template: &Value) -> Value {
        match (template, self) {
            (Value::Fixed(reg), Value::Fixed(new)) => match reg.format() {
                Some(format) => Value::Fixed(new.resize_to(&format)),
                None => Value::Fixed(new),
            },
            (Value::Fixed(reg), Value::Int(n)) => coerce_number(reg, n as f64),
            (Value::Fixed(reg), Value::Float(n)) => coerce_number(reg, n),
            (Value::Complex(reg), Value::Complex(new)) => match reg.format() {
                Some(format) => Value::Complex(new.resize_to(&format)),
                None => Value::Complex(new),
            },
            (Value::List(regs), Value::List(items)) if regs.len() == items.len() => Value::List(
                items
                    .into_iter()
                    .zip(regs)
                    .map(|(item, reg)| item.coerce_like(reg))
                    .collect(),
            ),
            (_, other) => other,
        }
    }
}

fn coerce_number(reg: &Sfix, n: f64) -> Value {
    match reg.format() {
        Some(format) => Value::Fixed(Sfix::lazy(n).resize_to(&format)),
        None => Value::Fixed(Sfix::lazy(n)),
    }
}

impl From<Sfix> for Value {
    fn from(fix: Sfix) -> Self {
        Value::Fixed(fix)
    }
}

impl From<ComplexSfix> for Value {
    fn from(c: ComplexSfix) -> Self {
        Value::Complex(c)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Float(n) => write!(f, "{:?}", n),
            Value::Fixed(fix) => write!(f, "{}", fix),
            Value::Complex(c) => write!(f, "{}", c),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Enum { name, variant, .. } => write!(f, "{}.{}", name, variant),
            Value::Module(instance) => write!(f, "<{}>", instance.class_name()),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}
