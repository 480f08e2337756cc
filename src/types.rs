//! Hardware types and inferred signatures
//!
//! A [`SignatureSet`] is the extractor's output: one
//! [`ModuleTypeSignature`] per distinct module shape reachable from the top
//! instance, keyed by package name.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Serialize, Serializer};

use crate::error::TypeInferenceError;
use crate::fixed::FixedFormat;
use crate::sim::Instance;
use crate::value::Value;

/// Type of a variable, argument, return value or attribute in hardware
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HwType {
    Integer,
    Boolean,
    Fixed(FixedFormat),
    /// Pair of fixed-point parts sharing one format
    Complex(FixedFormat),
    /// Element type and length
    List(Box<HwType>, usize),
    /// Package name of a sub-module signature
    Module(String),
    Enum(String),
}

impl HwType {
    /// Classify a simulated value. `package` resolves sub-module values to
    /// their signature's package.
    pub fn from_value(value: &Value, package: &dyn Fn(&Instance) -> Option<String>) -> Option<HwType> {
        match value {
            Value::Int(_) => Some(HwType::Integer),
            Value::Bool(_) => Some(HwType::Boolean),
            Value::Fixed(fix) => fix.format().map(HwType::Fixed),
            Value::Complex(c) => c.format().map(HwType::Complex),
            Value::Enum { name, .. } => Some(HwType::Enum(name.clone())),
            Value::Module(instance) => package(instance).map(HwType::Module),
            Value::List(items) => {
                let (first, rest) = items.split_first()?;
                if matches!(first, Value::List(_)) {
                    return None;
                }
                let element = HwType::from_value(first, package)?;
                for item in rest {
                    if !element.compatible(&HwType::from_value(item, package)?) {
                        return None;
                    }
                }
                Some(HwType::List(Box::new(element), items.len()))
            }
            Value::Float(_) | Value::Tuple(_) => None,
        }
    }

    /// Same kind; fixed-point also needs identical bounds, lists identical
    /// length. Policies are not compared.
    pub fn compatible(&self, other: &HwType) -> bool {
        match (self, other) {
            (HwType::Fixed(a), HwType::Fixed(b)) | (HwType::Complex(a), HwType::Complex(b)) => {
                a.left == b.left && a.right == b.right
            }
            (HwType::List(a, n), HwType::List(b, m)) => n == m && a.compatible(b),
            (a, b) => a == b,
        }
    }

    pub fn fixed_format(&self) -> Option<&FixedFormat> {
        match self {
            HwType::Fixed(format) => Some(format),
            _ => None,
        }
    }

    pub fn complex_format(&self) -> Option<&FixedFormat> {
        match self {
            HwType::Complex(format) => Some(format),
            _ => None,
        }
    }

    /// Package of a sub-module or list of sub-modules
    pub fn module_package(&self) -> Option<&str> {
        match self {
            HwType::Module(package) => Some(package),
            HwType::List(element, _) => element.module_package(),
            _ => None,
        }
    }

    pub fn is_module(&self) -> bool {
        self.module_package().is_some()
    }

    pub fn element(&self) -> Option<&HwType> {
        match self {
            HwType::List(element, _) => Some(element),
            _ => None,
        }
    }
}

impl fmt::Display for HwType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HwType::Integer => write!(f, "integer"),
            HwType::Boolean => write!(f, "boolean"),
            HwType::Fixed(format) => write!(
                f,
                "sfix{} {}/{}",
                format,
                format.overflow.keyword(),
                format.round.keyword()
            ),
            HwType::Complex(format) => write!(
                f,
                "complex{} {}/{}",
                format,
                format.overflow.keyword(),
                format.round.keyword()
            ),
            HwType::List(element, n) => write!(f, "[{}; {}]", element, n),
            HwType::Module(package) => write!(f, "{}", package),
            HwType::Enum(name) => write!(f, "enum {}", name),
        }
    }
}

impl Serialize for HwType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn serialize_initial<S: Serializer>(value: &Option<Value>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.collect_str(value),
        None => serializer.serialize_none(),
    }
}

fn serialize_failures<S: Serializer>(
    failures: &IndexMap<String, TypeInferenceError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_map(failures.iter().map(|(name, err)| (name, err.to_string())))
}

/// Inferred types of one function, merged over all observed calls
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSignature {
    pub name: String,
    pub args: Vec<(String, HwType)>,
    pub locals: IndexMap<String, HwType>,
    pub returns: Vec<HwType>,
    /// Number of merged trace records
    pub calls: usize,
}

impl FunctionSignature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            locals: IndexMap::new(),
            returns: Vec::new(),
            calls: 0,
        }
    }

    /// Type of an argument or local
    pub fn variable(&self, name: &str) -> Option<&HwType> {
        self.args
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| ty)
            .or_else(|| self.locals.get(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeSignature {
    pub ty: HwType,
    /// Construction-time value; `None` for sub-modules
    #[serde(serialize_with = "serialize_initial")]
    pub initial: Option<Value>,
    /// Never written after construction by any instance sharing the signature
    pub constant: bool,
}

/// Everything the lowering and the emitter need to know about one module shape
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleTypeSignature {
    pub class: String,
    pub package: String,
    pub attributes: IndexMap<String, AttributeSignature>,
    pub functions: IndexMap<String, FunctionSignature>,
    #[serde(serialize_with = "serialize_failures")]
    pub failures: IndexMap<String, TypeInferenceError>,
    /// Functions never called during simulation and not required
    pub unsimulated: Vec<String>,
}

impl ModuleTypeSignature {
    pub fn new(class: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            package: package.into(),
            attributes: IndexMap::new(),
            functions: IndexMap::new(),
            failures: IndexMap::new(),
            unsimulated: Vec::new(),
        }
    }

    pub fn function(&self, name: &str) -> Result<&FunctionSignature, TypeInferenceError> {
        if let Some(err) = self.failures.get(name) {
            return Err(err.clone());
        }
        self.functions
            .get(name)
            .ok_or_else(|| TypeInferenceError::FunctionNotSimulated {
                class: self.class.clone(),
                function: name.to_string(),
            })
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeSignature> {
        self.attributes.get(name)
    }

    pub fn constant_names(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|(_, a)| a.constant)
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Written state that lives in the pending record; sub-modules carry
    /// their own.
    pub fn registers(&self) -> impl Iterator<Item = (&String, &AttributeSignature)> {
        self.attributes
            .iter()
            .filter(|(_, a)| !a.constant && !a.ty.is_module())
    }

    pub fn submodules(&self) -> impl Iterator<Item = (&String, &AttributeSignature)> {
        self.attributes.iter().filter(|(_, a)| a.ty.is_module())
    }

    /// Packages of direct sub-modules, first-use order
    pub fn dependencies(&self) -> Vec<&str> {
        let mut packages: Vec<&str> = Vec::new();
        for (_, attr) in self.submodules() {
            if let Some(package) = attr.ty.module_package() {
                if !packages.contains(&package) {
                    packages.push(package);
                }
            }
        }
        packages
    }
}

/// All signatures of one conversion, children before parents
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureSet {
    pub top: String,
    pub modules: IndexMap<String, Arc<ModuleTypeSignature>>,
}

impl SignatureSet {
    pub fn get(&self, package: &str) -> Option<&Arc<ModuleTypeSignature>> {
        self.modules.get(package)
    }

    pub fn top(&self) -> Option<&Arc<ModuleTypeSignature>> {
        self.modules.get(&self.top)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for SignatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (package, sig) in &self.modules {
            let marker = if *package == self.top { " (top)" } else { "" };
            writeln!(f, "{} [{}]{}", package, sig.class, marker)?;
            for (name, attr) in &sig.attributes {
                let constant = if attr.constant { " const" } else { "" };
                writeln!(f, "  {}: {}{}", name, attr.ty, constant)?;
            }
            for func in sig.functions.values() {
                let args: Vec<String> = func
                    .args
                    .iter()
                    .map(|(n, t)| format!("{}: {}", n, t))
                    .collect();
                write!(f, "  fn {}({})", func.name, args.join(", "))?;
                if !func.returns.is_empty() {
                    let returns: Vec<String> = func.returns.iter().map(|t| t.to_string()).collect();
                    write!(f, " -> {}", returns.join(", "))?;
                }
                writeln!(f, "  [{} calls]", func.calls)?;
            }
            for (name, err) in &sig.failures {
                writeln!(f, "  fn {}: {}", name, err)?;
            }
            for name in &sig.unsimulated {
                writeln!(f, "  fn {}: not simulated", name)?;
            }
        }
        Ok(())
    }
}
