//! Fixed-point RTL compiler
//!
//! Takes a design written in a small object-oriented hardware language,
//! simulates it cycle by cycle, derives hardware types from the recorded
//! execution traces and emits one VHDL package per distinct module shape.
//!
//! # Example
//!
//! ```rust
//! use fixed_rtl::{compile, ConversionConfig, Sfix, Value};
//!
//! let source = "
//!     module Acc {
//!         fn init() { self.acc = sfix(0.0, 2, -10); }
//!         fn main(x) { self.acc = self.acc + x; return self.acc; }
//!     }";
//! let inputs = vec![vec![Value::Fixed(Sfix::new(0.5, 0, -8))]; 4];
//! let converted = compile(source, "Acc", vec![], inputs, &ConversionConfig::default()).unwrap();
//! assert!(converted.file("Acc_0.vhd").is_some());
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod error;
pub mod config;
pub mod fixed;
pub mod complex;
pub mod diagnostics;
pub mod registers;
pub mod value;
pub mod trace;
pub mod sim;
pub mod stimulus;
pub mod types;
pub mod extract;
pub mod lower;
pub mod vhdl;

pub use ast::Design;
pub use complex::ComplexSfix;
pub use config::ConversionConfig;
pub use error::{CompileError, CompileResult, StateDisciplineError, TranslationError, TypeInferenceError};
pub use extract::{extract, Extractor};
pub use fixed::{FixedFormat, Overflow, Round, Sfix};
pub use lower::{lower_module, LoweredModule};
pub use parser::Parser;
pub use registers::{clock, Clocked, Registers};
pub use sim::{Instance, Simulator};
pub use types::{HwType, ModuleTypeSignature, SignatureSet};
pub use value::Value;
pub use vhdl::{EmittedRegistry, VhdlEmitter};

/// Parse a whole design
pub fn parse(source: &str) -> CompileResult<Design> {
    parser::parse_design(source)
}

/// One generated source file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputFile {
    pub name: String,
    pub contents: String,
}

impl OutputFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
        }
    }
}

/// Result of a conversion: the type signatures and the VHDL sources, the
/// shared typedefs first and then packages in dependency order
#[derive(Debug, Clone, Serialize)]
pub struct ConvertedDesign {
    pub signatures: SignatureSet,
    pub files: Vec<OutputFile>,
}

impl ConvertedDesign {
    pub fn file(&self, name: &str) -> Option<&OutputFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn write_to(&self, dir: &Path) -> CompileResult<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut paths = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let path = dir.join(&file.name);
            fs::write(&path, &file.contents)?;
            paths.push(path);
        }
        Ok(paths)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Drives extraction, lowering and emission for a simulated top instance
pub struct Converter {
    config: ConversionConfig,
    registry: EmittedRegistry,
}

impl Converter {
    pub fn new(config: ConversionConfig) -> Self {
        Self {
            config,
            registry: EmittedRegistry::new(),
        }
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Packages emitted so far; a second conversion through the same
    /// converter skips them
    pub fn registry(&self) -> &EmittedRegistry {
        &self.registry
    }

    pub fn convert(&self, design: &Design, top: &Instance) -> CompileResult<ConvertedDesign> {
        let set = extract(design, top, &self.config)?;
        tracing::info!(top = %set.top, packages = set.len(), "extracted signatures");
        for sig in set.modules.values() {
            let required = sig.failures.iter().find(|(name, _)| self.config.is_required(name));
            if let Some((_, err)) = required {
                return Err(err.clone().into());
            }
        }

        let signatures: Vec<&Arc<ModuleTypeSignature>> = set.modules.values().collect();
        let lower = |sig: &&Arc<ModuleTypeSignature>| lower_module(design, &set, sig);
        let lowered: Vec<LoweredModule> = if self.config.parallel {
            signatures.par_iter().map(lower).collect::<CompileResult<_>>()?
        } else {
            signatures.iter().map(lower).collect::<CompileResult<_>>()?
        };

        let emitter = VhdlEmitter::new(design, &self.registry);
        let emit = |module: &LoweredModule| -> CompileResult<Option<OutputFile>> {
            Ok(emitter
                .emit(module)?
                .map(|text| OutputFile::new(format!("{}.vhd", module.signature.package), text)))
        };
        let packages: Vec<Option<OutputFile>> = if self.config.parallel {
            lowered.par_iter().map(emit).collect::<CompileResult<_>>()?
        } else {
            lowered.iter().map(emit).collect::<CompileResult<_>>()?
        };

        let mut files = vec![OutputFile::new(
            format!("{}.vhd", vhdl::TYPEDEFS_PACKAGE),
            vhdl::emit_typedefs(&lowered)?,
        )];
        files.extend(packages.into_iter().flatten());
        tracing::info!(files = files.len(), "conversion finished");

        Ok(ConvertedDesign {
            signatures: set,
            files,
        })
    }
}

/// Parse, construct `top`, run it on `inputs` and convert the result
pub fn compile(
    source: &str,
    top: &str,
    init_args: Vec<Value>,
    inputs: Vec<Vec<Value>>,
    config: &ConversionConfig,
) -> CompileResult<ConvertedDesign> {
    let design = Arc::new(parse(source)?);
    let simulator = Simulator::with_config(design.clone(), config);
    let mut instance = simulator.instantiate(top, init_args)?;
    instance.simulate(inputs)?;
    Converter::new(config.clone()).convert(&design, &instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FILTER: &str = "
        module Tap {
            fn init() { self.y = sfix(0.0, 1, -8, wrap, truncate); }
            fn main(x) { self.y = x; return self.y; }
        }
        module Filter {
            fn init(n) {
                self.taps = [Tap(); 3];
                self.out = sfix(0.0, 3, -8, wrap, truncate);
            }
            fn main(x) {
                acc = sfix(0.0, 3, -8, wrap, truncate);
                for t in self.taps { acc = resize(acc + t.main(x), 3, -8); }
                self.out = acc;
                return self.out;
            }
        }";

    fn inputs() -> Vec<Vec<Value>> {
        vec![vec![Value::Fixed(Sfix::new(0.5, 0, -8))]; 4]
    }

    #[test]
    fn test_compile_end_to_end() {
        let config = ConversionConfig::new().require("main");
        let converted = compile(FILTER, "Filter", vec![Value::Int(3)], inputs(), &config).unwrap();

        let names: Vec<&str> = converted.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Typedefs.vhd", "Tap_0.vhd", "Filter_0.vhd"]);
        assert_eq!(converted.signatures.top, "Filter_0");

        let filter = &converted.file("Filter_0.vhd").unwrap().contents;
        assert!(filter.contains("for \\_i_\\ in self.taps'range loop"));
        assert!(filter.contains("Tap_0.main(self.taps(\\_i_\\), x, ret_0=>\\_call0_\\);"));
        assert!(converted.to_json().unwrap().contains("\"Filter_0\""));
    }

    #[test]
    fn test_parallel_output_matches_sequential() {
        let parallel = compile(FILTER, "Filter", vec![Value::Int(3)], inputs(), &ConversionConfig::default()).unwrap();
        let config = ConversionConfig {
            parallel: false,
            ..ConversionConfig::default()
        };
        let sequential = compile(FILTER, "Filter", vec![Value::Int(3)], inputs(), &config).unwrap();
        assert_eq!(parallel.files, sequential.files);
    }

    #[test]
    fn test_registry_skips_known_packages() {
        let design = Arc::new(parse(FILTER).unwrap());
        let mut top = Simulator::new(design.clone()).instantiate("Filter", vec![Value::Int(3)]).unwrap();
        top.simulate(inputs()).unwrap();

        let converter = Converter::new(ConversionConfig {
            parallel: false,
            ..ConversionConfig::default()
        });
        let first = converter.convert(&design, &top).unwrap();
        let second = converter.convert(&design, &top).unwrap();
        assert_eq!(first.files.len(), 3);
        assert_eq!(second.files.len(), 1);
        assert_eq!(converter.registry().names(), vec!["Tap_0", "Filter_0"]);
    }

    const MIXED: &str = "
        module Mixed {
            fn init() {
                self.taps = [sfix(0.5, 0, -4), sfix(0.5, 1, -4)];
                self.n = 0;
            }
            fn main(x) { self.n = x; return self.n; }
            fn tap(i) { return self.taps[i]; }
            fn indirect(i) { return self.tap(i); }
        }";

    fn mixed(extra: &str) -> (Arc<Design>, Instance) {
        let design = Arc::new(parse(MIXED).unwrap());
        let mut top = Simulator::new(design.clone()).instantiate("Mixed", vec![]).unwrap();
        top.simulate(vec![vec![Value::Int(1)], vec![Value::Int(2)]]).unwrap();
        top.call(extra, vec![Value::Int(0)]).unwrap();
        (design, top)
    }

    #[test]
    fn test_failed_sibling_does_not_block_conversion() {
        let (design, top) = mixed("tap");
        let converted = Converter::new(ConversionConfig::default())
            .convert(&design, &top)
            .unwrap();

        let sig = converted.signatures.top().unwrap();
        assert!(sig.failures.contains_key("tap"));
        let text = &converted.file("Mixed_0.vhd").unwrap().contents;
        assert!(text.contains("procedure main(self: inout self_t; x: integer; ret_0: out integer);"));
        assert!(!text.contains("procedure tap"));
        assert!(!text.contains("taps"));
    }

    #[test]
    fn test_calling_a_failed_function_fails() {
        let (design, top) = mixed("indirect");
        let result = Converter::new(ConversionConfig::default()).convert(&design, &top);
        assert!(matches!(
            result,
            Err(CompileError::TypeInference(TypeInferenceError::VariableNotConvertable { ref function, .. }))
                if function == "tap"
        ));

        let config = ConversionConfig::new().require("tap");
        let (design, top) = mixed("tap");
        assert!(Converter::new(config).convert(&design, &top).is_err());
    }

    #[test]
    fn test_unsimulated_top_fails() {
        let config = ConversionConfig::new().require("main");
        let result = compile(FILTER, "Filter", vec![Value::Int(3)], vec![], &config);
        assert!(matches!(
            result,
            Err(CompileError::TypeInference(TypeInferenceError::FunctionNotSimulated { .. }))
        ));
    }
}
