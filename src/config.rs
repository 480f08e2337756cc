//! Conversion configuration
//!
//! Loaded from a JSON file and overridden from the command line:
//! ```json
//! { "entry": "main", "required_functions": ["main"], "strict_wrap": true }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CompileError, CompileResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Function a simulation step invokes
    pub entry: String,
    /// Function run once when a module is constructed
    pub constructor: String,
    /// Functions that must have been simulated; the rest are skipped with
    /// a warning when never called
    pub required_functions: Vec<String>,
    /// Turn unmarked wraps during simulation into errors
    pub strict_wrap: bool,
    /// Simulate fixed-point values as unquantized floats
    pub float_mode: bool,
    /// Lower and emit independent packages on the rayon pool
    pub parallel: bool,
    pub output_dir: Option<PathBuf>,
}

impl ConversionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> CompileResult<Self> {
        let config: ConversionConfig = serde_json::from_str(text)
            .map_err(|e| CompileError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CompileResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn require(mut self, function: impl Into<String>) -> Self {
        let function = function.into();
        if !self.required_functions.contains(&function) {
            self.required_functions.push(function);
        }
        self
    }

    pub fn is_required(&self, function: &str) -> bool {
        self.required_functions.iter().any(|f| f == function)
    }

    fn validate(&self) -> CompileResult<()> {
        if self.entry.is_empty() {
            return Err(CompileError::config("entry function name is empty"));
        }
        if self.entry == self.constructor {
            return Err(CompileError::config(format!(
                "entry function and constructor are both '{}'",
                self.entry
            )));
        }
        Ok(())
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            entry: "main".to_string(),
            constructor: "init".to_string(),
            required_functions: Vec::new(),
            strict_wrap: false,
            float_mode: false,
            parallel: true,
            output_dir: None,
        }
    }
}
