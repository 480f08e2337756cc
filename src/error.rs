//! Error types for the fixed-point RTL compiler

use thiserror::Error;

/// Result type for compilation operations
pub type CompileResult<T> = Result<T, CompileError>;

/// Compilation errors
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Lexer error at line {line}: {message}")]
    LexerError { line: usize, message: String },

    #[error("Parser error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error(transparent)]
    TypeInference(#[from] TypeInferenceError),

    #[error(transparent)]
    StateDiscipline(#[from] StateDisciplineError),

    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error("Simulation error in {path}: {message}")]
    SimulationError { path: String, message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the execution-trace type extractor. Fatal to the affected
/// function only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TypeInferenceError {
    #[error("{class}.{function} was never called during simulation, its types cannot be inferred")]
    FunctionNotSimulated { class: String, function: String },

    #[error("{class}.{function}: variable '{variable}' holds {value}, which has no hardware type")]
    VariableNotConvertable {
        class: String,
        function: String,
        variable: String,
        value: String,
    },

    #[error("{class}.{function}: variable '{variable}' was bound to {first} and later to {second}")]
    VariableMultipleTypes {
        class: String,
        function: String,
        variable: String,
        first: String,
        second: String,
    },
}

/// Violations of the current/pending register discipline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateDisciplineError {
    #[error("{class}: assignment to committed state '{path}', write to pending state instead")]
    AssignToCommittedState { class: String, path: String },

    #[error("{class}.{function}: register '{variable}' changed type from {previous} to {next}")]
    TypeNotConsistent {
        class: String,
        function: String,
        variable: String,
        previous: String,
        next: String,
    },
}

/// Failures of the lowering pipeline and the emitter. Fatal to the module
/// being emitted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TranslationError {
    #[error("{class}: '{statement}' assigns {targets} targets from a call returning {returns} values")]
    MultipleAssignmentArityMismatch {
        class: String,
        statement: String,
        targets: usize,
        returns: usize,
    },

    #[error("{class}: '{statement}' uses compound assignment '{operator}', write 'x = x {binary} y' instead")]
    UnsupportedCompoundAssignment {
        class: String,
        statement: String,
        operator: String,
        binary: String,
    },

    #[error("{class}: cannot convert '{construct}': {reason}")]
    UnsupportedConstruct {
        class: String,
        construct: String,
        reason: String,
    },

    #[error("found {count} definitions of module '{class}'")]
    AmbiguousSourceDefinition { class: String, count: usize },
}

impl CompileError {
    pub fn lexer_error(line: usize, msg: impl Into<String>) -> Self {
        CompileError::LexerError { line, message: msg.into() }
    }

    pub fn parse_error(line: usize, msg: impl Into<String>) -> Self {
        CompileError::ParseError { line, message: msg.into() }
    }

    pub fn simulation(path: impl Into<String>, msg: impl Into<String>) -> Self {
        CompileError::SimulationError {
            path: path.into(),
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CompileError::ConfigError { message: msg.into() }
    }
}

impl TranslationError {
    pub fn unsupported(
        class: impl Into<String>,
        construct: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        TranslationError::UnsupportedConstruct {
            class: class.into(),
            construct: construct.into(),
            reason: reason.into(),
        }
    }
}
