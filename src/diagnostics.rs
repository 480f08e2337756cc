//! Overflow diagnostics
//!
//! Saturation and wrap are expected DSP behaviour, so they are logged rather
//! than raised. Every record is tagged with the logical execution path
//! (`Class.function` frames pushed by the simulator) and also kept in a
//! per-thread sink that the simulator drains after each step.

use std::cell::RefCell;
use std::fmt;

/// What happened to an out-of-range value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowKind {
    Saturate,
    Wrap,
}

/// One overflow event.
#[derive(Debug, Clone, PartialEq)]
pub struct OverflowDiagnostic {
    pub kind: OverflowKind,
    pub old: f64,
    pub new: f64,
    pub path: String,
    /// The call site marked this wrap as expected.
    pub expected: bool,
}

impl OverflowDiagnostic {
    /// A wrap nobody asked for.
    pub fn is_unexpected_wrap(&self) -> bool {
        self.kind == OverflowKind::Wrap && !self.expected
    }
}

impl fmt::Display for OverflowDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            OverflowKind::Saturate => "SATURATION",
            OverflowKind::Wrap => "WRAP",
        };
        write!(f, "{} {} -> {}\t[{}]", label, self.old, self.new, self.path)
    }
}

thread_local! {
    static PATH: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    static SINK: RefCell<Vec<OverflowDiagnostic>> = const { RefCell::new(Vec::new()) };
}

/// Pops its path segment when dropped.
#[must_use]
pub struct PathGuard {
    _private: (),
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        PATH.with(|p| {
            p.borrow_mut().pop();
        });
    }
}

/// Push a segment onto the logical execution path for the guard's lifetime.
pub fn enter_path(segment: impl Into<String>) -> PathGuard {
    let segment = segment.into();
    PATH.with(|p| p.borrow_mut().push(segment));
    PathGuard { _private: () }
}

/// The logical execution path, e.g. `Top.main/Acc.main`.
pub fn current_path() -> String {
    PATH.with(|p| {
        let p = p.borrow();
        if p.is_empty() {
            "inputs".to_string()
        } else {
            p.join("/")
        }
    })
}

/// Log an overflow and keep it for the simulator.
pub fn report_overflow(kind: OverflowKind, old: f64, new: f64, expected: bool) {
    let diagnostic = OverflowDiagnostic {
        kind,
        old,
        new,
        path: current_path(),
        expected,
    };

    match kind {
        OverflowKind::Saturate => tracing::warn!(path = %diagnostic.path, "{}", diagnostic),
        OverflowKind::Wrap if expected => tracing::debug!(path = %diagnostic.path, "{}", diagnostic),
        OverflowKind::Wrap => tracing::error!(path = %diagnostic.path, "{}", diagnostic),
    }

    SINK.with(|s| s.borrow_mut().push(diagnostic));
}

/// Drain everything reported on this thread so far.
pub fn take_diagnostics() -> Vec<OverflowDiagnostic> {
    SINK.with(|s| std::mem::take(&mut *s.borrow_mut()))
}
