//! Structured diagnostics produced while compiling and running wrappers
//!
//! The diagnostics sink is the only channel through which compile errors
//! reach the invoker. The core never prints; rendering is left to callers.

use std::fmt;

use crate::compiler::{LineIndex, Span};

/// How serious a diagnostic is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Remark,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Remark => write!(f, "note"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A single diagnostic record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Location in the wrapper source, when the problem has one
    pub span: Option<Span>,
    /// Optional hint for fixing the problem
    pub hint: Option<String>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            span: None,
            hint: None,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.severity, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

/// Collects diagnostics for one compile or call
#[derive(Debug, Clone, Default)]
pub struct DiagnosticManager {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn put_error(&mut self, message: impl Into<String>) {
        self.push(Diagnostic::error(message));
    }

    pub fn put_warning(&mut self, message: impl Into<String>) {
        self.push(Diagnostic::warning(message));
    }

    pub fn put_remark(&mut self, message: impl Into<String>) {
        self.push(Diagnostic::new(Severity::Remark, message));
    }

    /// Append more text to the most recent diagnostic
    pub fn append_to_last(&mut self, text: &str) {
        if let Some(last) = self.diagnostics.last_mut() {
            last.message.push_str(text);
        }
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count(Severity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count(Severity::Warning)
    }

    fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn clear(&mut self) {
        self.diagnostics.clear();
    }

    /// Render all diagnostics, one per line
    ///
    /// When the wrapper source is supplied, spans are shown as `line:col`.
    #[must_use]
    pub fn render(&self, source: Option<&str>) -> String {
        let index = source.map(LineIndex::new);
        let mut out = String::new();
        for diagnostic in &self.diagnostics {
            match (&index, diagnostic.span) {
                (Some(index), Some(span)) => {
                    out.push_str(&format!("{}: {diagnostic}\n", index.location(span.start)));
                }
                _ => {
                    out.push_str(&format!("{diagnostic}\n"));
                }
            }
        }
        out
    }
}
