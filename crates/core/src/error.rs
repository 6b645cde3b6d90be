//! The exception taxonomy shared by compile-time and runtime failures
//!
//! One error shape serves the whole pipeline. The scanner and compiler only
//! ever raise `Syntax`; the VM and natives pick from the rest. Errors are
//! terminal for the current `interpret` call; the language has no catch.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Syntax,
    Type,
    Name,
    Attribute,
    Index,
    Import,
    Io,
    Memory,
    Runtime,
    Assertion,
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionKind::Syntax => "SyntaxException",
            ExceptionKind::Type => "TypeException",
            ExceptionKind::Name => "NameException",
            ExceptionKind::Attribute => "AttributeException",
            ExceptionKind::Index => "IndexException",
            ExceptionKind::Import => "ImportException",
            ExceptionKind::Io => "IOException",
            ExceptionKind::Memory => "MemoryException",
            ExceptionKind::Runtime => "RuntimeException",
            ExceptionKind::Assertion => "AssertionException",
        };
        f.write_str(name)
    }
}

/// One frame of a runtime stack trace, innermost first.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// A compile-time or runtime failure with enough position data to render
/// the standard report: header, source snippet with caret, stack trace.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] {message} at {file}:{line}:{column}")]
pub struct SloError {
    pub kind: ExceptionKind,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// The source text of the offending line, when available
    pub snippet: Option<String>,
    pub trace: Vec<TraceFrame>,
}

impl SloError {
    pub fn new(
        kind: ExceptionKind,
        message: impl Into<String>,
        file: impl Into<String>,
        line: u32,
        column: u32,
    ) -> Self {
        SloError {
            kind,
            message: message.into(),
            file: file.into(),
            line,
            column,
            snippet: None,
            trace: Vec::new(),
        }
    }

    pub fn with_snippet(mut self, source_line: impl Into<String>) -> Self {
        self.snippet = Some(source_line.into());
        self
    }

    /// Render the full report:
    ///
    /// ```text
    /// [TypeException] Operands must be numbers at script.slo:3:7
    ///     3 | var x = 1 + true;
    ///                ^
    /// Stack trace:
    ///   at main (script.slo:3:7)
    /// ```
    pub fn render(&self) -> String {
        let mut out = self.to_string();
        if let Some(snippet) = &self.snippet {
            let prefix = format!("    {} | ", self.line);
            out.push('\n');
            out.push_str(&prefix);
            out.push_str(snippet);
            out.push('\n');
            let caret_at = prefix.len() + self.column as usize;
            out.push_str(&" ".repeat(caret_at));
            out.push('^');
        }
        if !self.trace.is_empty() {
            out.push_str("\nStack trace:");
            for frame in &self.trace {
                out.push_str(&format!(
                    "\n  at {} ({}:{}:{})",
                    frame.function, frame.file, frame.line, frame.column
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_format() {
        let err = SloError::new(ExceptionKind::Type, "Operands must be numbers", "t.slo", 3, 7);
        assert_eq!(
            err.to_string(),
            "[TypeException] Operands must be numbers at t.slo:3:7"
        );
    }

    #[test]
    fn test_render_with_snippet_and_trace() {
        let mut err = SloError::new(ExceptionKind::Name, "Undefined variable 'x'", "a.slo", 2, 4)
            .with_snippet("q = x;");
        err.trace.push(TraceFrame {
            function: "main".to_string(),
            file: "a.slo".to_string(),
            line: 2,
            column: 4,
        });
        let rendered = err.render();
        assert!(rendered.contains("    2 | q = x;"));
        assert!(rendered.contains("Stack trace:\n  at main (a.slo:2:4)"));
        // Caret sits `column` characters past the gutter.
        let caret_line = rendered.lines().nth(2).unwrap();
        assert_eq!(caret_line.chars().filter(|c| *c == '^').count(), 1);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ExceptionKind::Io.to_string(), "IOException");
        assert_eq!(ExceptionKind::Assertion.to_string(), "AssertionException");
    }
}
