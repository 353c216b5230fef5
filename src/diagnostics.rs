//! Component D: diagnostics and call-stack reconstruction.
//!
//! An evaluation that hits a problem does not panic the host compiler: it
//! records a [`Diagnostic`], marks the executor's sticky `has_error` flag,
//! and keeps going with a dummy result so later, unrelated errors in the
//! same expression can still be reported in one pass.

use crate::common::Id;
use crate::function::{SrcToken, WarningKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning(WarningKind),
}

/// One frame of call-stack context attached to a diagnostic, rendered as
/// `"in call to '<signature>'"`.
#[derive(Debug, Clone)]
pub struct CallNote {
    pub function_signature: Id,
    pub call_site: SrcToken,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub src_token: SrcToken,
    pub message: String,
    /// Innermost call first, matching call-stack unwind order; the final
    /// synthesized note is always "while evaluating expression at compile
    /// time", appended by [`build_notes`].
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        matches!(self.severity, Severity::Error)
    }
}

/// Turn a call stack (innermost frame last, as the executor's call-frame
/// vector holds it) into the note strings a diagnostic attaches to itself.
///
/// Ported from the reference executor's note reconstruction: one
/// `"in call to '<signature>'"` line per active call, innermost first, plus
/// a final `"while evaluating expression at compile time"` root note.
pub fn build_notes(call_stack: &[CallNote]) -> Vec<String> {
    let mut notes: Vec<String> = call_stack
        .iter()
        .rev()
        .map(|frame| format!("in call to '{}'", frame.function_signature))
        .collect();
    notes.push("while evaluating expression at compile time".to_string());
    notes
}

#[derive(Debug, Clone, Default)]
pub struct DiagnosticSink {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        log::debug!("diagnostic: {:?} {}", diagnostic.severity, diagnostic.message);
        self.diagnostics.push(diagnostic);
    }

    pub fn has_error(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    pub fn all(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> SrcToken {
        SrcToken { file_id: 0, line: 1, column_begin: 0, column_end: 1 }
    }

    #[test]
    fn notes_are_innermost_first_with_root_note_last() {
        let stack = vec![
            CallNote { function_signature: Id::new("outer".to_string()), call_site: token() },
            CallNote { function_signature: Id::new("inner".to_string()), call_site: token() },
        ];
        let notes = build_notes(&stack);
        assert_eq!(notes[0], "in call to 'inner'");
        assert_eq!(notes[1], "in call to 'outer'");
        assert_eq!(notes[2], "while evaluating expression at compile time");
    }

    #[test]
    fn sink_reports_error_only_for_error_severity() {
        let mut sink = DiagnosticSink::new();
        sink.push(Diagnostic {
            severity: Severity::Warning(WarningKind::UnusedResult),
            src_token: token(),
            message: "unused".into(),
            notes: vec![],
        });
        assert!(!sink.has_error());
        sink.push(Diagnostic {
            severity: Severity::Error,
            src_token: token(),
            message: "boom".into(),
            notes: vec![],
        });
        assert!(sink.has_error());
    }
}
