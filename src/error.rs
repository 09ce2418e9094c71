use std::fmt;

use thiserror::Error;

/// An error produced while compiling or running a Lox program, tagged with
/// the 1-based source line it was detected on.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LoxError {
    #[error("compilation error [L{line}]: {reason}")]
    Compile { line: u32, reason: String },
    #[error("runtime error [L{line}]: {reason}")]
    Runtime { line: u32, reason: String },
}

pub type LoxResult<T> = Result<T, LoxError>;

/// An ordered collection of errors gathered during one compilation pass.
///
/// The compiler keeps reporting after the first error (resynchronizing at
/// statement boundaries), so a single pass can produce several diagnostics.
/// When the REPL retries a failed line as a bare expression and that retry
/// also fails, the retry's errors are chained on as the `caused by:` section.
#[derive(Clone, Debug, Default)]
pub struct ErrorBundle {
    errors: Vec<LoxError>,
    cause: Option<Box<ErrorBundle>>,
}

impl ErrorBundle {
    pub fn push(&mut self, err: LoxError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[LoxError] {
        &self.errors
    }

    pub fn with_cause(mut self, cause: ErrorBundle) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ErrorBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [single] => write!(f, "{single}")?,
            many => {
                writeln!(f, "{} errors occurred:", many.len())?;
                for err in many {
                    writeln!(f, "\t* {err}")?;
                }
            }
        }
        if let Some(cause) = &self.cause {
            write!(f, "\ncaused by:\n{cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorBundle {}

impl From<LoxError> for ErrorBundle {
    fn from(err: LoxError) -> Self {
        ErrorBundle {
            errors: vec![err],
            cause: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_error_renders_bare() {
        let bundle = ErrorBundle::from(LoxError::Compile {
            line: 3,
            reason: "expect expression".to_string(),
        });
        assert_eq!(
            bundle.to_string(),
            "compilation error [L3]: expect expression"
        );
    }

    #[test]
    fn multiple_errors_render_count_and_list() {
        let mut bundle = ErrorBundle::default();
        bundle.push(LoxError::Compile {
            line: 1,
            reason: "expect ';' after value".to_string(),
        });
        bundle.push(LoxError::Compile {
            line: 2,
            reason: "expect expression".to_string(),
        });
        let text = bundle.to_string();
        assert!(text.starts_with("2 errors occurred:"));
        assert!(text.contains("expect ';' after value"));
        assert!(text.contains("expect expression"));
    }

    #[test]
    fn chained_bundle_renders_cause_section() {
        let decls = ErrorBundle::from(LoxError::Compile {
            line: 1,
            reason: "expect ';' after value".to_string(),
        });
        let exprs = ErrorBundle::from(LoxError::Compile {
            line: 1,
            reason: "expect expression".to_string(),
        });
        let chained = decls.with_cause(exprs);
        let text = chained.to_string();
        let caused = text.find("caused by:").expect("cause section");
        assert!(text[..caused].contains("expect ';' after value"));
        assert!(text[caused..].contains("expect expression"));
    }
}
