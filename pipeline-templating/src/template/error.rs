// Template error types
// Expansion diagnostics and document syntax errors with source context

use std::fmt;

use thiserror::Error;

/// Error raised while reading or expanding a template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct TemplateError {
    pub message: String,
    /// Document path of the offending node, e.g. `jobs[0].steps[2].script`
    pub path: Option<String>,
    pub kind: TemplateErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateErrorKind {
    /// A named value depends on itself
    CircularReference,
    /// Maximum expansion depth exceeded
    MaxDepthExceeded,
    /// Invalid parameter value or declaration
    InvalidParameter,
    /// Value does not match the allowed definitions
    TypeMismatch,
    /// Required parameter missing
    MissingParameter,
    /// Malformed expression span or expression syntax
    ParseError,
    /// Expression evaluation error
    ExpressionError,
    /// Expression used where the schema allows none
    ExpressionNotAllowed,
    /// Expression references a named value not available at its position
    UnrecognizedNamedValue,
    /// Mapping key not declared by any candidate definition
    UnexpectedProperty,
    MissingRequiredProperty,
    DuplicateKey,
    /// Misplaced or malformed `${{ if }}`, `${{ each }}` or `${{ insert }}`
    InvalidDirective,
    /// Expanded output grew past the byte limit
    MaxBytesExceeded,
    /// Error limit reached; later errors were dropped
    TooManyErrors,
}

impl TemplateErrorKind {
    /// Errors that abort the enclosing subtree instead of being collected
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            TemplateErrorKind::CircularReference
                | TemplateErrorKind::MaxDepthExceeded
                | TemplateErrorKind::MaxBytesExceeded
        )
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path.as_deref() {
            Some(path) if !path.is_empty() => {
                write!(f, "template error at '{}': {}", path, self.message)
            }
            _ => write!(f, "template error: {}", self.message),
        }
    }
}

impl TemplateError {
    pub fn new(message: impl Into<String>, kind: TemplateErrorKind) -> Self {
        Self {
            message: message.into(),
            path: None,
            kind,
        }
    }

    pub fn with_path(mut self, path: impl fmt::Display) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Truncate the message to at most `max` characters
    pub(crate) fn truncated(mut self, max: usize) -> Self {
        if self.message.chars().count() > max {
            let mut message: String = self.message.chars().take(max).collect();
            message.push_str("[...]");
            self.message = message;
        }
        self
    }
}

/// Diagnostics collected over one read or expansion pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
pub struct TemplateErrors {
    errors: Vec<TemplateError>,
}

impl TemplateErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: TemplateError) {
        self.errors.push(error);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TemplateError> {
        self.errors.iter()
    }

    pub fn first(&self) -> Option<&TemplateError> {
        self.errors.first()
    }

    /// Whether any error is of `kind`
    pub fn contains(&self, kind: TemplateErrorKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn into_vec(self) -> Vec<TemplateError> {
        self.errors
    }
}

impl fmt::Display for TemplateErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "no template errors"),
            [single] => write!(f, "{}", single),
            errors => {
                write!(f, "{} template errors:", errors.len())?;
                for error in errors {
                    write!(f, "\n  - {}", error)?;
                }
                Ok(())
            }
        }
    }
}

impl From<TemplateError> for TemplateErrors {
    fn from(error: TemplateError) -> Self {
        Self {
            errors: vec![error],
        }
    }
}

impl From<Vec<TemplateError>> for TemplateErrors {
    fn from(errors: Vec<TemplateError>) -> Self {
        Self { errors }
    }
}

impl IntoIterator for TemplateErrors {
    type Item = TemplateError;
    type IntoIter = std::vec::IntoIter<TemplateError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a TemplateErrors {
    type Item = &'a TemplateError;
    type IntoIter = std::slice::Iter<'a, TemplateError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}

/// Source format of a document that failed to parse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentFormat::Yaml => write!(f, "YAML"),
            DocumentFormat::Json => write!(f, "JSON"),
        }
    }
}

/// Document syntax error with location and context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed)
    pub line: usize,
    /// Column number (1-indexed)
    pub column: usize,
    /// Surrounding context (a few lines around the error)
    pub context: String,
    /// Optional suggestion for fixing the error
    pub suggestion: Option<String>,
    pub format: DocumentFormat,
}

impl ParseError {
    pub fn new(
        message: impl Into<String>,
        line: usize,
        column: usize,
        format: DocumentFormat,
    ) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            format,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Create context from source content
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column - 1) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Create from a serde_yaml error
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((1, 1));

        let mut error = ParseError::new(
            strip_location(&err.to_string()),
            line,
            column,
            DocumentFormat::Yaml,
        )
        .with_source_context(source, 2);
        error.suggestion = suggest_fix(source, line);
        error
    }

    /// Create from a serde_json error
    pub fn from_json_error(err: &serde_json::Error, source: &str) -> Self {
        let line = err.line().max(1);
        let column = err.column().max(1);

        let mut error = ParseError::new(
            strip_location(&err.to_string()),
            line,
            column,
            DocumentFormat::Json,
        )
        .with_source_context(source, 2);
        error.suggestion = suggest_fix(source, line);
        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: invalid {}: {}", self.format, self.message)?;
        writeln!(f, "  --> line {}:{}", self.line, self.column)?;

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// serde errors append " at line X column Y", which is reported separately
fn strip_location(message: &str) -> String {
    match message.rfind(" at line ") {
        Some(index) => message[..index].to_string(),
        None => message.to_string(),
    }
}

/// Suggest fixes for common mistakes around expressions
fn suggest_fix(source: &str, line: usize) -> Option<String> {
    let lines: Vec<&str> = source.lines().collect();
    let error_line = lines.get(line.saturating_sub(1)).copied().unwrap_or("");
    let trimmed = error_line.trim_start().trim_start_matches("- ");

    if error_line.starts_with('\t') {
        return Some(
            "YAML prefers spaces over tabs for indentation. Replace tabs with spaces.".to_string(),
        );
    }

    // `key: {{ x }}` parses as a flow mapping
    let value = trimmed.split_once(": ").map(|(_, v)| v).unwrap_or(trimmed);
    if value.trim_start().starts_with("{{") {
        return Some("expressions are written as '${{ ... }}'".to_string());
    }

    if error_line.contains("${{") && !error_line.contains("}}") {
        return Some("expression is missing its closing '}}'".to_string());
    }

    None
}
