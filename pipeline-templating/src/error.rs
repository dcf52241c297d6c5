// Crate error type
// Aggregates the expression, schema and template layer errors

use thiserror::Error;

use crate::expression::evaluator::ExpressionError;
use crate::template::error::{ParseError, TemplateErrors};
use crate::template::schema::SchemaError;

pub type TemplatingResult<T> = Result<T, TemplatingError>;

#[derive(Debug, Error)]
pub enum TemplatingError {
    /// YAML/JSON syntax error in a document
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Diagnostics from reading or expanding a template
    #[error(transparent)]
    Template(#[from] TemplateErrors),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

impl TemplatingError {
    /// Template diagnostics, if this is an expansion or reader failure
    pub fn diagnostics(&self) -> Option<&TemplateErrors> {
        match self {
            TemplatingError::Template(errors) => Some(errors),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::error::{TemplateError, TemplateErrorKind};

    #[test]
    fn test_template_errors_convert() {
        let errors = TemplateErrors::from(TemplateError::new(
            "unexpected property 'x'",
            TemplateErrorKind::UnexpectedProperty,
        ));
        let err: TemplatingError = errors.into();
        assert_eq!(err.diagnostics().map(TemplateErrors::len), Some(1));
        assert!(err.to_string().contains("unexpected property 'x'"));
    }

    #[test]
    fn test_schema_error_converts() {
        let err: TemplatingError = crate::template::schema::TemplateSchema::from_yaml("nope: [")
            .unwrap_err()
            .into();
        assert!(matches!(err, TemplatingError::Schema(_)));
        assert!(err.diagnostics().is_none());
    }
}
