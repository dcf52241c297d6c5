// Pipeline Templating Library
// Expression evaluation and schema-guided expansion of YAML pipeline templates

pub mod error;
pub mod expression;
pub mod template;

pub use error::{TemplatingError, TemplatingResult};

// Re-export expression types
pub use expression::{
    ContextValue, Dictionary, EvalError, EvalErrorKind, EvaluationResult, Expr, ExprParser,
    ExpressionEngine, ExpressionError, FunctionDescriptor, FunctionTable, NamedValueProvider,
    NamedValues, ParseExprError, ParserOptions,
};

// Re-export template types
pub use template::{
    resolve_parameters, take_parameters, Bindings, DocumentPath, ExpandedDocument, ParseError,
    TemplateEngine, TemplateError, TemplateErrorKind, TemplateErrors, TemplateOptions,
    TemplateReader, TemplateSchema, TemplateToken,
};

#[cfg(test)]
pub(crate) mod test_utils {
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Route `tracing` output through the test harness; honors `RUST_LOG`
    pub fn init_test_logging() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}
