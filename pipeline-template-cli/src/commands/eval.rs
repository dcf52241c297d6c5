use crate::commands::load_values;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_templating::{ExpressionEngine, NamedValues};

/// Evaluate one expression and print the result as JSON
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Expression text, without the surrounding ${{ }}
    pub expression: String,

    /// Mapping of values bound as `variables`
    #[arg(long, value_name = "FILE")]
    pub variables: Option<PathBuf>,

    /// Mapping of values bound as `parameters`
    #[arg(long, value_name = "FILE")]
    pub parameters: Option<PathBuf>,
}

pub fn execute(args: EvalArgs) -> Result<()> {
    println!("{}", evaluate(&args)?);
    Ok(())
}

pub fn evaluate(args: &EvalArgs) -> Result<String> {
    let mut named_values = NamedValues::new();
    named_values.insert("variables", load_optional(args.variables.as_ref())?);
    named_values.insert("parameters", load_optional(args.parameters.as_ref())?);

    let engine = ExpressionEngine::new(named_values);
    let result = engine.evaluate(&args.expression)?;
    if result.is_secret {
        output::warning("result is derived from a secret");
    }
    Ok(result.value.to_json_pretty())
}

fn load_optional(path: Option<&PathBuf>) -> Result<pipeline_templating::Dictionary> {
    match path {
        Some(path) => load_values(path),
        None => Ok(pipeline_templating::Dictionary::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(expression: &str, variables: Option<PathBuf>) -> EvalArgs {
        EvalArgs {
            expression: expression.to_string(),
            variables,
            parameters: None,
        }
    }

    #[test]
    fn test_evaluate_with_variables() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vars.yml");
        std::fs::write(&path, "env: prod\nregions: [west, east]\n").unwrap();

        let output = evaluate(&args("format('{0}-{1}', variables.env, length(variables.regions))", Some(path))).unwrap();
        assert_eq!(output, "\"prod-2\"");
    }

    #[test]
    fn test_evaluate_without_bindings() {
        assert_eq!(evaluate(&args("and(true, eq(1, '1'))", None)).unwrap(), "true");
        assert_eq!(evaluate(&args("variables.missing", None)).unwrap(), "null");
    }

    #[test]
    fn test_parse_error() {
        let err = evaluate(&args("eq(1,", None)).unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }
}
