use crate::commands::TemplateArgs;
use crate::output;

use clap::Args;
use color_eyre::Result;

use pipeline_templating::{FunctionTable, TemplateEngine, TemplateErrors};

/// Validate a template document against a schema
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub template: TemplateArgs,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let document = &args.template.document;
    output::status("Validating", &format!("{}", document.display()));

    match validate(&args)? {
        Ok(()) => {
            println!();
            output::success("Template is valid");
            Ok(())
        }
        Err(errors) => {
            output::diagnostics(&errors);
            std::process::exit(1);
        }
    }
}

pub fn validate(args: &ValidateArgs) -> Result<Result<(), TemplateErrors>> {
    // Step 1: Read the document, schema and bindings
    let prepared = args.template.prepare()?;
    output::check("Document syntax valid");
    output::check(&format!(
        "Schema loaded: {} definitions",
        prepared.schema.len()
    ));

    // Step 2: Expand against the schema
    let functions = FunctionTable::builtin();
    let engine = TemplateEngine::new(&prepared.schema, &functions).with_options(prepared.options);
    let result = engine.expand(&prepared.token, &args.template.type_name, &prepared.bindings);
    if let Ok(document) = &result {
        output::check(&format!(
            "Expanded as '{}' ({} secret value(s))",
            args.template.type_name,
            document.secret_count()
        ));
    }

    Ok(result.map(|_| ()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::SCHEMA;
    use crate::commands::LimitArgs;
    use pipeline_templating::TemplateErrorKind;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn args(dir: &TempDir, document: &str, max_errors: Option<usize>) -> ValidateArgs {
        let write = |name: &str, contents: &str| -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, contents).unwrap();
            path
        };
        ValidateArgs {
            template: TemplateArgs {
                document: write("pipeline.yml", document),
                schema: write("schema.yml", SCHEMA),
                type_name: "pipeline".to_string(),
                variables: None,
                secrets: None,
                parameters: None,
                limits: LimitArgs {
                    max_errors,
                    ..LimitArgs::default()
                },
            },
        }
    }

    #[test]
    fn test_valid_document() {
        let dir = TempDir::new().unwrap();
        let result = validate(&args(&dir, "name: app\nsteps:\n  - script: make\n", None)).unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_document() {
        let dir = TempDir::new().unwrap();
        let errors = validate(&args(&dir, "steps:\n  - displayName: x\n", None))
            .unwrap()
            .unwrap_err();
        assert!(errors.contains(TemplateErrorKind::UnexpectedProperty));
        assert!(errors.contains(TemplateErrorKind::MissingRequiredProperty));
    }

    #[test]
    fn test_error_limit_flag() {
        let dir = TempDir::new().unwrap();
        let errors = validate(&args(&dir, "a: 1\nb: 2\nc: 3\nd: 4\n", Some(1)))
            .unwrap()
            .unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(TemplateErrorKind::TooManyErrors));
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = validate(&args(&dir, "name: [unclosed\n", None)).err().unwrap();
        assert!(err.to_string().contains("invalid YAML"));
    }
}
