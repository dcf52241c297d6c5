use crate::commands::TemplateArgs;
use crate::output;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;

use pipeline_templating::{ContextValue, FunctionTable, TemplateEngine};

/// Expand a template document and print the resolved result
#[derive(Args, Debug)]
pub struct ExpandArgs {
    #[command(flatten)]
    pub template: TemplateArgs,

    /// Print JSON instead of YAML
    #[arg(long)]
    pub json: bool,

    /// Print secret-derived values instead of masking them
    #[arg(long)]
    pub reveal_secrets: bool,
}

pub fn execute(args: ExpandArgs) -> Result<()> {
    output::status("Expanding", &format!("{}", args.template.document.display()));

    match expand_to_string(&args)? {
        Some(rendered) => {
            print!("{}", rendered);
            Ok(())
        }
        None => std::process::exit(1),
    }
}

/// Rendered document, or `None` after diagnostics were printed
pub fn expand_to_string(args: &ExpandArgs) -> Result<Option<String>> {
    let prepared = args.template.prepare()?;
    let functions = FunctionTable::builtin();
    let engine = TemplateEngine::new(&prepared.schema, &functions).with_options(prepared.options);

    let document = match engine.expand(&prepared.token, &args.template.type_name, &prepared.bindings)
    {
        Ok(document) => document,
        Err(errors) => {
            output::diagnostics(&errors);
            return Ok(None);
        }
    };

    if document.has_secrets() {
        if args.reveal_secrets {
            output::warning(&format!(
                "revealing {} secret value(s)",
                document.secret_count()
            ));
        } else {
            output::dim(&format!(
                "{} secret value(s) masked; use --reveal-secrets to show them",
                document.secret_count()
            ));
        }
    }

    let value = if args.reveal_secrets {
        document.value
    } else {
        document.masked()
    };
    render(&value, args.json).map(Some)
}

fn render(value: &ContextValue, json: bool) -> Result<String> {
    if json {
        return Ok(format!("{}\n", value.to_json_pretty()));
    }
    serde_yaml::to_string(&value.to_yaml()).wrap_err("Failed to render expanded document")
}
