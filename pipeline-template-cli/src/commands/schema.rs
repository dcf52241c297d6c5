use crate::commands::load_schema;
use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_templating::template::{Definition, DefinitionKind};
use pipeline_templating::TemplateSchema;

/// Load a schema file and list its definitions
#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Path to the schema file (YAML or JSON)
    pub schema: PathBuf,

    /// Also list the built-in definitions
    #[arg(long)]
    pub all: bool,
}

pub fn execute(args: SchemaArgs) -> Result<()> {
    output::status("Loading", &format!("{}", args.schema.display()));
    let schema = load_schema(&args.schema)?;
    output::check(&format!("Schema valid: {} definitions", schema.len()));
    println!();

    for line in describe(&schema, args.all) {
        println!("{}", line);
    }
    Ok(())
}

/// One line per definition: name, structure and description
pub fn describe(schema: &TemplateSchema, all: bool) -> Vec<String> {
    let builtin = TemplateSchema::builtin();
    let width = schema
        .definitions()
        .map(|d| d.name.len())
        .max()
        .unwrap_or(0);

    schema
        .definitions()
        .filter(|d| all || !builtin.contains(&d.name))
        .map(|d| {
            let mut line = format!("{:<width$}  {}", d.name, structure(d), width = width);
            if let Some(context) = &d.context {
                line.push_str(&format!(" [context: {}]", context.join(", ")));
            }
            if let Some(description) = &d.description {
                line.push_str(&format!(" - {}", description));
            }
            line
        })
        .collect()
}

fn structure(definition: &Definition) -> String {
    match &definition.kind {
        DefinitionKind::Null => "null".to_string(),
        DefinitionKind::Boolean => "boolean".to_string(),
        DefinitionKind::Number => "number".to_string(),
        DefinitionKind::String(string) => match &string.constant {
            Some(constant) => format!("string '{}'", constant),
            None => "string".to_string(),
        },
        DefinitionKind::Sequence { item_type } => format!("sequence of {}", item_type),
        DefinitionKind::Mapping(mapping) => {
            let mut properties: Vec<String> = mapping
                .properties
                .iter()
                .map(|(name, property)| {
                    if property.required {
                        format!("{}*", name)
                    } else {
                        name.clone()
                    }
                })
                .collect();
            if let Some(key_type) = &mapping.loose_key_type {
                properties.push(format!(
                    "<{}>: {}",
                    key_type,
                    mapping.loose_value_type.as_deref().unwrap_or("any")
                ));
            }
            format!("mapping {{{}}}", properties.join(", "))
        }
        DefinitionKind::OneOf(members) => format!("one of {}", members.join(" | ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::SCHEMA;

    #[test]
    fn test_describe_user_definitions() {
        let schema = TemplateSchema::from_yaml(SCHEMA).unwrap();
        let lines = describe(&schema, false);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("pipeline"));
        assert!(lines[0].contains("mapping {name, steps}"));
        assert!(lines[0].contains("[context: parameters, variables]"));
        assert!(lines[1].contains("sequence of step"));
        assert!(lines[2].contains("mapping {script*}"));
    }

    #[test]
    fn test_describe_all() {
        let schema = TemplateSchema::from_yaml(SCHEMA).unwrap();
        let lines = describe(&schema, true);
        assert_eq!(lines.len(), schema.len());
        assert!(lines.iter().any(|l| l.contains("one of null | boolean")));
    }
}
