// CLI subcommands
// Shared file loading and option handling for the subcommands

pub mod eval;
pub mod expand;
pub mod schema;
pub mod validate;

use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use tracing::debug;

use pipeline_templating::template::{DocumentFormat, ParseError};
use pipeline_templating::{
    resolve_parameters, take_parameters, Bindings, ContextValue, Dictionary, EvaluationResult,
    TemplateOptions, TemplateReader, TemplateSchema, TemplateToken,
};

/// Expansion limit overrides shared by `expand` and `validate`
#[derive(Args, Debug, Default)]
pub struct LimitArgs {
    /// YAML file with expansion limits (max-depth, max-errors, max-bytes, ...)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Maximum expansion depth
    #[arg(long, value_name = "N")]
    pub max_depth: Option<usize>,

    /// Maximum number of reported errors
    #[arg(long, value_name = "N")]
    pub max_errors: Option<usize>,
}

impl LimitArgs {
    pub fn options(&self) -> Result<TemplateOptions> {
        let mut options = match &self.config {
            Some(path) => serde_yaml::from_str(&read_file(path)?)
                .wrap_err_with(|| format!("Invalid config file: {}", path.display()))?,
            None => TemplateOptions::default(),
        };
        if let Some(max_depth) = self.max_depth {
            options.max_depth = max_depth;
        }
        if let Some(max_errors) = self.max_errors {
            options.max_errors = max_errors;
        }
        Ok(options)
    }
}

/// Template inputs shared by `expand` and `validate`
#[derive(Args, Debug)]
pub struct TemplateArgs {
    /// Path to the template document (YAML or JSON)
    pub document: PathBuf,

    /// Schema file describing the document
    #[arg(long, value_name = "FILE")]
    pub schema: PathBuf,

    /// Schema definition the document root must match
    #[arg(long = "type", value_name = "DEFINITION")]
    pub type_name: String,

    /// Mapping of values bound as `variables`
    #[arg(long, value_name = "FILE")]
    pub variables: Option<PathBuf>,

    /// Mapping of secret values, also bound under `variables`
    #[arg(long, value_name = "FILE")]
    pub secrets: Option<PathBuf>,

    /// Mapping of values for the document's declared parameters
    #[arg(long, value_name = "FILE")]
    pub parameters: Option<PathBuf>,

    #[command(flatten)]
    pub limits: LimitArgs,
}

/// Everything one expansion pass needs
pub struct Prepared {
    pub schema: TemplateSchema,
    pub token: TemplateToken,
    pub bindings: Bindings,
    pub options: TemplateOptions,
}

impl TemplateArgs {
    pub fn prepare(&self) -> Result<Prepared> {
        let schema = load_schema(&self.schema)?;
        if !schema.contains(&self.type_name) {
            bail!(
                "Schema {} has no definition named '{}'",
                self.schema.display(),
                self.type_name
            );
        }

        let mut document = read_document(&self.document)?;
        let declared = take_parameters(&mut document)?;
        let provided = match &self.parameters {
            Some(path) => load_values(path)?,
            None => Dictionary::new(),
        };
        let mut bindings = resolve_parameters(&declared, &provided)?;

        if let Some(path) = &self.variables {
            for (name, value) in load_values(path)?.iter() {
                bindings.insert_member("variables", name, EvaluationResult::new(value.clone()));
            }
        }
        if let Some(path) = &self.secrets {
            for (name, value) in load_values(path)?.iter() {
                bindings.insert_member("variables", name, EvaluationResult::secret(value.clone()));
            }
        }
        if !bindings.contains("variables") {
            bindings.insert("variables", Dictionary::new());
        }

        let token = TemplateReader::from_yaml_value(&document)?;
        debug!(?bindings, declared = declared.len(), "prepared template inputs");

        Ok(Prepared {
            schema,
            token,
            bindings,
            options: self.limits.options()?,
        })
    }
}

pub fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        bail!("File not found: {}", path.display());
    }
    std::fs::read_to_string(path).wrap_err_with(|| format!("Failed to read {}", path.display()))
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Parse a YAML or JSON document, chosen by file extension
pub fn read_document(path: &Path) -> Result<serde_yaml::Value> {
    let source = read_file(path)?;
    if is_json(path) {
        let json: serde_json::Value = serde_json::from_str(&source)
            .map_err(|e| ParseError::from_json_error(&e, &source))?;
        let value = serde_yaml::to_value(json)
            .map_err(|e| ParseError::new(e.to_string(), 1, 1, DocumentFormat::Json))?;
        Ok(value)
    } else {
        Ok(serde_yaml::from_str(&source).map_err(|e| ParseError::from_yaml_error(&e, &source))?)
    }
}

pub fn load_schema(path: &Path) -> Result<TemplateSchema> {
    let source = read_file(path)?;
    let schema = if is_json(path) {
        TemplateSchema::from_json(&source)
    } else {
        TemplateSchema::from_yaml(&source)
    };
    schema.wrap_err_with(|| format!("Invalid schema: {}", path.display()))
}

/// Load a mapping of named values; an empty file yields no values
pub fn load_values(path: &Path) -> Result<Dictionary> {
    let value = ContextValue::from_yaml(&read_document(path)?);
    match value {
        ContextValue::Dictionary(dict) => Ok(Dictionary::clone(&dict)),
        ContextValue::Null => Ok(Dictionary::new()),
        other => bail!(
            "{} must contain a mapping, found {}",
            path.display(),
            other.kind()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const SCHEMA: &str = r#"
definitions:
  pipeline:
    context: [parameters, variables]
    mapping:
      properties:
        name: non-empty-string
        steps: steps
  steps:
    sequence:
      item-type: step
  step:
    mapping:
      properties:
        script: { type: non-empty-string, required: true }
"#;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_values() {
        let dir = TempDir::new().unwrap();
        let yaml = write(&dir, "vars.yml", "name: app\nreplicas: 2\n");
        let values = load_values(&yaml).unwrap();
        assert_eq!(values.get("name"), Some(&ContextValue::string("app")));
        assert_eq!(values.get("replicas"), Some(&ContextValue::Number(2.0)));

        let json = write(&dir, "vars.json", r#"{"flag": true}"#);
        assert_eq!(
            load_values(&json).unwrap().get("flag"),
            Some(&ContextValue::Boolean(true))
        );

        let empty = write(&dir, "empty.yml", "");
        assert!(load_values(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_load_values_requires_mapping() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "vars.yml", "- a\n- b\n");
        let err = load_values(&path).unwrap_err();
        assert!(err.to_string().contains("must contain a mapping"));
    }

    #[test]
    fn test_missing_file() {
        let err = read_file(Path::new("/nonexistent/pipeline.yml")).unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }

    #[test]
    fn test_limit_overrides() {
        let dir = TempDir::new().unwrap();
        let config = write(&dir, "limits.yml", "max-depth: 7\nmax-errors: 3\n");
        let limits = LimitArgs {
            config: Some(config),
            max_depth: None,
            max_errors: Some(5),
        };
        let options = limits.options().unwrap();
        assert_eq!(options.max_depth, 7);
        assert_eq!(options.max_errors, 5);
        assert_eq!(options.max_bytes, TemplateOptions::default().max_bytes);
    }

    #[test]
    fn test_prepare_binds_parameters_and_variables() {
        let dir = TempDir::new().unwrap();
        let args = TemplateArgs {
            document: write(
                &dir,
                "pipeline.yml",
                "parameters:\n  - name: env\n    default: dev\nname: ${{ parameters.env }}\n",
            ),
            schema: write(&dir, "schema.yml", SCHEMA),
            type_name: "pipeline".to_string(),
            variables: Some(write(&dir, "vars.yml", "region: west\n")),
            secrets: None,
            parameters: Some(write(&dir, "params.yml", "env: prod\n")),
            limits: LimitArgs::default(),
        };

        let prepared = args.prepare().unwrap();
        assert!(prepared.bindings.contains("parameters"));
        assert!(prepared.bindings.contains("variables"));
        assert!(matches!(prepared.token, TemplateToken::Mapping(ref entries) if entries.len() == 1));
    }

    #[test]
    fn test_prepare_rejects_unknown_type() {
        let dir = TempDir::new().unwrap();
        let args = TemplateArgs {
            document: write(&dir, "pipeline.yml", "name: x\n"),
            schema: write(&dir, "schema.yml", SCHEMA),
            type_name: "job".to_string(),
            variables: None,
            secrets: None,
            parameters: None,
            limits: LimitArgs::default(),
        };
        let err = args.prepare().err().unwrap();
        assert!(err.to_string().contains("'job'"));
    }
}
