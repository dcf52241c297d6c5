// Template parameters
// Declaration parsing and resolution of provided values into expansion bindings

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::expression::evaluator::EvaluationResult;
use crate::expression::value::{parse_number, ContextValue, Dictionary};
use crate::template::bindings::{Bindings, DeferredTemplate};
use crate::template::error::{TemplateError, TemplateErrorKind, TemplateErrors};
use crate::template::reader::TemplateReader;
use crate::template::token::DocumentPath;

/// Root name parameters are bound under
pub const PARAMETERS: &str = "parameters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ParameterType {
    #[default]
    String,
    Number,
    Boolean,
    Object,
    Step,
    StepList,
    Job,
    JobList,
    Stage,
    StageList,
}

impl ParameterType {
    /// Built-in schema definition a default of this type is expanded against
    pub fn type_name(self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Number => "number",
            ParameterType::Boolean => "boolean",
            ParameterType::Object => "any",
            ParameterType::Step | ParameterType::Job | ParameterType::Stage => "mapping",
            ParameterType::StepList | ParameterType::JobList | ParameterType::StageList => {
                "sequence"
            }
        }
    }

    /// Inferred from a shorthand `name: default` declaration
    fn of_default(value: &serde_yaml::Value) -> Self {
        match value {
            serde_yaml::Value::Bool(_) => ParameterType::Boolean,
            serde_yaml::Value::Number(_) => ParameterType::Number,
            serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => ParameterType::Object,
            _ => ParameterType::String,
        }
    }

    /// Check a provided value, converting scalars the way pipeline
    /// parameters are commonly passed (e.g. `"3"` for a number)
    fn coerce(self, value: &ContextValue) -> Option<ContextValue> {
        match (self, value) {
            (
                ParameterType::String,
                ContextValue::String(_) | ContextValue::Number(_) | ContextValue::Boolean(_),
            ) => Some(ContextValue::String(value.as_string())),
            (ParameterType::Number, ContextValue::Number(_)) => Some(value.clone()),
            (ParameterType::Number, ContextValue::String(s)) => {
                let text = s.trim();
                let n = parse_number(text);
                if text.is_empty() || (n.is_nan() && text != "NaN") {
                    None
                } else {
                    Some(ContextValue::Number(n))
                }
            }
            (ParameterType::Boolean, ContextValue::Boolean(_)) => Some(value.clone()),
            (ParameterType::Boolean, ContextValue::String(s)) => {
                if s.eq_ignore_ascii_case("true") {
                    Some(ContextValue::Boolean(true))
                } else if s.eq_ignore_ascii_case("false") {
                    Some(ContextValue::Boolean(false))
                } else {
                    None
                }
            }
            (ParameterType::Object, ContextValue::Array(_) | ContextValue::Dictionary(_)) => {
                Some(value.clone())
            }
            (
                ParameterType::Step | ParameterType::Job | ParameterType::Stage,
                ContextValue::Dictionary(_),
            ) => Some(value.clone()),
            (
                ParameterType::StepList | ParameterType::JobList | ParameterType::StageList,
                ContextValue::Array(_),
            ) => Some(value.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ParameterDeclaration {
    pub name: String,
    pub display_name: Option<String>,
    #[serde(rename = "type", default)]
    pub param_type: ParameterType,
    pub default: Option<serde_yaml::Value>,
    /// Allowed values
    pub values: Option<Vec<serde_yaml::Value>>,
}

/// Parse a `parameters:` section: a sequence of declarations or the
/// `name: default` shorthand mapping
pub fn parse_parameters(
    section: &serde_yaml::Value,
) -> Result<Vec<ParameterDeclaration>, TemplateErrors> {
    let root = DocumentPath::root().key(PARAMETERS);
    let mut declared: Vec<ParameterDeclaration> = Vec::new();
    let mut errors = TemplateErrors::new();

    match section {
        serde_yaml::Value::Null => {}
        serde_yaml::Value::Sequence(items) => {
            for (i, item) in items.iter().enumerate() {
                match serde_yaml::from_value::<ParameterDeclaration>(item.clone()) {
                    Ok(declaration) => declared.push(declaration),
                    Err(e) => errors.push(
                        TemplateError::new(
                            format!("invalid parameter declaration: {}", e),
                            TemplateErrorKind::InvalidParameter,
                        )
                        .with_path(root.index(i)),
                    ),
                }
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (key, value) in map {
                let Some(name) = key.as_str() else {
                    errors.push(
                        TemplateError::new(
                            "parameter names must be strings",
                            TemplateErrorKind::InvalidParameter,
                        )
                        .with_path(&root),
                    );
                    continue;
                };
                declared.push(ParameterDeclaration {
                    name: name.to_string(),
                    display_name: None,
                    param_type: ParameterType::of_default(value),
                    default: Some(value.clone()),
                    values: None,
                });
            }
        }
        _ => errors.push(
            TemplateError::new(
                "parameters must be a sequence or mapping",
                TemplateErrorKind::InvalidParameter,
            )
            .with_path(&root),
        ),
    }

    for (i, declaration) in declared.iter().enumerate() {
        let duplicate = declared[..i]
            .iter()
            .any(|earlier| earlier.name.eq_ignore_ascii_case(&declaration.name));
        if duplicate {
            errors.push(
                TemplateError::new(
                    format!("parameter '{}' is declared more than once", declaration.name),
                    TemplateErrorKind::InvalidParameter,
                )
                .with_path(root.key(declaration.name.as_str())),
            );
        }
    }

    if errors.is_empty() {
        Ok(declared)
    } else {
        Err(errors)
    }
}

/// Remove the `parameters:` section from a mapping document and parse it
pub fn take_parameters(
    document: &mut serde_yaml::Value,
) -> Result<Vec<ParameterDeclaration>, TemplateErrors> {
    match document
        .as_mapping_mut()
        .and_then(|map| map.remove(PARAMETERS))
    {
        Some(section) => parse_parameters(&section),
        None => Ok(Vec::new()),
    }
}

/// Validate provided values against the declarations and bind the result
/// under `parameters`.
///
/// Defaults become deferred templates, expanded on first reference during a
/// pass. Undeclared provided values are passed through.
pub fn resolve_parameters(
    declared: &[ParameterDeclaration],
    provided: &Dictionary,
) -> Result<Bindings, TemplateErrors> {
    let root = DocumentPath::root().key(PARAMETERS);
    let mut bindings = Bindings::new();
    let mut errors = TemplateErrors::new();
    bindings.insert(PARAMETERS, Dictionary::case_insensitive());

    for declaration in declared {
        let path = root.key(declaration.name.as_str());
        let provided_value = provided.iter().find_map(|(name, value)| {
            name.eq_ignore_ascii_case(&declaration.name).then_some(value)
        });

        if let Some(value) = provided_value {
            let Some(value) = declaration.param_type.coerce(value) else {
                errors.push(
                    TemplateError::new(
                        format!(
                            "parameter '{}' expects a {} value, found {}",
                            declaration.name,
                            declaration.param_type.type_name(),
                            value.kind()
                        ),
                        TemplateErrorKind::TypeMismatch,
                    )
                    .with_path(&path),
                );
                continue;
            };

            if let Some(allowed) = &declaration.values {
                let permitted = allowed
                    .iter()
                    .any(|candidate| ContextValue::from_yaml(candidate).loose_eq(&value));
                if !permitted {
                    errors.push(
                        TemplateError::new(
                            format!(
                                "value '{}' is not allowed for parameter '{}'",
                                value, declaration.name
                            ),
                            TemplateErrorKind::InvalidParameter,
                        )
                        .with_path(&path),
                    );
                    continue;
                }
            }

            bindings.insert_member(PARAMETERS, declaration.name.as_str(), EvaluationResult::new(value));
        } else if let Some(default) = &declaration.default {
            match TemplateReader::from_yaml_value(default) {
                Ok(token) => bindings.insert_deferred(
                    PARAMETERS,
                    declaration.name.as_str(),
                    DeferredTemplate::new(token, declaration.param_type.type_name()),
                ),
                Err(read_errors) => {
                    for error in read_errors {
                        errors.push(error.with_path(&path));
                    }
                }
            }
        } else {
            errors.push(
                TemplateError::new(
                    format!("required parameter '{}' was not provided", declaration.name),
                    TemplateErrorKind::MissingParameter,
                )
                .with_path(&path),
            );
        }
    }

    for (name, value) in provided.iter() {
        let is_declared = declared
            .iter()
            .any(|declaration| declaration.name.eq_ignore_ascii_case(name));
        if !is_declared {
            bindings.insert_member(PARAMETERS, name, EvaluationResult::new(value.clone()));
        }
    }

    debug!(
        declared = declared.len(),
        provided = provided.len(),
        errors = errors.len(),
        "resolved template parameters"
    );

    if errors.is_empty() {
        Ok(bindings)
    } else {
        Err(errors)
    }
}
