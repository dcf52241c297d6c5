// Template schema
// Definitions describing the allowed shape of each document position

use std::collections::HashSet;
use std::fmt;

use indexmap::IndexMap;
use serde::Deserialize;
use thiserror::Error;

use crate::expression::value::ValueKind;

/// Error raised while loading or validating a schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct SchemaError {
    /// Definition the error was found in, if any
    pub definition: Option<String>,
    pub message: String,
}

impl SchemaError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            definition: None,
            message: message.into(),
        }
    }

    fn in_definition(definition: &str, message: impl Into<String>) -> Self {
        Self {
            definition: Some(definition.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.definition {
            Some(definition) => write!(f, "schema error in '{}': {}", definition, self.message),
            None => write!(f, "schema error: {}", self.message),
        }
    }
}

// =============================================================================
// Schema file format
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaFile {
    #[serde(default)]
    version: Option<serde_yaml::Value>,
    #[serde(default)]
    definitions: IndexMap<String, DefinitionFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct DefinitionFile {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    context: Option<Vec<String>>,
    #[serde(default)]
    null: Option<EmptyFile>,
    #[serde(default)]
    boolean: Option<EmptyFile>,
    #[serde(default)]
    number: Option<EmptyFile>,
    #[serde(default)]
    string: Option<StringDefinition>,
    #[serde(default)]
    sequence: Option<SequenceFile>,
    #[serde(default)]
    mapping: Option<MappingFile>,
    #[serde(default)]
    one_of: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyFile {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct SequenceFile {
    item_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct MappingFile {
    #[serde(default)]
    properties: IndexMap<String, PropertyFile>,
    #[serde(default)]
    loose_key_type: Option<String>,
    #[serde(default)]
    loose_value_type: Option<String>,
}

/// `name: type` or `name: {type, required}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PropertyFile {
    Short(String),
    Full(PropertyDefinition),
}

// =============================================================================
// Definitions
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub name: String,
    pub description: Option<String>,
    /// Named values expressions may reference at positions of this type.
    /// `None` inherits the enclosing position's set.
    pub context: Option<Vec<String>>,
    pub kind: DefinitionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionKind {
    Null,
    Boolean,
    Number,
    String(StringDefinition),
    Sequence { item_type: String },
    Mapping(MappingDefinition),
    OneOf(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct StringDefinition {
    /// The only accepted value
    pub constant: Option<String>,
    /// Compare `constant` case-insensitively
    pub ignore_case: bool,
    pub require_non_empty: bool,
}

impl StringDefinition {
    pub fn accepts(&self, value: &str) -> bool {
        if self.require_non_empty && value.is_empty() {
            return false;
        }
        match &self.constant {
            Some(constant) if self.ignore_case => constant.eq_ignore_ascii_case(value),
            Some(constant) => constant == value,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingDefinition {
    pub properties: IndexMap<String, PropertyDefinition>,
    pub loose_key_type: Option<String>,
    pub loose_value_type: Option<String>,
}

impl MappingDefinition {
    /// Declared property, matched case-insensitively
    pub fn property(&self, key: &str) -> Option<&PropertyDefinition> {
        self.properties.get(key).or_else(|| {
            self.properties
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(key))
                .map(|(_, property)| property)
        })
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(|(_, property)| property.required)
            .map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropertyDefinition {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub required: bool,
}

impl Definition {
    fn builtin(name: &str, kind: DefinitionKind) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            context: None,
            kind,
        }
    }

    /// Names of the definitions this one refers to
    fn references(&self) -> Vec<&str> {
        match &self.kind {
            DefinitionKind::Sequence { item_type } => vec![item_type.as_str()],
            DefinitionKind::Mapping(mapping) => mapping
                .properties
                .values()
                .map(|p| p.type_name.as_str())
                .chain(mapping.loose_key_type.as_deref())
                .chain(mapping.loose_value_type.as_deref())
                .collect(),
            DefinitionKind::OneOf(members) => members.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    fn from_file(name: &str, file: DefinitionFile) -> Result<Self, SchemaError> {
        let mut kinds = Vec::new();
        if file.null.is_some() {
            kinds.push(DefinitionKind::Null);
        }
        if file.boolean.is_some() {
            kinds.push(DefinitionKind::Boolean);
        }
        if file.number.is_some() {
            kinds.push(DefinitionKind::Number);
        }
        if let Some(string) = file.string {
            kinds.push(DefinitionKind::String(string));
        }
        if let Some(sequence) = file.sequence {
            kinds.push(DefinitionKind::Sequence {
                item_type: sequence.item_type,
            });
        }
        if let Some(mapping) = file.mapping {
            if mapping.loose_value_type.is_some() && mapping.loose_key_type.is_none() {
                return Err(SchemaError::in_definition(
                    name,
                    "'loose-value-type' requires 'loose-key-type'",
                ));
            }
            let properties = mapping
                .properties
                .into_iter()
                .map(|(key, property)| {
                    let property = match property {
                        PropertyFile::Short(type_name) => PropertyDefinition {
                            type_name,
                            required: false,
                        },
                        PropertyFile::Full(property) => property,
                    };
                    (key, property)
                })
                .collect();
            kinds.push(DefinitionKind::Mapping(MappingDefinition {
                properties,
                loose_key_type: mapping.loose_key_type,
                loose_value_type: mapping.loose_value_type,
            }));
        }
        if let Some(members) = file.one_of {
            kinds.push(DefinitionKind::OneOf(members));
        }

        if kinds.len() != 1 {
            return Err(SchemaError::in_definition(
                name,
                format!(
                    "a definition must declare exactly one of null, boolean, number, string, sequence, mapping or one-of; found {}",
                    kinds.len()
                ),
            ));
        }

        Ok(Self {
            name: name.to_string(),
            description: file.description,
            context: file.context,
            kind: kinds.remove(0),
        })
    }
}

/// Names that every schema defines
pub const BUILTIN_DEFINITIONS: &[&str] = &[
    "null",
    "boolean",
    "number",
    "string",
    "sequence",
    "mapping",
    "any",
    "non-empty-string",
    "sequence-of-non-empty-string",
];

/// Loaded and validated set of definitions. Read-only after construction.
#[derive(Debug, Clone)]
pub struct TemplateSchema {
    version: Option<String>,
    definitions: IndexMap<String, Definition>,
}

impl Default for TemplateSchema {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateSchema {
    /// Schema containing only the built-in definitions
    pub fn builtin() -> Self {
        let any_members = ["null", "boolean", "number", "string", "sequence", "mapping"]
            .iter()
            .map(|name| name.to_string())
            .collect();

        let definitions = [
            Definition::builtin("null", DefinitionKind::Null),
            Definition::builtin("boolean", DefinitionKind::Boolean),
            Definition::builtin("number", DefinitionKind::Number),
            Definition::builtin("string", DefinitionKind::String(StringDefinition::default())),
            Definition::builtin(
                "sequence",
                DefinitionKind::Sequence {
                    item_type: "any".to_string(),
                },
            ),
            Definition::builtin(
                "mapping",
                DefinitionKind::Mapping(MappingDefinition {
                    properties: IndexMap::new(),
                    loose_key_type: Some("string".to_string()),
                    loose_value_type: Some("any".to_string()),
                }),
            ),
            Definition::builtin("any", DefinitionKind::OneOf(any_members)),
            Definition::builtin(
                "non-empty-string",
                DefinitionKind::String(StringDefinition {
                    require_non_empty: true,
                    ..StringDefinition::default()
                }),
            ),
            Definition::builtin(
                "sequence-of-non-empty-string",
                DefinitionKind::Sequence {
                    item_type: "non-empty-string".to_string(),
                },
            ),
        ];

        Self {
            version: None,
            definitions: definitions
                .into_iter()
                .map(|definition| (definition.name.clone(), definition))
                .collect(),
        }
    }

    pub fn from_yaml(source: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_yaml::from_str(source)
            .map_err(|e| SchemaError::new(format!("invalid schema YAML: {}", e)))?;
        Self::from_file(file)
    }

    pub fn from_json(source: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = serde_json::from_str(source)
            .map_err(|e| SchemaError::new(format!("invalid schema JSON: {}", e)))?;
        Self::from_file(file)
    }

    fn from_file(file: SchemaFile) -> Result<Self, SchemaError> {
        let mut schema = Self::builtin();
        schema.version = file.version.and_then(|version| match version {
            serde_yaml::Value::String(s) => Some(s),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        for (name, definition) in file.definitions {
            if schema.definitions.contains_key(&name) {
                return Err(SchemaError::in_definition(
                    &name,
                    "built-in definitions cannot be redefined",
                ));
            }
            let definition = Definition::from_file(&name, definition)?;
            schema.definitions.insert(name, definition);
        }

        schema.validate()?;
        tracing::debug!(
            definitions = schema.definitions.len(),
            version = schema.version.as_deref().unwrap_or("-"),
            "loaded template schema"
        );
        Ok(schema)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        for definition in self.definitions.values() {
            for reference in definition.references() {
                if !self.definitions.contains_key(reference) {
                    return Err(SchemaError::in_definition(
                        &definition.name,
                        format!("unknown type '{}'", reference),
                    ));
                }
            }
        }

        for definition in self.definitions.values() {
            let mut chain = vec![definition.name.as_str()];
            self.check_one_of_cycle(definition, &mut chain)?;
        }

        Ok(())
    }

    fn check_one_of_cycle<'s>(
        &'s self,
        definition: &'s Definition,
        chain: &mut Vec<&'s str>,
    ) -> Result<(), SchemaError> {
        let DefinitionKind::OneOf(members) = &definition.kind else {
            return Ok(());
        };
        for member in members {
            if chain.contains(&member.as_str()) {
                chain.push(member);
                return Err(SchemaError::in_definition(
                    chain[0],
                    format!("one-of cycle: {}", chain.join(" -> ")),
                ));
            }
            if let Some(next) = self.definitions.get(member) {
                chain.push(member);
                self.check_one_of_cycle(next, chain)?;
                chain.pop();
            }
        }
        Ok(())
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&Definition> {
        self.definitions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Concrete definitions reachable from `name` through one-of, deduplicated
    pub fn resolve(&self, name: &str) -> Vec<&Definition> {
        let mut resolved = Vec::new();
        let mut seen = HashSet::new();
        self.collect(name, &mut resolved, &mut seen);
        resolved
    }

    fn collect<'s>(
        &'s self,
        name: &str,
        resolved: &mut Vec<&'s Definition>,
        seen: &mut HashSet<&'s str>,
    ) {
        let Some(definition) = self.definitions.get(name) else {
            return;
        };
        if !seen.insert(definition.name.as_str()) {
            return;
        }
        match &definition.kind {
            DefinitionKind::OneOf(members) => {
                for member in members {
                    self.collect(member, resolved, seen);
                }
            }
            _ => resolved.push(definition),
        }
    }

    /// Definition set for a position typed by any of `names`
    pub fn definition_set<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> DefinitionSet<'_> {
        let mut set = DefinitionSet::default();
        let mut seen = HashSet::new();
        for name in names {
            let Some(definition) = self.definitions.get(name) else {
                continue;
            };
            set.names.push(definition.name.as_str());
            if let Some(context) = &definition.context {
                set.context
                    .get_or_insert_with(Vec::new)
                    .extend(context.iter().cloned());
            }
            self.collect(name, &mut set.definitions, &mut seen);
        }
        set
    }
}

/// Concrete definitions a document position may match
#[derive(Debug, Clone, Default)]
pub struct DefinitionSet<'s> {
    names: Vec<&'s str>,
    definitions: Vec<&'s Definition>,
    context: Option<Vec<String>>,
}

impl<'s> DefinitionSet<'s> {
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'s Definition> + '_ {
        self.definitions.iter().copied()
    }

    /// Allowed named values declared for this position
    pub fn context(&self) -> Option<&[String]> {
        self.context.as_deref()
    }

    /// Whether a scalar of `kind` is accepted without further constraints
    pub fn allows(&self, kind: ValueKind) -> bool {
        self.iter().any(|definition| {
            matches!(
                (&definition.kind, kind),
                (DefinitionKind::Null, ValueKind::Null)
                    | (DefinitionKind::Boolean, ValueKind::Boolean)
                    | (DefinitionKind::Number, ValueKind::Number)
            )
        })
    }

    pub fn strings(&self) -> impl Iterator<Item = &'s StringDefinition> + '_ {
        self.iter().filter_map(|definition| match &definition.kind {
            DefinitionKind::String(string) => Some(string),
            _ => None,
        })
    }

    pub fn has_strings(&self) -> bool {
        self.strings().next().is_some()
    }

    pub fn accepts_string(&self, value: &str) -> bool {
        self.strings().any(|string| string.accepts(value))
    }

    /// Item types of the sequence definitions
    pub fn item_types(&self) -> impl Iterator<Item = &'s str> + '_ {
        self.iter().filter_map(|definition| match &definition.kind {
            DefinitionKind::Sequence { item_type } => Some(item_type.as_str()),
            _ => None,
        })
    }

    pub fn mappings(&self) -> Vec<&'s MappingDefinition> {
        self.iter()
            .filter_map(|definition| match &definition.kind {
                DefinitionKind::Mapping(mapping) => Some(mapping),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for DefinitionSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names.join(" or "))
    }
}
