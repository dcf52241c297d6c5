// Template Module
// Token tree, reader, schema and the schema-guided expansion engine

pub mod bindings;
pub mod engine;
pub mod error;
pub mod parameters;
pub mod reader;
pub mod schema;
pub mod token;

pub use bindings::{Bindings, DeferredTemplate};
pub use engine::{ExpandedDocument, TemplateEngine, TemplateOptions, SECRET_MASK};
pub use error::{DocumentFormat, ParseError, TemplateError, TemplateErrorKind, TemplateErrors};
pub use parameters::{
    parse_parameters, resolve_parameters, take_parameters, ParameterDeclaration, ParameterType,
};
pub use reader::TemplateReader;
pub use schema::{
    Definition, DefinitionKind, DefinitionSet, MappingDefinition, PropertyDefinition,
    SchemaError, StringDefinition, TemplateSchema,
};
pub use token::{DocumentPath, ExpressionToken, PathSegment, TemplateToken};
