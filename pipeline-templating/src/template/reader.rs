// Template reader
// Converts parsed YAML/JSON documents into template tokens, splitting ${{ }} spans

use crate::error::{TemplatingError, TemplatingResult};
use crate::expression::value::format_number;
use crate::template::error::{
    DocumentFormat, ParseError, TemplateError, TemplateErrorKind, TemplateErrors,
};
use crate::template::token::{DocumentPath, ExpressionToken, TemplateToken};

const EXPRESSION_START: &str = "${{";
const EXPRESSION_END: &str = "}}";

/// Piece of a scalar: literal text or the inside of a `${{ }}` span
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Expression(String),
}

/// Reads documents into [`TemplateToken`] trees
#[derive(Debug, Default)]
pub struct TemplateReader {
    errors: TemplateErrors,
}

impl TemplateReader {
    /// Parse YAML text into a token tree
    pub fn read_yaml(source: &str) -> TemplatingResult<TemplateToken> {
        let value: serde_yaml::Value = serde_yaml::from_str(source)
            .map_err(|e| TemplatingError::Parse(ParseError::from_yaml_error(&e, source)))?;
        Ok(Self::from_yaml_value(&value)?)
    }

    /// Parse JSON text into a token tree
    pub fn read_json(source: &str) -> TemplatingResult<TemplateToken> {
        let json: serde_json::Value = serde_json::from_str(source)
            .map_err(|e| TemplatingError::Parse(ParseError::from_json_error(&e, source)))?;
        let value = serde_yaml::to_value(&json).map_err(|e| {
            TemplatingError::Parse(ParseError::new(e.to_string(), 1, 1, DocumentFormat::Json))
        })?;
        Ok(Self::from_yaml_value(&value)?)
    }

    /// Convert an already parsed document, collecting every reader error
    pub fn from_yaml_value(value: &serde_yaml::Value) -> Result<TemplateToken, TemplateErrors> {
        let mut reader = TemplateReader::default();
        let token = reader.read_node(value, &DocumentPath::root());
        if reader.errors.is_empty() {
            Ok(token)
        } else {
            Err(reader.errors)
        }
    }

    /// Read a scalar in value position
    pub fn read_scalar(text: &str) -> Result<TemplateToken, TemplateError> {
        let token = read_string(text)?;
        match token.as_directive() {
            Some(directive) => Err(misplaced_directive(directive)),
            None => Ok(token),
        }
    }

    fn read_node(&mut self, value: &serde_yaml::Value, path: &DocumentPath) -> TemplateToken {
        match value {
            serde_yaml::Value::Null => TemplateToken::Null,
            serde_yaml::Value::Bool(b) => TemplateToken::Boolean(*b),
            serde_yaml::Value::Number(n) => TemplateToken::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_yaml::Value::String(s) => match Self::read_scalar(s) {
                Ok(token) => token,
                Err(e) => {
                    self.errors.push(e.with_path(path));
                    TemplateToken::Null
                }
            },
            serde_yaml::Value::Sequence(items) => TemplateToken::Sequence(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.read_node(item, &path.index(i)))
                    .collect(),
            ),
            serde_yaml::Value::Mapping(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, value) in map {
                    let Some(key) = self.read_key(key, path) else {
                        continue;
                    };
                    let child = match &key {
                        TemplateToken::String(name) => path.key(name.as_str()),
                        other => path.key(other.to_string_lossy()),
                    };
                    let value = self.read_node(value, &child);
                    entries.push((key, value));
                }
                TemplateToken::Mapping(entries)
            }
            serde_yaml::Value::Tagged(tagged) => self.read_node(&tagged.value, path),
        }
    }

    fn read_key(&mut self, key: &serde_yaml::Value, path: &DocumentPath) -> Option<TemplateToken> {
        let result = match key {
            serde_yaml::Value::String(s) => read_string(s),
            serde_yaml::Value::Bool(b) => Ok(TemplateToken::String(b.to_string())),
            serde_yaml::Value::Number(n) => Ok(TemplateToken::String(format_number(
                n.as_f64().unwrap_or(f64::NAN),
            ))),
            serde_yaml::Value::Null => Ok(TemplateToken::string("null")),
            serde_yaml::Value::Tagged(tagged) => return self.read_key(&tagged.value, path),
            serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => Err(
                TemplateError::new("mapping keys must be scalars", TemplateErrorKind::ParseError),
            ),
        };

        match result {
            Ok(token) => Some(token),
            Err(e) => {
                self.errors.push(e.with_path(path));
                None
            }
        }
    }
}

impl TemplateToken {
    /// Text used to name a key in document paths
    fn to_string_lossy(&self) -> String {
        match self {
            TemplateToken::String(s) => s.clone(),
            TemplateToken::Expression(expr) => expr.to_string(),
            other => other.type_name().to_string(),
        }
    }
}

/// Read a string scalar in key position, where directives are legal
fn read_string(text: &str) -> Result<TemplateToken, TemplateError> {
    if !text.contains(EXPRESSION_START) {
        return Ok(TemplateToken::string(text));
    }

    let segments = split_segments(text)?;

    if let [Segment::Expression(inner)] = segments.as_slice() {
        if let Some(directive) = ExpressionToken::parse_directive(inner) {
            return Ok(TemplateToken::Expression(directive));
        }
        if let Some(literal) = string_literal(inner) {
            return Ok(TemplateToken::String(literal));
        }
        return Ok(TemplateToken::expression(inner.as_str()));
    }

    let mut format = String::new();
    let mut args: Vec<&str> = Vec::new();
    for segment in &segments {
        match segment {
            Segment::Literal(text) => push_format_literal(&mut format, text),
            Segment::Expression(inner) => {
                if let Some(directive) = ExpressionToken::parse_directive(inner) {
                    return Err(misplaced_directive(&directive));
                }
                match string_literal(inner) {
                    Some(literal) => push_format_literal(&mut format, &literal),
                    None => {
                        format.push_str(&format!("{{{}}}", args.len()));
                        args.push(inner);
                    }
                }
            }
        }
    }

    if args.is_empty() {
        // only literals, e.g. `a ${{ '{{' }} b`
        let text = segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.clone(),
                Segment::Expression(inner) => string_literal(inner).unwrap_or_default(),
            })
            .collect::<String>();
        return Ok(TemplateToken::String(text));
    }

    Ok(TemplateToken::expression(format!(
        "format('{}', {})",
        format,
        args.join(", ")
    )))
}

/// Split text into literal and expression segments.
///
/// `}}` inside a single-quoted expression string does not close the span.
fn split_segments(text: &str) -> Result<Vec<Segment>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(EXPRESSION_START) {
        if start > 0 {
            segments.push(Segment::Literal(rest[..start].to_string()));
        }

        let body = &rest[start + EXPRESSION_START.len()..];
        let end = find_expression_end(body).ok_or_else(|| {
            TemplateError::new(
                format!("unclosed expression in '{}': missing '}}}}'", text),
                TemplateErrorKind::ParseError,
            )
        })?;

        let inner = body[..end].trim();
        if inner.is_empty() {
            return Err(TemplateError::new(
                format!("empty expression in '{}'", text),
                TemplateErrorKind::ParseError,
            ));
        }
        segments.push(Segment::Expression(inner.to_string()));
        rest = &body[end + EXPRESSION_END.len()..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest.to_string()));
    }

    Ok(segments)
}

fn find_expression_end(body: &str) -> Option<usize> {
    let mut in_string = false;
    for (i, c) in body.char_indices() {
        match c {
            // `''` escapes toggle twice
            '\'' => in_string = !in_string,
            '}' if !in_string && body[i..].starts_with(EXPRESSION_END) => return Some(i),
            _ => {}
        }
    }
    None
}

/// Value of `inner` when it is exactly one single-quoted string literal
fn string_literal(inner: &str) -> Option<String> {
    let body = inner.strip_prefix('\'')?.strip_suffix('\'')?;
    let mut value = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            // inside a literal a quote must be doubled
            if chars.next() != Some('\'') {
                return None;
            }
        }
        value.push(c);
    }
    Some(value)
}

fn push_format_literal(format: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '{' => format.push_str("{{"),
            '}' => format.push_str("}}"),
            '\'' => format.push_str("''"),
            c => format.push(c),
        }
    }
}

fn misplaced_directive(directive: &ExpressionToken) -> TemplateError {
    TemplateError::new(
        format!(
            "directive '{}' is only valid as an entire mapping key",
            directive
        ),
        TemplateErrorKind::InvalidDirective,
    )
}
