// Template token tree
// Document nodes with embedded expressions, before schema-guided expansion

use std::fmt;

/// A document node as read from YAML or JSON
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateToken {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Sequence(Vec<TemplateToken>),
    /// Entries in document order. Keys are `String` or `Expression` tokens.
    Mapping(Vec<(TemplateToken, TemplateToken)>),
    Expression(ExpressionToken),
}

/// A `${{ }}` span occupying a whole scalar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpressionToken {
    /// Plain expression whose value replaces the node
    Basic(String),
    Insert,
    If(String),
    ElseIf(String),
    Else,
    Each { variable: String, collection: String },
}

impl TemplateToken {
    pub fn string(value: impl Into<String>) -> Self {
        TemplateToken::String(value.into())
    }

    pub fn expression(text: impl Into<String>) -> Self {
        TemplateToken::Expression(ExpressionToken::Basic(text.into()))
    }

    /// Human-readable node type for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            TemplateToken::Null => "null",
            TemplateToken::Boolean(_) => "boolean",
            TemplateToken::Number(_) => "number",
            TemplateToken::String(_) => "string",
            TemplateToken::Sequence(_) => "sequence",
            TemplateToken::Mapping(_) => "mapping",
            TemplateToken::Expression(_) => "expression",
        }
    }

    /// The directive this token carries, if it is one
    pub fn as_directive(&self) -> Option<&ExpressionToken> {
        match self {
            TemplateToken::Expression(expr) if expr.is_directive() => Some(expr),
            _ => None,
        }
    }

    /// `- ${{ if ... }}: body` style sequence item: a one-entry mapping
    /// keyed by a directive
    pub fn as_directive_entry(&self) -> Option<(&ExpressionToken, &TemplateToken)> {
        match self {
            TemplateToken::Mapping(entries) if entries.len() == 1 => {
                let (key, value) = &entries[0];
                key.as_directive().map(|directive| (directive, value))
            }
            _ => None,
        }
    }
}

impl ExpressionToken {
    pub fn is_directive(&self) -> bool {
        !matches!(self, ExpressionToken::Basic(_))
    }

    /// Recognize a directive from the trimmed text inside `${{ }}`
    pub fn parse_directive(inner: &str) -> Option<ExpressionToken> {
        let inner = inner.trim();

        if inner == "insert" {
            Some(ExpressionToken::Insert)
        } else if inner == "else" {
            Some(ExpressionToken::Else)
        } else if let Some(rest) = inner.strip_prefix("if ") {
            Some(ExpressionToken::If(rest.trim().to_string()))
        } else if let Some(rest) = inner.strip_prefix("elseif ") {
            Some(ExpressionToken::ElseIf(rest.trim().to_string()))
        } else if let Some(rest) = inner.strip_prefix("else if ") {
            Some(ExpressionToken::ElseIf(rest.trim().to_string()))
        } else if let Some(rest) = inner.strip_prefix("each ") {
            let rest = rest.trim();
            let (variable, collection) = rest.split_once(" in ")?;
            Some(ExpressionToken::Each {
                variable: variable.trim().to_string(),
                collection: collection.trim().to_string(),
            })
        } else {
            None
        }
    }

    /// Directive keyword, or `None` for a plain expression
    pub fn keyword(&self) -> Option<&'static str> {
        match self {
            ExpressionToken::Basic(_) => None,
            ExpressionToken::Insert => Some("insert"),
            ExpressionToken::If(_) => Some("if"),
            ExpressionToken::ElseIf(_) => Some("elseif"),
            ExpressionToken::Else => Some("else"),
            ExpressionToken::Each { .. } => Some("each"),
        }
    }
}

impl fmt::Display for ExpressionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpressionToken::Basic(text) => write!(f, "${{{{ {} }}}}", text),
            ExpressionToken::Insert => write!(f, "${{{{ insert }}}}"),
            ExpressionToken::If(cond) => write!(f, "${{{{ if {} }}}}", cond),
            ExpressionToken::ElseIf(cond) => write!(f, "${{{{ elseif {} }}}}", cond),
            ExpressionToken::Else => write!(f, "${{{{ else }}}}"),
            ExpressionToken::Each {
                variable,
                collection,
            } => write!(f, "${{{{ each {} in {} }}}}", variable, collection),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location of a node in a document, displayed as `jobs[0].steps[2].script`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DocumentPath {
    segments: Vec<PathSegment>,
}

impl DocumentPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(&self, key: impl Into<String>) -> Self {
        let mut path = self.clone();
        path.segments.push(PathSegment::Key(key.into()));
        path
    }

    pub fn index(&self, index: usize) -> Self {
        let mut path = self.clone();
        path.segments.push(PathSegment::Index(index));
        path
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if i == 0 => write!(f, "{}", key)?,
                PathSegment::Key(key) => write!(f, ".{}", key)?,
                PathSegment::Index(index) => write!(f, "[{}]", index)?,
            }
        }
        Ok(())
    }
}
