// Expression Engine Parser
// Parses tokens into an AST for pipeline expressions

use crate::expression::functions::FunctionTable;
use crate::expression::lexer::{tokenize, LexError, Position, Token, TokenKind};
use crate::expression::value::{format_number, ContextValue};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Abstract Syntax Tree node for expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Null, boolean, number or string literal
    Literal(ContextValue),

    /// Context lookup by name: variables, parameters
    NamedValue(String),

    /// Member access: obj.property
    Property { object: Box<Expr>, name: String },

    /// Index access: arr[0], obj['key']
    Index { object: Box<Expr>, index: Box<Expr> },

    /// Projection over all members: obj.* or obj[*]
    Wildcard { object: Box<Expr> },

    /// Function call: eq(a, b), contains(str, 'substr')
    FunctionCall { name: String, args: Vec<Expr> },

    /// Operator application. `!` is unary, comparisons are binary and
    /// `&&`/`||` take two or more operands.
    Logical { op: LogicalOp, operands: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    Not, // !
    Eq,  // ==
    Ne,  // !=
    Lt,  // <
    Le,  // <=
    Gt,  // >
    Ge,  // >=
    And, // &&
    Or,  // ||
}

impl LogicalOp {
    fn symbol(self) -> &'static str {
        match self {
            LogicalOp::Not => "!",
            LogicalOp::Eq => "==",
            LogicalOp::Ne => "!=",
            LogicalOp::Lt => "<",
            LogicalOp::Le => "<=",
            LogicalOp::Gt => ">",
            LogicalOp::Ge => ">=",
            LogicalOp::And => "&&",
            LogicalOp::Or => "||",
        }
    }
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl Expr {
    pub fn literal(value: impl Into<ContextValue>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn named(name: impl Into<String>) -> Self {
        Expr::NamedValue(name.into())
    }

    /// Visit every named value referenced by this expression
    pub fn named_values(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_named_values(&mut names);
        names
    }

    fn collect_named_values<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::NamedValue(name) => names.push(name),
            Expr::Property { object, .. } | Expr::Wildcard { object } => {
                object.collect_named_values(names)
            }
            Expr::Index { object, index } => {
                object.collect_named_values(names);
                index.collect_named_values(names);
            }
            Expr::FunctionCall { args, .. } => {
                args.iter().for_each(|a| a.collect_named_values(names))
            }
            Expr::Logical { operands, .. } => operands
                .iter()
                .for_each(|o| o.collect_named_values(names)),
        }
    }

    fn fmt_receiver(object: &Expr, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Literal receivers would re-lex as part of the literal (e.g. "1.x")
        if matches!(object, Expr::Literal(_)) {
            write!(f, "({})", object)
        } else {
            write!(f, "{}", object)
        }
    }
}

/// Canonical textual form. Re-parsing it yields an equal tree.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => match value {
                ContextValue::Null => write!(f, "null"),
                ContextValue::Boolean(b) => write!(f, "{}", b),
                ContextValue::Number(n) => write!(f, "{}", format_number(*n)),
                ContextValue::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
                // Containers never come out of the parser; render their JSON
                other => write!(f, "fromJson('{}')", other.to_json().replace('\'', "''")),
            },
            Expr::NamedValue(name) => write!(f, "{}", name),
            Expr::Property { object, name } => {
                Self::fmt_receiver(object, f)?;
                write!(f, ".{}", name)
            }
            Expr::Index { object, index } => {
                Self::fmt_receiver(object, f)?;
                write!(f, "[{}]", index)
            }
            Expr::Wildcard { object } => {
                Self::fmt_receiver(object, f)?;
                write!(f, ".*")
            }
            Expr::FunctionCall { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Logical { op, operands } => {
                if *op == LogicalOp::Not {
                    return match operands.first() {
                        Some(operand) => write!(f, "!{}", operand),
                        None => write!(f, "!"),
                    };
                }
                write!(f, "(")?;
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op)?;
                    }
                    write!(f, "{}", operand)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Limits applied while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ParserOptions {
    /// Maximum nesting of groups, calls, `!`, comparison folds and postfix segments
    pub max_depth: usize,
    /// Maximum expression length in characters
    pub max_length: usize,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_length: 21_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The lexer could not recognize part of the input
    UnrecognizedValue,
    /// A token that does not fit the grammar at this point
    UnexpectedSymbol,
    /// Input ended while an expression or closing bracket was required
    UnexpectedEnd,
    /// Function called with too few or too many arguments
    InvalidArgumentCount,
    /// Nesting deeper than the configured maximum
    ExceededMaxDepth,
    /// Expression longer than the configured maximum
    ExceededMaxLength,
    /// Nothing to parse
    EmptyExpression,
}

/// Parser error
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} at {position}")]
pub struct ParseExprError {
    pub kind: ParseErrorKind,
    pub message: String,
    pub position: Position,
    /// Every unrecognized sequence, when `kind` is `UnrecognizedValue`
    pub lex_errors: Vec<LexError>,
}

impl ParseExprError {
    pub fn new(kind: ParseErrorKind, message: impl Into<String>, position: Position) -> Self {
        Self {
            kind,
            message: message.into(),
            position,
            lex_errors: Vec::new(),
        }
    }

    fn from_lex_errors(lex_errors: Vec<LexError>) -> Self {
        let position = lex_errors.first().map(|e| e.position).unwrap_or_default();
        let values = lex_errors
            .iter()
            .map(|e| format!("'{}'", e.raw))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            kind: ParseErrorKind::UnrecognizedValue,
            message: format!("unrecognized value(s) {}", values),
            position,
            lex_errors,
        }
    }
}

/// Recursive descent parser for pipeline expressions
pub struct ExprParser<'f> {
    tokens: Vec<Token>,
    position: usize,
    depth: usize,
    functions: Option<&'f FunctionTable>,
    options: ParserOptions,
}

impl ExprParser<'static> {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
            depth: 0,
            functions: None,
            options: ParserOptions::default(),
        }
    }

    /// Parse expression from string, without arity checks
    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        Self::parse_with(input, None, ParserOptions::default())
    }
}

impl<'f> ExprParser<'f> {
    /// Validate function arity against `functions` while parsing
    pub fn with_functions<'g>(self, functions: &'g FunctionTable) -> ExprParser<'g> {
        ExprParser {
            tokens: self.tokens,
            position: self.position,
            depth: self.depth,
            functions: Some(functions),
            options: self.options,
        }
    }

    pub fn with_options(mut self, options: ParserOptions) -> Self {
        self.options = options;
        self
    }

    /// Tokenize and parse `input`, enforcing the length limit
    pub fn parse_with(
        input: &str,
        functions: Option<&'f FunctionTable>,
        options: ParserOptions,
    ) -> Result<Expr, ParseExprError> {
        let length = input.chars().count();
        if length > options.max_length {
            return Err(ParseExprError::new(
                ParseErrorKind::ExceededMaxLength,
                format!(
                    "expression is {} characters long, exceeding the maximum of {}",
                    length, options.max_length
                ),
                Position::new(1, 1),
            ));
        }

        let parser = ExprParser {
            tokens: tokenize(input),
            position: 0,
            depth: 0,
            functions,
            options,
        };
        parser.parse()
    }

    /// Parse the token stream into an expression
    pub fn parse(mut self) -> Result<Expr, ParseExprError> {
        let lex_errors: Vec<LexError> = self.tokens.iter().filter_map(Token::to_lex_error).collect();
        if !lex_errors.is_empty() {
            return Err(ParseExprError::from_lex_errors(lex_errors));
        }

        if self.tokens.is_empty() {
            return Err(ParseExprError::new(
                ParseErrorKind::EmptyExpression,
                "expected an expression",
                Position::new(1, 1),
            ));
        }

        let expr = self.parse_or()?;

        if let Some(token) = self.peek() {
            return Err(self.unexpected(token));
        }

        Ok(expr)
    }

    // Precedence (lowest to highest):
    // 1. Or: ||
    // 2. And: &&
    // 3. Equality: == !=
    // 4. Relational: < <= > >=
    // 5. Unary: !
    // 6. Postfix: . [] .* [*]

    fn parse_or(&mut self) -> Result<Expr, ParseExprError> {
        let first = self.parse_and()?;
        let mut operands = vec![first];

        while self.check(&TokenKind::Or) {
            self.advance();
            operands.push(self.parse_and()?);
        }

        Ok(Self::chain(LogicalOp::Or, operands))
    }

    fn parse_and(&mut self) -> Result<Expr, ParseExprError> {
        let first = self.parse_equality()?;
        let mut operands = vec![first];

        while self.check(&TokenKind::And) {
            self.advance();
            operands.push(self.parse_equality()?);
        }

        Ok(Self::chain(LogicalOp::And, operands))
    }

    fn chain(op: LogicalOp, mut operands: Vec<Expr>) -> Expr {
        if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::Logical { op, operands }
        }
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_relational()?;
        let mut folds = 0;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Eq) => LogicalOp::Eq,
                Some(TokenKind::Ne) => LogicalOp::Ne,
                _ => break,
            };

            let position = self.advance().map(|t| t.position).unwrap_or_default();
            self.enter(position)?;
            folds += 1;
            let right = self.parse_relational()?;
            left = Expr::Logical {
                op,
                operands: vec![left, right],
            };
        }

        self.depth -= folds;
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseExprError> {
        let mut left = self.parse_unary()?;
        let mut folds = 0;

        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Lt) => LogicalOp::Lt,
                Some(TokenKind::Le) => LogicalOp::Le,
                Some(TokenKind::Gt) => LogicalOp::Gt,
                Some(TokenKind::Ge) => LogicalOp::Ge,
                _ => break,
            };

            let position = self.advance().map(|t| t.position).unwrap_or_default();
            self.enter(position)?;
            folds += 1;
            let right = self.parse_unary()?;
            left = Expr::Logical {
                op,
                operands: vec![left, right],
            };
        }

        self.depth -= folds;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseExprError> {
        if let Some(token) = self.peek().filter(|t| t.kind == TokenKind::Not) {
            let position = token.position;
            self.advance();
            self.enter(position)?;
            let operand = self.parse_unary()?;
            self.exit();
            return Ok(Expr::Logical {
                op: LogicalOp::Not,
                operands: vec![operand],
            });
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseExprError> {
        let mut expr = self.parse_primary()?;
        // each segment wraps the receiver one level deeper
        let mut segments = 0;

        loop {
            match self.peek_kind() {
                Some(TokenKind::Dereference) => {
                    let position = self.advance().map(|t| t.position).unwrap_or_default();
                    self.enter(position)?;
                    segments += 1;
                    let token = self.next_required("a property name after '.'")?;
                    expr = match token.kind {
                        TokenKind::PropertyName(name) => Expr::Property {
                            object: Box::new(expr),
                            name,
                        },
                        TokenKind::Wildcard => Expr::Wildcard {
                            object: Box::new(expr),
                        },
                        _ => return Err(self.unexpected(token)),
                    };
                }
                Some(TokenKind::StartIndex) => {
                    let open = self.advance().map(|t| t.position).unwrap_or_default();
                    self.enter(open)?;
                    segments += 1;

                    let is_wildcard = self.check(&TokenKind::Wildcard)
                        && matches!(
                            self.tokens.get(self.position + 1).map(|t| &t.kind),
                            Some(TokenKind::EndIndex)
                        );
                    if is_wildcard {
                        self.advance();
                        self.advance();
                        expr = Expr::Wildcard {
                            object: Box::new(expr),
                        };
                    } else {
                        let index = self.parse_or()?;
                        self.expect(&TokenKind::EndIndex, "']'")?;
                        expr = Expr::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                        };
                    }
                }
                _ => break,
            }
        }

        self.depth -= segments;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseExprError> {
        let token = self.next_required("an expression")?;

        match token.kind {
            TokenKind::Null => Ok(Expr::Literal(ContextValue::Null)),
            TokenKind::Boolean(b) => Ok(Expr::Literal(ContextValue::Boolean(b))),
            TokenKind::Number(n) => Ok(Expr::Literal(ContextValue::Number(n))),
            TokenKind::String(s) => Ok(Expr::Literal(ContextValue::String(s))),
            TokenKind::NamedValue(name) => Ok(Expr::NamedValue(name)),
            TokenKind::Function(name) => {
                self.enter(token.position)?;
                let args = self.parse_args()?;
                self.exit();
                self.check_arity(&name, args.len(), token.position)?;
                Ok(Expr::FunctionCall { name, args })
            }
            TokenKind::StartGroup => {
                self.enter(token.position)?;
                let expr = self.parse_or()?;
                self.expect(&TokenKind::EndGroup, "')'")?;
                self.exit();
                Ok(expr)
            }
            _ => Err(self.unexpected(token)),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseExprError> {
        self.expect(&TokenKind::StartParameters, "'('")?;

        let mut args = Vec::new();

        if self.check(&TokenKind::EndParameters) {
            self.advance();
            return Ok(args);
        }

        loop {
            args.push(self.parse_or()?);

            match self.peek_kind() {
                Some(TokenKind::Separator) => {
                    self.advance();
                }
                Some(TokenKind::EndParameters) => {
                    self.advance();
                    return Ok(args);
                }
                Some(_) => {
                    let token = self.tokens[self.position].clone();
                    return Err(self.unexpected(token));
                }
                None => return Err(self.unexpected_end("')'")),
            }
        }
    }

    fn check_arity(&self, name: &str, count: usize, position: Position) -> Result<(), ParseExprError> {
        let Some(descriptor) = self.functions.and_then(|table| table.get(name)) else {
            return Ok(());
        };

        if count < descriptor.min_args || count > descriptor.max_args {
            return Err(ParseExprError::new(
                ParseErrorKind::InvalidArgumentCount,
                format!(
                    "function '{}' expects {} but got {}",
                    descriptor.name,
                    descriptor.arity_description(),
                    count
                ),
                position,
            ));
        }

        Ok(())
    }

    fn enter(&mut self, position: Position) -> Result<(), ParseExprError> {
        self.depth += 1;
        if self.depth > self.options.max_depth {
            return Err(ParseExprError::new(
                ParseErrorKind::ExceededMaxDepth,
                format!(
                    "expression nesting exceeds the maximum depth of {}",
                    self.options.max_depth
                ),
                position,
            ));
        }
        Ok(())
    }

    fn exit(&mut self) {
        self.depth -= 1;
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).cloned()
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.position).map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        self.position += 1;
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind()
            .is_some_and(|k| std::mem::discriminant(k) == std::mem::discriminant(kind))
    }

    fn next_required(&mut self, expected: &str) -> Result<Token, ParseExprError> {
        match self.advance() {
            Some(token) => Ok(token),
            None => Err(self.unexpected_end(expected)),
        }
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> Result<(), ParseExprError> {
        if self.check(kind) {
            self.advance();
            return Ok(());
        }

        match self.peek() {
            Some(token) => Err(ParseExprError::new(
                ParseErrorKind::UnexpectedSymbol,
                format!("expected {} but found '{}'", expected, token.raw),
                token.position,
            )),
            None => Err(self.unexpected_end(expected)),
        }
    }

    fn unexpected(&self, token: Token) -> ParseExprError {
        ParseExprError::new(
            ParseErrorKind::UnexpectedSymbol,
            format!("unexpected symbol '{}'", token.raw),
            token.position,
        )
    }

    fn unexpected_end(&self, expected: &str) -> ParseExprError {
        let position = self
            .tokens
            .last()
            .map(|t| Position::new(t.position.line, t.position.column + t.raw.chars().count()))
            .unwrap_or_else(|| Position::new(1, 1));
        ParseExprError::new(
            ParseErrorKind::UnexpectedEnd,
            format!("unexpected end of expression, expected {}", expected),
            position,
        )
    }
}
