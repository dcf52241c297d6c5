// Expression Engine Lexer
// Tokenizes the body of a ${{ }} expression

use crate::expression::value::parse_number;

use std::fmt;

use thiserror::Error;

/// Line and column of a token inside an expression, both 1-indexed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Token kinds for pipeline expressions
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Punctuation
    StartGroup,      // (
    StartParameters, // ( directly after a function name
    EndGroup,        // )
    EndParameters,   // ) closing a function call
    StartIndex,      // [
    EndIndex,        // ]
    Separator,       // ,
    Dereference,     // .
    Wildcard,        // *

    // Logical operators
    Not,  // !
    Eq,   // ==
    Ne,   // !=
    Lt,   // <
    Le,   // <=
    Gt,   // >
    Ge,   // >=
    And,  // &&
    Or,   // ||

    // Values
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    PropertyName(String),
    Function(String),
    NamedValue(String),

    /// Unrecognized character sequence
    Unexpected,
}

impl TokenKind {
    /// Tokens after which a `.` dereferences rather than starting a number
    fn ends_operand(&self) -> bool {
        matches!(
            self,
            TokenKind::EndGroup
                | TokenKind::EndParameters
                | TokenKind::EndIndex
                | TokenKind::Wildcard
                | TokenKind::Null
                | TokenKind::Boolean(_)
                | TokenKind::Number(_)
                | TokenKind::String(_)
                | TokenKind::PropertyName(_)
                | TokenKind::NamedValue(_)
        )
    }
}

/// A token with the raw text it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub raw: String,
    pub position: Position,
}

impl Token {
    pub fn new(kind: TokenKind, raw: impl Into<String>, position: Position) -> Self {
        Self {
            kind,
            raw: raw.into(),
            position,
        }
    }

    /// The lexer failure this token stands for, if it is `Unexpected`
    pub fn to_lex_error(&self) -> Option<LexError> {
        match self.kind {
            TokenKind::Unexpected => Some(LexError {
                raw: self.raw.clone(),
                position: self.position,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Unrecognized character sequence
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized value '{raw}' at {position}")]
pub struct LexError {
    pub raw: String,
    pub position: Position,
}

/// Tokenize an expression. Never fails: unrecognized input becomes
/// `Unexpected` tokens which the parser rejects.
pub fn tokenize(input: &str) -> Vec<Token> {
    Lexer::new(input).tokenize()
}

/// Lexer for pipeline expressions
pub struct Lexer {
    chars: Vec<char>,
    index: usize,
    line: usize,
    column: usize,
    last: Option<TokenKind>,
    // open '(' and '[' tokens, innermost last
    unclosed: Vec<TokenKind>,
}

impl Lexer {
    pub fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            index: 0,
            line: 1,
            column: 1,
            last: None,
            unclosed: Vec::new(),
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_token() {
            tokens.push(token);
        }
        tokens
    }

    /// Get the next token, or `None` at the end of input
    pub fn next_token(&mut self) -> Option<Token> {
        self.skip_whitespace();

        let ch = self.peek()?;
        let position = self.position();

        let token = match ch {
            '(' => {
                self.advance();
                let kind = if matches!(self.last, Some(TokenKind::Function(_))) {
                    TokenKind::StartParameters
                } else {
                    TokenKind::StartGroup
                };
                self.unclosed.push(kind.clone());
                Token::new(kind, "(", position)
            }
            ')' => {
                self.advance();
                let kind = match self.unclosed.pop() {
                    Some(TokenKind::StartParameters) => TokenKind::EndParameters,
                    _ => TokenKind::EndGroup,
                };
                Token::new(kind, ")", position)
            }
            '[' => {
                self.advance();
                self.unclosed.push(TokenKind::StartIndex);
                Token::new(TokenKind::StartIndex, "[", position)
            }
            ']' => {
                self.advance();
                self.unclosed.pop();
                Token::new(TokenKind::EndIndex, "]", position)
            }
            ',' => {
                self.advance();
                Token::new(TokenKind::Separator, ",", position)
            }
            '*' => {
                self.advance();
                Token::new(TokenKind::Wildcard, "*", position)
            }
            '.' => {
                let after_operand = self.last.as_ref().is_some_and(TokenKind::ends_operand);
                let digit_follows = self.peek_at(1).is_some_and(|c| c.is_ascii_digit());
                if !after_operand && digit_follows {
                    self.read_number(position)
                } else {
                    self.advance();
                    Token::new(TokenKind::Dereference, ".", position)
                }
            }
            '!' => self.read_operator(position, '=', TokenKind::Ne, Some(TokenKind::Not)),
            '=' => self.read_operator(position, '=', TokenKind::Eq, None),
            '<' => self.read_operator(position, '=', TokenKind::Le, Some(TokenKind::Lt)),
            '>' => self.read_operator(position, '=', TokenKind::Ge, Some(TokenKind::Gt)),
            '&' => self.read_operator(position, '&', TokenKind::And, None),
            '|' => self.read_operator(position, '|', TokenKind::Or, None),
            '\'' => self.read_string(position),
            '0'..='9' | '-' | '+' => self.read_number(position),
            c if c.is_alphabetic() || c == '_' => self.read_keyword(position),
            _ => self.read_unexpected(position),
        };

        self.last = Some(token.kind.clone());
        Some(token)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.index).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.index + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.chars.get(self.index).copied()?;
        self.index += 1;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn position(&self) -> Position {
        Position::new(self.line, self.column)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.advance();
        }
    }

    fn read_operator(
        &mut self,
        position: Position,
        second: char,
        pair: TokenKind,
        single: Option<TokenKind>,
    ) -> Token {
        let first = self.advance().unwrap_or_default();
        if self.peek() == Some(second) {
            self.advance();
            return Token::new(pair, format!("{}{}", first, second), position);
        }
        match single {
            Some(kind) => Token::new(kind, first.to_string(), position),
            None => Token::new(TokenKind::Unexpected, first.to_string(), position),
        }
    }

    fn read_string(&mut self, position: Position) -> Token {
        let mut raw = String::new();
        let mut value = String::new();
        raw.extend(self.advance()); // opening quote

        loop {
            match self.advance() {
                Some('\'') => {
                    raw.push('\'');
                    // Escaped quote ('')
                    if self.peek() == Some('\'') {
                        self.advance();
                        raw.push('\'');
                        value.push('\'');
                    } else {
                        return Token::new(TokenKind::String(value), raw, position);
                    }
                }
                Some(ch) => {
                    raw.push(ch);
                    value.push(ch);
                }
                // Unterminated: the whole remainder is unrecognized
                None => return Token::new(TokenKind::Unexpected, raw, position),
            }
        }
    }

    fn read_number(&mut self, position: Position) -> Token {
        let mut raw = String::new();
        while let Some(ch) = self.peek() {
            if is_delimiter(ch) {
                break;
            }
            raw.push(ch);
            self.advance();
        }

        let value = parse_number(&raw);
        if value.is_nan() && raw != "NaN" {
            Token::new(TokenKind::Unexpected, raw, position)
        } else {
            Token::new(TokenKind::Number(value), raw, position)
        }
    }

    fn read_keyword(&mut self, position: Position) -> Token {
        let mut raw = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                raw.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        if matches!(self.last, Some(TokenKind::Dereference)) {
            return Token::new(TokenKind::PropertyName(raw.clone()), raw, position);
        }

        let kind = match raw.to_lowercase().as_str() {
            "true" => TokenKind::Boolean(true),
            "false" => TokenKind::Boolean(false),
            "null" => TokenKind::Null,
            _ if raw == "NaN" => TokenKind::Number(f64::NAN),
            _ if raw == "Infinity" => TokenKind::Number(f64::INFINITY),
            _ if self.next_non_whitespace() == Some('(') => TokenKind::Function(raw.clone()),
            _ => TokenKind::NamedValue(raw.clone()),
        };
        Token::new(kind, raw, position)
    }

    fn read_unexpected(&mut self, position: Position) -> Token {
        let mut raw = String::new();
        raw.extend(self.advance());
        while let Some(ch) = self.peek() {
            if is_delimiter(ch) || ch == '.' || ch == '*' {
                break;
            }
            raw.push(ch);
            self.advance();
        }
        Token::new(TokenKind::Unexpected, raw, position)
    }

    fn next_non_whitespace(&self) -> Option<char> {
        self.chars[self.index..]
            .iter()
            .copied()
            .find(|c| !c.is_whitespace())
    }
}

fn is_delimiter(ch: char) -> bool {
    ch.is_whitespace()
        || matches!(
            ch,
            '(' | ')' | '[' | ']' | ',' | '!' | '=' | '<' | '>' | '&' | '|' | '\'' | '*'
        )
}
