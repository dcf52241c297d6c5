// Expression Engine Module
// `${{ }}` expressions: lexing, parsing, the value model and evaluation

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod value;

pub use evaluator::{
    EvalError, EvalErrorKind, EvaluationContext, EvaluationResult, Evaluator, ExpressionEngine,
    ExpressionError, NamedValueProvider, NamedValueResolver, NamedValues,
};
pub use functions::{FunctionArgs, FunctionDescriptor, FunctionTable};
pub use lexer::{tokenize, LexError, Lexer, Position, Token, TokenKind};
pub use parser::{Expr, ExprParser, LogicalOp, ParseErrorKind, ParseExprError, ParserOptions};
pub use value::{format_number, parse_number, ContextValue, Dictionary, ValueKind};
