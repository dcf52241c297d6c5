// Expression Engine Evaluator
// Evaluates AST expressions against named values and a function table

use crate::expression::functions::{FunctionArgs, FunctionTable};
use crate::expression::parser::{Expr, ExprParser, LogicalOp, ParseExprError, ParserOptions};
use crate::expression::value::{ContextValue, Dictionary};

use indexmap::IndexMap;
use thiserror::Error;

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalErrorKind {
    UnknownNamedValue,
    UnknownFunction,
    InvalidArgumentCount,
    InvalidArgument,
    InvalidIndex,
    InvalidProperty,
    InvalidWildcard,
    /// A named value provider failed
    Provider,
    /// A named value depends on itself
    Cycle,
    MaxDepthExceeded,
}

/// Evaluation error
#[derive(Debug, Clone, PartialEq, Error)]
#[error("evaluation error: {message}")]
pub struct EvalError {
    pub kind: EvalErrorKind,
    pub message: String,
}

impl EvalError {
    pub fn new(kind: EvalErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(function: &str, message: impl fmt::Display) -> Self {
        Self::new(
            EvalErrorKind::InvalidArgument,
            format!("{}: {}", function, message),
        )
    }

    /// Whether this error must abort the enclosing subtree rather than be
    /// collected alongside sibling diagnostics
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, EvalErrorKind::Cycle | EvalErrorKind::MaxDepthExceeded)
    }
}

/// A value together with whether it was derived from a secret
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvaluationResult {
    pub value: ContextValue,
    pub is_secret: bool,
}

impl EvaluationResult {
    pub fn new(value: impl Into<ContextValue>) -> Self {
        Self {
            value: value.into(),
            is_secret: false,
        }
    }

    pub fn secret(value: impl Into<ContextValue>) -> Self {
        Self {
            value: value.into(),
            is_secret: true,
        }
    }
}

/// Source of named values for an evaluation
pub trait NamedValueResolver {
    /// Resolve a root name. `Ok(None)` means the name is unknown.
    fn resolve(&self, name: &str) -> Result<Option<EvaluationResult>, EvalError>;

    /// Resolve `name.key` without materializing the whole named value.
    ///
    /// Returns `None` when the resolver has no member-level lookup for
    /// `name`, in which case the evaluator resolves the root and indexes it.
    fn resolve_member(
        &self,
        _name: &str,
        _key: &str,
    ) -> Option<Result<EvaluationResult, EvalError>> {
        None
    }

    /// Whether `name` supports [`resolve_member`](Self::resolve_member).
    /// An indexed root that does is never resolved whole, so its index is
    /// evaluated first.
    fn has_members(&self, _name: &str) -> bool {
        false
    }
}

/// Lazily computed named value
pub trait NamedValueProvider: Send + Sync {
    fn evaluate(&self, name: &str) -> Result<EvaluationResult, EvalError>;
}

impl<F> NamedValueProvider for F
where
    F: Fn(&str) -> Result<EvaluationResult, EvalError> + Send + Sync,
{
    fn evaluate(&self, name: &str) -> Result<EvaluationResult, EvalError> {
        self(name)
    }
}

#[derive(Clone)]
enum NamedValue {
    Value(EvaluationResult),
    Provider(Arc<dyn NamedValueProvider>),
}

/// Named values keyed case-insensitively
#[derive(Clone, Default)]
pub struct NamedValues {
    // lowercase name -> (name, value)
    values: IndexMap<String, (String, NamedValue)>,
}

impl NamedValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ContextValue>) {
        self.insert_result(name, EvaluationResult::new(value));
    }

    /// Insert a value whose derived results are masked
    pub fn insert_secret(&mut self, name: impl Into<String>, value: impl Into<ContextValue>) {
        self.insert_result(name, EvaluationResult::secret(value));
    }

    pub fn insert_result(&mut self, name: impl Into<String>, result: EvaluationResult) {
        let name = name.into();
        self.values
            .insert(name.to_lowercase(), (name, NamedValue::Value(result)));
    }

    /// Insert a value computed on each lookup
    pub fn insert_provider(
        &mut self,
        name: impl Into<String>,
        provider: impl NamedValueProvider + 'static,
    ) {
        let name = name.into();
        self.values.insert(
            name.to_lowercase(),
            (name, NamedValue::Provider(Arc::new(provider))),
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.values().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build from a mapping of names to values, e.g. a parsed variables file
    pub fn from_dictionary(dict: &Dictionary) -> Self {
        let mut values = Self::new();
        for (name, value) in dict.iter() {
            values.insert(name, value.clone());
        }
        values
    }
}

impl NamedValueResolver for NamedValues {
    fn resolve(&self, name: &str) -> Result<Option<EvaluationResult>, EvalError> {
        match self.values.get(&name.to_lowercase()) {
            Some((_, NamedValue::Value(result))) => Ok(Some(result.clone())),
            Some((name, NamedValue::Provider(provider))) => provider.evaluate(name).map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for NamedValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Everything an expression may reference during one evaluation
#[derive(Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub named_values: &'a dyn NamedValueResolver,
    pub functions: &'a FunctionTable,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(named_values: &'a dyn NamedValueResolver, functions: &'a FunctionTable) -> Self {
        Self {
            named_values,
            functions,
        }
    }
}

/// Intermediate result: wildcard segments produce projections that the
/// following postfix segments map over.
enum Evaluated {
    Value { value: ContextValue, is_secret: bool },
    Projection { items: Vec<ContextValue>, is_secret: bool },
}

impl Evaluated {
    fn into_result(self) -> EvaluationResult {
        match self {
            Evaluated::Value { value, is_secret } => EvaluationResult { value, is_secret },
            Evaluated::Projection { items, is_secret } => EvaluationResult {
                value: ContextValue::array(items),
                is_secret,
            },
        }
    }
}

impl From<EvaluationResult> for Evaluated {
    fn from(result: EvaluationResult) -> Self {
        Evaluated::Value {
            value: result.value,
            is_secret: result.is_secret,
        }
    }
}

#[derive(Clone, Copy)]
enum Segment<'s> {
    Property(&'s str),
    Index(&'s ContextValue),
    Wildcard,
}

/// Expression evaluator
pub struct Evaluator<'a> {
    context: EvaluationContext<'a>,
}

impl<'a> Evaluator<'a> {
    pub fn new(context: &EvaluationContext<'a>) -> Self {
        Self { context: *context }
    }

    /// Evaluate an expression
    pub fn evaluate(&self, expr: &Expr) -> Result<EvaluationResult, EvalError> {
        self.eval(expr).map(Evaluated::into_result)
    }

    fn eval(&self, expr: &Expr) -> Result<Evaluated, EvalError> {
        match expr {
            Expr::Literal(value) => Ok(Evaluated::Value {
                value: value.clone(),
                is_secret: false,
            }),

            Expr::NamedValue(name) => self.lookup(name).map(Evaluated::from),

            Expr::Property { object, name } => {
                if let Expr::NamedValue(root) = object.as_ref() {
                    if let Some(result) = self.context.named_values.resolve_member(root, name) {
                        return result.map(Evaluated::from);
                    }
                }
                let receiver = self.eval(object)?;
                self.apply(receiver, Segment::Property(name))
            }

            Expr::Index { object, index } => {
                let member_root = match object.as_ref() {
                    Expr::NamedValue(root) if self.context.named_values.has_members(root) => {
                        Some(root)
                    }
                    _ => None,
                };

                let (receiver, key) = match member_root {
                    Some(root) => {
                        let key = self.evaluate(index)?;
                        if let ContextValue::String(member) = &key.value {
                            if let Some(result) =
                                self.context.named_values.resolve_member(root, member)
                            {
                                return result.map(|r| Evaluated::Value {
                                    value: r.value,
                                    is_secret: r.is_secret || key.is_secret,
                                });
                            }
                        }
                        (self.eval(object)?, key)
                    }
                    None => {
                        let receiver = self.eval(object)?;
                        (receiver, self.evaluate(index)?)
                    }
                };

                match self.apply(receiver, Segment::Index(&key.value))? {
                    Evaluated::Value { value, is_secret } => Ok(Evaluated::Value {
                        value,
                        is_secret: is_secret || key.is_secret,
                    }),
                    Evaluated::Projection { items, is_secret } => Ok(Evaluated::Projection {
                        items,
                        is_secret: is_secret || key.is_secret,
                    }),
                }
            }

            Expr::Wildcard { object } => {
                let receiver = self.eval(object)?;
                self.apply(receiver, Segment::Wildcard)
            }

            Expr::FunctionCall { name, args } => self.call_function(name, args),

            Expr::Logical { op, operands } => self.eval_logical(*op, operands),
        }
    }

    fn lookup(&self, name: &str) -> Result<EvaluationResult, EvalError> {
        self.context.named_values.resolve(name)?.ok_or_else(|| {
            EvalError::new(
                EvalErrorKind::UnknownNamedValue,
                format!("unrecognized named value '{}'", name),
            )
        })
    }

    fn apply(&self, receiver: Evaluated, segment: Segment<'_>) -> Result<Evaluated, EvalError> {
        match receiver {
            Evaluated::Value { value, is_secret } => {
                let evaluated = match segment {
                    Segment::Wildcard => Evaluated::Projection {
                        items: members(&value)?,
                        is_secret,
                    },
                    Segment::Property(name) => Evaluated::Value {
                        value: property(&value, name)?,
                        is_secret,
                    },
                    Segment::Index(index) => Evaluated::Value {
                        value: index_value(&value, index)?,
                        is_secret,
                    },
                };
                Ok(evaluated)
            }

            // Projections drop members that fail or come back null
            Evaluated::Projection { items, is_secret } => {
                let mut projected = Vec::with_capacity(items.len());
                for item in &items {
                    match segment {
                        Segment::Wildcard => {
                            if let Ok(inner) = members(item) {
                                projected.extend(inner);
                            }
                        }
                        Segment::Property(name) => match property(item, name) {
                            Ok(ContextValue::Null) | Err(_) => {}
                            Ok(value) => projected.push(value),
                        },
                        Segment::Index(index) => match index_value(item, index) {
                            Ok(ContextValue::Null) | Err(_) => {}
                            Ok(value) => projected.push(value),
                        },
                    }
                }
                Ok(Evaluated::Projection {
                    items: projected,
                    is_secret,
                })
            }
        }
    }

    fn call_function(&self, name: &str, args: &[Expr]) -> Result<Evaluated, EvalError> {
        let descriptor = self.context.functions.get(name).ok_or_else(|| {
            EvalError::new(
                EvalErrorKind::UnknownFunction,
                format!("unrecognized function '{}'", name),
            )
        })?;

        if !descriptor.accepts(args.len()) {
            return Err(EvalError::new(
                EvalErrorKind::InvalidArgumentCount,
                format!(
                    "function '{}' expects {} but got {}",
                    descriptor.name,
                    descriptor.arity_description(),
                    args.len()
                ),
            ));
        }

        let call_args = FunctionArgs::new(self, args, descriptor.lazy_from)?;
        let value = descriptor.call(&call_args)?;

        Ok(Evaluated::Value {
            value,
            is_secret: call_args.is_secret(),
        })
    }

    fn eval_logical(&self, op: LogicalOp, operands: &[Expr]) -> Result<Evaluated, EvalError> {
        match op {
            // Short-circuit, yielding the operand that decided the result
            LogicalOp::And | LogicalOp::Or => {
                let mut is_secret = false;
                let mut last = ContextValue::Null;
                for operand in operands {
                    let result = self.evaluate(operand)?;
                    is_secret |= result.is_secret;
                    let decided = match op {
                        LogicalOp::And => !result.value.is_truthy(),
                        _ => result.value.is_truthy(),
                    };
                    last = result.value;
                    if decided {
                        break;
                    }
                }
                Ok(Evaluated::Value {
                    value: last,
                    is_secret,
                })
            }

            LogicalOp::Not => {
                let [operand] = operands else {
                    return Err(operand_count(op, 1, operands.len()));
                };
                let result = self.evaluate(operand)?;
                Ok(Evaluated::Value {
                    value: ContextValue::Boolean(!result.value.is_truthy()),
                    is_secret: result.is_secret,
                })
            }

            _ => {
                let [left, right] = operands else {
                    return Err(operand_count(op, 2, operands.len()));
                };
                let left = self.evaluate(left)?;
                let right = self.evaluate(right)?;

                let outcome = match op {
                    LogicalOp::Eq => left.value.loose_eq(&right.value),
                    LogicalOp::Ne => !left.value.loose_eq(&right.value),
                    _ => left.value.loose_cmp(&right.value).is_some_and(|o| match op {
                        LogicalOp::Lt => o.is_lt(),
                        LogicalOp::Le => o.is_le(),
                        LogicalOp::Gt => o.is_gt(),
                        _ => o.is_ge(),
                    }),
                };

                Ok(Evaluated::Value {
                    value: ContextValue::Boolean(outcome),
                    is_secret: left.is_secret || right.is_secret,
                })
            }
        }
    }
}

fn operand_count(op: LogicalOp, expected: usize, actual: usize) -> EvalError {
    EvalError::new(
        EvalErrorKind::InvalidArgumentCount,
        format!("operator '{}' expects {} operand(s) but got {}", op, expected, actual),
    )
}

/// Members of a wildcard receiver: array items or dictionary values
fn members(receiver: &ContextValue) -> Result<Vec<ContextValue>, EvalError> {
    match receiver {
        ContextValue::Array(items) => Ok(items.to_vec()),
        ContextValue::Dictionary(dict) => Ok(dict.values().cloned().collect()),
        ContextValue::Null => Ok(Vec::new()),
        other => Err(EvalError::new(
            EvalErrorKind::InvalidWildcard,
            format!("cannot apply a wildcard to a {}", other.kind()),
        )),
    }
}

fn property(receiver: &ContextValue, name: &str) -> Result<ContextValue, EvalError> {
    match receiver {
        ContextValue::Dictionary(dict) => Ok(dict.get(name).cloned().unwrap_or_default()),
        ContextValue::Null => Ok(ContextValue::Null),
        other => Err(EvalError::new(
            EvalErrorKind::InvalidProperty,
            format!("cannot read property '{}' of a {}", name, other.kind()),
        )),
    }
}

fn index_value(receiver: &ContextValue, index: &ContextValue) -> Result<ContextValue, EvalError> {
    match receiver {
        ContextValue::Array(items) => {
            if index.is_container() {
                return Err(EvalError::new(
                    EvalErrorKind::InvalidIndex,
                    format!("cannot index an array with a {}", index.kind()),
                ));
            }
            let n = index.to_number();
            if n.is_infinite() {
                return Ok(ContextValue::Null);
            }
            if n.is_nan() || n.fract() != 0.0 {
                return Err(EvalError::new(
                    EvalErrorKind::InvalidIndex,
                    format!("array index '{}' is not an integer", index.as_string()),
                ));
            }
            if n < 0.0 || n >= items.len() as f64 {
                return Ok(ContextValue::Null);
            }
            Ok(items[n as usize].clone())
        }
        ContextValue::Dictionary(dict) => {
            if index.is_container() {
                return Err(EvalError::new(
                    EvalErrorKind::InvalidIndex,
                    format!("cannot index a dictionary with a {}", index.kind()),
                ));
            }
            Ok(dict.get(&index.as_string()).cloned().unwrap_or_default())
        }
        other => Err(EvalError::new(
            EvalErrorKind::InvalidIndex,
            format!("cannot index a {}", other.kind()),
        )),
    }
}

/// Either half of the parse-then-evaluate pipeline failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExpressionError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseExprError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// High-level expression engine
#[derive(Debug, Clone)]
pub struct ExpressionEngine {
    named_values: NamedValues,
    functions: FunctionTable,
    options: ParserOptions,
}

impl ExpressionEngine {
    /// An engine with the built-in function set
    pub fn new(named_values: NamedValues) -> Self {
        Self {
            named_values,
            functions: FunctionTable::builtin(),
            options: ParserOptions::default(),
        }
    }

    pub fn with_functions(mut self, functions: FunctionTable) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_options(mut self, options: ParserOptions) -> Self {
        self.options = options;
        self
    }

    /// Parse with arity checks against this engine's functions
    pub fn parse(&self, expr: &str) -> Result<Expr, ParseExprError> {
        ExprParser::parse_with(expr, Some(&self.functions), self.options)
    }

    /// Evaluate a bare expression (without the `${{ }}` markers)
    pub fn evaluate(&self, expr: &str) -> Result<EvaluationResult, ExpressionError> {
        let ast = self.parse(expr)?;
        let context = EvaluationContext::new(&self.named_values, &self.functions);
        let result = Evaluator::new(&context).evaluate(&ast)?;

        tracing::trace!(
            expression = %ast,
            kind = %result.value.kind(),
            secret = result.is_secret,
            "evaluated expression"
        );

        Ok(result)
    }

    pub fn named_values(&self) -> &NamedValues {
        &self.named_values
    }

    pub fn named_values_mut(&mut self) -> &mut NamedValues {
        &mut self.named_values
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::functions::FunctionDescriptor;
    use pretty_assertions::assert_eq;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn variables() -> ContextValue {
        ContextValue::from_json(&serde_json::json!({
            "x": "ready",
            "count": 3,
            "list": ["a", "b", "c"],
            "nested": [{"a": 1}, {"a": 2}, {"b": 3}],
            "matrix": [[1, 2], [3]],
            "empty": ""
        }))
    }

    fn engine() -> ExpressionEngine {
        let mut named = NamedValues::new();
        named.insert("variables", variables());
        named.insert("parameters", Dictionary::case_insensitive());
        ExpressionEngine::new(named)
    }

    fn eval(expr: &str) -> ContextValue {
        engine().evaluate(expr).unwrap().value
    }

    fn eval_err(expr: &str) -> EvalError {
        match engine().evaluate(expr) {
            Err(ExpressionError::Eval(e)) => e,
            other => panic!("expected evaluation error, got {:?}", other),
        }
    }

    #[test]
    fn test_eval_literals() {
        assert_eq!(eval("null"), ContextValue::Null);
        assert_eq!(eval("'text'"), ContextValue::string("text"));
        assert_eq!(eval("0x1F"), ContextValue::Number(31.0));
    }

    #[test]
    fn test_eval_property_and_index() {
        assert_eq!(eval("variables.x"), ContextValue::string("ready"));
        assert_eq!(eval("variables['X']"), ContextValue::string("ready"));
        assert_eq!(eval("variables.list[1]"), ContextValue::string("b"));
        assert_eq!(eval("variables.list['2']"), ContextValue::string("c"));
    }

    #[test]
    fn test_eval_array_index_in_and_out_of_range() {
        let list = ["a", "b", "c"];
        for (i, expected) in list.iter().enumerate() {
            assert_eq!(
                eval(&format!("variables.list[{}]", i)),
                ContextValue::string(*expected)
            );
        }
        assert_eq!(eval("variables.list[3]"), ContextValue::Null);
        assert_eq!(eval("variables.list[100]"), ContextValue::Null);
        assert_eq!(eval("variables.list[-1]"), ContextValue::Null);
    }

    #[test]
    fn test_eval_invalid_indexes() {
        assert_eq!(eval_err("variables.list[1.5]").kind, EvalErrorKind::InvalidIndex);
        assert_eq!(eval_err("variables.list['abc']").kind, EvalErrorKind::InvalidIndex);
        assert_eq!(eval_err("variables.list[variables.list]").kind, EvalErrorKind::InvalidIndex);
        assert_eq!(eval_err("variables.x[0]").kind, EvalErrorKind::InvalidIndex);
        assert_eq!(eval_err("variables.missing[0]").kind, EvalErrorKind::InvalidIndex);
    }

    #[test]
    fn test_eval_missing_key_is_null() {
        assert_eq!(eval("variables.missing"), ContextValue::Null);
        assert_eq!(eval("variables['missing']"), ContextValue::Null);
        assert_eq!(eval("variables.missing.deeper"), ContextValue::Null);
    }

    #[test]
    fn test_eval_property_on_scalar_is_error() {
        assert_eq!(eval_err("variables.x.length").kind, EvalErrorKind::InvalidProperty);
    }

    #[test]
    fn test_eval_unknown_names() {
        assert_eq!(eval_err("secrets.token").kind, EvalErrorKind::UnknownNamedValue);
        assert_eq!(eval_err("bogus(1)").kind, EvalErrorKind::UnknownFunction);
        // Named values are case-insensitive
        assert_eq!(eval("VARIABLES.x"), ContextValue::string("ready"));
    }

    #[test]
    fn test_eval_wildcard_projection() {
        assert_eq!(
            eval("variables.nested.*.a"),
            ContextValue::array(vec![1.0.into(), 2.0.into()])
        );
        assert_eq!(
            eval("variables.nested[*].a"),
            ContextValue::array(vec![1.0.into(), 2.0.into()])
        );
        assert_eq!(
            eval("variables.matrix.*.*"),
            ContextValue::array(vec![1.0.into(), 2.0.into(), 3.0.into()])
        );
        assert_eq!(eval("variables.missing.*"), ContextValue::array(vec![]));
        assert_eq!(eval("length(variables.list.*)"), ContextValue::Number(3.0));
        assert_eq!(eval_err("variables.x.*").kind, EvalErrorKind::InvalidWildcard);
    }

    #[test]
    fn test_eval_wildcard_over_dictionary_values() {
        assert_eq!(
            eval("fromJson('{\"a\":{\"v\":1},\"b\":{\"v\":2}}').*.v"),
            ContextValue::array(vec![1.0.into(), 2.0.into()])
        );
    }

    #[test]
    fn test_eval_and_or_return_deciding_operand() {
        assert_eq!(eval("variables.x && variables.count"), ContextValue::Number(3.0));
        assert_eq!(eval("variables.empty && variables.count"), ContextValue::string(""));
        assert_eq!(eval("variables.empty || 'fallback'"), ContextValue::string("fallback"));
        assert_eq!(eval("0 || null"), ContextValue::Null);
        assert_eq!(eval("!variables.x"), ContextValue::Boolean(false));
        assert_eq!(eval("and(variables.x, variables.count)"), ContextValue::Boolean(true));
    }

    #[test]
    fn test_eval_short_circuit_skips_side_effects() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut functions = FunctionTable::builtin();
        functions.register(FunctionDescriptor::new("record", 0, 0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ContextValue::Boolean(true))
        }));
        let engine = engine().with_functions(functions);

        assert_eq!(engine.evaluate("false && record()").unwrap().value, ContextValue::Boolean(false));
        assert_eq!(engine.evaluate("true || record()").unwrap().value, ContextValue::Boolean(true));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(engine.evaluate("true && record()").unwrap().value, ContextValue::Boolean(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eval_comparisons() {
        assert_eq!(eval("variables.x == 'READY'"), ContextValue::Boolean(true));
        assert_eq!(eval("variables.count == '3'"), ContextValue::Boolean(true));
        assert_eq!(eval("variables.count > 2"), ContextValue::Boolean(true));
        assert_eq!(eval("true == 1"), ContextValue::Boolean(true));
        assert_eq!(eval("null == 0"), ContextValue::Boolean(true));
        assert_eq!(eval("NaN == NaN"), ContextValue::Boolean(false));
        assert_eq!(eval("variables.list < variables.list"), ContextValue::Boolean(false));
    }

    #[test]
    fn test_eval_container_equality_is_identity() {
        assert_eq!(eval("variables.list == variables.list"), ContextValue::Boolean(true));
        assert_eq!(
            eval("split('a', ',') == split('a', ',')"),
            ContextValue::Boolean(false)
        );
        assert_eq!(eval("variables.list != variables.nested"), ContextValue::Boolean(true));
    }

    #[test]
    fn test_eval_end_to_end_eq() {
        let mut vars = Dictionary::case_insensitive();
        vars.insert("x", ContextValue::string("ready"));
        let mut named = NamedValues::new();
        named.insert("variables", vars);

        let result = ExpressionEngine::new(named)
            .evaluate("eq(variables.x, 'ready')")
            .unwrap();
        assert_eq!(result.value, ContextValue::Boolean(true));
    }

    #[test]
    fn test_eval_secret_propagation() {
        let mut named = NamedValues::new();
        named.insert_secret("token", "s3cr3t");
        named.insert("user", "bob");
        let engine = ExpressionEngine::new(named);

        assert!(engine.evaluate("format('{0}:{1}', user, token)").unwrap().is_secret);
        assert!(engine.evaluate("length(token)").unwrap().is_secret);
        assert!(engine.evaluate("token == 'x'").unwrap().is_secret);
        assert!(!engine.evaluate("upper(user)").unwrap().is_secret);
        // Deferred arguments that are never evaluated do not taint the result
        assert!(!engine.evaluate("iif(true, user, token)").unwrap().is_secret);
        assert!(engine.evaluate("iif(false, user, token)").unwrap().is_secret);
    }

    #[test]
    fn test_eval_provider() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut named = NamedValues::new();
        named.insert_provider("lazy", move |_: &str| -> Result<EvaluationResult, EvalError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(EvaluationResult::new("computed"))
        });
        named.insert_provider("denied", |name: &str| -> Result<EvaluationResult, EvalError> {
            Err(EvalError::new(
                EvalErrorKind::Provider,
                format!("access to '{}' is not allowed", name),
            ))
        });
        let engine = ExpressionEngine::new(named);

        assert_eq!(engine.evaluate("false && lazy").unwrap().value, ContextValue::Boolean(false));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.evaluate("upper(lazy)").unwrap().value, ContextValue::string("COMPUTED"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = engine.evaluate("denied").unwrap_err();
        assert!(matches!(err, ExpressionError::Eval(e) if e.kind == EvalErrorKind::Provider));
    }

    #[test]
    fn test_eval_index_receiver_before_index() {
        use std::sync::{Arc, Mutex};

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut named = NamedValues::new();
        for name in ["list", "position"] {
            let order = Arc::clone(&order);
            named.insert_provider(name, move |requested: &str| -> Result<EvaluationResult, EvalError> {
                order.lock().unwrap().push(requested.to_string());
                Ok(if requested == "list" {
                    EvaluationResult::new(vec![ContextValue::string("a"), ContextValue::string("b")])
                } else {
                    EvaluationResult::new(1.0)
                })
            });
        }

        let functions = FunctionTable::builtin();
        let context = EvaluationContext::new(&named, &functions);
        let expr = ExprParser::parse_str("list[position]").unwrap();
        let result = Evaluator::new(&context).evaluate(&expr).unwrap();

        assert_eq!(result.value, ContextValue::string("b"));
        assert_eq!(*order.lock().unwrap(), vec!["list", "position"]);
    }

    #[test]
    fn test_eval_member_resolver() {
        struct Members;

        impl NamedValueResolver for Members {
            fn resolve(&self, name: &str) -> Result<Option<EvaluationResult>, EvalError> {
                if name.eq_ignore_ascii_case("parameters") {
                    Err(EvalError::new(EvalErrorKind::Cycle, "whole root requested"))
                } else {
                    Ok(None)
                }
            }

            fn resolve_member(
                &self,
                name: &str,
                key: &str,
            ) -> Option<Result<EvaluationResult, EvalError>> {
                name.eq_ignore_ascii_case("parameters")
                    .then(|| Ok(EvaluationResult::new(format!("member:{}", key))))
            }

            fn has_members(&self, name: &str) -> bool {
                name.eq_ignore_ascii_case("parameters")
            }
        }

        let functions = FunctionTable::builtin();
        let context = EvaluationContext::new(&Members, &functions);
        let evaluator = Evaluator::new(&context);

        let expr = ExprParser::parse_str("parameters.name").unwrap();
        assert_eq!(evaluator.evaluate(&expr).unwrap().value, ContextValue::string("member:name"));

        let expr = ExprParser::parse_str("parameters['other']").unwrap();
        assert_eq!(evaluator.evaluate(&expr).unwrap().value, ContextValue::string("member:other"));

        let expr = ExprParser::parse_str("parameters.*").unwrap();
        assert_eq!(evaluator.evaluate(&expr).unwrap_err().kind, EvalErrorKind::Cycle);
    }

    #[test]
    fn test_eval_runtime_arity_check() {
        let expr = Expr::FunctionCall {
            name: "not".to_string(),
            args: vec![],
        };
        let named = NamedValues::new();
        let functions = FunctionTable::builtin();
        let context = EvaluationContext::new(&named, &functions);
        let err = Evaluator::new(&context).evaluate(&expr).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::InvalidArgumentCount);
    }

    #[test]
    fn test_engine_reports_parse_errors() {
        assert!(matches!(
            engine().evaluate("eq(1)"),
            Err(ExpressionError::Parse(_))
        ));
    }

    #[test]
    fn test_named_values_shared_across_threads() {
        let mut named = NamedValues::new();
        named.insert("variables", variables());
        let functions = FunctionTable::builtin();
        let expr = ExprParser::parse_str("variables.nested.*.a").unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let context = EvaluationContext::new(&named, &functions);
                    let result = Evaluator::new(&context).evaluate(&expr).unwrap();
                    assert_eq!(result.value.as_array().map(|a| a.len()), Some(2));
                });
            }
        });
    }
}
