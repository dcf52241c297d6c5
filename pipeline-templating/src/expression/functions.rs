// Built-in Functions for Pipeline Expressions
// Function descriptors, the function table and the standard function set

use crate::expression::evaluator::{EvalError, EvalErrorKind, Evaluator};
use crate::expression::parser::Expr;
use crate::expression::value::ContextValue;

use indexmap::IndexMap;

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

/// Arguments passed to a function implementation.
///
/// Arguments before the descriptor's `lazy_from` position are evaluated up
/// front. Later ones are deferred: each call to [`FunctionArgs::get`]
/// evaluates the argument node again.
pub struct FunctionArgs<'e, 'a> {
    evaluator: &'e Evaluator<'a>,
    nodes: &'e [Expr],
    evaluated: Vec<Option<ContextValue>>,
    secret: Cell<bool>,
}

impl<'e, 'a> FunctionArgs<'e, 'a> {
    pub(crate) fn new(
        evaluator: &'e Evaluator<'a>,
        nodes: &'e [Expr],
        lazy_from: Option<usize>,
    ) -> Result<Self, EvalError> {
        let eager = lazy_from.unwrap_or(nodes.len()).min(nodes.len());
        let mut evaluated = Vec::with_capacity(nodes.len());
        let mut secret = false;

        for node in &nodes[..eager] {
            let result = evaluator.evaluate(node)?;
            secret |= result.is_secret;
            evaluated.push(Some(result.value));
        }
        evaluated.resize(nodes.len(), None);

        Ok(Self {
            evaluator,
            nodes,
            evaluated,
            secret: Cell::new(secret),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether the argument at `index` is evaluated on demand
    pub fn is_deferred(&self, index: usize) -> bool {
        matches!(self.evaluated.get(index), Some(None))
    }

    /// Value of the argument at `index`, or Null past the end
    pub fn get(&self, index: usize) -> Result<ContextValue, EvalError> {
        match self.evaluated.get(index) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => {
                let result = self.evaluator.evaluate(&self.nodes[index])?;
                if result.is_secret {
                    self.secret.set(true);
                }
                Ok(result.value)
            }
            None => Ok(ContextValue::Null),
        }
    }

    /// Evaluate every argument in order
    pub fn values(&self) -> Result<Vec<ContextValue>, EvalError> {
        (0..self.len()).map(|i| self.get(i)).collect()
    }

    /// Whether any argument evaluated so far was secret
    pub fn is_secret(&self) -> bool {
        self.secret.get()
    }
}

type BuiltinFn = fn(&FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError>;

type FunctionImpl =
    dyn Fn(&FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> + Send + Sync;

/// A callable entry in a [`FunctionTable`]
#[derive(Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub min_args: usize,
    /// `usize::MAX` for variadic functions
    pub max_args: usize,
    /// First argument position passed as a deferred thunk
    pub lazy_from: Option<usize>,
    evaluate: Arc<FunctionImpl>,
}

impl FunctionDescriptor {
    pub fn new<F>(name: impl Into<String>, min_args: usize, max_args: usize, evaluate: F) -> Self
    where
        F: Fn(&FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            min_args,
            max_args,
            lazy_from: None,
            evaluate: Arc::new(evaluate),
        }
    }

    /// Defer evaluation of arguments from `index` onwards
    pub fn lazy_from(mut self, index: usize) -> Self {
        self.lazy_from = Some(index);
        self
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args && count <= self.max_args
    }

    pub fn arity_description(&self) -> String {
        let plural = |n: usize| if n == 1 { "argument" } else { "arguments" };
        if self.max_args == usize::MAX {
            format!("at least {} {}", self.min_args, plural(self.min_args))
        } else if self.min_args == self.max_args {
            format!("{} {}", self.min_args, plural(self.min_args))
        } else {
            format!("{} to {} arguments", self.min_args, self.max_args)
        }
    }

    pub fn call(&self, args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
        (self.evaluate)(args)
    }

    fn aliased(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("min_args", &self.min_args)
            .field("max_args", &self.max_args)
            .field("lazy_from", &self.lazy_from)
            .finish_non_exhaustive()
    }
}

/// Functions callable from expressions, keyed case-insensitively by name
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: IndexMap<String, FunctionDescriptor>,
}

impl FunctionTable {
    /// An empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard function set
    pub fn builtin() -> Self {
        const ANY: usize = usize::MAX;

        let mut table = Self::new();
        let mut add = |name: &str, min: usize, max: usize, f: BuiltinFn| {
            table.register(FunctionDescriptor::new(name, min, max, f));
        };

        // Comparison
        add("eq", 2, 2, fn_eq);
        add("ne", 2, 2, fn_ne);
        add("lt", 2, 2, fn_lt);
        add("le", 2, 2, fn_le);
        add("gt", 2, 2, fn_gt);
        add("ge", 2, 2, fn_ge);
        add("in", 2, ANY, fn_in);
        add("notIn", 2, ANY, fn_notin);

        // Logical
        add("not", 1, 1, fn_not);
        add("xor", 2, 2, fn_xor);

        // String
        add("contains", 2, 2, fn_contains);
        add("containsValue", 2, 2, fn_contains_value);
        add("startsWith", 2, 2, fn_startswith);
        add("endsWith", 2, 2, fn_endswith);
        add("format", 1, ANY, fn_format);
        add("join", 1, 2, fn_join);
        add("replace", 3, 3, fn_replace);
        add("split", 2, 2, fn_split);
        add("lower", 1, 1, fn_lower);
        add("upper", 1, 1, fn_upper);
        add("trim", 1, 1, fn_trim);
        add("length", 1, 1, fn_length);

        // Conversion
        add("toJson", 1, 1, fn_to_json);
        add("fromJson", 1, 1, fn_from_json);

        // Lazy
        table.register(FunctionDescriptor::new("and", 2, ANY, fn_and).lazy_from(0));
        table.register(FunctionDescriptor::new("or", 2, ANY, fn_or).lazy_from(0));
        table.register(FunctionDescriptor::new("iif", 3, 3, fn_iif).lazy_from(1));
        table.register(FunctionDescriptor::new("coalesce", 1, ANY, fn_coalesce).lazy_from(0));

        if let Some(to_json) = table.get("toJson").map(|d| d.aliased("convertToJson")) {
            table.register(to_json);
        }

        table
    }

    /// Add or replace a function. Returns the descriptor it replaced.
    pub fn register(&mut self, descriptor: FunctionDescriptor) -> Option<FunctionDescriptor> {
        self.functions
            .insert(descriptor.name.to_lowercase(), descriptor)
    }

    pub fn get(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions.get(&name.to_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.values().map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// =========================================================================
// Comparison Functions
// =========================================================================

fn fn_eq(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    Ok(args.get(0)?.loose_eq(&args.get(1)?).into())
}

fn fn_ne(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    Ok((!args.get(0)?.loose_eq(&args.get(1)?)).into())
}

fn compare(
    args: &FunctionArgs<'_, '_>,
    test: fn(std::cmp::Ordering) -> bool,
) -> Result<ContextValue, EvalError> {
    let ordering = args.get(0)?.loose_cmp(&args.get(1)?);
    Ok(ordering.is_some_and(test).into())
}

fn fn_lt(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    compare(args, |o| o.is_lt())
}

fn fn_le(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    compare(args, |o| o.is_le())
}

fn fn_gt(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    compare(args, |o| o.is_gt())
}

fn fn_ge(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    compare(args, |o| o.is_ge())
}

fn fn_in(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let needle = args.get(0)?;
    for i in 1..args.len() {
        if needle.loose_eq(&args.get(i)?) {
            return Ok(true.into());
        }
    }
    Ok(false.into())
}

fn fn_notin(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let found = fn_in(args)?.is_truthy();
    Ok((!found).into())
}

// =========================================================================
// Logical Functions
// =========================================================================

fn fn_and(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    for i in 0..args.len() {
        if !args.get(i)?.is_truthy() {
            return Ok(false.into());
        }
    }
    Ok(true.into())
}

fn fn_or(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    for i in 0..args.len() {
        if args.get(i)?.is_truthy() {
            return Ok(true.into());
        }
    }
    Ok(false.into())
}

fn fn_not(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    Ok((!args.get(0)?.is_truthy()).into())
}

fn fn_xor(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    Ok((args.get(0)?.is_truthy() != args.get(1)?.is_truthy()).into())
}

fn fn_iif(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    if args.get(0)?.is_truthy() {
        args.get(1)
    } else {
        args.get(2)
    }
}

/// First argument that is neither null nor an empty string
fn fn_coalesce(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    for i in 0..args.len() {
        match args.get(i)? {
            ContextValue::Null => continue,
            ContextValue::String(s) if s.is_empty() => continue,
            value => return Ok(value),
        }
    }
    Ok(ContextValue::Null)
}

// =========================================================================
// String Functions
// =========================================================================

fn fn_contains(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let haystack = args.get(0)?;
    let needle = args.get(1)?;
    let found = match &haystack {
        ContextValue::Array(items) => items.iter().any(|item| item.loose_eq(&needle)),
        ContextValue::Dictionary(_) => false,
        other => other
            .as_string()
            .to_lowercase()
            .contains(&needle.as_string().to_lowercase()),
    };
    Ok(found.into())
}

fn fn_contains_value(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let collection = args.get(0)?;
    let needle = args.get(1)?;
    let found = match &collection {
        ContextValue::Array(items) => items.iter().any(|item| item.loose_eq(&needle)),
        ContextValue::Dictionary(dict) => dict.values().any(|value| value.loose_eq(&needle)),
        _ => false,
    };
    Ok(found.into())
}

fn fn_startswith(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let s = args.get(0)?.as_string().to_lowercase();
    let prefix = args.get(1)?.as_string().to_lowercase();
    Ok(s.starts_with(&prefix).into())
}

fn fn_endswith(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let s = args.get(0)?.as_string().to_lowercase();
    let suffix = args.get(1)?.as_string().to_lowercase();
    Ok(s.ends_with(&suffix).into())
}

/// `format('{0} and {1}', a, b)`. `{{` and `}}` produce literal braces.
fn fn_format(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let template = args.get(0)?.as_string();
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                result.push('{');
            }
            '{' => {
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) if c.is_ascii_digit() => digits.push(c),
                        _ => {
                            return Err(EvalError::invalid_argument(
                                "format",
                                format!("invalid placeholder in format string '{}'", template),
                            ))
                        }
                    }
                }

                if digits.is_empty() {
                    return Err(EvalError::invalid_argument(
                        "format",
                        format!("empty placeholder in format string '{}'", template),
                    ));
                }

                // argument 0 is the format string itself
                let position = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|index| index.checked_add(1))
                    .filter(|position| *position < args.len());
                let Some(position) = position else {
                    return Err(EvalError::invalid_argument(
                        "format",
                        format!(
                            "placeholder {{{}}} has no matching argument ({} given)",
                            digits,
                            args.len() - 1
                        ),
                    ));
                };

                result.push_str(&args.get(position)?.as_string());
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                result.push('}');
            }
            '}' => {
                return Err(EvalError::invalid_argument(
                    "format",
                    format!("unbalanced '}}' in format string '{}'", template),
                ))
            }
            c => result.push(c),
        }
    }

    Ok(ContextValue::String(result))
}

fn fn_join(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let separator = if args.len() > 1 {
        args.get(1)?.as_string()
    } else {
        ",".to_string()
    };

    match args.get(0)? {
        ContextValue::Array(items) => {
            let strings: Vec<String> = items.iter().map(|v| v.as_string()).collect();
            Ok(ContextValue::String(strings.join(&separator)))
        }
        ContextValue::Dictionary(_) => Err(EvalError::invalid_argument(
            "join",
            "expected an array as the first argument",
        )),
        other => Ok(ContextValue::String(other.as_string())),
    }
}

fn fn_replace(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let s = args.get(0)?.as_string();
    let from = args.get(1)?.as_string();
    let to = args.get(2)?.as_string();
    if from.is_empty() {
        return Ok(ContextValue::String(s));
    }
    Ok(ContextValue::String(s.replace(&from, &to)))
}

fn fn_split(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let s = args.get(0)?.as_string();
    let delimiter = args.get(1)?.as_string();
    if delimiter.is_empty() {
        return Ok(ContextValue::array(vec![ContextValue::String(s)]));
    }
    let parts: Vec<ContextValue> = s.split(delimiter.as_str()).map(ContextValue::string).collect();
    Ok(ContextValue::array(parts))
}

fn fn_lower(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    Ok(ContextValue::String(args.get(0)?.as_string().to_lowercase()))
}

fn fn_upper(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    Ok(ContextValue::String(args.get(0)?.as_string().to_uppercase()))
}

fn fn_trim(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    Ok(ContextValue::String(args.get(0)?.as_string().trim().to_string()))
}

fn fn_length(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let length = match args.get(0)? {
        ContextValue::String(s) => s.chars().count(),
        ContextValue::Array(items) => items.len(),
        ContextValue::Dictionary(dict) => dict.len(),
        other => {
            return Err(EvalError::invalid_argument(
                "length",
                format!("expected a string, array or dictionary but got {}", other.kind()),
            ))
        }
    };
    Ok(ContextValue::Number(length as f64))
}

// =========================================================================
// Conversion Functions
// =========================================================================

fn fn_to_json(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    Ok(ContextValue::String(args.get(0)?.to_json_pretty()))
}

fn fn_from_json(args: &FunctionArgs<'_, '_>) -> Result<ContextValue, EvalError> {
    let text = args.get(0)?.as_string();
    let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        EvalError::new(
            EvalErrorKind::InvalidArgument,
            format!("fromJson: invalid JSON: {}", e),
        )
    })?;
    Ok(ContextValue::from_json(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::evaluator::{EvaluationContext, NamedValues};
    use crate::expression::parser::ExprParser;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn eval_with(expr: &str, named: &NamedValues, functions: &FunctionTable) -> Result<ContextValue, EvalError> {
        let ast = ExprParser::parse_str(expr).unwrap();
        let ctx = EvaluationContext::new(named, functions);
        Evaluator::new(&ctx).evaluate(&ast).map(|r| r.value)
    }

    fn eval(expr: &str) -> ContextValue {
        eval_with(expr, &NamedValues::new(), &FunctionTable::builtin()).unwrap()
    }

    fn eval_err(expr: &str) -> EvalError {
        eval_with(expr, &NamedValues::new(), &FunctionTable::builtin()).unwrap_err()
    }

    #[test]
    fn test_fn_comparison() {
        assert_eq!(eval("eq('a', 'A')"), ContextValue::Boolean(true));
        assert_eq!(eval("ne(1, '1')"), ContextValue::Boolean(false));
        assert_eq!(eval("lt(1, 2)"), ContextValue::Boolean(true));
        assert_eq!(eval("ge('b', 'A')"), ContextValue::Boolean(true));
        assert_eq!(eval("gt(NaN, 1)"), ContextValue::Boolean(false));
    }

    #[test]
    fn test_fn_in() {
        assert_eq!(eval("in('b', 'a', 'B', 'c')"), ContextValue::Boolean(true));
        assert_eq!(eval("notIn('z', 'a', 'b')"), ContextValue::Boolean(true));
    }

    #[test]
    fn test_fn_logical() {
        assert_eq!(eval("and(true, 1, 'x')"), ContextValue::Boolean(true));
        assert_eq!(eval("and(true, '')"), ContextValue::Boolean(false));
        assert_eq!(eval("or(0, null, 'x')"), ContextValue::Boolean(true));
        assert_eq!(eval("not('')"), ContextValue::Boolean(true));
        assert_eq!(eval("xor(true, 0)"), ContextValue::Boolean(true));
    }

    #[test]
    fn test_fn_lazy_arguments_are_not_evaluated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut functions = FunctionTable::builtin();
        functions.register(FunctionDescriptor::new("touch", 0, 0, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ContextValue::Boolean(true))
        }));
        let named = NamedValues::new();

        assert_eq!(
            eval_with("and(false, touch())", &named, &functions).unwrap(),
            ContextValue::Boolean(false)
        );
        assert_eq!(
            eval_with("or(true, touch())", &named, &functions).unwrap(),
            ContextValue::Boolean(true)
        );
        assert_eq!(
            eval_with("iif(true, 'yes', touch())", &named, &functions).unwrap(),
            ContextValue::string("yes")
        );
        assert_eq!(
            eval_with("coalesce('first', touch())", &named, &functions).unwrap(),
            ContextValue::string("first")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        eval_with("iif(false, 'yes', touch())", &named, &functions).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fn_coalesce() {
        assert_eq!(eval("coalesce(null, '', 'x')"), ContextValue::string("x"));
        assert_eq!(eval("coalesce(null, '')"), ContextValue::Null);
        assert_eq!(eval("coalesce(0, 'x')"), ContextValue::Number(0.0));
    }

    #[test]
    fn test_fn_contains() {
        assert_eq!(eval("contains('Hello World', 'world')"), ContextValue::Boolean(true));
        assert_eq!(eval("contains(split('a,b', ','), 'B')"), ContextValue::Boolean(true));
        assert_eq!(eval("contains(fromJson('{\"a\":1}'), 'a')"), ContextValue::Boolean(false));
        assert_eq!(eval("containsValue(fromJson('{\"a\":1}'), 1)"), ContextValue::Boolean(true));
        assert_eq!(eval("containsValue('abc', 'a')"), ContextValue::Boolean(false));
    }

    #[test]
    fn test_fn_starts_ends_with() {
        assert_eq!(eval("startsWith('refs/heads/main', 'REFS/')"), ContextValue::Boolean(true));
        assert_eq!(eval("endsWith('build.yml', '.YML')"), ContextValue::Boolean(true));
        assert_eq!(eval("endsWith('build.yml', '.json')"), ContextValue::Boolean(false));
    }

    #[test]
    fn test_fn_format() {
        assert_eq!(
            eval("format('{0}-{1}-{0}', 'a', 2)"),
            ContextValue::string("a-2-a")
        );
        assert_eq!(eval("format('{{literal}} {0}', true)"), ContextValue::string("{literal} true"));
        assert_eq!(eval("format('no placeholders')"), ContextValue::string("no placeholders"));
    }

    #[test]
    fn test_fn_format_errors() {
        assert_eq!(eval_err("format('{1}', 'a')").kind, EvalErrorKind::InvalidArgument);
        assert_eq!(eval_err("format('{0', 'a')").kind, EvalErrorKind::InvalidArgument);
        assert_eq!(eval_err("format('a}b')").kind, EvalErrorKind::InvalidArgument);
        assert_eq!(eval_err("format('{x}', 'a')").kind, EvalErrorKind::InvalidArgument);
        assert_eq!(eval_err("format('{}', 'a')").kind, EvalErrorKind::InvalidArgument);
    }

    #[test]
    fn test_fn_format_huge_placeholder_index() {
        let err = eval_err("format('{18446744073709551615}', 'a')");
        assert_eq!(err.kind, EvalErrorKind::InvalidArgument);
        assert!(err.message.contains("{18446744073709551615}"));

        let err = eval_err("format('{99999999999999999999999}', 'a')");
        assert_eq!(err.kind, EvalErrorKind::InvalidArgument);
    }

    #[test]
    fn test_fn_join_split() {
        assert_eq!(eval("join(split('a b c', ' '))"), ContextValue::string("a,b,c"));
        assert_eq!(eval("join(split('a,b', ','), ' | ')"), ContextValue::string("a | b"));
        assert_eq!(eval("join('single', ';')"), ContextValue::string("single"));
        assert_eq!(eval("split('abc', '')"), ContextValue::array(vec!["abc".into()]));
    }

    #[test]
    fn test_fn_string_transforms() {
        assert_eq!(eval("replace('a-b-c', '-', '_')"), ContextValue::string("a_b_c"));
        assert_eq!(eval("replace('abc', '', 'x')"), ContextValue::string("abc"));
        assert_eq!(eval("lower('MiXeD')"), ContextValue::string("mixed"));
        assert_eq!(eval("upper('MiXeD')"), ContextValue::string("MIXED"));
        assert_eq!(eval("trim('  padded ')"), ContextValue::string("padded"));
    }

    #[test]
    fn test_fn_length() {
        assert_eq!(eval("length('héllo')"), ContextValue::Number(5.0));
        assert_eq!(eval("length(split('a,b,c', ','))"), ContextValue::Number(3.0));
        assert_eq!(eval("length(fromJson('{\"a\":1,\"b\":2}'))"), ContextValue::Number(2.0));
        assert_eq!(eval_err("length(1)").kind, EvalErrorKind::InvalidArgument);
    }

    #[test]
    fn test_fn_json_round_trip() {
        let value = eval("fromJson('{\"name\":\"app\",\"ports\":[80,443]}')");
        let dict = value.as_dictionary().unwrap();
        assert_eq!(dict.get("name"), Some(&ContextValue::string("app")));

        let mut named = NamedValues::new();
        named.insert("config", value);
        let json = eval_with("convertToJson(config)", &named, &FunctionTable::builtin()).unwrap();
        let reparsed: serde_json::Value = serde_json::from_str(json.as_str().unwrap()).unwrap();
        assert_eq!(reparsed["ports"][1], 443);

        assert_eq!(eval_err("fromJson('{not json')").kind, EvalErrorKind::InvalidArgument);
    }

    #[test]
    fn test_function_table_case_insensitive() {
        let table = FunctionTable::builtin();
        assert!(table.contains("STARTSWITH"));
        assert!(table.contains("converttojson"));
        assert_eq!(table.get("notin").unwrap().name, "notIn");
        assert!(table.get("counter").is_none());
    }

    #[test]
    fn test_function_table_register_replaces() {
        let mut table = FunctionTable::builtin();
        let count = table.len();
        let replaced = table.register(FunctionDescriptor::new("EQ", 2, 2, |_| Ok(ContextValue::Null)));
        assert!(replaced.is_some());
        assert_eq!(table.len(), count);
        assert_eq!(eval_with("eq(1, 1)", &NamedValues::new(), &table).unwrap(), ContextValue::Null);
    }

    #[test]
    fn test_arity_description() {
        let table = FunctionTable::builtin();
        assert_eq!(table.get("not").unwrap().arity_description(), "1 argument");
        assert_eq!(table.get("eq").unwrap().arity_description(), "2 arguments");
        assert_eq!(table.get("join").unwrap().arity_description(), "1 to 2 arguments");
        assert_eq!(table.get("in").unwrap().arity_description(), "at least 2 arguments");
    }

    #[test]
    fn test_function_args_deferred() {
        let mut functions = FunctionTable::new();
        functions.register(
            FunctionDescriptor::new("probe", 2, 2, |args| {
                Ok(ContextValue::array(vec![
                    args.is_deferred(0).into(),
                    args.is_deferred(1).into(),
                ]))
            })
            .lazy_from(1),
        );
        let result = eval_with("probe(1, 2)", &NamedValues::new(), &functions).unwrap();
        assert_eq!(
            result,
            ContextValue::array(vec![false.into(), true.into()])
        );
    }
}
