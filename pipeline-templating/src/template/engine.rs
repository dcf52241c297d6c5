// Template Expansion Engine
// Expands template tokens against a schema, evaluating ${{ }} expressions

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::expression::evaluator::{
    EvalError, EvalErrorKind, EvaluationContext, EvaluationResult, Evaluator, NamedValueResolver,
};
use crate::expression::functions::FunctionTable;
use crate::expression::parser::{ExprParser, ParserOptions};
use crate::expression::value::{ContextValue, Dictionary, ValueKind};
use crate::template::bindings::{Binding, Bindings, DeferredTemplate, Member};
use crate::template::error::{TemplateError, TemplateErrorKind, TemplateErrors};
use crate::template::schema::{DefinitionSet, MappingDefinition, TemplateSchema};
use crate::template::token::{DocumentPath, ExpressionToken, PathSegment, TemplateToken};

/// Replacement text for secret-derived values
pub const SECRET_MASK: &str = "***";

/// Approximate per-node overhead used for output size accounting
const NODE_BYTES: usize = 24;

/// Limits applied to one expansion pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TemplateOptions {
    /// Maximum nesting, counting deferred named value expansion
    pub max_depth: usize,
    /// Diagnostics kept before the rest are dropped
    pub max_errors: usize,
    pub max_error_message_length: usize,
    /// Approximate size limit of the expanded document
    pub max_bytes: usize,
    pub parser: ParserOptions,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_errors: 10,
            max_error_message_length: 500,
            max_bytes: 10 * 1024 * 1024,
            parser: ParserOptions::default(),
        }
    }
}

/// Result of a successful expansion
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedDocument {
    pub value: ContextValue,
    /// Paths of values derived from secrets
    pub secrets: Vec<DocumentPath>,
    /// Paths of entries whose key was computed from a secret
    pub secret_keys: Vec<DocumentPath>,
}

impl ExpandedDocument {
    pub fn has_secrets(&self) -> bool {
        !self.secrets.is_empty() || !self.secret_keys.is_empty()
    }

    /// Number of secret-derived values and keys
    pub fn secret_count(&self) -> usize {
        self.secrets.len() + self.secret_keys.len()
    }

    /// Whether the value at `path`, or one of its ancestors, is secret
    pub fn is_secret(&self, path: &DocumentPath) -> bool {
        self.secrets
            .iter()
            .any(|secret| path.segments().starts_with(secret.segments()))
    }

    /// The document with every secret-derived value and key replaced by `***`
    pub fn masked(&self) -> ContextValue {
        let value = self
            .secrets
            .iter()
            .fold(self.value.clone(), |value, path| mask(&value, path.segments()));

        // rename inner keys before the paths through them change
        let mut keys: Vec<&DocumentPath> = self.secret_keys.iter().collect();
        keys.sort_by_key(|path| std::cmp::Reverse(path.segments().len()));
        keys.into_iter()
            .fold(value, |value, path| mask_key(&value, path.segments()))
    }
}

fn mask_key(value: &ContextValue, path: &[PathSegment]) -> ContextValue {
    match (value, path) {
        (ContextValue::Dictionary(dict), [PathSegment::Key(key)]) if dict.contains_key(key) => {
            let mut masked = if dict.is_case_insensitive() {
                Dictionary::case_insensitive()
            } else {
                Dictionary::new()
            };
            let mut n = 1;
            for (name, inner) in dict.iter() {
                if name == key.as_str() {
                    let mut replacement = SECRET_MASK.to_string();
                    while dict.contains_key(&replacement) || masked.contains_key(&replacement) {
                        n += 1;
                        replacement = format!("{}{}", SECRET_MASK, n);
                    }
                    masked.insert(replacement, inner.clone());
                } else {
                    masked.insert(name, inner.clone());
                }
            }
            ContextValue::dictionary(masked)
        }
        (ContextValue::Array(items), [PathSegment::Index(index), rest @ ..])
            if *index < items.len() && !rest.is_empty() =>
        {
            let mut items = items.to_vec();
            let masked = mask_key(&items[*index], rest);
            items[*index] = masked;
            ContextValue::array(items)
        }
        (ContextValue::Dictionary(dict), [PathSegment::Key(key), rest @ ..]) if !rest.is_empty() => {
            match dict.get(key) {
                Some(inner) => {
                    let masked = mask_key(inner, rest);
                    let mut dict = Dictionary::clone(dict);
                    dict.insert(key.clone(), masked);
                    ContextValue::dictionary(dict)
                }
                None => value.clone(),
            }
        }
        _ => value.clone(),
    }
}

fn mask(value: &ContextValue, path: &[PathSegment]) -> ContextValue {
    let Some((first, rest)) = path.split_first() else {
        return ContextValue::string(SECRET_MASK);
    };
    match (value, first) {
        (ContextValue::Array(items), PathSegment::Index(index)) if *index < items.len() => {
            let mut items = items.to_vec();
            let masked = mask(&items[*index], rest);
            items[*index] = masked;
            ContextValue::array(items)
        }
        (ContextValue::Dictionary(dict), PathSegment::Key(key)) => match dict.get(key) {
            Some(inner) => {
                let masked = mask(inner, rest);
                let mut dict = Dictionary::clone(dict);
                dict.insert(key.clone(), masked);
                ContextValue::dictionary(dict)
            }
            None => value.clone(),
        },
        _ => value.clone(),
    }
}

/// Schema-guided template expander.
///
/// The engine only borrows the schema and function table, so one engine can
/// run passes from several threads at once.
#[derive(Debug, Clone)]
pub struct TemplateEngine<'s> {
    schema: &'s TemplateSchema,
    functions: &'s FunctionTable,
    options: TemplateOptions,
}

impl<'s> TemplateEngine<'s> {
    pub fn new(schema: &'s TemplateSchema, functions: &'s FunctionTable) -> Self {
        Self {
            schema,
            functions,
            options: TemplateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TemplateOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &TemplateOptions {
        &self.options
    }

    /// Expand `token` as a `type_name` document.
    ///
    /// Every diagnostic of the pass is returned together; a cycle or depth
    /// violation only abandons the subtree it occurred in.
    pub fn expand(
        &self,
        token: &TemplateToken,
        type_name: &str,
        bindings: &Bindings,
    ) -> Result<ExpandedDocument, TemplateErrors> {
        if !self.schema.contains(type_name) {
            return Err(TemplateError::new(
                format!("unknown definition '{}'", type_name),
                TemplateErrorKind::TypeMismatch,
            )
            .into());
        }

        debug!(
            type_name,
            bindings = bindings.len(),
            "starting template expansion"
        );

        let pass = Pass::new(self, bindings);
        let set = self.schema.definition_set([type_name]);
        let frame = Frame::root(&pass.root_allowed);
        let value = match pass.expand_node(token, &set, frame, &DocumentPath::root()) {
            Ok(value) => value,
            Err(Fatal(Some(error))) => {
                pass.record(error);
                ContextValue::Null
            }
            Err(Fatal(None)) => ContextValue::Null,
        };

        pass.finish(value)
    }
}

/// An error that abandons the enclosing subtree. `None` when it was already
/// recorded.
struct Fatal(Option<TemplateError>);

type Expansion<T> = Result<T, Fatal>;

/// Lexical state of the node being expanded
#[derive(Clone, Copy)]
struct Frame<'f> {
    /// Named values expressions may reference here
    allowed: &'f [String],
    locals: Option<&'f Local<'f>>,
    /// Deferred values currently being expanded, innermost first
    in_flight: Option<&'f InFlight<'f>>,
    depth: usize,
}

/// `${{ each }}` loop variable
struct Local<'f> {
    name: String,
    value: EvaluationResult,
    parent: Option<&'f Local<'f>>,
}

struct InFlight<'f> {
    root: &'f str,
    key: &'f str,
    parent: Option<&'f InFlight<'f>>,
}

impl<'f> Frame<'f> {
    fn root(allowed: &'f [String]) -> Self {
        Self {
            allowed,
            locals: None,
            in_flight: None,
            depth: 0,
        }
    }

    fn deeper(self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self
        }
    }

    fn local(&self, name: &str) -> Option<&'f EvaluationResult> {
        let mut current = self.locals;
        while let Some(local) = current {
            if local.name.eq_ignore_ascii_case(name) {
                return Some(&local.value);
            }
            current = local.parent;
        }
        None
    }

    fn allows(&self, name: &str) -> bool {
        self.allowed.iter().any(|n| n.eq_ignore_ascii_case(name)) || self.local(name).is_some()
    }

    fn allows_expressions(&self) -> bool {
        !self.allowed.is_empty() || self.locals.is_some()
    }
}

/// State of an if/elseif/else chain among siblings
#[derive(Default)]
struct Chain {
    active: bool,
    taken: bool,
}

impl Chain {
    fn reset(&mut self) {
        *self = Chain::default();
    }
}

enum Branch<'t> {
    Skip,
    Take,
    Each {
        variable: &'t str,
        values: Vec<EvaluationResult>,
    },
    Insert,
}

/// Mapping under construction with the definitions it may still match
struct MappingState<'a> {
    candidates: Vec<&'a MappingDefinition>,
    out: Dictionary,
}

/// Per-pass mutable state. Never shared between threads.
struct Pass<'a> {
    schema: &'a TemplateSchema,
    functions: &'a FunctionTable,
    options: &'a TemplateOptions,
    bindings: &'a Bindings,
    root_allowed: Vec<String>,
    errors: RefCell<Vec<TemplateError>>,
    dropped: Cell<usize>,
    bytes: Cell<usize>,
    exhausted: Cell<bool>,
    secrets: RefCell<Vec<DocumentPath>>,
    secret_keys: RefCell<Vec<DocumentPath>>,
    deferred: RefCell<HashMap<(String, String), EvaluationResult>>,
}

impl<'a> Pass<'a> {
    fn new(engine: &'a TemplateEngine<'_>, bindings: &'a Bindings) -> Self {
        Self {
            schema: engine.schema,
            functions: engine.functions,
            options: &engine.options,
            bindings,
            root_allowed: bindings.names().map(str::to_string).collect(),
            errors: RefCell::new(Vec::new()),
            dropped: Cell::new(0),
            bytes: Cell::new(0),
            exhausted: Cell::new(false),
            secrets: RefCell::new(Vec::new()),
            secret_keys: RefCell::new(Vec::new()),
            deferred: RefCell::new(HashMap::new()),
        }
    }

    fn finish(self, value: ContextValue) -> Result<ExpandedDocument, TemplateErrors> {
        let mut errors = self.errors.into_inner();
        let dropped = self.dropped.get();
        if dropped > 0 {
            errors.push(TemplateError::new(
                format!(
                    "maximum number of errors ({}) reached; {} more omitted",
                    self.options.max_errors, dropped
                ),
                TemplateErrorKind::TooManyErrors,
            ));
        }

        debug!(
            errors = errors.len(),
            bytes = self.bytes.get(),
            "finished template expansion"
        );

        if errors.is_empty() {
            Ok(ExpandedDocument {
                value,
                secrets: self.secrets.into_inner(),
                secret_keys: self.secret_keys.into_inner(),
            })
        } else {
            Err(errors.into())
        }
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    fn record(&self, error: TemplateError) {
        let error = error.truncated(self.options.max_error_message_length);
        let mut errors = self.errors.borrow_mut();
        if errors.len() < self.options.max_errors {
            errors.push(error);
        } else {
            if self.dropped.get() == 0 {
                warn!(
                    max_errors = self.options.max_errors,
                    "template error limit reached; dropping further errors"
                );
            }
            self.dropped.set(self.dropped.get() + 1);
        }
    }

    fn error(&self, kind: TemplateErrorKind, message: impl Into<String>, path: &DocumentPath) {
        self.record(TemplateError::new(message, kind).with_path(self.shown(path)));
    }

    /// `path` with every secret-derived key replaced by `***`
    fn shown(&self, path: &DocumentPath) -> DocumentPath {
        let secret_keys = self.secret_keys.borrow();
        if secret_keys.is_empty() {
            return path.clone();
        }
        let segments = path.segments();
        (0..segments.len()).fold(DocumentPath::root(), |shown, i| {
            let secret = secret_keys
                .iter()
                .any(|key| key.segments() == &segments[..=i]);
            match &segments[i] {
                PathSegment::Key(_) if secret => shown.key(SECRET_MASK),
                PathSegment::Key(key) => shown.key(key.as_str()),
                PathSegment::Index(index) => shown.index(*index),
            }
        })
    }

    fn mismatch(&self, set: &DefinitionSet<'_>, found: &str, path: &DocumentPath) {
        self.error(
            TemplateErrorKind::TypeMismatch,
            format!("expected {}, found {}", set, found),
            path,
        );
    }

    /// Catch a subtree failure at an item boundary
    fn guard<T>(&self, result: Expansion<T>) -> Expansion<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(Fatal(Some(error))) => {
                self.record(error);
                Ok(None)
            }
            Err(Fatal(None)) => Err(Fatal(None)),
        }
    }

    fn charge(&self, bytes: usize, path: &DocumentPath) -> Expansion<()> {
        let total = self.bytes.get().saturating_add(bytes);
        self.bytes.set(total);
        if total > self.options.max_bytes {
            self.exhausted.set(true);
            self.error(
                TemplateErrorKind::MaxBytesExceeded,
                format!(
                    "expanded document exceeds the maximum size of {} bytes",
                    self.options.max_bytes
                ),
                path,
            );
            return Err(Fatal(None));
        }
        Ok(())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    fn expand_node(
        &self,
        token: &TemplateToken,
        set: &DefinitionSet<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<ContextValue> {
        if self.exhausted.get() {
            return Err(Fatal(None));
        }
        if frame.depth > self.options.max_depth {
            return Err(Fatal(Some(
                TemplateError::new(
                    format!(
                        "maximum expansion depth of {} exceeded",
                        self.options.max_depth
                    ),
                    TemplateErrorKind::MaxDepthExceeded,
                )
                .with_path(self.shown(path)),
            )));
        }

        let frame = match set.context() {
            Some(allowed) => Frame { allowed, ..frame },
            None => frame,
        };

        match token {
            TemplateToken::Null => self.expand_literal(ContextValue::Null, set, path),
            TemplateToken::Boolean(b) => self.expand_literal(ContextValue::Boolean(*b), set, path),
            TemplateToken::Number(n) => self.expand_literal(ContextValue::Number(*n), set, path),
            TemplateToken::String(s) => self.expand_literal(ContextValue::string(s.as_str()), set, path),
            TemplateToken::Sequence(items) => self.expand_sequence(items, set, frame, path),
            TemplateToken::Mapping(entries) => self.expand_mapping(entries, set, frame, path),
            TemplateToken::Expression(ExpressionToken::Basic(text)) => {
                let Some(result) = self.evaluate(text, frame, path)? else {
                    return Ok(ContextValue::Null);
                };
                self.charge(value_size(&result.value), path)?;
                if let Err(message) = self.check_value(&result.value, set) {
                    self.error(TemplateErrorKind::TypeMismatch, message, path);
                    return Ok(ContextValue::Null);
                }
                if result.is_secret {
                    self.secrets.borrow_mut().push(path.clone());
                }
                Ok(result.value)
            }
            TemplateToken::Expression(directive) => {
                self.error(
                    TemplateErrorKind::InvalidDirective,
                    format!(
                        "directive '{}' is only valid as an entire mapping key",
                        directive
                    ),
                    path,
                );
                Ok(ContextValue::Null)
            }
        }
    }

    /// Literal document scalars: booleans and numbers may stand in for strings
    fn expand_literal(
        &self,
        value: ContextValue,
        set: &DefinitionSet<'a>,
        path: &DocumentPath,
    ) -> Expansion<ContextValue> {
        self.charge(value_size(&value), path)?;

        let accepted = match &value {
            ContextValue::Null => set.allows(ValueKind::Null),
            ContextValue::Boolean(_) | ContextValue::Number(_) => {
                if set.allows(value.kind()) {
                    true
                } else {
                    let text = value.as_string();
                    if set.accepts_string(&text) {
                        return Ok(ContextValue::String(text));
                    }
                    false
                }
            }
            ContextValue::String(s) => set.accepts_string(s),
            _ => false,
        };

        if accepted {
            Ok(value)
        } else {
            self.error(
                TemplateErrorKind::TypeMismatch,
                describe_mismatch(set, &value),
                path,
            );
            Ok(ContextValue::Null)
        }
    }

    fn expand_sequence(
        &self,
        items: &[TemplateToken],
        set: &DefinitionSet<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<ContextValue> {
        let item_types: Vec<&'a str> = set.item_types().collect();
        if item_types.is_empty() {
            self.mismatch(set, "sequence", path);
            return Ok(ContextValue::Null);
        }

        self.charge(NODE_BYTES, path)?;
        let item_set = self.schema.definition_set(item_types);
        let mut out = Vec::with_capacity(items.len());
        self.expand_items(items, &item_set, frame, path, &mut out)?;
        Ok(ContextValue::array(out))
    }

    fn expand_items(
        &self,
        items: &[TemplateToken],
        item_set: &DefinitionSet<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
        out: &mut Vec<ContextValue>,
    ) -> Expansion<()> {
        let mut chain = Chain::default();

        for item in items {
            let Some((directive, body)) = item.as_directive_entry() else {
                chain.reset();
                let item_path = path.index(out.len());
                if let Some(value) =
                    self.guard(self.expand_node(item, item_set, frame.deeper(), &item_path))?
                {
                    out.push(value);
                }
                continue;
            };

            let directive_path = path.index(out.len());
            match self.select_branch(directive, &mut chain, frame, &directive_path)? {
                Branch::Skip => {}
                Branch::Take => self.splice(body, item_set, frame, path, out)?,
                Branch::Each { variable, values } => {
                    for value in values {
                        let local = Local {
                            name: variable.to_string(),
                            value,
                            parent: frame.locals,
                        };
                        let inner = Frame {
                            locals: Some(&local),
                            ..frame
                        };
                        self.splice(body, item_set, inner, path, out)?;
                    }
                }
                Branch::Insert => self.error(
                    TemplateErrorKind::InvalidDirective,
                    "'${{ insert }}' is not valid in a sequence",
                    &directive_path,
                ),
            }
        }

        Ok(())
    }

    /// Add a directive body to a sequence: sequences are spliced in, anything
    /// else becomes one item
    fn splice(
        &self,
        body: &TemplateToken,
        item_set: &DefinitionSet<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
        out: &mut Vec<ContextValue>,
    ) -> Expansion<()> {
        match body {
            TemplateToken::Sequence(items) => {
                self.expand_items(items, item_set, frame.deeper(), path, out)
            }
            TemplateToken::Null => Ok(()),
            other => {
                let item_path = path.index(out.len());
                if let Some(value) =
                    self.guard(self.expand_node(other, item_set, frame.deeper(), &item_path))?
                {
                    out.push(value);
                }
                Ok(())
            }
        }
    }

    fn expand_mapping(
        &self,
        entries: &[(TemplateToken, TemplateToken)],
        set: &DefinitionSet<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<ContextValue> {
        let candidates = set.mappings();
        if candidates.is_empty() {
            self.mismatch(set, "mapping", path);
            return Ok(ContextValue::Null);
        }

        self.charge(NODE_BYTES, path)?;
        let mut state = MappingState {
            candidates,
            out: Dictionary::case_insensitive(),
        };
        self.expand_entries(entries, &mut state, frame, path)?;
        self.check_required(&state, path);
        Ok(ContextValue::dictionary(state.out))
    }

    fn expand_entries(
        &self,
        entries: &[(TemplateToken, TemplateToken)],
        state: &mut MappingState<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<()> {
        let mut chain = Chain::default();

        for (key, value) in entries {
            if let Some(directive) = key.as_directive() {
                match self.select_branch(directive, &mut chain, frame, path)? {
                    Branch::Skip => {}
                    Branch::Take => self.merge(value, state, frame, path)?,
                    Branch::Each { variable, values } => {
                        for item in values {
                            let local = Local {
                                name: variable.to_string(),
                                value: item,
                                parent: frame.locals,
                            };
                            let inner = Frame {
                                locals: Some(&local),
                                ..frame
                            };
                            self.merge(value, state, inner, path)?;
                        }
                    }
                    Branch::Insert => self.insert(value, state, frame, path)?,
                }
                continue;
            }

            chain.reset();
            let Some((name, secret_key)) = self.key_name(key, frame, path)? else {
                continue;
            };
            self.expand_entry(name, secret_key, value, state, frame, path)?;
        }

        Ok(())
    }

    /// Merge a directive body into the enclosing mapping
    fn merge(
        &self,
        body: &TemplateToken,
        state: &mut MappingState<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<()> {
        match body {
            TemplateToken::Mapping(entries) => {
                self.expand_entries(entries, state, frame.deeper(), path)
            }
            TemplateToken::Null => Ok(()),
            other => {
                self.error(
                    TemplateErrorKind::InvalidDirective,
                    format!(
                        "directive body in a mapping must be a mapping, found {}",
                        other.type_name()
                    ),
                    path,
                );
                Ok(())
            }
        }
    }

    fn insert(
        &self,
        value: &TemplateToken,
        state: &mut MappingState<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<()> {
        match value {
            TemplateToken::Mapping(entries) => {
                self.expand_entries(entries, state, frame.deeper(), path)
            }
            TemplateToken::Expression(ExpressionToken::Basic(text)) => {
                let Some(result) = self.evaluate(text, frame, path)? else {
                    return Ok(());
                };
                match &result.value {
                    ContextValue::Dictionary(dict) => {
                        for (key, value) in dict.iter() {
                            self.insert_value(key, value.clone(), result.is_secret, state, path)?;
                        }
                    }
                    ContextValue::Null => {}
                    other => self.error(
                        TemplateErrorKind::InvalidDirective,
                        format!(
                            "'${{{{ insert }}}}' requires a mapping, found {}",
                            other.kind()
                        ),
                        path,
                    ),
                }
                Ok(())
            }
            other => {
                self.error(
                    TemplateErrorKind::InvalidDirective,
                    format!(
                        "'${{{{ insert }}}}' requires a mapping, found {}",
                        other.type_name()
                    ),
                    path,
                );
                Ok(())
            }
        }
    }

    fn key_name(
        &self,
        key: &TemplateToken,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<Option<(String, bool)>> {
        match key {
            TemplateToken::String(s) => Ok(Some((s.clone(), false))),
            TemplateToken::Expression(ExpressionToken::Basic(text)) => {
                let Some(result) = self.evaluate(text, frame, path)? else {
                    return Ok(None);
                };
                match result.value {
                    ContextValue::String(s) => Ok(Some((s, result.is_secret))),
                    value @ (ContextValue::Boolean(_) | ContextValue::Number(_)) => {
                        Ok(Some((value.as_string(), result.is_secret)))
                    }
                    other => {
                        self.error(
                            TemplateErrorKind::TypeMismatch,
                            format!("mapping key must be a string, found {}", other.kind()),
                            path,
                        );
                        Ok(None)
                    }
                }
            }
            other => {
                self.error(
                    TemplateErrorKind::ParseError,
                    format!("invalid mapping key of type {}", other.type_name()),
                    path,
                );
                Ok(None)
            }
        }
    }

    /// Narrow the candidates by `key` and return the definitions its value
    /// must match
    fn narrow(&self, state: &mut MappingState<'a>, key: &str) -> Option<DefinitionSet<'a>> {
        let declared: Vec<&'a MappingDefinition> = state
            .candidates
            .iter()
            .copied()
            .filter(|mapping| mapping.property(key).is_some())
            .collect();

        if !declared.is_empty() {
            let mut types: Vec<&'a str> = Vec::new();
            for mapping in &declared {
                if let Some(property) = mapping.property(key) {
                    if !types.contains(&property.type_name.as_str()) {
                        types.push(property.type_name.as_str());
                    }
                }
            }
            state.candidates = declared;
            return Some(self.schema.definition_set(types));
        }

        let loose: Vec<&'a MappingDefinition> = state
            .candidates
            .iter()
            .copied()
            .filter(|mapping| match mapping.loose_key_type.as_deref() {
                Some(key_type) => self.schema.definition_set([key_type]).accepts_string(key),
                None => false,
            })
            .collect();

        if loose.is_empty() {
            return None;
        }

        let mut types: Vec<&'a str> = Vec::new();
        for mapping in &loose {
            let value_type = mapping.loose_value_type.as_deref().unwrap_or("any");
            if !types.contains(&value_type) {
                types.push(value_type);
            }
        }
        state.candidates = loose;
        Some(self.schema.definition_set(types))
    }

    fn expand_entry(
        &self,
        name: String,
        secret_key: bool,
        value: &TemplateToken,
        state: &mut MappingState<'a>,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<()> {
        let entry_path = path.key(name.as_str());
        let Some(value_set) = self.admit_key(&name, secret_key, state, path) else {
            return Ok(());
        };

        self.charge(2 * name.len(), &entry_path)?;
        if let Some(value) =
            self.guard(self.expand_node(value, &value_set, frame.deeper(), &entry_path))?
        {
            state.out.insert(name, value);
        }
        Ok(())
    }

    /// Add an entry produced by `${{ insert }}`; the value is checked strictly
    fn insert_value(
        &self,
        name: &str,
        value: ContextValue,
        is_secret: bool,
        state: &mut MappingState<'a>,
        path: &DocumentPath,
    ) -> Expansion<()> {
        let entry_path = path.key(name);
        let Some(value_set) = self.admit_key(name, is_secret, state, path) else {
            return Ok(());
        };

        self.charge(2 * name.len() + value_size(&value), &entry_path)?;
        if let Err(message) = self.check_value(&value, &value_set) {
            self.error(TemplateErrorKind::TypeMismatch, message, &entry_path);
            return Ok(());
        }
        if is_secret {
            self.secrets.borrow_mut().push(entry_path);
        }
        state.out.insert(name, value);
        Ok(())
    }

    /// Check `name` against the keys so far and narrow the candidates,
    /// returning the definitions its value must match. Secret keys are
    /// recorded so their text is masked in output and diagnostics.
    fn admit_key(
        &self,
        name: &str,
        secret_key: bool,
        state: &mut MappingState<'a>,
        path: &DocumentPath,
    ) -> Option<DefinitionSet<'a>> {
        let shown = if secret_key { SECRET_MASK } else { name };
        if state.out.contains_key(name) {
            self.error(
                TemplateErrorKind::DuplicateKey,
                format!("duplicate key '{}'", shown),
                &path.key(shown),
            );
            return None;
        }
        let Some(value_set) = self.narrow(state, name) else {
            self.error(
                TemplateErrorKind::UnexpectedProperty,
                format!("unexpected property '{}'", shown),
                &path.key(shown),
            );
            return None;
        };
        if secret_key {
            self.secret_keys.borrow_mut().push(path.key(name));
        }
        Some(value_set)
    }

    fn check_required(&self, state: &MappingState<'a>, path: &DocumentPath) {
        let satisfied = state.candidates.iter().any(|mapping| {
            mapping
                .required()
                .all(|property| state.out.contains_key(property))
        });
        if satisfied {
            return;
        }

        if let Some(mapping) = state.candidates.first() {
            for property in mapping.required() {
                if !state.out.contains_key(property) {
                    self.error(
                        TemplateErrorKind::MissingRequiredProperty,
                        format!("missing required property '{}'", property),
                        path,
                    );
                }
            }
        }
    }

    // =========================================================================
    // Directives
    // =========================================================================

    fn select_branch<'t>(
        &self,
        directive: &'t ExpressionToken,
        chain: &mut Chain,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<Branch<'t>> {
        match directive {
            ExpressionToken::If(condition) => {
                chain.active = true;
                chain.taken = self.condition(condition, frame, path)?;
                debug!(%condition, taken = chain.taken, "evaluated if");
                Ok(if chain.taken {
                    Branch::Take
                } else {
                    Branch::Skip
                })
            }
            ExpressionToken::ElseIf(condition) => {
                if !chain.active {
                    self.error(
                        TemplateErrorKind::InvalidDirective,
                        "'${{ elseif }}' must follow '${{ if }}' or '${{ elseif }}'",
                        path,
                    );
                    return Ok(Branch::Skip);
                }
                if chain.taken {
                    return Ok(Branch::Skip);
                }
                chain.taken = self.condition(condition, frame, path)?;
                debug!(%condition, taken = chain.taken, "evaluated elseif");
                Ok(if chain.taken {
                    Branch::Take
                } else {
                    Branch::Skip
                })
            }
            ExpressionToken::Else => {
                if !chain.active {
                    self.error(
                        TemplateErrorKind::InvalidDirective,
                        "'${{ else }}' must follow '${{ if }}' or '${{ elseif }}'",
                        path,
                    );
                    return Ok(Branch::Skip);
                }
                let taken = !chain.taken;
                chain.reset();
                debug!(taken, "evaluated else");
                Ok(if taken { Branch::Take } else { Branch::Skip })
            }
            ExpressionToken::Each {
                variable,
                collection,
            } => {
                chain.reset();
                let values = self.iterate(collection, frame, path)?;
                debug!(
                    %variable,
                    %collection,
                    iterations = values.len(),
                    "expanding each"
                );
                Ok(Branch::Each {
                    variable: variable.as_str(),
                    values,
                })
            }
            ExpressionToken::Insert => {
                chain.reset();
                Ok(Branch::Insert)
            }
            ExpressionToken::Basic(_) => {
                chain.reset();
                Ok(Branch::Skip)
            }
        }
    }

    fn condition(&self, text: &str, frame: Frame<'_>, path: &DocumentPath) -> Expansion<bool> {
        Ok(self
            .evaluate(text, frame, path)?
            .map(|result| result.value.is_truthy())
            .unwrap_or(false))
    }

    /// Loop values of `${{ each }}`: array items, or `{key, value}` entries
    fn iterate(
        &self,
        collection: &str,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<Vec<EvaluationResult>> {
        let Some(result) = self.evaluate(collection, frame, path)? else {
            return Ok(Vec::new());
        };
        let is_secret = result.is_secret;
        let wrap = |value: ContextValue| EvaluationResult { value, is_secret };

        let values = match &result.value {
            ContextValue::Array(items) => items.iter().cloned().map(wrap).collect(),
            ContextValue::Dictionary(dict) => dict
                .iter()
                .map(|(key, value)| {
                    let mut entry = Dictionary::case_insensitive();
                    entry.insert("key", ContextValue::string(key));
                    entry.insert("value", value.clone());
                    wrap(ContextValue::dictionary(entry))
                })
                .collect(),
            ContextValue::Null => Vec::new(),
            other => {
                self.error(
                    TemplateErrorKind::InvalidDirective,
                    format!(
                        "'${{{{ each }}}}' requires a sequence or mapping, found {}",
                        other.kind()
                    ),
                    path,
                );
                Vec::new()
            }
        };
        Ok(values)
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Parse and evaluate one expression span. `None` when a diagnostic was
    /// recorded instead.
    fn evaluate(
        &self,
        text: &str,
        frame: Frame<'_>,
        path: &DocumentPath,
    ) -> Expansion<Option<EvaluationResult>> {
        if !frame.allows_expressions() {
            self.error(
                TemplateErrorKind::ExpressionNotAllowed,
                format!("expressions are not allowed here: '${{{{ {} }}}}'", text),
                path,
            );
            return Ok(None);
        }

        let ast = match ExprParser::parse_with(text, Some(self.functions), self.options.parser) {
            Ok(ast) => ast,
            Err(e) => {
                self.error(
                    TemplateErrorKind::ParseError,
                    format!("invalid expression '{}': {}", text, e),
                    path,
                );
                return Ok(None);
            }
        };

        if let Some(name) = ast.named_values().into_iter().find(|name| !frame.allows(name)) {
            self.error(
                TemplateErrorKind::UnrecognizedNamedValue,
                format!(
                    "unrecognized named value '{}'; available here: {}",
                    name,
                    frame.allowed.join(", ")
                ),
                path,
            );
            return Ok(None);
        }

        let resolver = ScopeResolver { pass: self, frame };
        let context = EvaluationContext::new(&resolver, self.functions);
        match Evaluator::new(&context).evaluate(&ast) {
            Ok(result) => {
                trace!(
                    expression = %ast,
                    kind = %result.value.kind(),
                    secret = result.is_secret,
                    path = %self.shown(path),
                    "evaluated expression"
                );
                Ok(Some(result))
            }
            Err(_) if self.exhausted.get() => Err(Fatal(None)),
            Err(e) if e.is_fatal() => Err(Fatal(Some(
                TemplateError::new(e.message, fatal_template_kind(e.kind))
                    .with_path(self.shown(path)),
            ))),
            Err(e) => {
                self.error(
                    TemplateErrorKind::ExpressionError,
                    format!("error evaluating '{}': {}", text, e.message),
                    path,
                );
                Ok(None)
            }
        }
    }

    /// Strict check of an expression result against the position's definitions
    fn check_value(&self, value: &ContextValue, set: &DefinitionSet<'a>) -> Result<(), String> {
        match value {
            ContextValue::Null | ContextValue::Boolean(_) | ContextValue::Number(_) => {
                if set.allows(value.kind()) {
                    Ok(())
                } else {
                    Err(describe_mismatch(set, value))
                }
            }
            ContextValue::String(s) => {
                if set.accepts_string(s) {
                    Ok(())
                } else {
                    Err(describe_mismatch(set, value))
                }
            }
            ContextValue::Array(items) => {
                let mut failure = describe_mismatch(set, value);
                for item_type in set.item_types() {
                    let item_set = self.schema.definition_set([item_type]);
                    let checked = items.iter().enumerate().try_for_each(|(i, item)| {
                        self.check_value(item, &item_set)
                            .map_err(|e| format!("[{}]: {}", i, e))
                    });
                    match checked {
                        Ok(()) => return Ok(()),
                        Err(e) => failure = e,
                    }
                }
                Err(failure)
            }
            ContextValue::Dictionary(dict) => {
                let mut failure = describe_mismatch(set, value);
                for mapping in set.mappings() {
                    match self.check_dictionary(dict, mapping) {
                        Ok(()) => return Ok(()),
                        Err(e) => failure = e,
                    }
                }
                Err(failure)
            }
        }
    }

    fn check_dictionary(
        &self,
        dict: &Dictionary,
        mapping: &'a MappingDefinition,
    ) -> Result<(), String> {
        for (key, value) in dict.iter() {
            let value_type = match (mapping.property(key), mapping.loose_key_type.as_deref()) {
                (Some(property), _) => property.type_name.as_str(),
                (None, Some(key_type))
                    if self.schema.definition_set([key_type]).accepts_string(key) =>
                {
                    mapping.loose_value_type.as_deref().unwrap_or("any")
                }
                _ => return Err(format!("unexpected property '{}'", key)),
            };
            self.check_value(value, &self.schema.definition_set([value_type]))
                .map_err(|e| format!("{}: {}", key, e))?;
        }

        match mapping.required().find(|property| !dict.contains_key(property)) {
            Some(missing) => Err(format!("missing required property '{}'", missing)),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Named values
    // =========================================================================

    fn resolve_root(
        &self,
        name: &str,
        frame: Frame<'_>,
    ) -> Result<Option<EvaluationResult>, EvalError> {
        let Some((root, binding)) = self.bindings.get(name) else {
            return Ok(None);
        };
        match binding {
            Binding::Value(result) => Ok(Some(result.clone())),
            Binding::Provider(provider) => provider.evaluate(root).map(Some),
            Binding::Members(members) => {
                let mut dict = Dictionary::case_insensitive();
                let mut is_secret = false;
                for (key, _) in members.values() {
                    let result = self.resolve_member(root, binding, key, frame)?;
                    is_secret |= result.is_secret;
                    dict.insert(key.as_str(), result.value);
                }
                Ok(Some(EvaluationResult {
                    value: ContextValue::dictionary(dict),
                    is_secret,
                }))
            }
        }
    }

    fn resolve_member(
        &self,
        root: &'a str,
        binding: &'a Binding,
        key: &str,
        frame: Frame<'_>,
    ) -> Result<EvaluationResult, EvalError> {
        match binding.member(key) {
            None => Ok(EvaluationResult::default()),
            Some((_, Member::Value(result))) => Ok(result.clone()),
            Some((key, Member::Deferred(template))) => {
                self.expand_deferred(root, key, template, frame)
            }
        }
    }

    /// Expand a deferred member on first reference, guarding against cycles
    fn expand_deferred(
        &self,
        root: &'a str,
        key: &'a str,
        template: &'a DeferredTemplate,
        frame: Frame<'_>,
    ) -> Result<EvaluationResult, EvalError> {
        let cache_key = (root.to_lowercase(), key.to_lowercase());
        if let Some(cached) = self.deferred.borrow().get(&cache_key) {
            return Ok(cached.clone());
        }

        let mut chain = Vec::new();
        let mut current = frame.in_flight;
        while let Some(entry) = current {
            chain.push(format!("{}.{}", entry.root, entry.key));
            if entry.root.eq_ignore_ascii_case(root) && entry.key.eq_ignore_ascii_case(key) {
                chain.reverse();
                chain.push(format!("{}.{}", root, key));
                return Err(EvalError::new(
                    EvalErrorKind::Cycle,
                    format!("circular reference: {}", chain.join(" -> ")),
                ));
            }
            current = entry.parent;
        }

        let depth = frame.depth + 1;
        if depth > self.options.max_depth {
            return Err(EvalError::new(
                EvalErrorKind::MaxDepthExceeded,
                format!(
                    "maximum expansion depth of {} exceeded while expanding '{}.{}'",
                    self.options.max_depth, root, key
                ),
            ));
        }

        debug!(
            name = %format_args!("{}.{}", root, key),
            type_name = %template.type_name,
            "expanding deferred value"
        );

        let in_flight = InFlight {
            root,
            key,
            parent: frame.in_flight,
        };
        let inner = Frame {
            allowed: &self.root_allowed,
            locals: None,
            in_flight: Some(&in_flight),
            depth,
        };

        let error_mark = self.errors.borrow().len();
        let dropped = self.dropped.get();
        let secret_mark = self.secrets.borrow().len();
        let secret_key_mark = self.secret_keys.borrow().len();

        let set = self.schema.definition_set([template.type_name.as_str()]);
        let path = DocumentPath::root().key(root).key(key);
        let result = self.expand_node(&template.token, &set, inner, &path);

        if self.exhausted.get() {
            return Err(EvalError::new(
                EvalErrorKind::Provider,
                "expanded document exceeds the maximum size",
            ));
        }

        let is_secret = {
            let mut secrets = self.secrets.borrow_mut();
            let mut secret_keys = self.secret_keys.borrow_mut();
            let is_secret = secrets.len() > secret_mark || secret_keys.len() > secret_key_mark;
            secrets.truncate(secret_mark);
            secret_keys.truncate(secret_key_mark);
            is_secret
        };
        let errors: Vec<TemplateError> = self.errors.borrow_mut().drain(error_mark..).collect();
        self.dropped.set(dropped);

        let value = match result {
            Ok(value) => value,
            Err(Fatal(Some(error))) => {
                return Err(EvalError::new(fatal_eval_kind(error.kind), error.message))
            }
            Err(Fatal(None)) => {
                return Err(EvalError::new(
                    EvalErrorKind::Provider,
                    "expanded document exceeds the maximum size",
                ))
            }
        };

        if let Some(error) = errors.iter().find(|e| e.kind.is_fatal()).or(errors.first()) {
            return Err(EvalError::new(
                fatal_eval_kind(error.kind),
                format!("invalid value for '{}.{}': {}", root, key, error.message),
            ));
        }

        let result = EvaluationResult { value, is_secret };
        self.deferred.borrow_mut().insert(cache_key, result.clone());
        Ok(result)
    }
}

/// Named value lookups from inside a pass: loop variables first, then the
/// bound roots
struct ScopeResolver<'p, 'a> {
    pass: &'p Pass<'a>,
    frame: Frame<'p>,
}

impl NamedValueResolver for ScopeResolver<'_, '_> {
    fn resolve(&self, name: &str) -> Result<Option<EvaluationResult>, EvalError> {
        if let Some(local) = self.frame.local(name) {
            return Ok(Some(local.clone()));
        }
        self.pass.resolve_root(name, self.frame)
    }

    fn resolve_member(&self, name: &str, key: &str) -> Option<Result<EvaluationResult, EvalError>> {
        if self.frame.local(name).is_some() {
            return None;
        }
        let (root, binding) = self.pass.bindings.get(name)?;
        match binding {
            Binding::Members(_) => Some(self.pass.resolve_member(root, binding, key, self.frame)),
            _ => None,
        }
    }

    fn has_members(&self, name: &str) -> bool {
        self.frame.local(name).is_none()
            && matches!(self.pass.bindings.get(name), Some((_, Binding::Members(_))))
    }
}

fn fatal_template_kind(kind: EvalErrorKind) -> TemplateErrorKind {
    match kind {
        EvalErrorKind::Cycle => TemplateErrorKind::CircularReference,
        EvalErrorKind::MaxDepthExceeded => TemplateErrorKind::MaxDepthExceeded,
        _ => TemplateErrorKind::ExpressionError,
    }
}

fn fatal_eval_kind(kind: TemplateErrorKind) -> EvalErrorKind {
    match kind {
        TemplateErrorKind::CircularReference => EvalErrorKind::Cycle,
        TemplateErrorKind::MaxDepthExceeded => EvalErrorKind::MaxDepthExceeded,
        _ => EvalErrorKind::Provider,
    }
}

fn describe_mismatch(set: &DefinitionSet<'_>, value: &ContextValue) -> String {
    match value {
        ContextValue::String(s) if set.has_strings() => {
            format!("'{}' is not an allowed value for {}", s, set)
        }
        other => format!("expected {}, found {}", set, other.kind()),
    }
}

/// Approximate in-memory size of a produced value
fn value_size(value: &ContextValue) -> usize {
    match value {
        ContextValue::String(s) => NODE_BYTES + 2 * s.len(),
        ContextValue::Array(items) => NODE_BYTES + items.iter().map(value_size).sum::<usize>(),
        ContextValue::Dictionary(dict) => {
            NODE_BYTES
                + dict
                    .iter()
                    .map(|(key, value)| 2 * key.len() + value_size(value))
                    .sum::<usize>()
        }
        _ => NODE_BYTES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::reader::TemplateReader;
    use crate::test_utils::init_test_logging;
    use pretty_assertions::assert_eq;

    const SCHEMA: &str = r#"
definitions:
  pipeline:
    context: [parameters, variables]
    mapping:
      properties:
        name: non-empty-string
        ready: boolean
        count: number
        value: any
        steps: steps
        env: env
        trigger: trigger
  steps:
    sequence:
      item-type: step
  step:
    mapping:
      properties:
        script: { type: non-empty-string, required: true }
        displayName: string
        condition: condition
  condition:
    context: []
    string: {}
  env:
    mapping:
      loose-key-type: non-empty-string
      loose-value-type: string
  trigger:
    string:
      constant: manual
      ignore-case: true
  static:
    context: []
    mapping:
      properties:
        name: string
  numbers:
    sequence:
      item-type: number
"#;

    fn schema() -> TemplateSchema {
        TemplateSchema::from_yaml(SCHEMA).unwrap()
    }

    fn dict(entries: Vec<(&str, ContextValue)>) -> ContextValue {
        ContextValue::dictionary(entries.into_iter().collect())
    }

    fn variables() -> Bindings {
        let mut bindings = Bindings::new();
        bindings.insert(
            "variables",
            dict(vec![
                ("x", ContextValue::string("ready")),
                (
                    "list",
                    ContextValue::array(vec![ContextValue::string("a"), ContextValue::string("b")]),
                ),
                (
                    "envs",
                    dict(vec![
                        ("dev", ContextValue::string("d1")),
                        ("prod", ContextValue::string("p1")),
                    ]),
                ),
                ("extra", dict(vec![("ready", ContextValue::Boolean(true))])),
            ]),
        );
        bindings
    }

    fn expand_as(
        source: &str,
        type_name: &str,
        bindings: &Bindings,
        options: TemplateOptions,
    ) -> Result<ExpandedDocument, TemplateErrors> {
        init_test_logging();
        let schema = schema();
        let functions = FunctionTable::builtin();
        let token = TemplateReader::read_yaml(source).unwrap();
        TemplateEngine::new(&schema, &functions)
            .with_options(options)
            .expand(&token, type_name, bindings)
    }

    fn expand(source: &str, bindings: &Bindings) -> Result<ExpandedDocument, TemplateErrors> {
        expand_as(source, "pipeline", bindings, TemplateOptions::default())
    }

    fn expand_ok(source: &str) -> ContextValue {
        match expand(source, &variables()) {
            Ok(document) => document.value,
            Err(errors) => panic!("expansion failed: {}", errors),
        }
    }

    fn expand_err(source: &str) -> TemplateErrors {
        expand(source, &variables()).unwrap_err()
    }

    fn get<'v>(value: &'v ContextValue, key: &str) -> &'v ContextValue {
        value.as_dictionary().and_then(|d| d.get(key)).unwrap()
    }

    fn scripts(value: &ContextValue) -> Vec<String> {
        get(value, "steps")
            .as_array()
            .unwrap()
            .iter()
            .map(|step| get(step, "script").as_string())
            .collect()
    }

    #[test]
    fn test_expression_in_boolean_position() {
        let value = expand_ok("ready: ${{ eq(variables.x, 'ready') }}");
        assert_eq!(get(&value, "ready"), &ContextValue::Boolean(true));
    }

    #[test]
    fn test_missing_variable_is_null() {
        let value = expand_ok("value: ${{ variables.missing }}");
        assert_eq!(get(&value, "value"), &ContextValue::Null);
    }

    #[test]
    fn test_literals() {
        let value = expand_ok("name: 42\ncount: 3\ntrigger: Manual\nvalue: [1, x]");
        assert_eq!(get(&value, "name"), &ContextValue::string("42"));
        assert_eq!(get(&value, "count"), &ContextValue::Number(3.0));
        assert_eq!(get(&value, "trigger"), &ContextValue::string("Manual"));
        assert_eq!(
            get(&value, "value"),
            &ContextValue::array(vec![ContextValue::Number(1.0), ContextValue::string("x")])
        );
    }

    #[test]
    fn test_literal_type_mismatch() {
        let errors = expand_err("ready: maybe\ntrigger: auto\nname: ''");
        let messages: Vec<_> = errors.iter().map(|e| e.message.clone()).collect();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e.kind == TemplateErrorKind::TypeMismatch));
        assert_eq!(messages[0], "expected boolean, found string");
        assert_eq!(messages[1], "'auto' is not an allowed value for trigger");
        assert_eq!(errors.first().unwrap().path.as_deref(), Some("ready"));
    }

    #[test]
    fn test_expression_result_is_not_coerced() {
        let errors = expand_err("count: ${{ variables.x }}");
        let error = errors.first().unwrap();
        assert_eq!(error.kind, TemplateErrorKind::TypeMismatch);
        assert_eq!(error.message, "expected number, found string");
        assert_eq!(error.path.as_deref(), Some("count"));
    }

    #[test]
    fn test_string_interpolation() {
        let value = expand_ok("name: build-${{ variables.x }}-${{ length(variables.list) }}");
        assert_eq!(get(&value, "name"), &ContextValue::string("build-ready-2"));
    }

    #[test]
    fn test_each_over_array() {
        let value = expand_ok(
            r#"
steps:
  - script: first
  - ${{ each item in variables.list }}:
    - script: echo ${{ item }}
"#,
        );
        assert_eq!(scripts(&value), vec!["first", "echo a", "echo b"]);
    }

    #[test]
    fn test_each_over_dictionary() {
        let value = expand_ok(
            r#"
env:
  ${{ each pair in variables.envs }}:
    ${{ pair.key }}: ${{ pair.value }}
"#,
        );
        let env = get(&value, "env");
        assert_eq!(
            env.as_dictionary().unwrap().keys().collect::<Vec<_>>(),
            vec!["dev", "prod"]
        );
        assert_eq!(get(env, "DEV"), &ContextValue::string("d1"));
        assert_eq!(get(env, "prod"), &ContextValue::string("p1"));
    }

    #[test]
    fn test_each_over_scalar_is_rejected() {
        let errors = expand_err("steps:\n  - ${{ each s in variables.x }}:\n    - script: a\n");
        assert_eq!(
            errors.first().unwrap().kind,
            TemplateErrorKind::InvalidDirective
        );
    }

    #[test]
    fn test_if_elseif_else_in_sequence() {
        let value = expand_ok(
            r#"
steps:
  - ${{ if eq(variables.x, 'no') }}:
    - script: first
  - ${{ elseif eq(variables.x, 'ready') }}:
    - script: second
  - ${{ else }}:
    - script: third
  - script: always
"#,
        );
        assert_eq!(scripts(&value), vec!["second", "always"]);
    }

    #[test]
    fn test_if_else_in_mapping() {
        let value = expand_ok(
            r#"
${{ if ne(variables.x, 'ready') }}:
  name: not-ready
${{ else }}:
  name: is-ready
count: 1
"#,
        );
        assert_eq!(get(&value, "name"), &ContextValue::string("is-ready"));
        assert_eq!(get(&value, "count"), &ContextValue::Number(1.0));
    }

    #[test]
    fn test_else_without_if() {
        let errors = expand_err("steps:\n  - script: a\n  - ${{ else }}:\n    - script: b\n");
        let error = errors.first().unwrap();
        assert_eq!(error.kind, TemplateErrorKind::InvalidDirective);
        assert_eq!(error.path.as_deref(), Some("steps[1]"));
    }

    #[test]
    fn test_insert() {
        let value = expand_ok("name: base\n${{ insert }}: ${{ variables.extra }}\n");
        assert_eq!(get(&value, "name"), &ContextValue::string("base"));
        assert_eq!(get(&value, "ready"), &ContextValue::Boolean(true));

        let errors = expand_err("${{ insert }}: ${{ variables.list }}\n");
        assert_eq!(
            errors.first().unwrap().kind,
            TemplateErrorKind::InvalidDirective
        );
    }

    #[test]
    fn test_structural_errors() {
        let errors = expand_err(
            r#"
bogus: 1
name: a
NAME: b
steps:
  - displayName: no script
"#,
        );
        let kinds: Vec<_> = errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TemplateErrorKind::UnexpectedProperty,
                TemplateErrorKind::DuplicateKey,
                TemplateErrorKind::MissingRequiredProperty,
            ]
        );
        let paths: Vec<_> = errors.iter().filter_map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec!["bogus", "NAME", "steps[0]"]);
    }

    #[test]
    fn test_expression_not_allowed() {
        let errors = expand_err("steps:\n  - script: run\n    condition: ${{ variables.x }}\n");
        let error = errors.first().unwrap();
        assert_eq!(error.kind, TemplateErrorKind::ExpressionNotAllowed);
        assert_eq!(error.path.as_deref(), Some("steps[0].condition"));

        let errors = expand_as(
            "name: ${{ variables.x }}",
            "static",
            &variables(),
            TemplateOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            errors.first().unwrap().kind,
            TemplateErrorKind::ExpressionNotAllowed
        );
    }

    #[test]
    fn test_unrecognized_named_value() {
        let mut bindings = variables();
        bindings.insert("secrets", ContextValue::Null);
        let errors = expand("name: ${{ secrets.token }}", &bindings).unwrap_err();
        let error = errors.first().unwrap();
        assert_eq!(error.kind, TemplateErrorKind::UnrecognizedNamedValue);
        assert!(error.message.contains("'secrets'"));
    }

    #[test]
    fn test_expression_errors_are_collected() {
        let errors = expand_err("name: ${{ eq(1) }}\ncount: ${{ variables.x[0] }}\nvalue: ${{ nope(1) }}");
        let kinds: Vec<_> = errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TemplateErrorKind::ParseError,
                TemplateErrorKind::ExpressionError,
                TemplateErrorKind::ExpressionError,
            ]
        );
    }

    #[test]
    fn test_provider_failure() {
        let mut bindings = Bindings::new();
        bindings.insert_provider("variables", |_: &str| -> Result<EvaluationResult, EvalError> {
            Err(EvalError::new(EvalErrorKind::Provider, "vault unavailable"))
        });
        let errors = expand("name: ${{ variables.x }}", &bindings).unwrap_err();
        let error = errors.first().unwrap();
        assert_eq!(error.kind, TemplateErrorKind::ExpressionError);
        assert!(error.message.contains("vault unavailable"));
    }

    #[test]
    fn test_self_referencing_default_is_a_cycle() {
        let mut bindings = Bindings::new();
        bindings.insert_deferred(
            "parameters",
            "p",
            DeferredTemplate::new(TemplateToken::expression("parameters.p"), "string"),
        );

        let errors = expand("name: ${{ parameters.p }}\ncount: 1", &bindings).unwrap_err();
        assert_eq!(errors.len(), 1);
        let error = errors.first().unwrap();
        assert_eq!(error.kind, TemplateErrorKind::CircularReference);
        assert_eq!(error.path.as_deref(), Some("name"));
        assert!(error
            .message
            .contains("parameters.p -> parameters.p"));
    }

    #[test]
    fn test_indirect_cycle() {
        let mut bindings = Bindings::new();
        bindings.insert_deferred(
            "parameters",
            "a",
            DeferredTemplate::new(
                TemplateReader::read_scalar("${{ parameters.b }}-a").unwrap(),
                "string",
            ),
        );
        bindings.insert_deferred(
            "parameters",
            "b",
            DeferredTemplate::new(TemplateToken::expression("parameters.a"), "string"),
        );

        let errors = expand("name: ${{ parameters.a }}", &bindings).unwrap_err();
        let error = errors.first().unwrap();
        assert_eq!(error.kind, TemplateErrorKind::CircularReference);
        assert!(error
            .message
            .contains("parameters.a -> parameters.b -> parameters.a"));
    }

    #[test]
    fn test_deferred_defaults_reference_each_other() {
        let mut bindings = variables();
        bindings.insert_member("parameters", "env", EvaluationResult::new("prod"));
        bindings.insert_deferred(
            "parameters",
            "name",
            DeferredTemplate::new(
                TemplateReader::read_scalar("app-${{ parameters.env }}").unwrap(),
                "string",
            ),
        );
        bindings.insert_deferred(
            "parameters",
            "broken",
            DeferredTemplate::new(TemplateToken::expression("parameters.broken"), "string"),
        );

        let value = expand("name: ${{ parameters.name }}", &bindings).unwrap().value;
        assert_eq!(get(&value, "name"), &ContextValue::string("app-prod"));
    }

    #[test]
    fn test_max_depth() {
        let mut token = TemplateToken::string("leaf");
        for _ in 0..60 {
            token = TemplateToken::Mapping(vec![(TemplateToken::string("a"), token)]);
        }
        let document = TemplateToken::Mapping(vec![(TemplateToken::string("value"), token)]);

        let schema = schema();
        let functions = FunctionTable::builtin();
        let errors = TemplateEngine::new(&schema, &functions)
            .expand(&document, "pipeline", &Bindings::new())
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.first().unwrap().kind,
            TemplateErrorKind::MaxDepthExceeded
        );
    }

    #[test]
    fn test_error_cap() {
        let options = TemplateOptions {
            max_errors: 2,
            ..TemplateOptions::default()
        };
        let errors = expand_as("[a, b, c, d, e]", "numbers", &Bindings::new(), options).unwrap_err();
        let kinds: Vec<_> = errors.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TemplateErrorKind::TypeMismatch,
                TemplateErrorKind::TypeMismatch,
                TemplateErrorKind::TooManyErrors,
            ]
        );
        assert!(errors.iter().last().unwrap().message.contains("3 more omitted"));
    }

    #[test]
    fn test_error_messages_are_truncated() {
        let options = TemplateOptions {
            max_error_message_length: 10,
            ..TemplateOptions::default()
        };
        let errors = expand_as("ready: maybe", "pipeline", &Bindings::new(), options).unwrap_err();
        assert_eq!(errors.first().unwrap().message, "expected b[...]");
    }

    #[test]
    fn test_max_bytes() {
        let mut bindings = Bindings::new();
        let big: Vec<ContextValue> = (0..200).map(|_| ContextValue::string("xxxxxxxxxx")).collect();
        bindings.insert("variables", dict(vec![("big", ContextValue::array(big))]));
        let options = TemplateOptions {
            max_bytes: 1_000,
            ..TemplateOptions::default()
        };

        let source = "steps:\n  - ${{ each item in variables.big }}:\n    - script: ${{ item }}\n";
        let errors = expand_as(source, "pipeline", &bindings, options).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors.first().unwrap().kind,
            TemplateErrorKind::MaxBytesExceeded
        );
    }

    #[test]
    fn test_secrets_are_tracked_and_masked() {
        let mut bindings = Bindings::new();
        bindings.insert_member("variables", "token", EvaluationResult::secret("hunter2"));
        bindings.insert_member("variables", "x", EvaluationResult::new("plain"));

        let document = expand(
            "name: login-${{ variables.token }}\nvalue: ${{ variables.x }}\nsteps:\n  - script: ${{ variables.token }}\n",
            &bindings,
        )
        .unwrap();

        let name = DocumentPath::root().key("name");
        let script = DocumentPath::root().key("steps").index(0).key("script");
        assert_eq!(document.secrets, vec![name.clone(), script.clone()]);
        assert!(document.is_secret(&name));
        assert!(!document.is_secret(&DocumentPath::root().key("value")));
        assert_eq!(get(&document.value, "name"), &ContextValue::string("login-hunter2"));

        let masked = document.masked();
        assert_eq!(get(&masked, "name"), &ContextValue::string(SECRET_MASK));
        assert_eq!(get(&masked, "value"), &ContextValue::string("plain"));
        assert_eq!(scripts(&masked), vec![SECRET_MASK]);
    }

    fn keys(value: &ContextValue) -> Vec<String> {
        match value {
            ContextValue::Dictionary(dict) => dict.keys().map(str::to_string).collect(),
            other => panic!("expected a mapping, found {:?}", other),
        }
    }

    #[test]
    fn test_secret_keys_are_masked() {
        let mut bindings = Bindings::new();
        bindings.insert_member("variables", "token", EvaluationResult::secret("hunter2"));
        bindings.insert_member("variables", "other", EvaluationResult::secret("swordfish"));

        let document = expand(
            "env:\n  \"${{ variables.token }}\": x\n  \"${{ variables.other }}\": y\n  plain: ${{ variables.token }}\n",
            &bindings,
        )
        .unwrap();

        let env = get(&document.value, "env");
        assert_eq!(keys(env), vec!["hunter2", "swordfish", "plain"]);
        assert_eq!(
            document.secret_keys,
            vec![
                DocumentPath::root().key("env").key("hunter2"),
                DocumentPath::root().key("env").key("swordfish"),
            ]
        );
        assert_eq!(document.secret_count(), 3);

        let masked = document.masked();
        let env = get(&masked, "env");
        assert_eq!(keys(env), vec!["***", "***2", "plain"]);
        assert_eq!(get(env, "***"), &ContextValue::string("x"));
        assert_eq!(get(env, "plain"), &ContextValue::string(SECRET_MASK));
    }

    #[test]
    fn test_inserted_secret_keys_are_masked() {
        let mut bindings = Bindings::new();
        bindings.insert_member(
            "variables",
            "creds",
            EvaluationResult::secret(dict(vec![("hunter2", ContextValue::string("v"))])),
        );

        let document = expand("env:\n  ${{ insert }}: ${{ variables.creds }}\n", &bindings).unwrap();
        let masked = document.masked();
        assert_eq!(keys(get(&masked, "env")), vec![SECRET_MASK]);
        assert_eq!(get(get(&masked, "env"), SECRET_MASK), &ContextValue::string(SECRET_MASK));
    }

    #[test]
    fn test_secret_keys_are_masked_in_diagnostics() {
        let mut bindings = Bindings::new();
        bindings.insert_member("variables", "token", EvaluationResult::secret("hunter2"));

        let errors = expand(
            "\"${{ variables.token }}\": x\nenv:\n  \"${{ variables.token }}\": [1]\n",
            &bindings,
        )
        .unwrap_err();

        let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        assert_eq!(rendered.len(), 2);
        assert!(rendered.iter().all(|e| !e.contains("hunter2")), "{:?}", rendered);
        assert_eq!(errors.first().unwrap().kind, TemplateErrorKind::UnexpectedProperty);
        assert_eq!(errors.first().unwrap().path.as_deref(), Some(SECRET_MASK));
        assert_eq!(
            errors.iter().nth(1).unwrap().path.as_deref(),
            Some("env.***")
        );
    }

    #[test]
    fn test_unknown_type() {
        let errors = expand_as("a: 1", "nope", &Bindings::new(), TemplateOptions::default())
            .unwrap_err();
        assert!(errors.first().unwrap().message.contains("'nope'"));
    }

    #[test]
    fn test_shared_inputs_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TemplateSchema>();
        assert_send_sync::<FunctionTable>();
        assert_send_sync::<crate::expression::NamedValues>();
        assert_send_sync::<Bindings>();
    }

    #[test]
    fn test_parallel_expansion() {
        let schema = schema();
        let functions = FunctionTable::builtin();
        let bindings = variables();
        let token = TemplateReader::read_yaml(
            "steps:\n  - ${{ each item in variables.list }}:\n    - script: ${{ upper(item) }}\n",
        )
        .unwrap();
        let engine = TemplateEngine::new(&schema, &functions);

        let results: Vec<ExpandedDocument> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| engine.expand(&token, "pipeline", &bindings).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for document in &results {
            assert_eq!(scripts(&document.value), vec!["A", "B"]);
        }
    }
}
