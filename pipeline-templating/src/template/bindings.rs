// Template bindings
// Named values supplied to an expansion pass, including lazily expanded members

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::expression::evaluator::{EvaluationResult, NamedValueProvider};
use crate::expression::value::{ContextValue, Dictionary};
use crate::template::token::TemplateToken;

/// A template expanded on first reference, e.g. a parameter default
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredTemplate {
    pub token: TemplateToken,
    /// Schema definition the expanded value must match
    pub type_name: String,
}

impl DeferredTemplate {
    pub fn new(token: TemplateToken, type_name: impl Into<String>) -> Self {
        Self {
            token,
            type_name: type_name.into(),
        }
    }
}

#[derive(Clone)]
pub(crate) enum Member {
    Value(EvaluationResult),
    Deferred(DeferredTemplate),
}

#[derive(Clone)]
pub(crate) enum Binding {
    Value(EvaluationResult),
    /// Root whose members resolve individually, so one deferred member
    /// does not force the others
    Members(IndexMap<String, (String, Member)>),
    Provider(Arc<dyn NamedValueProvider>),
}

/// Named values visible to expressions during expansion.
///
/// Roots are looked up case-insensitively. Bindings are read-only during a
/// pass and can be shared between threads running parallel passes.
#[derive(Clone, Default)]
pub struct Bindings {
    // lowercase name -> (name, binding)
    roots: IndexMap<String, (String, Binding)>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ContextValue>) {
        self.insert_result(name, EvaluationResult::new(value));
    }

    pub fn insert_secret(&mut self, name: impl Into<String>, value: impl Into<ContextValue>) {
        self.insert_result(name, EvaluationResult::secret(value));
    }

    pub fn insert_result(&mut self, name: impl Into<String>, result: EvaluationResult) {
        self.set_root(name.into(), Binding::Value(result));
    }

    pub fn insert_provider(
        &mut self,
        name: impl Into<String>,
        provider: impl NamedValueProvider + 'static,
    ) {
        self.set_root(name.into(), Binding::Provider(Arc::new(provider)));
    }

    /// Bind `root.key` to a value. A root that was bound as a whole value or
    /// a provider is replaced.
    pub fn insert_member(
        &mut self,
        root: impl Into<String>,
        key: impl Into<String>,
        result: EvaluationResult,
    ) {
        self.set_member(root.into(), key.into(), Member::Value(result));
    }

    /// Bind `root.key` to a template expanded on first reference
    pub fn insert_deferred(
        &mut self,
        root: impl Into<String>,
        key: impl Into<String>,
        template: DeferredTemplate,
    ) {
        self.set_member(root.into(), key.into(), Member::Deferred(template));
    }

    /// Bind every entry of `values` as a root
    pub fn extend_from_dictionary(&mut self, values: &Dictionary) {
        for (name, value) in values.iter() {
            self.insert(name, value.clone());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.roots.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.roots.values().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<(&str, &Binding)> {
        self.roots
            .get(&name.to_lowercase())
            .map(|(name, binding)| (name.as_str(), binding))
    }

    fn set_root(&mut self, name: String, binding: Binding) {
        self.roots.insert(name.to_lowercase(), (name, binding));
    }

    fn set_member(&mut self, root: String, key: String, member: Member) {
        let entry = self
            .roots
            .entry(root.to_lowercase())
            .or_insert_with(|| (root, Binding::Members(IndexMap::new())));
        if !matches!(entry.1, Binding::Members(_)) {
            entry.1 = Binding::Members(IndexMap::new());
        }
        if let Binding::Members(members) = &mut entry.1 {
            members.insert(key.to_lowercase(), (key, member));
        }
    }
}

impl Binding {
    pub(crate) fn member(&self, key: &str) -> Option<(&str, &Member)> {
        match self {
            Binding::Members(members) => members
                .get(&key.to_lowercase())
                .map(|(key, member)| (key.as_str(), member)),
            _ => None,
        }
    }
}

impl fmt::Debug for Bindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, binding) in self.roots.values() {
            match binding {
                Binding::Value(result) if result.is_secret => map.entry(name, &"***"),
                Binding::Value(result) => map.entry(name, &result.value),
                Binding::Members(members) => {
                    map.entry(name, &members.values().map(|(k, _)| k).collect::<Vec<_>>())
                }
                Binding::Provider(_) => map.entry(name, &"<provider>"),
            };
        }
        map.finish()
    }
}
