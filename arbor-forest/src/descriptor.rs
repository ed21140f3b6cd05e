// Copyright 2026 foyer Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Operation descriptors and resolved selections.
//!
//! Documents are built programmatically ([`Document`], [`SelectionSet`], [`Field`]); no query syntax is parsed.
//! Resolving a document against variables produces an [`OperationDescriptor`] whose [`PossibleSelections`] carry the
//! per-type [`ResolvedSelection`]s with resolved arguments and normalized field identities.

use std::{fmt::Display, sync::Arc};

use arbor_common::error::{Error, ErrorKind, Result};
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use itertools::Itertools;
use serde_json::{Map, Value};

use crate::policy::{KeyArgs, PolicyTable};

/// GraphQL type name.
pub type TypeName = Arc<str>;
/// Globally unique node identity.
pub type NodeKey = Arc<str>;

/// Root node key of query operations.
pub const ROOT_QUERY: &str = "ROOT_QUERY";
/// Root node key of mutation operations.
pub const ROOT_MUTATION: &str = "ROOT_MUTATION";
/// Root node key of subscription operations.
pub const ROOT_SUBSCRIPTION: &str = "ROOT_SUBSCRIPTION";
/// Response key of the type name meta field.
pub const TYPENAME_FIELD: &str = "__typename";

/// Arena id of a registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u32);

impl OperationId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    /// Index in the operation arena.
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Kind of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    /// Query operation.
    Query,
    /// Mutation operation.
    Mutation,
    /// Subscription operation.
    Subscription,
    /// Fragment on a node, rooted at an explicit node key.
    Fragment,
}

/// Argument value of a field in a document.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    /// Literal value.
    Literal(Value),
    /// Reference to an operation variable.
    Variable(String),
}

/// Condition of a `@skip` / `@include` directive.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Literal condition.
    Literal(bool),
    /// Condition read from a boolean variable.
    Variable(String),
}

impl Condition {
    fn evaluate(&self, variables: &Map<String, Value>) -> bool {
        match self {
            Condition::Literal(b) => *b,
            Condition::Variable(name) => variables.get(name).and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

/// A field of a selection set.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    alias: Option<String>,
    arguments: Vec<(String, ArgumentValue)>,
    selection: Option<SelectionSet>,
    skip: Option<Condition>,
    include: Option<Condition>,
    type_name: Option<String>,
}

impl Field {
    /// Create a leaf field.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            arguments: vec![],
            selection: None,
            skip: None,
            include: None,
            type_name: None,
        }
    }

    /// Set the response key alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Add a literal argument.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.push((name.into(), ArgumentValue::Literal(value.into())));
        self
    }

    /// Add an argument bound to an operation variable.
    pub fn var_arg(mut self, name: impl Into<String>, variable: impl Into<String>) -> Self {
        self.arguments.push((name.into(), ArgumentValue::Variable(variable.into())));
        self
    }

    /// Set the sub-selection, which makes the field composite.
    pub fn selection(mut self, selection: SelectionSet) -> Self {
        self.selection = Some(selection);
        self
    }

    /// Set the type name of the composite value, used to resolve field policies of the sub-selection.
    pub fn of_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    /// Attach `@skip(if: ...)`.
    pub fn skip_if(mut self, condition: Condition) -> Self {
        self.skip = Some(condition);
        self
    }

    /// Attach `@include(if: ...)`.
    pub fn include_if(mut self, condition: Condition) -> Self {
        self.include = Some(condition);
        self
    }

    /// Field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Response key.
    pub fn data_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    fn is_skipped(&self, variables: &Map<String, Value>) -> bool {
        if let Some(skip) = &self.skip {
            if skip.evaluate(variables) {
                return true;
            }
        }
        if let Some(include) = &self.include {
            if !include.evaluate(variables) {
                return true;
            }
        }
        false
    }
}

/// An inline fragment with a type condition.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineFragment {
    type_condition: String,
    selection: SelectionSet,
}

/// A set of fields plus type conditioned inline fragments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionSet {
    fields: Vec<Field>,
    fragments: Vec<InlineFragment>,
}

impl SelectionSet {
    /// Create an empty selection set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field.
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Add leaf fields by name.
    pub fn leaves<'a>(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.fields.extend(names.into_iter().map(Field::new));
        self
    }

    /// Add an inline fragment `... on Type { ... }`.
    pub fn on(mut self, type_condition: impl Into<String>, selection: SelectionSet) -> Self {
        self.fragments.push(InlineFragment {
            type_condition: type_condition.into(),
            selection,
        });
        self
    }
}

/// A query, mutation, subscription or fragment document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    name: String,
    kind: DocumentKind,
    root_type: String,
    selection: SelectionSet,
    variable_defaults: Map<String, Value>,
    key_variables: Option<Vec<String>>,
}

impl Document {
    /// Create a query document.
    pub fn query(name: impl Into<String>, selection: SelectionSet) -> Self {
        Self::new(name, DocumentKind::Query, "Query", selection)
    }

    /// Create a mutation document.
    pub fn mutation(name: impl Into<String>, selection: SelectionSet) -> Self {
        Self::new(name, DocumentKind::Mutation, "Mutation", selection)
    }

    /// Create a subscription document.
    pub fn subscription(name: impl Into<String>, selection: SelectionSet) -> Self {
        Self::new(name, DocumentKind::Subscription, "Subscription", selection)
    }

    /// Create a fragment document on the given type.
    pub fn fragment(name: impl Into<String>, type_condition: impl Into<String>, selection: SelectionSet) -> Self {
        Self::new(name, DocumentKind::Fragment, type_condition, selection)
    }

    fn new(
        name: impl Into<String>,
        kind: DocumentKind,
        root_type: impl Into<String>,
        selection: SelectionSet,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            root_type: root_type.into(),
            selection,
            variable_defaults: Map::new(),
            key_variables: None,
        }
    }

    /// Declare a default value of a variable.
    pub fn with_variable_default(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variable_defaults.insert(name.into(), value.into());
        self
    }

    /// Restrict the variables that identify an operation of this document.
    ///
    /// Operations differing only in other variables share one descriptor.
    pub fn with_key_variables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_variables = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Document name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Document kind.
    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    /// Root type name.
    pub fn root_type(&self) -> &str {
        &self.root_type
    }
}

/// Normalized identity of a field: name plus key arguments.
///
/// Two fields with different aliases but the same name and key arguments are the same field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NormalizedField {
    name: Arc<str>,
    key: Arc<str>,
}

impl NormalizedField {
    /// Normalized field without arguments.
    pub fn plain(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            key: Arc::from(name),
        }
    }

    /// Normalized field with the given key arguments.
    pub fn with_args(name: &str, key_args: &Map<String, Value>) -> Self {
        if key_args.is_empty() {
            return Self::plain(name);
        }
        let key = format!("{name}({})", canonical_json(&Value::Object(key_args.clone())));
        Self {
            name: Arc::from(name),
            key: Arc::from(key),
        }
    }

    /// Field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store field name, e.g. `user({"id":"1"})`.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Display for NormalizedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// A resolved field of a [`ResolvedSelection`].
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,
    /// Response key (alias or name).
    pub data_key: String,
    /// Resolved arguments, if any.
    pub args: Option<Arc<Map<String, Value>>>,
    /// Normalized identity.
    pub normalized: NormalizedField,
    /// Sub-selections of a composite field.
    pub selection: Option<Arc<PossibleSelections>>,
}

impl FieldInfo {
    /// Returns `true` if the field has a sub-selection.
    pub fn is_composite(&self) -> bool {
        self.selection.is_some()
    }
}

/// Selection of one object type with resolved arguments.
#[derive(Debug)]
pub struct ResolvedSelection {
    /// Object type this selection applies to; `None` for the default selection.
    pub type_name: Option<TypeName>,
    /// Fields keyed by response key.
    pub fields: IndexMap<String, FieldInfo>,
    /// Normalized fields in selection order; the initial queue of a difference.
    pub field_queue: Vec<NormalizedField>,
    /// Response keys of fields skipped by directives.
    pub skipped_fields: HashSet<String>,
    /// Response key by normalized field.
    pub normalized_fields: HashMap<NormalizedField, String>,
}

impl ResolvedSelection {
    /// Get a field by response key.
    pub fn field(&self, data_key: &str) -> Option<&FieldInfo> {
        self.fields.get(data_key)
    }

    /// Get a field by normalized identity.
    pub fn field_by_normalized(&self, normalized: &NormalizedField) -> Option<&FieldInfo> {
        self.normalized_fields.get(normalized).and_then(|k| self.fields.get(k))
    }

    /// Iterate over fields with the given name, regardless of arguments and aliases.
    pub fn fields_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FieldInfo> + 'a {
        self.fields.values().filter(move |f| f.name == name)
    }
}

/// All selections a composite value may be read with, per concrete type.
#[derive(Debug)]
pub struct PossibleSelections {
    default: Arc<ResolvedSelection>,
    by_type: HashMap<TypeName, Arc<ResolvedSelection>>,
    signature: Arc<str>,
}

impl PossibleSelections {
    /// Resolve the selection for the given concrete type.
    pub fn resolve(&self, type_name: Option<&str>) -> &Arc<ResolvedSelection> {
        type_name.and_then(|t| self.by_type.get(t)).unwrap_or(&self.default)
    }

    /// The selection used when the concrete type is unknown.
    pub fn default_selection(&self) -> &Arc<ResolvedSelection> {
        &self.default
    }

    /// Canonical shape signature, equal for equal shapes.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Returns `true` if both possible selections describe the same shape.
    pub fn same_shape(a: &Arc<PossibleSelections>, b: &Arc<PossibleSelections>) -> bool {
        Arc::ptr_eq(a, b) || a.signature == b.signature
    }
}

/// A document resolved against concrete variables.
#[derive(Debug)]
pub struct OperationDescriptor {
    /// Arena id.
    pub id: OperationId,
    /// Source document.
    pub document: Arc<Document>,
    /// Root type name.
    pub root_type: TypeName,
    /// Root node key.
    pub root_node_key: NodeKey,
    /// Root selections.
    pub possible_selections: Arc<PossibleSelections>,
    /// Variables merged with document defaults.
    pub variables_with_defaults: Map<String, Value>,
    /// Canonical key of the identifying variables.
    pub variables_key: String,
    /// Variables that identify the operation, `None` means all.
    pub key_variables: Option<Vec<String>>,
}

impl OperationDescriptor {
    /// Resolve a document against variables.
    ///
    /// `root_node_key` is required for fragments and ignored otherwise.
    pub fn resolve(
        id: OperationId,
        document: Arc<Document>,
        variables: Option<&Map<String, Value>>,
        root_node_key: Option<&str>,
        policies: &PolicyTable,
    ) -> Result<Self> {
        let mut variables_with_defaults = document.variable_defaults.clone();
        if let Some(variables) = variables {
            for (k, v) in variables {
                variables_with_defaults.insert(k.clone(), v.clone());
            }
        }
        let variables_key = variables_key(&variables_with_defaults, document.key_variables.as_deref());

        let root_node_key: NodeKey = match document.kind {
            DocumentKind::Query => Arc::from(ROOT_QUERY),
            DocumentKind::Mutation => Arc::from(ROOT_MUTATION),
            DocumentKind::Subscription => Arc::from(ROOT_SUBSCRIPTION),
            DocumentKind::Fragment => match root_node_key {
                Some(key) => Arc::from(key),
                None => {
                    return Err(Error::new(ErrorKind::InvalidData, "fragment operations require a root node key")
                        .with_context("document", &document.name))
                }
            },
        };

        let resolver = Resolver {
            variables: &variables_with_defaults,
            policies,
        };
        let possible_selections = resolver.resolve(&document.selection, Some(&document.root_type));

        Ok(Self {
            id,
            root_type: Arc::from(document.root_type.as_str()),
            key_variables: document.key_variables.clone(),
            document,
            root_node_key,
            possible_selections,
            variables_with_defaults,
            variables_key,
        })
    }

    /// Human readable name for logs and notifications.
    pub fn debug_name(&self) -> String {
        if self.variables_key == "{}" {
            self.document.name.clone()
        } else {
            format!("{}{}", self.document.name, self.variables_key)
        }
    }

    /// Names of the fields selected at the root.
    pub fn root_field_names(&self) -> impl Iterator<Item = &str> {
        self.possible_selections
            .default_selection()
            .fields
            .values()
            .map(|f| f.name.as_str())
    }

    /// Returns `true` if this is a fragment operation.
    pub fn is_fragment(&self) -> bool {
        self.document.kind == DocumentKind::Fragment
    }
}

struct Resolver<'a> {
    variables: &'a Map<String, Value>,
    policies: &'a PolicyTable,
}

impl Resolver<'_> {
    fn resolve(&self, set: &SelectionSet, type_hint: Option<&str>) -> Arc<PossibleSelections> {
        let base = self.collect(set, None);
        let default = Arc::new(self.resolve_fields(&base, type_hint));

        let mut by_type = HashMap::new();
        for type_condition in set.fragments.iter().map(|f| f.type_condition.as_str()).unique() {
            let fields = self.collect(set, Some(type_condition));
            by_type.insert(
                TypeName::from(type_condition),
                Arc::new(self.resolve_fields(&fields, Some(type_condition))),
            );
        }

        let signature = std::iter::once(signature_of(&default))
            .chain(
                by_type
                    .iter()
                    .sorted_by(|a, b| a.0.cmp(b.0))
                    .map(|(t, s)| format!("...on {t}{}", signature_of(s))),
            )
            .join("");

        Arc::new(PossibleSelections {
            default,
            by_type,
            signature: Arc::from(signature),
        })
    }

    /// Collect fields applying to the given type condition, merged by response key.
    fn collect(&self, set: &SelectionSet, type_condition: Option<&str>) -> CollectedFields {
        let mut collected = CollectedFields::default();
        self.collect_into(set, type_condition, &mut collected);
        collected
    }

    fn collect_into(&self, set: &SelectionSet, type_condition: Option<&str>, collected: &mut CollectedFields) {
        for field in set.fields.iter() {
            let data_key = field.data_key().to_string();
            if field.is_skipped(self.variables) {
                collected.skipped.insert(data_key);
                continue;
            }
            match collected.fields.get_mut(&data_key) {
                Some(existing) => {
                    // Same response key selected twice, merge sub-selections.
                    if let (Some(a), Some(b)) = (&mut existing.selection, &field.selection) {
                        a.fields.extend(b.fields.iter().cloned());
                        a.fragments.extend(b.fragments.iter().cloned());
                    }
                }
                None => {
                    collected.fields.insert(data_key, field.clone());
                }
            }
        }
        if let Some(type_condition) = type_condition {
            for fragment in set.fragments.iter().filter(|f| f.type_condition == type_condition) {
                self.collect_into(&fragment.selection, Some(type_condition), collected);
            }
        }
    }

    fn resolve_fields(&self, collected: &CollectedFields, type_name: Option<&str>) -> ResolvedSelection {
        let mut fields = IndexMap::with_capacity(collected.fields.len());
        let mut field_queue = Vec::with_capacity(collected.fields.len());
        let mut normalized_fields = HashMap::with_capacity(collected.fields.len());

        for (data_key, field) in collected.fields.iter() {
            let args = self.resolve_arguments(&field.arguments);
            let normalized = self.normalize(type_name, &field.name, args.as_deref());
            let selection = field
                .selection
                .as_ref()
                .map(|set| self.resolve(set, field.type_name.as_deref()));

            field_queue.push(normalized.clone());
            normalized_fields.insert(normalized.clone(), data_key.clone());
            fields.insert(
                data_key.clone(),
                FieldInfo {
                    name: field.name.clone(),
                    data_key: data_key.clone(),
                    args,
                    normalized,
                    selection,
                },
            );
        }

        ResolvedSelection {
            type_name: type_name.map(TypeName::from),
            fields,
            field_queue,
            skipped_fields: collected.skipped.clone(),
            normalized_fields,
        }
    }

    fn resolve_arguments(&self, arguments: &[(String, ArgumentValue)]) -> Option<Arc<Map<String, Value>>> {
        if arguments.is_empty() {
            return None;
        }
        let mut args = Map::new();
        for (name, value) in arguments {
            match value {
                ArgumentValue::Literal(v) => {
                    args.insert(name.clone(), v.clone());
                }
                ArgumentValue::Variable(variable) => {
                    // Undefined variables drop the argument.
                    if let Some(v) = self.variables.get(variable) {
                        args.insert(name.clone(), v.clone());
                    }
                }
            }
        }
        Some(Arc::new(args))
    }

    fn normalize(&self, type_name: Option<&str>, field_name: &str, args: Option<&Map<String, Value>>) -> NormalizedField {
        let Some(args) = args else {
            return NormalizedField::plain(field_name);
        };
        let key_args = type_name.and_then(|t| self.policies.key_args(t, field_name));
        match key_args {
            None | Some(KeyArgs::All) => NormalizedField::with_args(field_name, args),
            Some(KeyArgs::Ignore) => NormalizedField::plain(field_name),
            Some(KeyArgs::Only(names)) => NormalizedField::with_args(field_name, &filter_args(args, names)),
            Some(KeyArgs::Custom(f)) => match f(type_name.unwrap_or_default(), field_name, args) {
                Some(names) => NormalizedField::with_args(field_name, &filter_args(args, &names)),
                None => NormalizedField::with_args(field_name, args),
            },
        }
    }
}

#[derive(Default)]
struct CollectedFields {
    fields: IndexMap<String, Field>,
    skipped: HashSet<String>,
}

fn filter_args(args: &Map<String, Value>, names: &[String]) -> Map<String, Value> {
    names
        .iter()
        .filter_map(|n| args.get(n).map(|v| (n.clone(), v.clone())))
        .collect()
}

fn signature_of(selection: &ResolvedSelection) -> String {
    let fields = selection
        .fields
        .values()
        .map(|f| match &f.selection {
            Some(s) => format!("{}:{}{}", f.data_key, f.normalized, s.signature()),
            None => format!("{}:{}", f.data_key, f.normalized),
        })
        .join(",");
    format!("{{{fields}}}")
}

fn variables_key(variables: &Map<String, Value>, key_variables: Option<&[String]>) -> String {
    let filtered: Map<String, Value> = match key_variables {
        Some(names) => names
            .iter()
            .filter_map(|n| variables.get(n).map(|v| (n.clone(), v.clone())))
            .collect(),
        None => variables.clone(),
    };
    canonical_json(&Value::Object(filtered))
}

/// Serialize a JSON value with object keys sorted recursively.
pub fn canonical_json(value: &Value) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(o) => Value::Object(
                o.iter()
                    .sorted_by(|a, b| a.0.cmp(b.0))
                    .map(|(k, v)| (k.clone(), sort(v)))
                    .collect(),
            ),
            Value::Array(a) => Value::Array(a.iter().map(sort).collect()),
            v => v.clone(),
        }
    }
    sort(value).to_string()
}
