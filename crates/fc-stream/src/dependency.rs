//! Declarative predicates that a watch's match filter is compiled from.
//!
//! Each variant contributes to a [`FilterBuilder`] (or, for
//! [`Dependency::OperationType`], contributes nothing — it only narrows which
//! operation types the watch's workers are started for). The update-transition
//! clause in [`ProcessDependency::contribute`] is driven by the `op_type`
//! parameter threaded through `contribute`, deliberately not by a field read
//! off the dependency itself — a per-dependency `operation_type` would be
//! meaningless here, since whether an update transition matters depends on
//! which operation type the *worker* consuming it is currently running as.

use bson::Bson;

use crate::filter::{dot_path_equals, rerun_expr, FilterBuilder};
use crate::op_type::OperationType;

/// Restricts which operation types a watch's workers are started for.
/// Contributes nothing to the match document itself.
#[derive(Debug, Clone)]
pub struct OperationTypeDependency {
    operation_types: Vec<OperationType>,
}

impl OperationTypeDependency {
    pub fn new(operation_types: impl IntoIterator<Item = OperationType>) -> Self {
        Self {
            operation_types: operation_types.into_iter().collect(),
        }
    }
}

/// Requires that `fullDocument.<key>` exists.
#[derive(Debug, Clone)]
pub struct RequiredKeyDependency {
    key: String,
    operation_types: Vec<OperationType>,
}

impl RequiredKeyDependency {
    pub fn new(key: impl Into<String>, operation_types: impl IntoIterator<Item = OperationType>) -> Self {
        Self {
            key: key.into(),
            operation_types: operation_types.into_iter().collect(),
        }
    }
}

/// Requires that `fullDocument.<key>` equals a literal value.
#[derive(Debug, Clone)]
pub struct KeyValueDependency {
    key: String,
    value: Bson,
    operation_types: Vec<OperationType>,
}

impl KeyValueDependency {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Bson>,
        operation_types: impl IntoIterator<Item = OperationType>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            operation_types: operation_types.into_iter().collect(),
        }
    }
}

/// Requires that an upstream process has completed successfully, optionally
/// with specific result keys present, and optionally re-triggers the current
/// process whenever the upstream process is re-run.
#[derive(Debug, Clone)]
pub struct ProcessDependency {
    process_name: String,
    operation_types: Vec<OperationType>,
    trigger_if_rerun: bool,
    required_results: Vec<String>,
}

impl ProcessDependency {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            operation_types: vec![OperationType::Update],
            trigger_if_rerun: true,
            required_results: Vec::new(),
        }
    }

    pub fn operation_types(mut self, operation_types: impl IntoIterator<Item = OperationType>) -> Self {
        self.operation_types = operation_types.into_iter().collect();
        self
    }

    pub fn trigger_if_rerun(mut self, trigger_if_rerun: bool) -> Self {
        self.trigger_if_rerun = trigger_if_rerun;
        self
    }

    pub fn required_results(mut self, required_results: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.required_results = required_results.into_iter().map(Into::into).collect();
        self
    }

    fn contribute(&self, name: &str, op_type: OperationType, builder: &mut FilterBuilder) {
        builder.require_eq(&format!("{}.success", self.process_name), true);

        if op_type == OperationType::Update {
            builder.add_and_clause(dot_path_equals(&format!("{}.success", self.process_name), true));
        }

        for result in &self.required_results {
            builder.require_exists(&format!("{}.{}", self.process_name, result));
        }

        if self.trigger_if_rerun {
            builder.add_rerun_clause(rerun_expr(&self.process_name, name));
        }
    }
}

/// A composite dependency: the union of its children's operation types, and
/// a `contribute` that forwards to each child whose own operation types
/// include the worker's `op_type`.
#[derive(Debug, Clone, Default)]
pub struct MultipleDependency {
    children: Vec<Dependency>,
}

impl MultipleDependency {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, dependency: Dependency) {
        self.children.push(dependency);

        let types = self.operation_types();
        if types.contains(&OperationType::Update) && types.contains(&OperationType::Replace) {
            tracing::warn!(
                "watch contains both update and replace dependencies; a replace \
                 event overwrites the document wholesale and can drop in-flight \
                 process state"
            );
        }
    }

    pub fn operation_types(&self) -> Vec<OperationType> {
        let mut types = Vec::new();
        for child in &self.children {
            for op_type in child.operation_types() {
                if !types.contains(&op_type) {
                    types.push(op_type);
                }
            }
        }
        types
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn children(&self) -> &[Dependency] {
        &self.children
    }
}

/// A declarative predicate contributing to a watch's match filter.
#[derive(Debug, Clone)]
pub enum Dependency {
    OperationType(OperationTypeDependency),
    RequiredKey(RequiredKeyDependency),
    KeyValue(KeyValueDependency),
    Process(ProcessDependency),
    Multiple(MultipleDependency),
}

impl Dependency {
    pub fn operation_types(&self) -> Vec<OperationType> {
        match self {
            Dependency::OperationType(d) => d.operation_types.clone(),
            Dependency::RequiredKey(d) => d.operation_types.clone(),
            Dependency::KeyValue(d) => d.operation_types.clone(),
            Dependency::Process(d) => d.operation_types.clone(),
            Dependency::Multiple(d) => d.operation_types(),
        }
    }

    /// Contributes this dependency's constraints to `builder`, for a worker
    /// consuming events of `op_type` named `name`. No-op for dependencies
    /// whose `operation_types` does not include `op_type`.
    pub fn contribute(&self, name: &str, op_type: OperationType, builder: &mut FilterBuilder) {
        if !self.operation_types().contains(&op_type) {
            return;
        }

        match self {
            Dependency::OperationType(_) => {}
            Dependency::RequiredKey(d) => builder.require_exists(&d.key),
            Dependency::KeyValue(d) => builder.require_eq(&d.key, d.value.clone()),
            Dependency::Process(d) => d.contribute(name, op_type, builder),
            Dependency::Multiple(d) => {
                for child in &d.children {
                    child.contribute(name, op_type, builder);
                }
            }
        }
    }
}

impl From<OperationTypeDependency> for Dependency {
    fn from(value: OperationTypeDependency) -> Self {
        Dependency::OperationType(value)
    }
}

impl From<RequiredKeyDependency> for Dependency {
    fn from(value: RequiredKeyDependency) -> Self {
        Dependency::RequiredKey(value)
    }
}

impl From<KeyValueDependency> for Dependency {
    fn from(value: KeyValueDependency) -> Self {
        Dependency::KeyValue(value)
    }
}

impl From<ProcessDependency> for Dependency {
    fn from(value: ProcessDependency) -> Self {
        Dependency::Process(value)
    }
}

impl From<MultipleDependency> for Dependency {
    fn from(value: MultipleDependency) -> Self {
        Dependency::Multiple(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterBuilder;

    #[test]
    fn process_dependency_requires_success_and_results() {
        let dep: Dependency = ProcessDependency::new("two")
            .trigger_if_rerun(true)
            .required_results(["c"])
            .into();

        let mut builder = FilterBuilder::new(OperationType::Update);
        dep.contribute("three", OperationType::Update, &mut builder);
        let match_doc = builder.build("three");

        assert_eq!(match_doc.get_bool("fullDocument.two.success").unwrap(), true);
        assert!(match_doc.contains_key("fullDocument.two.c"));

        let and = match_doc.get_array("$and").unwrap();
        assert_eq!(and.len(), 2, "expected the dot-path clause plus the rerun $or");
    }

    #[test]
    fn operation_type_dependency_contributes_nothing() {
        let dep: Dependency = OperationTypeDependency::new([OperationType::Insert]).into();
        let mut builder = FilterBuilder::new(OperationType::Insert);
        dep.contribute("one", OperationType::Insert, &mut builder);
        let match_doc = builder.build("one");

        // Only operationType and the mandatory first-run $and/$or should be present.
        assert_eq!(match_doc.keys().count(), 2);
    }

    #[test]
    fn multiple_dependency_unions_operation_types() {
        let mut multi = MultipleDependency::new();
        multi.push(OperationTypeDependency::new([OperationType::Insert]).into());
        multi.push(RequiredKeyDependency::new("k", [OperationType::Update]).into());

        let mut types = multi.operation_types();
        types.sort_by_key(|t| t.as_str());
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn multiple_dependency_only_forwards_to_matching_children() {
        let mut multi = MultipleDependency::new();
        multi.push(RequiredKeyDependency::new("insert_only", [OperationType::Insert]).into());
        multi.push(RequiredKeyDependency::new("update_only", [OperationType::Update]).into());

        let dep = Dependency::Multiple(multi);
        let mut builder = FilterBuilder::new(OperationType::Update);
        dep.contribute("x", OperationType::Update, &mut builder);
        let match_doc = builder.build("x");

        assert!(match_doc.contains_key("fullDocument.update_only"));
        assert!(!match_doc.contains_key("fullDocument.insert_only"));
    }
}
