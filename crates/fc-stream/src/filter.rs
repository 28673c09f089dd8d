//! Compiles a watch's dependencies into a single `$match` document for the
//! change stream aggregation pipeline.
//!
//! The match document is assembled through [`FilterBuilder`], a small mutable
//! context that dependencies push constraints into (see
//! [`crate::dependency::Dependency::contribute`]), and finished with
//! [`FilterBuilder::build`]. Keeping the accumulation and the final assembly
//! separate is what isolates the update-event dot-path workaround
//! (`dot_path_equals`) to a single call site.

use bson::{doc, Bson, Document};

use crate::op_type::OperationType;

/// Accumulates the pieces of a match document as dependencies contribute to
/// it, then assembles them into the final shape described in the filter
/// compiler design.
pub struct FilterBuilder {
    match_doc: Document,
    /// Extra top-level `$and` clauses (currently only the update-transition
    /// workaround), beyond the first-run/rerun `$or`.
    and_clauses: Vec<Document>,
    /// Disjunction members beyond the built-in "process has never run"
    /// clause; one per `ProcessDependency` with `trigger_if_rerun`.
    rerun_clauses: Vec<Document>,
}

impl FilterBuilder {
    pub fn new(op_type: OperationType) -> Self {
        let mut match_doc = Document::new();
        match_doc.insert("operationType", op_type.as_str());
        Self {
            match_doc,
            and_clauses: Vec::new(),
            rerun_clauses: Vec::new(),
        }
    }

    /// Require that `fullDocument.<path>` exists.
    pub fn require_exists(&mut self, path: &str) {
        self.match_doc
            .insert(format!("fullDocument.{path}"), doc! { "$exists": true });
    }

    /// Require that `fullDocument.<path>` equals `value`.
    pub fn require_eq(&mut self, path: &str, value: impl Into<Bson>) {
        self.match_doc
            .insert(format!("fullDocument.{path}"), value.into());
    }

    /// Add an extra clause to the outer `$and`, alongside the first-run/rerun
    /// disjunction. Used for the update-transition dot-path workaround.
    pub fn add_and_clause(&mut self, clause: Document) {
        self.and_clauses.push(clause);
    }

    /// Add a disjunction member to the first-run/rerun `$or`: "this upstream
    /// process re-ran after I last ran".
    pub fn add_rerun_clause(&mut self, clause: Document) {
        self.rerun_clauses.push(clause);
    }

    /// Assemble the final match document for a worker named `name`.
    pub fn build(mut self, name: &str) -> Document {
        let mut or_clauses = vec![doc! { format!("fullDocument.{name}"): { "$exists": false } }];
        or_clauses.extend(self.rerun_clauses);

        self.and_clauses.push(doc! { "$or": or_clauses });
        self.match_doc.insert("$and", self.and_clauses);
        self.match_doc
    }
}

/// Builds the `$or` workaround for matching on a dotted field name inside
/// `updateDescription.updatedFields`, which can't be addressed directly with
/// a dotted key because the key itself (not just the path to it) contains a
/// literal dot.
///
/// Emits two equivalent clauses: a direct (and usually sufficient) dotted-key
/// match, and an `$expr` that converts `updatedFields` to a `{k, v}` array and
/// filters for the matching key — the only route the query language provides
/// to express this robustly in all server versions.
pub fn dot_path_equals(field: &str, value: impl Into<Bson>) -> Document {
    let value = value.into();
    doc! {
        "$or": [
            {
                "$expr": {
                    "$eq": [
                        {
                            "$let": {
                                "vars": {
                                    "entry": {
                                        "$arrayElemAt": [
                                            {
                                                "$filter": {
                                                    "input": { "$objectToArray": "$updateDescription.updatedFields" },
                                                    "cond": { "$eq": [field, "$$this.k"] },
                                                },
                                            },
                                            0,
                                        ],
                                    },
                                },
                                "in": "$$entry.v",
                            },
                        },
                        value.clone(),
                    ],
                },
            },
            { format!("updateDescription.updatedFields.{field}"): value },
        ],
    }
}

/// Asserts that `upstream`'s `endTime` and `startTime` are both strictly
/// greater than `name`'s — i.e. `upstream` was re-run after `name` last ran.
pub fn rerun_expr(upstream: &str, name: &str) -> Document {
    doc! {
        "$expr": {
            "$and": [
                { "$gt": [format!("$fullDocument.{upstream}.endTime"), format!("$fullDocument.{name}.endTime")] },
                { "$gt": [format!("$fullDocument.{upstream}.startTime"), format!("$fullDocument.{name}.startTime")] },
            ],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_run_clause_is_always_present() {
        let builder = FilterBuilder::new(OperationType::Insert);
        let match_doc = builder.build("one");

        assert_eq!(match_doc.get_str("operationType").unwrap(), "insert");
        let and = match_doc.get_array("$and").unwrap();
        let or_doc = and.last().unwrap().as_document().unwrap();
        let or = or_doc.get_array("$or").unwrap();
        assert_eq!(
            or[0].as_document().unwrap(),
            &doc! { "fullDocument.one": { "$exists": false } }
        );
    }

    #[test]
    fn required_exists_and_eq_land_on_the_top_level_match() {
        let mut builder = FilterBuilder::new(OperationType::Update);
        builder.require_exists("two.c");
        builder.require_eq("two.success", true);
        let match_doc = builder.build("three");

        assert_eq!(
            match_doc.get_document("fullDocument.two.c").unwrap(),
            &doc! { "$exists": true }
        );
        assert_eq!(match_doc.get_bool("fullDocument.two.success").unwrap(), true);
    }

    #[test]
    fn dot_path_workaround_has_the_direct_and_expr_variants() {
        let clause = dot_path_equals("one.success", true);
        let or = clause.get_array("$or").unwrap();
        assert_eq!(or.len(), 2);
        assert!(or[0].as_document().unwrap().contains_key("$expr"));
        assert_eq!(
            or[1].as_document().unwrap(),
            &doc! { "updateDescription.updatedFields.one.success": true }
        );
    }
}
