//! The orchestrator a caller actually constructs: groups dependencies, owns
//! the per-operation-type workers they imply, and fans start/stop out
//! across them.
//!
//! A manager-over-a-map, in the spirit of `fc-router`'s `QueueManager`
//! holding pools keyed by pool code, scoped down to what a single watch
//! needs: one dependency set, one worker per operation type.

use std::collections::HashMap;
use std::sync::Arc;

use fc_common::{ProcessingError, Result};

use crate::dependency::{Dependency, MultipleDependency};
use crate::filter::FilterBuilder;
use crate::op_type::OperationType;
use crate::repository::Repository;
use crate::worker::{AcknowledgeCallback, DispatchPolicy, ProcessCallback, Worker};

/// Groups a set of dependencies and owns the workers they imply.
pub struct Watch {
    repository: Arc<dyn Repository>,
    dependencies: MultipleDependency,
    workers: HashMap<String, Worker>,
}

impl Watch {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            repository,
            dependencies: MultipleDependency::new(),
            workers: HashMap::new(),
        }
    }

    pub fn add_dependency(&mut self, dependency: impl Into<Dependency>) -> &mut Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Compiles a filter per operation type implied by the registered
    /// dependencies, then constructs and starts one worker per type, keyed
    /// `<name>_<op_type>`. Rejects an empty dependency set and duplicate
    /// worker keys with [`ProcessingError::Configuration`].
    pub fn start_worker(
        &mut self,
        name: &str,
        acknowledge: Arc<dyn AcknowledgeCallback>,
        process: Arc<dyn ProcessCallback>,
        resume: bool,
    ) -> Result<()> {
        self.start_worker_with_policy(name, acknowledge, process, resume, DispatchPolicy::default())
    }

    pub fn start_worker_with_policy(
        &mut self,
        name: &str,
        acknowledge: Arc<dyn AcknowledgeCallback>,
        process: Arc<dyn ProcessCallback>,
        resume: bool,
        policy: DispatchPolicy,
    ) -> Result<()> {
        if self.dependencies.is_empty() {
            return Err(ProcessingError::Configuration(format!(
                "watch \"{name}\" has no dependencies; at minimum an OperationTypeDependency is required"
            )));
        }

        let op_types = self.dependencies.operation_types();

        for &op_type in &op_types {
            let key = worker_key(name, op_type);
            if self.workers.contains_key(&key) {
                return Err(ProcessingError::Configuration(format!(
                    "worker \"{key}\" is already started"
                )));
            }
        }

        for op_type in op_types {
            let key = worker_key(name, op_type);
            let match_doc = compile_filter(&self.dependencies, name, op_type);

            let mut worker = Worker::new(
                name,
                match_doc,
                self.repository.clone(),
                acknowledge.clone(),
                process.clone(),
                policy,
            );
            worker.start(resume);
            self.workers.insert(key, worker);
        }

        Ok(())
    }

    /// Stops every worker concurrently and joins them all.
    pub async fn stop_all(&mut self) {
        let workers: Vec<Worker> = self.workers.drain().map(|(_, worker)| worker).collect();
        futures::future::join_all(workers.into_iter().map(|mut worker| async move {
            worker.stop().await;
        }))
        .await;
    }

    pub fn worker_names(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }
}

fn worker_key(name: &str, op_type: OperationType) -> String {
    format!("{name}_{op_type}")
}

fn compile_filter(dependencies: &MultipleDependency, name: &str, op_type: OperationType) -> bson::Document {
    let mut builder = FilterBuilder::new(op_type);
    for child in dependencies.children() {
        child.contribute(name, op_type, &mut builder);
    }
    builder.build(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::OperationTypeDependency;
    use crate::repository::test_support::InMemoryRepository;
    use async_trait::async_trait;
    use bson::Document;

    struct NoopAck;
    #[async_trait]
    impl AcknowledgeCallback for NoopAck {
        async fn acknowledge(&self, _document: &Document) -> Result<bool> {
            Ok(false)
        }
    }

    struct NoopProcess;
    #[async_trait]
    impl ProcessCallback for NoopProcess {
        async fn process(&self, _document: &Document) -> Result<(bool, Document)> {
            Ok((true, Document::new()))
        }
    }

    #[tokio::test]
    async fn start_worker_rejects_an_empty_dependency_set() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut watch = Watch::new(repo);

        let result = watch.start_worker("one", Arc::new(NoopAck), Arc::new(NoopProcess), true);
        assert!(matches!(result, Err(ProcessingError::Configuration(_))));
    }

    #[tokio::test]
    async fn start_worker_rejects_a_duplicate_key() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut watch = Watch::new(repo);
        watch.add_dependency(OperationTypeDependency::new([OperationType::Insert]));

        watch
            .start_worker("one", Arc::new(NoopAck), Arc::new(NoopProcess), true)
            .unwrap();

        let second = watch.start_worker("one", Arc::new(NoopAck), Arc::new(NoopProcess), true);
        assert!(matches!(second, Err(ProcessingError::Configuration(_))));

        watch.stop_all().await;
    }

    #[tokio::test]
    async fn start_worker_spawns_one_worker_per_operation_type() {
        let repo = Arc::new(InMemoryRepository::new());
        let mut watch = Watch::new(repo);
        watch.add_dependency(OperationTypeDependency::new([
            OperationType::Insert,
            OperationType::Update,
        ]));

        watch
            .start_worker("two", Arc::new(NoopAck), Arc::new(NoopProcess), true)
            .unwrap();

        let mut names: Vec<&str> = watch.worker_names().collect();
        names.sort();
        assert_eq!(names, vec!["two_insert", "two_update"]);

        watch.stop_all().await;
    }
}
