//! Composable data-processing pipelines over a MongoDB change stream.
//!
//! A caller registers named processes behind a [`Watch`], each guarded by a
//! set of [`Dependency`] values; when a change matches the watch's compiled
//! filter, the registered acknowledge/process callbacks run against the
//! document and their outcome is written back into the same document's
//! per-process subtree. Processes form a DAG by depending on each other's
//! results through [`ProcessDependency`].

pub mod config;
pub mod dependency;
pub mod filter;
pub mod op_type;
pub mod repository;
pub mod resume_token;
pub mod watch;
pub mod worker;

pub use config::StreamConfig;
pub use dependency::{
    Dependency, KeyValueDependency, MultipleDependency, OperationTypeDependency, ProcessDependency,
    RequiredKeyDependency,
};
pub use op_type::OperationType;
pub use repository::{MongoRepository, Repository};
pub use resume_token::{FileResumeTokenStore, ResumeTokenStore};
pub use watch::Watch;
pub use worker::{AcknowledgeCallback, DispatchPolicy, ProcessCallback};

pub use fc_common::{ProcessingError, Result};
