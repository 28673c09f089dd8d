//! Three-stage dependency pipeline demo: process `one` seeds a random value
//! on insert, `two` doubles it on update and sometimes contributes a third
//! value, `three` sums all three once `two`'s `c` clears a threshold.
//!
//! Wires the full stack (a real `mongodb::Client`, a file-backed resume
//! token, graceful shutdown on Ctrl-C) the way `bin/fc-dev` wires its own
//! components.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document};
use clap::Parser;
use rand::Rng;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fc_common::Result;
use fc_stream::{
    AcknowledgeCallback, FileResumeTokenStore, MongoRepository, OperationType, OperationTypeDependency,
    ProcessCallback, ProcessDependency, Repository, StreamConfig, Watch,
};

/// Stream processor demo: a three-stage dependency pipeline over a MongoDB
/// change stream.
#[derive(Parser, Debug)]
#[command(name = "fc-stream-processor")]
#[command(about = "Runs the one -> two -> three demo pipeline against a MongoDB collection")]
struct Args {
    /// MongoDB connection string.
    #[arg(long, env = "FC_STREAM_MONGO_URI", default_value = "mongodb://localhost:27017")]
    connection_string: String,

    /// Database holding the watched collection.
    #[arg(long, env = "FC_STREAM_DATABASE", default_value = "fc_stream_demo")]
    database: String,

    /// Collection whose documents carry the pipeline's process subtrees.
    #[arg(long, env = "FC_STREAM_COLLECTION", default_value = "items")]
    collection: String,

    /// Local file the resume token is checkpointed to.
    #[arg(long, env = "FC_STREAM_RESUME_TOKEN_PATH", default_value = "resume_token.bin")]
    resume_token_path: String,
}

impl From<Args> for StreamConfig {
    fn from(args: Args) -> Self {
        Self {
            connection_string: args.connection_string,
            database: args.database,
            collection: args.collection,
            resume_token_path: args.resume_token_path,
            ..Default::default()
        }
    }
}

struct AlwaysAcknowledge;

#[async_trait]
impl AcknowledgeCallback for AlwaysAcknowledge {
    async fn acknowledge(&self, _document: &Document) -> Result<bool> {
        Ok(true)
    }
}

struct SeedRandomValue;

#[async_trait]
impl ProcessCallback for SeedRandomValue {
    async fn process(&self, _document: &Document) -> Result<(bool, Document)> {
        let a = rand::thread_rng().gen_range(0..=9);
        Ok((true, doc! { "a": a }))
    }
}

struct DoubleAndMaybeSeedC;

#[async_trait]
impl ProcessCallback for DoubleAndMaybeSeedC {
    async fn process(&self, document: &Document) -> Result<(bool, Document)> {
        let a = document.get_document("one")?.get_i32("a")?;
        let mut results = doc! { "b": a * 2 };
        if a < 4 {
            let c = rand::thread_rng().gen_range(0..=9);
            results.insert("c", c);
        }
        Ok((true, results))
    }
}

struct AcknowledgeCExceedsTwo;

#[async_trait]
impl AcknowledgeCallback for AcknowledgeCExceedsTwo {
    async fn acknowledge(&self, document: &Document) -> Result<bool> {
        let c = document.get_document("two")?.get_i32("c").unwrap_or(0);
        Ok(c > 2)
    }
}

struct SumAll;

#[async_trait]
impl ProcessCallback for SumAll {
    async fn process(&self, document: &Document) -> Result<(bool, Document)> {
        let a = document.get_document("one")?.get_i32("a")?;
        let two = document.get_document("two")?;
        let b = two.get_i32("b")?;
        let c = two.get_i32("c").unwrap_or(0);
        Ok((true, doc! { "sum": a + b + c }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!(error = %e, "fc-stream-processor exited with an error");
        return Err(e);
    }

    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = StreamConfig::from(args);

    let client = mongodb::Client::with_uri_str(&config.connection_string).await?;
    let resume_tokens = Arc::new(FileResumeTokenStore::with_interval(
        config.resume_token_path.clone(),
        config.resume_token_save_interval,
    ));
    let repository: Arc<dyn Repository> = Arc::new(MongoRepository::new(
        client,
        &config.database,
        &config.collection,
        resume_tokens,
    ));

    let mut watch_one = Watch::new(repository.clone());
    watch_one.add_dependency(OperationTypeDependency::new([OperationType::Insert]));
    watch_one.start_worker("one", Arc::new(AlwaysAcknowledge), Arc::new(SeedRandomValue), true)?;

    let mut watch_two = Watch::new(repository.clone());
    watch_two.add_dependency(ProcessDependency::new("one"));
    watch_two.start_worker(
        "two",
        Arc::new(AlwaysAcknowledge),
        Arc::new(DoubleAndMaybeSeedC),
        true,
    )?;

    let mut watch_three = Watch::new(repository.clone());
    watch_three.add_dependency(
        ProcessDependency::new("two")
            .trigger_if_rerun(true)
            .required_results(["c"]),
    );
    watch_three.start_worker("three", Arc::new(AcknowledgeCExceedsTwo), Arc::new(SumAll), true)?;

    info!("fc-stream-processor running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining workers");

    // Give in-flight handlers a moment before the process exits, on top of
    // each worker's own grace-period drain.
    tokio::time::sleep(Duration::from_millis(100)).await;
    watch_one.stop_all().await;
    watch_two.stop_all().await;
    watch_three.stop_all().await;

    Ok(())
}
