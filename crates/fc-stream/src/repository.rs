//! The database-facing boundary every other component talks through.
//!
//! [`MongoRepository`] is the production implementation; tests exercise the
//! rest of the crate against an in-memory double (`InMemoryRepository`,
//! below) rather than a running server, mirroring the `MockDispatcher`
//! pattern used for `fc-outbox`'s message-group processor.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::{BoxStream, StreamExt};
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{Client, Collection};
use tracing::warn;

use fc_common::{ProcessingError, Result};

use crate::resume_token::ResumeTokenStore;

/// Thin async interface over the document store: change-stream
/// subscription, status writes, and resume-token persistence.
///
/// Any `key`/`data` field name may itself contain `.`; callers are
/// responsible for avoiding collisions with user-owned fields, the
/// adapter treats them as nested-path updates per the query language.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Subscribes to the collection's change stream filtered by `match_doc`,
    /// requesting the full post-image on every event. When `resume` is
    /// `true` and a token was previously saved, resumes from it; a stale
    /// token is logged at WARN and the subscription is retried from the
    /// current position instead of failing the call.
    async fn watch(
        &self,
        match_doc: Document,
        resume: bool,
    ) -> Result<BoxStream<'static, Result<ChangeStreamEvent<Document>>>>;

    async fn update(&self, doc_id: &Bson, data: Document, time_fields: &[&str]) -> Result<()>;

    async fn increment(&self, doc_id: &Bson, key: &str, delta: i64, time_fields: &[&str]) -> Result<()>;

    async fn add_to_set(&self, doc_id: &Bson, key: &str, value: Bson, time_fields: &[&str]) -> Result<()>;

    /// Marks a process as started: `{name.success: false, name.isRunning:
    /// true}`, with `name.startTime` and any `extra_time_fields` stamped to
    /// the server clock.
    async fn start_process(&self, doc_id: &Bson, name: &str, extra_time_fields: &[&str]) -> Result<()>;

    /// Marks a process as finished, writing `results` flat under `name`
    /// alongside `name.success`/`name.isRunning`, with `name.endTime`
    /// stamped to the server clock.
    async fn end_process(
        &self,
        doc_id: &Bson,
        name: &str,
        success: bool,
        results: Document,
        extra_time_fields: &[&str],
    ) -> Result<()>;

    async fn save_resume_token(&self, event: &ChangeStreamEvent<Document>);

    async fn load_resume_token(&self) -> Option<ResumeToken>;
}

fn time_fields_doc(time_fields: &[&str]) -> Document {
    let mut doc = Document::new();
    for field in time_fields {
        doc.insert(*field, true);
    }
    doc
}

/// Returns `true` for change-stream errors the worker should reconnect
/// through with backoff rather than treat as fatal — anything that isn't a
/// stale-resume-token condition (that case gets its own, faster-recovering
/// branch).
pub fn is_resumable(error: &mongodb::error::Error) -> bool {
    !is_stale_resume_token_error(error)
}

pub fn is_stale_resume_token_error(error: &mongodb::error::Error) -> bool {
    let message = error.to_string().to_lowercase();
    (message.contains("changestream") && message.contains("history"))
        || message.contains("resume token")
        || message.contains("oplog")
        || message.contains("invalidate")
}

/// Production [`Repository`] backed by a single MongoDB collection plus a
/// local resume-token file.
pub struct MongoRepository {
    collection: Collection<Document>,
    resume_tokens: Arc<dyn ResumeTokenStore>,
}

impl MongoRepository {
    pub fn new(
        client: Client,
        database: &str,
        collection: &str,
        resume_tokens: Arc<dyn ResumeTokenStore>,
    ) -> Self {
        Self {
            collection: client.database(database).collection(collection),
            resume_tokens,
        }
    }

    async fn apply(&self, doc_id: &Bson, set: Document, time_fields: &[&str]) -> Result<()> {
        let filter = doc! { "_id": doc_id.clone() };
        let mut update = doc! { "$set": set };
        if !time_fields.is_empty() {
            update.insert("$currentDate", time_fields_doc(time_fields));
        }
        self.collection
            .update_one(filter, update)
            .upsert(true)
            .await
            .map_err(ProcessingError::from)?;
        Ok(())
    }
}

#[async_trait]
impl Repository for MongoRepository {
    async fn watch(
        &self,
        match_doc: Document,
        resume: bool,
    ) -> Result<BoxStream<'static, Result<ChangeStreamEvent<Document>>>> {
        let pipeline = vec![doc! { "$match": match_doc }];
        let mut options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();

        if resume {
            if let Some(token) = self.resume_tokens.load().await {
                options.resume_after = Some(token);
            }
        }

        let stream = match self.collection.watch().pipeline(pipeline.clone()).with_options(options).await {
            Ok(stream) => stream,
            Err(e) if resume && is_stale_resume_token_error(&e) => {
                warn!(error = %e, "resume token is stale, restarting from current position");
                self.resume_tokens.clear().await;
                let fresh_options = ChangeStreamOptions::builder()
                    .full_document(Some(FullDocumentType::UpdateLookup))
                    .build();
                self.collection
                    .watch()
                    .pipeline(pipeline)
                    .with_options(fresh_options)
                    .await
                    .map_err(ProcessingError::from)?
            }
            Err(e) => return Err(ProcessingError::from(e)),
        };

        Ok(stream.map(|item| item.map_err(ProcessingError::from)).boxed())
    }

    async fn update(&self, doc_id: &Bson, data: Document, time_fields: &[&str]) -> Result<()> {
        self.apply(doc_id, data, time_fields).await
    }

    async fn increment(&self, doc_id: &Bson, key: &str, delta: i64, time_fields: &[&str]) -> Result<()> {
        let filter = doc! { "_id": doc_id.clone() };
        let mut update = doc! { "$inc": { key: delta } };
        if !time_fields.is_empty() {
            update.insert("$currentDate", time_fields_doc(time_fields));
        }
        self.collection
            .update_one(filter, update)
            .upsert(true)
            .await
            .map_err(ProcessingError::from)?;
        Ok(())
    }

    async fn add_to_set(&self, doc_id: &Bson, key: &str, value: Bson, time_fields: &[&str]) -> Result<()> {
        let filter = doc! { "_id": doc_id.clone() };
        let mut update = doc! { "$addToSet": { key: value } };
        if !time_fields.is_empty() {
            update.insert("$currentDate", time_fields_doc(time_fields));
        }
        self.collection
            .update_one(filter, update)
            .upsert(true)
            .await
            .map_err(ProcessingError::from)?;
        Ok(())
    }

    async fn start_process(&self, doc_id: &Bson, name: &str, extra_time_fields: &[&str]) -> Result<()> {
        let set = doc! {
            format!("{name}.success"): false,
            format!("{name}.isRunning"): true,
        };
        let start_time_field = format!("{name}.startTime");
        let mut time_fields: Vec<&str> = vec![&start_time_field];
        time_fields.extend(extra_time_fields);
        self.apply(doc_id, set, &time_fields).await
    }

    async fn end_process(
        &self,
        doc_id: &Bson,
        name: &str,
        success: bool,
        results: Document,
        extra_time_fields: &[&str],
    ) -> Result<()> {
        let mut set = doc! {
            format!("{name}.success"): success,
            format!("{name}.isRunning"): false,
        };
        for (key, value) in results {
            set.insert(format!("{name}.{key}"), value);
        }
        let end_time_field = format!("{name}.endTime");
        let mut time_fields: Vec<&str> = vec![&end_time_field];
        time_fields.extend(extra_time_fields);
        self.apply(doc_id, set, &time_fields).await
    }

    async fn save_resume_token(&self, event: &ChangeStreamEvent<Document>) {
        self.resume_tokens.save(&event.id).await;
    }

    async fn load_resume_token(&self) -> Option<ResumeToken> {
        self.resume_tokens.load().await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records writes against an in-memory map rather than a real
    /// collection. Used to unit-test the worker/watch logic without a
    /// running server.
    #[derive(Default)]
    pub struct InMemoryRepository {
        pub documents: Mutex<HashMap<String, Document>>,
        pub saved_token: Mutex<Option<ResumeToken>>,
    }

    impl InMemoryRepository {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, id: &str, doc: Document) {
            self.documents.lock().insert(id.to_string(), doc);
        }

        pub fn get(&self, id: &str) -> Option<Document> {
            self.documents.lock().get(id).cloned()
        }

        fn merge(&self, id: &str, set: Document) {
            let mut documents = self.documents.lock();
            let entry = documents.entry(id.to_string()).or_default();
            for (key, value) in flatten(set) {
                set_path(entry, &key, value);
            }
        }
    }

    fn flatten(doc: Document) -> Vec<(String, Bson)> {
        doc.into_iter().collect()
    }

    fn set_path(doc: &mut Document, path: &str, value: Bson) {
        let mut parts = path.split('.');
        let first = parts.next().unwrap();
        let rest: Vec<&str> = parts.collect();
        if rest.is_empty() {
            doc.insert(first, value);
            return;
        }
        let nested = doc
            .entry(first.to_string())
            .or_insert_with(|| Bson::Document(Document::new()));
        if !matches!(nested, Bson::Document(_)) {
            *nested = Bson::Document(Document::new());
        }
        if let Bson::Document(inner) = nested {
            set_path(inner, &rest.join("."), value);
        }
    }

    fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
        let mut parts = path.split('.');
        let first = parts.next().unwrap();
        let rest: Vec<&str> = parts.collect();
        let value = doc.get(first)?;
        if rest.is_empty() {
            return Some(value);
        }
        match value {
            Bson::Document(inner) => get_path(inner, &rest.join(".")),
            _ => None,
        }
    }

    #[async_trait]
    impl Repository for InMemoryRepository {
        async fn watch(
            &self,
            _match_doc: Document,
            _resume: bool,
        ) -> Result<BoxStream<'static, Result<ChangeStreamEvent<Document>>>> {
            Ok(futures::stream::empty().boxed())
        }

        async fn update(&self, doc_id: &Bson, data: Document, _time_fields: &[&str]) -> Result<()> {
            self.merge(&doc_id.to_string(), data);
            Ok(())
        }

        async fn increment(&self, doc_id: &Bson, key: &str, delta: i64, _time_fields: &[&str]) -> Result<()> {
            let id = doc_id.to_string();
            let mut documents = self.documents.lock();
            let entry = documents.entry(id).or_default();
            let current = get_path(entry, key).and_then(Bson::as_i64).unwrap_or(0);
            set_path(entry, key, Bson::Int64(current + delta));
            Ok(())
        }

        async fn add_to_set(&self, doc_id: &Bson, key: &str, value: Bson, _time_fields: &[&str]) -> Result<()> {
            let id = doc_id.to_string();
            let mut documents = self.documents.lock();
            let entry = documents.entry(id).or_default();
            let mut array = get_path(entry, key)
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            if !array.contains(&value) {
                array.push(value);
            }
            set_path(entry, key, Bson::Array(array));
            Ok(())
        }

        async fn start_process(&self, doc_id: &Bson, name: &str, _extra_time_fields: &[&str]) -> Result<()> {
            self.merge(
                &doc_id.to_string(),
                doc! {
                    format!("{name}.success"): false,
                    format!("{name}.isRunning"): true,
                    format!("{name}.startTime"): bson::DateTime::now(),
                },
            );
            Ok(())
        }

        async fn end_process(
            &self,
            doc_id: &Bson,
            name: &str,
            success: bool,
            results: Document,
            _extra_time_fields: &[&str],
        ) -> Result<()> {
            let mut set = doc! {
                format!("{name}.success"): success,
                format!("{name}.isRunning"): false,
                format!("{name}.endTime"): bson::DateTime::now(),
            };
            for (key, value) in results {
                set.insert(format!("{name}.{key}"), value);
            }
            self.merge(&doc_id.to_string(), set);
            Ok(())
        }

        async fn save_resume_token(&self, _event: &ChangeStreamEvent<Document>) {}

        async fn load_resume_token(&self) -> Option<ResumeToken> {
            self.saved_token.lock().clone()
        }
    }
}


#[cfg(test)]
fn is_stale_resume_token_error_str(message: &str) -> bool {
    let message = message.to_lowercase();
    (message.contains("changestream") && message.contains("history"))
        || message.contains("resume token")
        || message.contains("oplog")
        || message.contains("invalidate")
}
