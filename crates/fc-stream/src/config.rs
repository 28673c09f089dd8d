//! Connection and checkpoint settings a [`crate::repository::MongoRepository`]
//! is built from.
//!
//! A plain, `Default`-able struct populated by the binary's CLI layer, never
//! by this crate itself.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub connection_string: String,
    pub database: String,
    pub collection: String,
    pub resume_token_path: String,
    pub resume_token_save_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connection_string: "mongodb://localhost:27017".to_string(),
            database: "fc_stream_demo".to_string(),
            collection: "items".to_string(),
            resume_token_path: "resume_token.bin".to_string(),
            resume_token_save_interval: Duration::from_secs(5),
        }
    }
}
