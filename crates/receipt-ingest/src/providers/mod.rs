//! Collaborator abstractions for validation, storage, records and AI extraction
//!
//! The scheduler only talks to these traits. Local implementations live in
//! `local`, the Ollama extractor in `ollama`, and the SQLite-backed record and
//! session stores in `crate::storage`.

pub mod extractor;
pub mod local;
pub mod ollama;
pub mod optimizer;
pub mod record_store;
pub mod session_store;
pub mod status_push;
pub mod uploader;
pub mod validator;

use std::sync::Arc;

pub use extractor::{ExtractionOutcome, ExtractionStatus, Extractor};
pub use optimizer::Optimizer;
pub use record_store::{RecordMeta, RecordStore};
pub use session_store::SessionStore;
pub use status_push::{StatusPush, StatusStream, StatusUpdate};
pub use uploader::Uploader;
pub use validator::{Validation, Validator};

/// The set of external collaborators a pipeline drives
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn Validator>,
    pub optimizer: Arc<dyn Optimizer>,
    pub uploader: Arc<dyn Uploader>,
    pub record_store: Arc<dyn RecordStore>,
    pub extractor: Arc<dyn Extractor>,
    pub status_push: Arc<dyn StatusPush>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("validator", &self.validator.name())
            .field("optimizer", &self.optimizer.name())
            .field("uploader", &self.uploader.name())
            .field("record_store", &self.record_store.name())
            .field("extractor", &self.extractor.name())
            .field("status_push", &self.status_push.name())
            .finish()
    }
}
