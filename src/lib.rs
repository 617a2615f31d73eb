//! Resumable, crash-tolerant multipart upload engine for S3-compatible
//! object stores, mediated by a customer HTTP backend that issues
//! presigned part URLs. The engine itself never signs anything — see
//! `backend` for the wire contract and `engine` for the state machine
//! that drives it.

pub mod backend;
pub mod collaborators;
pub mod config;
pub mod constraints;
pub mod engine;
pub mod error;
pub mod ids;
pub mod model;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use backend::{BackendClient, HttpBackendClient};
pub use collaborators::{NoToken, NoopScheduler, Scheduler, TokenProvider};
pub use config::EngineConfig;
pub use constraints::ConstraintSet;
pub use engine::{EngineOutcome, SessionEngine};
pub use error::{EngineError, EngineResult};
pub use model::{Endpoints, PartStatus, SessionStatus, UploadPart, UploadSession};
pub use progress::Progress;
pub use store::{Store, TursoStore};
