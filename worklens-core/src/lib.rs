//! # worklens-core
//!
//! Core library for worklens - a background observer of developer activity.
//!
//! This library provides:
//! - The ingestion server accepting producer records over a local socket
//! - Secret redaction applied at the trust boundary
//! - Windowed correlation deriving activity episodes from raw signals
//! - Anomaly detection with cooldowns and intervention triggers
//! - Intent classification against an external inference service
//! - Retention management and the SQLite storage layer
//!
//! ## Architecture
//!
//! ```text
//! producers ──► IngestServer ──► Correlator ──► { Storage, AnomalyDetector }
//!                 (sanitize)         │                       │
//!                                    ▼                       ▼
//!                                 Storage ◄──────────── Classifier
//!                                    ▲
//!                            RetentionManager
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use worklens_core::{classify::HttpInferenceClient, Config, Database, Pipeline};
//!
//! # async fn start() -> worklens_core::Result<()> {
//! let config = Config::load()?;
//! let db = Arc::new(Database::open(&Config::database_path())?);
//! db.migrate()?;
//!
//! let client = Arc::new(HttpInferenceClient::new(&config.inference)?);
//! let pipeline = Pipeline::start(&config, db, client)?;
//! // ... run until a shutdown signal ...
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::Database;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use types::*;

// Public modules
pub mod classify;
pub mod config;
pub mod correlate;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod pipeline;
pub mod retention;
pub mod sanitize;
pub mod types;
