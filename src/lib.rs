pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{Config, UploadConfig};
pub use engine::{ChunkOutcome, ChunkRequest, UploadEngine};
pub use error::{Error, Result};
