//! Orchestra Common - shared types for the Orchestra kernel
//!
//! Envelope and error codes, service/health records, audit vocabulary,
//! config store entries, backup types, and the nav manifest schema.
//! No I/O lives here.

pub mod audit;
pub mod backup;
pub mod envelope;
pub mod error;
pub mod nav;
pub mod settings;
pub mod types;

pub use audit::*;
pub use backup::*;
pub use envelope::*;
pub use error::*;
pub use nav::*;
pub use settings::*;
pub use types::*;
