//! ASV Core - Shared types for agent session transcripts
//!
//! This crate provides the domain types shared between the wire
//! protocol (asv-protocol) and the daemon (asvd): sessions, messages,
//! and the filters used to select them.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod filter;
pub mod session;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use filter::{parse_date, PruneFilter, SessionFilter, StartedRange};
pub use session::{
    format_timestamp, parse_timestamp, Message, Session, SessionId, SourceCursor,
};
