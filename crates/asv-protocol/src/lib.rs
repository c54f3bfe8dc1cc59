//! ASV Protocol - Transcript records and HTTP wire types
//!
//! This crate provides parsing for the JSON lines agent processes append
//! to their transcript files, and the request/response payloads the
//! daemon exchanges with viewers.

pub mod message;
pub mod parse;

pub use message::{
    ChangeEvent, ErrorBody, HealthResponse, MachinesResponse, MessagesResponse, MinimapEntry,
    MinimapResponse, ProjectInfo, ProjectsResponse, SearchHit, SearchResponse,
    SessionListResponse, StatsResponse, API_PREFIX, EVENT_SESSION_UPDATED, EVENT_SNAPSHOT,
};
pub use parse::{parse_record, RawRecord, RecordParseError, UNKNOWN_ROLE};
