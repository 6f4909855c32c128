// Library root: exposes the pipeline for the binary and integration tests.
// The binary entry point is src/main.rs.

pub mod aggregation;
pub mod annotation;
pub mod config;
pub mod error;
pub mod expansion;
pub mod indexation;
pub mod lifecycle;
pub mod logger;
pub mod ontology;
pub mod pipeline;
pub mod removal;
pub mod resource;
pub mod store;
pub mod tagger;
