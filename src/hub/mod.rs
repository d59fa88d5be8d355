//! Hub-side ingestion: camera-session message handling, capture muxing,
//! notification correlation

pub mod image;
pub mod ingest;

pub use ingest::IngestService;
