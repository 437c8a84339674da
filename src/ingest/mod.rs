pub mod normalize;
pub mod pipeline;

pub use normalize::normalize;
pub use pipeline::{BatchReport, IngestStatus, IngestionPipeline};
