//! Background workers: periodic aggregation (events → incidents) and
//! batched AI summarization.

pub mod aggregation;
pub mod handle;
pub mod summarization;

pub use aggregation::{AggregationConfig, AggregationWorker, RunReport};
pub use handle::WorkerHandle;
pub use summarization::{
    SummarizationConfig, SummarizationWorker, SummarizeError, TickReport,
};
