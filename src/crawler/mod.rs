//! Catalog crawl: pagination, extraction and the orchestrating loop.
//!
//! - [`pagination`] - page dispatch state machine and page classification
//! - [`extract`] - raw items to records, committed per page
//! - [`orchestrator`] - lifecycle, page tasks, shutdown
//! - [`progress`] - crawl counters and the progress line

pub mod extract;
pub mod orchestrator;
pub mod pagination;
pub mod progress;

pub use extract::{ExtractionError, ExtractionPipeline, PipelineError, ProcessedPage};
pub use orchestrator::{CrawlEnd, CrawlError, CrawlSummary, Orchestrator, ResumeMode};
pub use pagination::{DriverState, PageClass, PaginationDriver};
pub use progress::{CrawlStats, StatsSnapshot};
