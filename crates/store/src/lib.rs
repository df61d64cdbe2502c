pub mod loader;
pub mod sink;
pub mod sqlite;

pub use loader::{LoadReport, Loader};
pub use sink::{FeatureSink, InsightSink};
pub use sqlite::{DEFAULT_TRANSCRIPT_VIEW, SqliteStore};
