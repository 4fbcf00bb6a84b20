pub mod database;
pub mod reaper;

pub use database::{retry_on_busy, DatabaseManager, StoreGate};
pub use database::sqlite::{
    SqliteMetricsRepository, SqliteRateLimitRepository, SqliteRatingRepository,
    SqliteTaskRepository,
};
pub use reaper::{CleanupOutcome, CleanupService, CleanupServiceConfig, CleanupStats, CleanedCounts};
