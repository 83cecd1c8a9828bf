pub mod recorder;
pub mod stats;
pub mod types;

pub use recorder::UsageRecorder;
pub use types::{TokenCounts, UsageRecord};
