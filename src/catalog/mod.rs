pub mod refresher;
pub mod store;
pub mod types;

pub use refresher::{ModelRefresher, RefreshError, spawn_refresh_task};
pub use store::ModelCatalog;
pub use types::ModelDescriptor;
