pub mod pool;
pub mod store;
pub mod types;

pub use pool::CredentialPool;
pub use store::CredentialStore;
pub use types::Credential;
