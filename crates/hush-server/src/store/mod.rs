pub mod backend;
pub mod db;
pub mod memory;
pub mod model;
pub mod secrets;

pub use backend::Backend;
pub use db::RedbBackend;
pub use memory::MemoryBackend;
pub use model::{Created, NewSecret, Retrieved, SecretRecord};
pub use secrets::{GetOutcome, SecretStore, StoreError};
