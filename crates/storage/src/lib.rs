pub mod error;
pub mod hub;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use error::StorageError;
pub use hub::PushHub;
pub use sqlite::SqliteRemoteStore;
pub use traits::*;
