pub mod kv;
pub mod memory;
pub mod pg;
pub mod pool;
pub mod schema;
pub mod store;

pub use memory::InMemoryStore;
pub use pg::PgStore;
pub use store::{Store, StoreError};
