pub mod memory;
pub mod record;
pub mod repository;
pub mod store;

pub use memory::MemoryCatalogStore;
pub use record::{ProductRecord, RecordError};
pub use repository::{CatalogRepository, InsertOutcome};
pub use store::{CatalogStore, CatalogTx};
