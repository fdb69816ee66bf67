//! Persistence contract for events, incidents, and rolling service stats,
//! with an in-memory backend (dev/test) and an optional Postgres backend.

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod query;
pub mod traits;

pub use error::StoreError;
pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use query::{
    EventFilter, EventSort, IncidentFilter, IncidentSort, Page, Pagination,
};
pub use traits::{
    EventStatsSummary, EventStore, IncidentPatch, IncidentStore, InsertReport, StatsStore,
};
