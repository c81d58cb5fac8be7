pub mod clock;
pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod expiration;
mod ledger;
pub mod memory;
pub mod model;
pub mod registry;
pub mod resource;
pub mod store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DatabaseConfig, QuotaConfig};
pub use context::{AdminCapability, QuotaContext};
pub use driver::{DbQuotaDriver, DriverDeps, DriverRegistry, NoopQuotaDriver, QuotaDriver};
pub use engine::QuotaEngine;
pub use error::QuotaError;
pub use expiration::Expiration;
pub use memory::InMemoryQuotaStore;
pub use model::{
    LimitLookup, OverQuotaDetail, QuotaDetail, QuotaMap, QuotaQuery, QuotaUsage, Reservation,
    SettableQuota, UsageSnapshot, UserQuota, UNLIMITED,
};
pub use registry::{QuotaMethod, ResourceRegistry};
pub use resource::{
    CountScope, Resource, ResourceKind, ScopedCounts, SyncScope, UsageCount, UsageSync,
};
pub use store::{QuotaStore, UsageScope};

#[cfg(feature = "postgres")]
pub use postgres::PostgresQuotaStore;

#[cfg(feature = "mock")]
pub use store::MockQuotaStore;
