pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod observability;
pub mod persistence;
pub mod record;
pub mod registry;
pub mod settings;

pub use cache::{CacheStats, LocalCache};
pub use config::{HashFunction, IdempotencyConfig, KeyExtractor};
pub use error::{IdempotencyError, Result};
pub use handler::{
    ExecutionError, IdempotencyHandler, IdempotencyMetrics, InvocationContext, MetricsSnapshot,
};
pub use persistence::{
    InMemoryStore, PersistenceStore, PostgresStore, RecordAttributes, RedisStore,
};
pub use record::{IdempotencyRecord, RecordStatus};
pub use registry::HandlerRegistry;
pub use settings::Settings;
