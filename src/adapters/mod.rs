pub mod memory;
pub mod memory_lock;
pub mod memory_queue;
pub mod postgres_events;
pub mod postgres_ledger;
pub mod postgres_queue;
pub mod redis_lock;

pub use memory::MemoryStore;
pub use memory_lock::MemoryLockStore;
pub use memory_queue::MemoryJobQueue;
pub use postgres_events::PgEventStore;
pub use postgres_ledger::PgLedgerStore;
pub use postgres_queue::PgJobQueue;
pub use redis_lock::RedisLockStore;
