//! Backend adapters, one per [`BackendKind`](crate::models::BackendKind).

pub mod clickhouse;
pub mod postgres;
pub mod redis;
pub mod sqlite;

pub use self::clickhouse::ClickhouseAdapter;
pub use self::postgres::PostgresAdapter;
pub use self::redis::RedisAdapter;
pub use self::sqlite::SqliteAdapter;
