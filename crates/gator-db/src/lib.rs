//! Database layer for gator: connection pooling, migrations, and typed
//! query functions over the PostgreSQL schema backing plans and tasks.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
