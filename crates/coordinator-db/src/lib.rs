//! Database access layer: row models, typed status enums, and hand-written
//! queries against the coordination schema (tasks, workers, phases, the
//! merge queue, and pending notifications).

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
