pub mod clock;
pub mod config;
pub mod console;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod wal;
