pub mod retention;

pub use retention::spawn_retention_daemon;
