pub mod backend;
pub mod backoff;
pub mod conn;
pub mod frontend;
pub mod state;
