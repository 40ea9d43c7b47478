pub mod config;
pub mod error;
pub mod names;
pub mod record;
pub mod remote;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod timestamp;
pub mod xmlrpc;
