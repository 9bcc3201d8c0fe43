pub mod auth;
pub mod catalog;
pub mod compactor;
pub mod config;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod service;
pub mod sql;
pub mod store;
pub mod timestamp;
pub mod tls;
pub mod wal;
pub mod wire;
