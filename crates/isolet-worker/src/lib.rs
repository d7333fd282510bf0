//! isolet-worker: the worker process and its reference execution host.

pub mod catalog;
pub mod host;

pub use host::{NativeHost, UnitError};
