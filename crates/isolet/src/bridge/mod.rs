//! Control channel between the controller and a worker process.
//!
//! - **protocol**: message types (`ControlRequest` / `ControlResponse`)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
