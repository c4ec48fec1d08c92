//! chatd library
//!
//! A chat completion daemon multiplexing concurrent gRPC requests onto a
//! small pool of local llama.cpp inference contexts. The arbiter owns
//! admission and dispatch; worker slots own the engines; the supervisor owns
//! the service lifecycle.

pub mod arbiter;
pub mod config;
pub mod engine;
pub mod job;
pub mod lifecycle;
pub mod sampler;
pub mod server;
