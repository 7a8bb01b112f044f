//! Stdio agent: one JSON request per line in, one JSON response per line out.

pub mod server;
pub mod utils;

pub use server::{dispatch, serve};
