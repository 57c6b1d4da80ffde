#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models and logic for the reference-test harness.

pub mod api;
pub mod manifest;
pub mod model;

mod util;

pub use util::{decode_data_uri, DataUriError};
