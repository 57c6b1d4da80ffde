#![forbid(unsafe_code)]

//! Reference-test harness: control server, result grading and run supervision.

pub mod browser;
pub mod compare;
pub mod completion;
pub mod config;
pub mod eqlog;
pub mod fixtures;
pub mod http;
pub mod refsync;
pub mod report;
pub mod service;
pub mod state;
pub mod supervisor;
