#![allow(clippy::uninlined_format_args)]

pub mod capture;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod postprocess;
pub mod protocol;
pub mod reassembly;
pub mod sanitize;
pub mod translate;
