pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
mod http;
pub mod ledger;
pub mod ncbi;
pub mod orchestrator;
pub mod output;
pub mod preflight;
pub mod store;
