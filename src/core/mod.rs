//! Shared primitives: configuration, errors, process execution, downloads,
//! package management, and the build journal.

pub mod arch;
pub mod config;
pub mod error;
pub mod exec;
pub mod fetch;
pub mod journal;
pub mod output;
pub mod packages;
pub mod scaffold;
