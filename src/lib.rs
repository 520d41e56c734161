#[macro_use]
extern crate log;

pub mod cli;
pub mod daemonize;
pub mod env;
pub mod error;
pub mod liveness;
pub mod lock;
pub mod logger;
pub mod port;
pub mod procs;
pub mod readiness;
pub mod state_file;
pub mod supervisor;

pub use miette::Result;
