//! spawnkit: the application spawning engine of a multi-process web
//! application server.
//!
//! Given an application description (root directory, runtime user,
//! environment, start command), the engine produces a running child
//! process that has executed the user's shell, dropped privileges,
//! chdir'd into the app root and loaded the application — and records
//! every stage of that lifecycle in a "journey" so a failed spawn can
//! be diagnosed forensically.

pub mod cli;
pub mod config;
pub mod error;
pub mod fifo;
pub mod handshake;
pub mod journey;
pub mod lve;
pub mod proc;
pub mod setupper;
pub mod spawner;
pub mod timing;
pub mod workdir;
