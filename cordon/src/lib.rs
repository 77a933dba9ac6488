// SPDX-License-Identifier: AGPL-3.0-only

//! Runs arbitrary user-supplied commands inside lightweight Linux
//! containers and exposes their merged stdout/stderr to one or more
//! concurrent live readers.
//!
//! The crate exposes [`controller::Controller`] and [`launcher::Command`]
//! as its sole programmatic entry points. How a caller drives them (a
//! CLI, a long-lived service, an RPC server) is deliberately out of
//! scope here; see `bin/cordon.rs` for one such driver.

#![warn(missing_docs)]

pub mod cgroup;
pub mod config;
pub mod controller;
pub mod error;
pub mod file_stream;
pub mod launcher;
pub mod process_log;
pub mod trampoline;
