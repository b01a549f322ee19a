//! End-to-end stories
//!
//! - `cli`: flag handling that needs no cluster at all
//! - `startup`: configuration errors terminate the process non-zero
//! - `sync`: a Thing created in kcp is mirrored downstream, its status flows
//!   back, and deletion waits for the mirror

mod cli;
mod helpers;
mod startup;
mod sync;
