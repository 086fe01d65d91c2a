//! A canopy node: one process in a tree of volunteer machines sharing
//! long computations.
//!
//! The pieces: [`link`] moves frames per socket, [`reactor`] owns all
//! node state on a single task, [`jobs`] tracks who computes what and
//! where answers go, [`worker`] runs the checkers, [`console`] takes
//! operator commands.

pub mod config;
pub mod console;
pub mod jobs;
pub mod link;
pub mod reactor;
pub mod worker;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

/// Node identity, derived once from the bound listen address.
///
/// Good enough at the scale this targets (tens of machines on a LAN);
/// colliding ids would confuse rerouting after a departure, nothing
/// detects them.
pub fn derive_app_id(addr: SocketAddr) -> i32 {
    let mut hasher = DefaultHasher::new();
    addr.hash(&mut hasher);
    hasher.finish() as i32
}
