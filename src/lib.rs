//! Routing and address-management primitives for an L4 service proxy.
//!
//! Two cores: a stride-8 longest-prefix-match trie for route lookup
//! ([`trie::TrieRoot`]) and a multi-cluster IP address manager
//! ([`ipam::IpAllocator`]) built on a constant-time free-ID allocator
//! ([`counter::Counter`]). All structures are single-writer; callers
//! serialize access.

pub mod bitarr;
pub mod counter;
pub mod errors;
pub mod ipam;
pub mod netutil;
pub mod sparse;
pub mod trie;

pub use crate::counter::Counter;
pub use crate::errors::{CounterError, IpamError, TrieError};
pub use crate::ipam::{make_ipam_ident, IpAllocator, IPAM_NO_IDENT, IP_CLUSTER_DEFAULT};
pub use crate::trie::{TrieRoot, TrieWalker};

use once_cell::sync::OnceCell;

// Fallback: env_logger with timestamps off; a logger installed by the
// host wins the try_init race.
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}
