pub mod gossip;
pub mod peer_cache;

pub use gossip::{GossipDirectory, GossipEntry};
pub use peer_cache::{check_peer_cache, store_peer_answer, PeerCacheHit};
