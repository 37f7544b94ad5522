// Network module
//
// This module connects a ledger to its peers:
// - Gossip message encoding
// - Broadcaster trait and in-memory transport
// - Node glue (inbound blocks, outbound snapshots, background miner)

pub mod message;
pub mod node;
pub mod transport;

pub use message::GossipMessage;
pub use node::{MinerHandle, Node};
pub use transport::{Broadcaster, LocalTransport};
