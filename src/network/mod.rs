// Network module
//
// Peer-to-peer gossip between nodes: message framing and the node that
// relays transactions, syncs blocks and mines pooled transactions.

pub mod message;
pub mod node;

pub use message::Message;
pub use node::Node;
