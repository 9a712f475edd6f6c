//! HTTP clients of the supernode, of other peers and of the local peer
//! server.
pub mod peer;
pub mod supernode;
pub mod types;
pub mod uploader;

pub use peer::PeerClient;
pub use supernode::SupernodeClient;
pub use uploader::UploaderClient;
