//! Pollen replication engine: epidemic, store-and-forward message exchange
//! between intermittently connected peers.
//! No network I/O here; the node crate drives connections and hands byte
//! streams to the engines below.

pub mod codec;
pub mod engine;
pub mod era;
pub mod protocol;
pub mod registry;
pub mod store;

pub use codec::ChunkReceivedListener;
pub use engine::{Engine, PduSink};
pub use era::{Era, DEFAULT_CACHE_LOOKBACK};
pub use protocol::{decode_frame, encode_frame, Pdu, PduHeader, PROTOCOL_VERSION};
pub use registry::{EngineRegistry, EngineSetting};
pub use store::{Chunk, ChunkStorage};
