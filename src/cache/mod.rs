//! Tiered position cache: session memory tier + persistent encrypted/compressed tier

pub mod codec;
pub mod memory;
pub mod store;

pub use codec::{Codec, CodecError, EncryptedCodec, PlainCodec, StoredPayload, ZstdCodec};
pub use memory::MemoryTier;
pub use store::{CacheEntry, PositionStore, StoreStats};
