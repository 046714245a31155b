//! Checkpoint and artifact I/O.

mod artifacts;
mod shard_reader;
mod state_dict;

pub use artifacts::{load_bincode, save_bincode, save_json};
pub use shard_reader::{decode, discover_shards, model_dir, ShardReader, TensorEntry, METADATA_KEY};
pub use state_dict::{checksums, encode, save_state_dict, QuantMetadata, CHECKSUMS_KEY};
