//! Deterministic, engine-agnostic AI kernel primitives.
//!
//! The [`Blackboard`] is a schema-bound store whose values are packed into one byte buffer with
//! the same packer ([`layout::pack`]) that behavior tree runtimes use for node memory.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod blackboard;
pub mod key;
pub mod layout;
pub mod rng;
pub mod schema;
pub mod tick;

pub use blackboard::{Blackboard, ObserverCallback, ObserverHandle, ObserverOwner, ObserverResult};
pub use key::{BlackboardValue, EnumValue, KeyId, KeyRef, KeySelector, KeyType, ObjectHandle};
pub use layout::{aligned_size, pack, PackedLayout};
pub use rng::SplitMix64;
pub use schema::{BlackboardSchema, KeyEntry, SchemaBuilder, SchemaError};
pub use tick::TickContext;
