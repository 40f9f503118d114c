use std::fmt;

use bytemuck::{Pod, Zeroable};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::schema::BlackboardSchema;

/// Dense key id inside a bound schema chain. Parent schema keys come first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KeyId(pub u16);

impl KeyId {
    pub const INVALID: KeyId = KeyId(u16::MAX);

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Closed set of fixed-size value encodings the store understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KeyType {
    Bool,
    Int,
    Float,
    Enum,
    Vector,
    Object,
}

impl KeyType {
    pub fn value_size(self) -> usize {
        match self {
            KeyType::Bool | KeyType::Enum => 1,
            KeyType::Int | KeyType::Float => 4,
            KeyType::Vector => 12,
            KeyType::Object => 8,
        }
    }
}

/// Opaque handle to a world object stored in an `Object` key. Zero means "unset".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct ObjectHandle(pub u64);

/// Enum keys store a single discriminant byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Pod, Zeroable)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct EnumValue(pub u8);

/// A Rust type that can live in a blackboard slot of a given [`KeyType`].
pub trait BlackboardValue: Copy + Default + 'static {
    const KEY_TYPE: KeyType;

    fn encode(&self, out: &mut [u8]);
    fn decode(bytes: &[u8]) -> Self;
}

macro_rules! pod_value {
    ($ty:ty, $kind:expr) => {
        impl BlackboardValue for $ty {
            const KEY_TYPE: KeyType = $kind;

            fn encode(&self, out: &mut [u8]) {
                out.copy_from_slice(bytemuck::bytes_of(self));
            }

            fn decode(bytes: &[u8]) -> Self {
                bytemuck::pod_read_unaligned(bytes)
            }
        }
    };
}

pod_value!(i32, KeyType::Int);
pod_value!(f32, KeyType::Float);
pod_value!(EnumValue, KeyType::Enum);
pod_value!([f32; 3], KeyType::Vector);
pod_value!(ObjectHandle, KeyType::Object);

impl BlackboardValue for bool {
    const KEY_TYPE: KeyType = KeyType::Bool;

    fn encode(&self, out: &mut [u8]) {
        out[0] = u8::from(*self);
    }

    fn decode(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Key addressed either by id or by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef<'a> {
    Id(KeyId),
    Name(&'a str),
}

impl From<KeyId> for KeyRef<'_> {
    fn from(id: KeyId) -> Self {
        KeyRef::Id(id)
    }
}

impl<'a> From<&'a str> for KeyRef<'a> {
    fn from(name: &'a str) -> Self {
        KeyRef::Name(name)
    }
}

impl<'a> From<&'a KeySelector> for KeyRef<'a> {
    fn from(selector: &'a KeySelector) -> Self {
        KeyRef::Name(selector.name())
    }
}

/// Named key reference, optionally restricted to one key type.
///
/// Nodes keep one of these per key they read. The selector itself never stores an id: a node
/// may be shared by trees bound to different schemas, so each tree template resolves its own
/// copy when it is built.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeySelector {
    name: String,
    allowed: Option<KeyType>,
}

impl KeySelector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: None,
        }
    }

    /// Restricts resolution to keys of `key_type`.
    pub fn of_type(mut self, key_type: KeyType) -> Self {
        self.allowed = Some(key_type);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allowed_type(&self) -> Option<KeyType> {
        self.allowed
    }

    /// Id of the named key in `schema`, or `None` when it is missing or has the wrong type.
    pub fn resolve(&self, schema: &BlackboardSchema) -> Option<KeyId> {
        let id = schema.key_id(&self.name)?;
        if let Some(allowed) = self.allowed {
            if schema.key_type(id) != Some(allowed) {
                tracing::warn!(key = %self.name, expected = ?allowed, "blackboard key has unexpected type");
                return None;
            }
        }
        Some(id)
    }
}
