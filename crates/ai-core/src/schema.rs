use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::key::{KeyId, KeyType};

static NEXT_SCHEMA_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("blackboard schema '{schema}' declares key '{key}' more than once")]
    DuplicateKey { schema: String, key: String },
    #[error("blackboard schema '{schema}' has more keys than fit a key id")]
    TooManyKeys { schema: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub name: String,
    pub key_type: KeyType,
}

/// Ordered key declarations, optionally extending a parent schema.
///
/// Schemas are immutable once built and shared through `Arc`. Identity (not structure) decides
/// whether two schemas are the same.
#[derive(Debug)]
pub struct BlackboardSchema {
    id: u64,
    name: String,
    parent: Option<Arc<BlackboardSchema>>,
    keys: Vec<KeyEntry>,
}

impl BlackboardSchema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            name: name.into(),
            parent: None,
            keys: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<BlackboardSchema>> {
        self.parent.as_ref()
    }

    /// Number of keys inherited from the parent chain.
    pub fn inherited_keys(&self) -> usize {
        self.parent.as_ref().map_or(0, |p| p.num_keys())
    }

    /// Id of this schema's first own key. Saturates for chains [`validate`](Self::validate)
    /// rejects.
    pub fn first_key_id(&self) -> u16 {
        u16::try_from(self.inherited_keys()).unwrap_or(u16::MAX)
    }

    pub fn num_keys(&self) -> usize {
        self.inherited_keys() + self.keys.len()
    }

    pub fn own_keys(&self) -> &[KeyEntry] {
        &self.keys
    }

    pub fn key(&self, id: KeyId) -> Option<&KeyEntry> {
        let first = self.inherited_keys();
        let index = id.index();
        if index < first {
            return self.parent.as_ref()?.key(id);
        }
        self.keys.get(index - first)
    }

    pub fn key_type(&self, id: KeyId) -> Option<KeyType> {
        self.key(id).map(|k| k.key_type)
    }

    pub fn key_name(&self, id: KeyId) -> Option<&str> {
        self.key(id).map(|k| k.name.as_str())
    }

    /// Looks a key up by name, own keys first.
    pub fn key_id(&self, name: &str) -> Option<KeyId> {
        if let Some(pos) = self.keys.iter().position(|k| k.name == name) {
            return u16::try_from(self.inherited_keys() + pos).ok().map(KeyId);
        }
        self.parent.as_ref()?.key_id(name)
    }

    /// Iterates all keys of the chain in id order.
    pub fn keys(&self) -> impl Iterator<Item = (KeyId, &KeyEntry)> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(schema) = current {
            chain.push(schema);
            current = schema.parent.as_deref();
        }
        chain.into_iter().rev().flat_map(|schema| {
            let first = schema.inherited_keys();
            schema
                .keys
                .iter()
                .enumerate()
                .map_while(move |(i, entry)| Some((KeyId(u16::try_from(first + i).ok()?), entry)))
        })
    }

    /// Rejects duplicate key names across the whole inheritance chain.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.num_keys() >= u16::MAX as usize {
            return Err(SchemaError::TooManyKeys {
                schema: self.name.clone(),
            });
        }
        let mut seen = HashSet::new();
        for (_, entry) in self.keys() {
            if !seen.insert(entry.name.as_str()) {
                return Err(SchemaError::DuplicateKey {
                    schema: self.name.clone(),
                    key: entry.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// True when `self` is `other` or inherits from it.
    pub fn is_child_of(&self, other: &BlackboardSchema) -> bool {
        let mut current = Some(self);
        while let Some(schema) = current {
            if schema.id == other.id {
                return true;
            }
            current = schema.parent.as_deref();
        }
        false
    }
}

pub struct SchemaBuilder {
    name: String,
    parent: Option<Arc<BlackboardSchema>>,
    keys: Vec<KeyEntry>,
}

impl SchemaBuilder {
    pub fn parent(mut self, parent: Arc<BlackboardSchema>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn key(mut self, name: impl Into<String>, key_type: KeyType) -> Self {
        self.keys.push(KeyEntry {
            name: name.into(),
            key_type,
        });
        self
    }

    pub fn build(self) -> Arc<BlackboardSchema> {
        Arc::new(BlackboardSchema {
            id: NEXT_SCHEMA_ID.fetch_add(1, Ordering::Relaxed),
            name: self.name,
            parent: self.parent,
            keys: self.keys,
        })
    }
}
