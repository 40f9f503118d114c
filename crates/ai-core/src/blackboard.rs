use std::collections::BTreeMap;
use std::sync::Arc;

use crate::key::{BlackboardValue, KeyId, KeyRef, KeyType};
use crate::layout;
use crate::schema::BlackboardSchema;

/// Identifies who registered an observer so all of its registrations can be dropped at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverOwner(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverHandle(u64);

/// Returned by observer callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverResult {
    Keep,
    Remove,
}

pub type ObserverCallback = Box<dyn FnMut(KeyId) -> ObserverResult + Send>;

struct Observer {
    handle: ObserverHandle,
    owner: ObserverOwner,
    callback: ObserverCallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValueSlot {
    offset: usize,
    size: usize,
    key_type: KeyType,
}

/// Schema-bound key-value store with all values packed into one byte buffer.
#[derive(Default)]
pub struct Blackboard {
    schema: Option<Arc<BlackboardSchema>>,
    slots: Vec<ValueSlot>,
    values: Vec<u8>,
    observers: BTreeMap<KeyId, Vec<Observer>>,
    next_handle: u64,
    paused: bool,
    queued: Vec<KeyId>,
}

impl std::fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blackboard")
            .field("schema", &self.schema.as_ref().map(|s| s.name().to_string()))
            .field("values", &self.values.len())
            .field("observed_keys", &self.observers.len())
            .field("paused", &self.paused)
            .finish()
    }
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(schema: Arc<BlackboardSchema>) -> Self {
        let mut bb = Self::new();
        bb.bind(schema);
        bb
    }

    pub fn schema(&self) -> Option<&Arc<BlackboardSchema>> {
        self.schema.as_ref()
    }

    pub fn is_bound(&self) -> bool {
        self.schema.is_some()
    }

    /// Binds a schema, rebuilding the value layout. Existing values are discarded.
    ///
    /// Binding the currently bound schema is a no-op. Returns `false` (leaving the store as it
    /// was) when the schema is invalid.
    pub fn bind(&mut self, schema: Arc<BlackboardSchema>) -> bool {
        if self.schema.as_ref().is_some_and(|s| Arc::ptr_eq(s, &schema)) {
            return true;
        }
        if let Err(err) = schema.validate() {
            tracing::warn!(schema = %schema.name(), error = %err, "blackboard schema rejected");
            return false;
        }

        let entries: Vec<KeyType> = schema.keys().map(|(_, entry)| entry.key_type).collect();
        let sizes: Vec<usize> = entries.iter().map(|t| t.value_size()).collect();
        let packed = layout::pack(&sizes);

        self.slots = entries
            .iter()
            .enumerate()
            .map(|(i, key_type)| ValueSlot {
                offset: packed.offsets[i],
                size: key_type.value_size(),
                key_type: *key_type,
            })
            .collect();
        self.values = vec![0; packed.total];
        self.observers.clear();
        self.queued.clear();
        tracing::debug!(schema = %schema.name(), keys = self.slots.len(), bytes = packed.total, "blackboard bound");
        self.schema = Some(schema);
        true
    }

    /// True when a tree authored against `schema` can run on this store.
    pub fn is_compatible_with(&self, schema: &BlackboardSchema) -> bool {
        self.schema.as_ref().is_some_and(|bound| bound.is_child_of(schema))
    }

    pub fn num_keys(&self) -> usize {
        self.slots.len()
    }

    pub fn key_id(&self, name: &str) -> Option<KeyId> {
        self.schema.as_ref()?.key_id(name)
    }

    pub fn key_name(&self, id: KeyId) -> Option<&str> {
        self.schema.as_ref()?.key_name(id)
    }

    pub fn key_type(&self, id: KeyId) -> Option<KeyType> {
        self.slots.get(id.index()).map(|s| s.key_type)
    }

    fn resolve<'k>(&self, key: impl Into<KeyRef<'k>>) -> Option<KeyId> {
        match key.into() {
            KeyRef::Id(id) => (id.index() < self.slots.len()).then_some(id),
            KeyRef::Name(name) => self.key_id(name),
        }
    }

    fn typed_slot<'k, T: BlackboardValue>(&self, key: impl Into<KeyRef<'k>>) -> Option<(KeyId, ValueSlot)> {
        let id = self.resolve(key)?;
        let slot = self.slots[id.index()];
        if slot.key_type != T::KEY_TYPE {
            tracing::debug!(key = %id, stored = ?slot.key_type, requested = ?T::KEY_TYPE, "blackboard type mismatch");
            return None;
        }
        Some((id, slot))
    }

    pub fn try_get<'k, T: BlackboardValue>(&self, key: impl Into<KeyRef<'k>>) -> Option<T> {
        let (_, slot) = self.typed_slot::<T>(key)?;
        Some(T::decode(&self.values[slot.offset..slot.offset + slot.size]))
    }

    /// Typed read. Unknown keys and type mismatches yield `T::default()`.
    pub fn get<'k, T: BlackboardValue>(&self, key: impl Into<KeyRef<'k>>) -> T {
        self.try_get(key).unwrap_or_default()
    }

    /// Typed write. Observers fire only when the stored bytes actually change.
    ///
    /// Returns `false` for unknown keys and type mismatches.
    pub fn set<'k, T: BlackboardValue>(&mut self, key: impl Into<KeyRef<'k>>, value: T) -> bool {
        let Some((id, slot)) = self.typed_slot::<T>(key) else {
            return false;
        };
        let mut encoded = [0u8; 16];
        let encoded = &mut encoded[..slot.size];
        value.encode(encoded);

        let stored = &mut self.values[slot.offset..slot.offset + slot.size];
        if stored != encoded {
            stored.copy_from_slice(encoded);
            self.notify(id);
        }
        true
    }

    /// Zeroes a value, notifying observers if it was set.
    pub fn clear_value<'k>(&mut self, key: impl Into<KeyRef<'k>>) -> bool {
        let Some(id) = self.resolve(key) else {
            return false;
        };
        let slot = self.slots[id.index()];
        let stored = &mut self.values[slot.offset..slot.offset + slot.size];
        if stored.iter().any(|b| *b != 0) {
            stored.fill(0);
            self.notify(id);
        }
        true
    }

    /// Generic "has a value" test: any non-zero byte.
    pub fn is_set<'k>(&self, key: impl Into<KeyRef<'k>>) -> bool {
        self.resolve(key).is_some_and(|id| {
            let slot = self.slots[id.index()];
            self.values[slot.offset..slot.offset + slot.size]
                .iter()
                .any(|b| *b != 0)
        })
    }

    /// Human readable value for debugging output.
    pub fn describe_value(&self, id: KeyId) -> Option<String> {
        let slot = *self.slots.get(id.index())?;
        let text = match slot.key_type {
            KeyType::Bool => self.get::<bool>(id).to_string(),
            KeyType::Int => self.get::<i32>(id).to_string(),
            KeyType::Float => self.get::<f32>(id).to_string(),
            KeyType::Enum => self.get::<crate::key::EnumValue>(id).0.to_string(),
            KeyType::Vector => format!("{:?}", self.get::<[f32; 3]>(id)),
            KeyType::Object => format!("object:{}", self.get::<crate::key::ObjectHandle>(id).0),
        };
        Some(text)
    }

    pub fn register_observer<'k>(
        &mut self,
        key: impl Into<KeyRef<'k>>,
        owner: ObserverOwner,
        callback: ObserverCallback,
    ) -> Option<ObserverHandle> {
        let id = self.resolve(key)?;
        self.next_handle += 1;
        let handle = ObserverHandle(self.next_handle);
        self.observers.entry(id).or_default().push(Observer {
            handle,
            owner,
            callback,
        });
        Some(handle)
    }

    pub fn unregister_observer(&mut self, key: KeyId, handle: ObserverHandle) {
        if let Some(list) = self.observers.get_mut(&key) {
            list.retain(|o| o.handle != handle);
            if list.is_empty() {
                self.observers.remove(&key);
            }
        }
    }

    pub fn unregister_observers_from(&mut self, owner: ObserverOwner) {
        self.observers.retain(|_, list| {
            list.retain(|o| o.owner != owner);
            !list.is_empty()
        });
    }

    pub fn observer_count(&self, key: KeyId) -> usize {
        self.observers.get(&key).map_or(0, Vec::len)
    }

    /// Queues notifications instead of delivering them until [`Blackboard::resume_updates`].
    pub fn pause_updates(&mut self) {
        self.paused = true;
    }

    /// Delivers queued notifications (each key once, in first-queued order).
    pub fn resume_updates(&mut self) {
        self.paused = false;
        let queued = std::mem::take(&mut self.queued);
        for key in queued {
            self.notify(key);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn notify(&mut self, key: KeyId) {
        if self.paused {
            if !self.queued.contains(&key) {
                self.queued.push(key);
            }
            return;
        }
        let Some(mut list) = self.observers.remove(&key) else {
            return;
        };
        list.retain_mut(|observer| (observer.callback)(key) == ObserverResult::Keep);
        if !list.is_empty() {
            self.observers.entry(key).or_default().splice(0..0, list);
        }
    }
}
