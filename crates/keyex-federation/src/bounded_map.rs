//! Fixed-capacity, insertion-ordered map used for key and signature collections.
//!
//! On the wire a map is a single field holding a flat entry list:
//!
//! ```text
//! Map(Key, Value) { entries: Option<List(Entry { key, value })> }
//! ```
//!
//! The list length is decided when the map is created and never grows, so an
//! overflowing write is rejected instead of truncated or reallocated. A map
//! that was never written to has *no* entry list at all, which is distinct from
//! an allocated list with zero entries; readers check [`BoundedMap::has_entries`]
//! before relying on the distinction.
//!
//! There is no removal. Maps are filled once and then handed to the signer.

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::Error as _,
    ser::SerializeStruct,
};

use crate::error::FederationError;

/// Largest capacity a map may declare.
pub const MAX_CAPACITY: usize = u16::MAX as usize;

/// A single key → value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

/// An append-only map with a capacity fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedMap<K, V> {
    capacity: usize,
    entries: Option<Vec<Entry<K, V>>>,
}

impl<K, V> BoundedMap<K, V> {
    /// Create an empty, unallocated map able to hold `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, FederationError> {
        if capacity > MAX_CAPACITY {
            return Err(FederationError::Capacity { requested: capacity, max: MAX_CAPACITY });
        }
        Ok(Self { capacity, entries: None })
    }

    /// Declared capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of entries written so far.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry list has been allocated.
    pub fn has_entries(&self) -> bool {
        self.entries.is_some()
    }

    /// Write `key → value` into the next free slot.
    ///
    /// The entry list is allocated at full capacity on the first append.
    /// Fails with [`FederationError::MapFull`] once `capacity` entries exist,
    /// leaving the map untouched.
    pub fn append(&mut self, key: K, value: V) -> Result<(), FederationError> {
        if self.len() >= self.capacity {
            return Err(FederationError::MapFull { capacity: self.capacity });
        }
        let capacity = self.capacity;
        self.entries
            .get_or_insert_with(|| Vec::with_capacity(capacity))
            .push(Entry { key, value });
        Ok(())
    }

    /// Fill a map that was never written to with `entries`, in the order given.
    ///
    /// Fails with [`FederationError::MapFull`] if the map already holds an entry
    /// list, and with [`FederationError::TooLarge`] if there are more entries
    /// than the declared capacity. Either way the map is left exactly as it was.
    pub fn set_all<I>(&mut self, entries: I) -> Result<(), FederationError>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        if self.entries.is_some() {
            return Err(FederationError::MapFull { capacity: self.capacity });
        }
        let list: Vec<Entry<K, V>> =
            entries.into_iter().map(|(key, value)| Entry { key, value }).collect();
        if list.len() > self.capacity {
            return Err(FederationError::TooLarge { len: list.len(), capacity: self.capacity });
        }
        let mut allocated = Vec::with_capacity(self.capacity);
        allocated.extend(list);
        self.entries = Some(allocated);
        Ok(())
    }

    /// All entries in insertion order. Empty if nothing was written.
    pub fn entries(&self) -> &[Entry<K, V>] {
        self.entries.as_deref().unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries().iter().map(|e| (&e.key, &e.value))
    }

    /// Look up the first entry with the given key.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: PartialEq<Q>,
        Q: ?Sized,
    {
        self.entries().iter().find(|e| e.key == *key).map(|e| &e.value)
    }
}

// ─── Wire format ─────────────────────────────────────────────────────────────

impl<K: Serialize, V: Serialize> Serialize for BoundedMap<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Map", 1)?;
        state.serialize_field("entries", &self.entries)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct WireMap<K, V> {
    entries: Option<Vec<Entry<K, V>>>,
}

impl<'de, K, V> Deserialize<'de> for BoundedMap<K, V>
where
    K: Deserialize<'de>,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireMap::deserialize(deserializer)?;
        // A received map is frozen: its capacity is exactly what was sent.
        let capacity = wire.entries.as_ref().map_or(0, Vec::len);
        if capacity > MAX_CAPACITY {
            return Err(D::Error::custom(format!(
                "map declares {capacity} entries, maximum is {MAX_CAPACITY}"
            )));
        }
        Ok(Self { capacity, entries: wire.entries })
    }
}
