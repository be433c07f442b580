use std::mem::size_of;
use std::ptr::null_mut;

use crate::memory::grow_capacity;
use crate::objects::object::Object;
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_string::ObjectString;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

/// One slot of the table. A null key with a nil value is empty; a null key
/// with `true` is a tombstone left behind by a deletion.
#[derive(Clone, Copy)]
struct Entry {
    key: *mut ObjectString,
    value: Value,
}

impl Entry {
    fn empty() -> Entry {
        Entry {
            key: null_mut(),
            value: Value::Nil,
        }
    }
}

/// Open-addressed hash table keyed by interned strings, so key comparison
/// is pointer comparison. Capacity stays a power of two; probing is linear
/// and tombstones hold probe chains together until the next rehash.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    /// Number of live entries (tombstones excluded).
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_entry(entries: &[Entry], key: *mut ObjectString) -> usize {
        let capacity = entries.len();
        let mut index = unsafe { (*key).hash } as usize & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_null() {
                if matches!(entry.value, Value::Nil) {
                    // Past the end of the chain; reuse a tombstone if we saw one.
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[Self::find_entry(&self.entries, key)];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Insert or update. Returns true when the key was not present before.
    pub fn set(&mut self, key: *mut ObjectString, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            let capacity = grow_capacity!(self.entries.len());
            self.adjust_capacity(capacity);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_null();
        // Tombstones are already counted; only a truly empty slot grows count.
        if is_new && matches!(entry.value, Value::Nil) {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new
    }

    /// Replace the entry with a tombstone. Returns true when the key existed.
    pub fn delete(&mut self, key: *mut ObjectString) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }
        entry.key = null_mut();
        entry.value = Value::Bool(true);
        true
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let mut entries = vec![Entry::empty(); capacity];
        self.count = 0;
        for entry in &self.entries {
            if entry.key.is_null() {
                continue;
            }
            let index = Self::find_entry(&entries, entry.key);
            entries[index] = *entry;
            self.count += 1;
        }
        self.entries = entries;
    }

    pub fn add_all(from: &Table, to: &mut Table) {
        for (key, value) in from.iter() {
            to.set(key, value);
        }
    }

    /// Content-based lookup used by the intern table before any allocation.
    /// This is the only place keys are compared by bytes rather than pointer.
    pub fn find_string(&self, content: &str, hash: u32) -> Option<*mut ObjectString> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if matches!(entry.value, Value::Nil) {
                    return None;
                }
            } else {
                let key = unsafe { &*entry.key };
                if key.hash == hash && key.content == content {
                    return Some(entry.key);
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Drop entries whose key string was not marked by the current
    /// collection. Run between mark and sweep; this is what makes the
    /// intern table weak.
    pub fn remove_white(&mut self) {
        for entry in self.entries.iter_mut() {
            if !entry.key.is_null() && !unsafe { (*entry.key).object.is_marked } {
                entry.key = null_mut();
                entry.value = Value::Bool(true);
            }
        }
    }

    pub fn mark(&self, heap: &mut ObjectManager) {
        for (key, value) in self.iter() {
            heap.mark_object(key as *mut Object);
            heap.mark_value(&value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjectString, Value)> + '_ {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_null())
            .map(|entry| (entry.key, entry.value))
    }

    pub fn deep_size(&self) -> usize {
        self.entries.capacity() * size_of::<Entry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_key(manager: &mut ObjectManager, content: &str) -> *mut ObjectString {
        manager.alloc_string(content.to_string())
    }

    #[test]
    fn test_set_get_and_update() {
        let mut manager = ObjectManager::new();
        let mut table = Table::new();
        let key = new_key(&mut manager, "answer");

        assert!(table.set(key, Value::Number(41.0)));
        assert!(!table.set(key, Value::Number(42.0)));
        assert_eq!(table.get(key), Some(Value::Number(42.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_get_on_empty_table() {
        let mut manager = ObjectManager::new();
        let table = Table::new();
        let key = new_key(&mut manager, "missing");
        assert_eq!(table.get(key), None);
    }

    #[test]
    fn test_delete_leaves_tombstone_and_set_reuses_it() {
        let mut manager = ObjectManager::new();
        let mut table = Table::new();
        let key = new_key(&mut manager, "a");
        let other = new_key(&mut manager, "b");

        table.set(key, Value::Number(1.0));
        table.set(other, Value::Number(2.0));

        assert!(table.delete(key));
        assert!(!table.delete(key));
        assert_eq!(table.get(key), None);
        // Unrelated keys survive the tombstone.
        assert_eq!(table.get(other), Some(Value::Number(2.0)));

        assert!(table.set(key, Value::Number(3.0)));
        assert_eq!(table.get(key), Some(Value::Number(3.0)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_rehash_preserves_entries() {
        let mut manager = ObjectManager::new();
        let mut table = Table::new();
        let mut keys = vec![];
        for i in 0..32 {
            let key = new_key(&mut manager, &format!("key{}", i));
            table.set(key, Value::Number(i as f64));
            keys.push(key);
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(table.get(*key), Some(Value::Number(i as f64)));
        }
        assert_eq!(table.len(), 32);
    }

    #[test]
    fn test_find_string_matches_by_content() {
        let mut manager = ObjectManager::new();
        let mut table = Table::new();
        let key = new_key(&mut manager, "shared");
        table.set(key, Value::Nil);

        let hash = unsafe { (*key).hash };
        assert_eq!(table.find_string("shared", hash), Some(key));
        assert_eq!(table.find_string("other", crate::objects::object_string::hash_string("other")), None);
    }

    #[test]
    fn test_remove_white_drops_unmarked_keys() {
        let mut manager = ObjectManager::new();
        let mut table = Table::new();
        let marked = new_key(&mut manager, "marked");
        let white = new_key(&mut manager, "white");
        table.set(marked, Value::Nil);
        table.set(white, Value::Nil);

        unsafe {
            (*marked).object.is_marked = true;
        }
        table.remove_white();
        unsafe {
            (*marked).object.is_marked = false;
        }

        assert_eq!(table.get(marked), Some(Value::Nil));
        assert_eq!(table.get(white), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_add_all_copies_live_entries() {
        let mut manager = ObjectManager::new();
        let mut from = Table::new();
        let mut to = Table::new();
        let a = new_key(&mut manager, "a");
        let b = new_key(&mut manager, "b");
        from.set(a, Value::Number(1.0));
        from.set(b, Value::Number(2.0));
        from.delete(b);

        Table::add_all(&from, &mut to);
        assert_eq!(to.get(a), Some(Value::Number(1.0)));
        assert_eq!(to.get(b), None);
    }
}
