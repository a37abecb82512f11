use crate::objects::object_string::ObjectString;
use crate::value::{is_bool, is_nil, make_bool_value, make_nil_value, value_hash, Value};

const MIN_CAPACITY: usize = 11;

/// Load factor check shared by both structures: grow at 75 %.
fn need_resize(count: usize, capacity: usize) -> bool {
    (count + 1) * 4 >= capacity * 3
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < MIN_CAPACITY {
        MIN_CAPACITY
    } else {
        capacity * 2 + 1
    }
}

#[derive(Clone, Copy)]
pub struct Entry {
    pub key: *mut ObjectString,
    pub value: Value,
}

impl Entry {
    fn vacant() -> Entry {
        Entry {
            key: std::ptr::null_mut(),
            value: make_nil_value(),
        }
    }

    /// Never used as a key: null key with a nil value.
    fn is_empty(&self) -> bool {
        self.key.is_null() && is_nil(&self.value)
    }

    /// Tombstone left by a deletion: null key with a bool value.
    fn is_del_mark(&self) -> bool {
        self.key.is_null() && is_bool(&self.value)
    }
}

/// Open-addressing table keyed on interned strings. Because strings are
/// interned, key comparison is pointer comparison. Keys are weakly held with
/// respect to the collector: `delete_unreachable` drops unmarked keys before
/// the sweep frees them.
pub struct Table {
    count: usize,
    backing: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            backing: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.backing.len()
    }

    fn resize(&mut self) {
        let new_capacity = grow_capacity(self.capacity());
        let old_backing = std::mem::replace(&mut self.backing, vec![Entry::vacant(); new_capacity]);
        self.count = 0;
        for entry in old_backing {
            if !entry.key.is_null() {
                self.set(entry.key, entry.value);
            }
        }
    }

    /// Returns the slot holding `key`, or the first empty slot of its probe
    /// sequence if the key is absent.
    fn find_slot(&self, key: *mut ObjectString) -> usize {
        let capacity = self.capacity();
        let hash = unsafe { (*key).hash } as usize;
        let mut index = hash % capacity;
        loop {
            let entry = &self.backing[index];
            if entry.is_empty() || entry.key == key {
                return index;
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.backing[self.find_slot(key)];
        if entry.is_empty() {
            None
        } else {
            Some(entry.value)
        }
    }

    pub fn has(&self, key: *mut ObjectString) -> bool {
        self.get(key).is_some()
    }

    /// Inserts or updates. Returns true when the key already existed. A
    /// tombstone seen on the way in is reused for the insertion.
    pub fn set(&mut self, key: *mut ObjectString, value: Value) -> bool {
        if need_resize(self.count, self.capacity()) {
            self.resize();
        }
        let capacity = self.capacity();
        let hash = unsafe { (*key).hash } as usize;
        let mut index = hash % capacity;
        let mut mark: Option<usize> = None;
        loop {
            let entry = &self.backing[index];
            if entry.is_empty() {
                match mark {
                    Some(mark_index) => {
                        self.backing[mark_index] = Entry { key, value };
                    }
                    None => {
                        self.backing[index] = Entry { key, value };
                        self.count += 1;
                    }
                }
                return false;
            } else if entry.key == key {
                self.backing[index].value = value;
                return true;
            } else if mark.is_none() && entry.is_del_mark() {
                mark = Some(index);
            }
            index = (index + 1) % capacity;
        }
    }

    /// Removes the key, leaving a tombstone. Returns the removed value, nil
    /// when the key was absent.
    pub fn delete(&mut self, key: *mut ObjectString) -> Value {
        if self.count == 0 {
            return make_nil_value();
        }
        let index = self.find_slot(key);
        let entry = &mut self.backing[index];
        if entry.is_empty() {
            return make_nil_value();
        }
        entry.key = std::ptr::null_mut();
        std::mem::replace(&mut entry.value, make_bool_value(true))
    }

    pub fn add_all(&self, to: &mut Table) {
        for entry in &self.backing {
            if !entry.key.is_null() {
                to.set(entry.key, entry.value);
            }
        }
    }

    /// Content lookup used for interning: find the canonical string object
    /// holding exactly these bytes.
    pub fn find_string(&self, content: &str, hash: u32) -> Option<*mut ObjectString> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.backing[index];
            if entry.is_empty() {
                return None;
            }
            if !entry.key.is_null() {
                let key = unsafe { &*entry.key };
                if key.hash == hash && key.content == content {
                    return Some(entry.key);
                }
            }
            index = (index + 1) % capacity;
        }
    }

    /// Drop entries whose key object did not survive marking. Runs between
    /// trace and sweep; the objects themselves are freed by the sweep.
    pub fn delete_unreachable(&mut self) {
        for entry in self.backing.iter_mut() {
            if !entry.key.is_null() && !unsafe { (*entry.key).object.is_marked } {
                entry.key = std::ptr::null_mut();
                entry.value = make_bool_value(true);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjectString, Value)> + '_ {
        self.backing
            .iter()
            .filter(|entry| !entry.key.is_null())
            .map(|entry| (entry.key, entry.value))
    }

    pub fn deep_size(&self) -> usize {
        self.backing.capacity() * std::mem::size_of::<Entry>()
    }
}

#[derive(Clone, Copy)]
pub struct MapEntry {
    pub key: Value,
    pub value: Value,
    pub hash: u32,
}

impl MapEntry {
    fn vacant() -> MapEntry {
        MapEntry {
            key: make_nil_value(),
            value: make_nil_value(),
            hash: 0,
        }
    }

    fn is_empty(&self) -> bool {
        is_nil(&self.key) && is_nil(&self.value)
    }

    fn is_del_mark(&self) -> bool {
        is_nil(&self.key) && is_bool(&self.value)
    }

    fn is_occupied(&self) -> bool {
        !self.is_empty() && !self.is_del_mark()
    }
}

/// Open addressing keyed on arbitrary values. The caller supplies the key
/// hash and an equality callback, so instance keys can route through
/// script-defined `hash`/`equal` methods; stored hashes make resizing
/// independent of the callback. `nil` is not usable as a key (it doubles as
/// the vacancy sentinel, as in the string table).
pub struct ValueMap {
    count: usize,
    backing: Vec<MapEntry>,
}

impl ValueMap {
    pub fn new() -> ValueMap {
        ValueMap {
            count: 0,
            backing: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    fn capacity(&self) -> usize {
        self.backing.len()
    }

    fn resize(&mut self) {
        let new_capacity = grow_capacity(self.capacity());
        let old_backing =
            std::mem::replace(&mut self.backing, vec![MapEntry::vacant(); new_capacity]);
        self.count = 0;
        for entry in old_backing {
            if entry.is_occupied() {
                self.insert_rehash(entry);
            }
        }
    }

    /// Rehash path: keys are distinct already, no equality calls needed.
    fn insert_rehash(&mut self, entry: MapEntry) {
        let capacity = self.capacity();
        let mut index = entry.hash as usize % capacity;
        loop {
            if self.backing[index].is_empty() {
                self.backing[index] = entry;
                self.count += 1;
                return;
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn get_with<E>(
        &self,
        key: &Value,
        hash: u32,
        equal: &mut dyn FnMut(&Value, &Value) -> Result<bool, E>,
    ) -> Result<Option<Value>, E> {
        if self.count == 0 {
            return Ok(None);
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.backing[index];
            if entry.is_empty() {
                return Ok(None);
            }
            if entry.is_occupied() && entry.hash == hash && equal(&entry.key, key)? {
                return Ok(Some(entry.value));
            }
            index = (index + 1) % capacity;
        }
    }

    /// Inserts or updates; returns true when the key already existed.
    pub fn set_with<E>(
        &mut self,
        key: Value,
        value: Value,
        hash: u32,
        equal: &mut dyn FnMut(&Value, &Value) -> Result<bool, E>,
    ) -> Result<bool, E> {
        if need_resize(self.count, self.capacity()) {
            self.resize();
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        let mut mark: Option<usize> = None;
        loop {
            let entry = &self.backing[index];
            if entry.is_empty() {
                let slot = match mark {
                    Some(mark_index) => mark_index,
                    None => {
                        self.count += 1;
                        index
                    }
                };
                self.backing[slot] = MapEntry { key, value, hash };
                return Ok(false);
            } else if entry.is_del_mark() {
                if mark.is_none() {
                    mark = Some(index);
                }
            } else if entry.hash == hash && equal(&entry.key, &key)? {
                self.backing[index].value = value;
                return Ok(true);
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn delete_with<E>(
        &mut self,
        key: &Value,
        hash: u32,
        equal: &mut dyn FnMut(&Value, &Value) -> Result<bool, E>,
    ) -> Result<Option<Value>, E> {
        if self.count == 0 {
            return Ok(None);
        }
        let capacity = self.capacity();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.backing[index];
            if entry.is_empty() {
                return Ok(None);
            }
            if entry.is_occupied() && entry.hash == hash && equal(&entry.key, key)? {
                let entry = &mut self.backing[index];
                entry.key = make_nil_value();
                let removed = std::mem::replace(&mut entry.value, make_bool_value(true));
                return Ok(Some(removed));
            }
            index = (index + 1) % capacity;
        }
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.get_with::<()>(key, value_hash(key), &mut |a, b| Ok(a == b))
            .unwrap_or(None)
    }

    pub fn set(&mut self, key: Value, value: Value) -> bool {
        let hash = value_hash(&key);
        self.set_with::<()>(key, value, hash, &mut |a, b| Ok(a == b))
            .unwrap_or(false)
    }

    pub fn iter_pairs(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.backing
            .iter()
            .filter(|entry| entry.is_occupied())
            .map(|entry| (entry.key, entry.value))
    }

    /// Slot-indexed access for the map iterator: the index survives across
    /// iteration steps as long as the map is not resized.
    pub fn pair_at(&self, slot: usize) -> Option<(Value, Value)> {
        self.backing.get(slot).and_then(|entry| {
            if entry.is_occupied() {
                Some((entry.key, entry.value))
            } else {
                None
            }
        })
    }

    pub fn slot_count(&self) -> usize {
        self.backing.len()
    }

    pub fn deep_size(&self) -> usize {
        self.backing.capacity() * std::mem::size_of::<MapEntry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_string::ObjectString;
    use crate::value::{as_int, make_int_value};

    fn leak_string(content: &str) -> *mut ObjectString {
        Box::into_raw(ObjectString::new(content))
    }

    #[test]
    fn test_set_get_update() {
        let mut table = Table::new();
        let key = leak_string("answer");
        assert!(!table.set(key, make_int_value(1)));
        assert!(table.set(key, make_int_value(42)));
        assert_eq!(as_int(&table.get(key).unwrap()), 42);
        assert_eq!(table.len(), 1);
        unsafe { drop(Box::from_raw(key)) };
    }

    #[test]
    fn test_tombstone_reuse() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..8).map(|i| leak_string(&format!("k{}", i))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, make_int_value(i as i32));
        }
        table.delete(keys[3]);
        assert!(table.get(keys[3]).is_none());
        // probing continues past the tombstone
        for (i, key) in keys.iter().enumerate() {
            if i != 3 {
                assert_eq!(as_int(&table.get(*key).unwrap()), i as i32);
            }
        }
        // reinsert lands on the tombstone without growing the count
        let before = table.len();
        table.set(keys[3], make_int_value(33));
        assert_eq!(table.len(), before);
        for key in keys {
            unsafe { drop(Box::from_raw(key)) };
        }
    }

    #[test]
    fn test_find_string_by_content() {
        let mut table = Table::new();
        let key = leak_string("shared");
        table.set(key, make_nil_value());
        let hash = unsafe { (*key).hash };
        assert_eq!(table.find_string("shared", hash), Some(key));
        assert_eq!(table.find_string("other", hash), None);
        unsafe { drop(Box::from_raw(key)) };
    }

    #[test]
    fn test_resize_keeps_entries() {
        let mut table = Table::new();
        let keys: Vec<_> = (0..100).map(|i| leak_string(&format!("key-{}", i))).collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(*key, make_int_value(i as i32));
        }
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(as_int(&table.get(*key).unwrap()), i as i32);
        }
        for key in keys {
            unsafe { drop(Box::from_raw(key)) };
        }
    }

    #[test]
    fn test_value_map_int_keys() {
        let mut map = ValueMap::new();
        for i in 0..50 {
            assert!(!map.set(make_int_value(i), make_int_value(i * 2)));
        }
        assert_eq!(map.len(), 50);
        for i in 0..50 {
            assert_eq!(as_int(&map.get(&make_int_value(i)).unwrap()), i * 2);
        }
        assert!(map.get(&make_int_value(99)).is_none());
        assert!(map.set(make_int_value(7), make_int_value(0)));
        assert_eq!(map.len(), 50);
    }

    #[test]
    fn test_value_map_delete() {
        let mut map = ValueMap::new();
        map.set(make_int_value(1), make_int_value(10));
        let hash = value_hash(&make_int_value(1));
        let removed = map
            .delete_with::<()>(&make_int_value(1), hash, &mut |a, b| Ok(a == b))
            .unwrap();
        assert_eq!(as_int(&removed.unwrap()), 10);
        assert!(map.get(&make_int_value(1)).is_none());
    }
}
