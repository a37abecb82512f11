use crate::objects::object::{Object, ObjectType};

pub const FNV_OFFSET_BASIS: u32 = 2166136261;
pub const FNV_PRIME: u32 = 16777619;

/// FNV-1a over the raw bytes. Cached in every string object so table probing
/// never rehashes.
pub fn chars_hash(content: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in content.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Interned string: exactly one live object per distinct content, so
/// pointer identity doubles as content equality. Interning happens in the
/// VM's string table; this type is just the storage.
#[repr(C)]
pub struct ObjectString {
    pub object: Object,
    pub content: String,
    pub hash: u32,
}

impl ObjectString {
    pub fn new(content: &str) -> Box<ObjectString> {
        Box::new(ObjectString {
            object: Object::new(ObjectType::ObjString),
            content: content.to_string(),
            hash: chars_hash(content),
        })
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::ObjectString;

    impl Drop for ObjectString {
        fn drop(&mut self) {
            println!("drop string object: content={}", self.content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        // well-known FNV-1a test vectors
        assert_eq!(chars_hash(""), 0x811c9dc5);
        assert_eq!(chars_hash("a"), 0xe40c292c);
        assert_eq!(chars_hash("foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_hash_cached_on_construction() {
        let string = ObjectString::new("greeting");
        assert_eq!(string.hash, chars_hash("greeting"));
    }
}
