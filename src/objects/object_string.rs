use crate::objects::object::{Object, ObjectType};

/// An immutable, interned string. The hash is cached so table probes and
/// intern lookups never rehash the bytes.
#[repr(C)]
pub struct ObjectString {
    pub object: Object,
    pub content: String,
    pub hash: u32,
}

impl ObjectString {
    pub fn new(content: String) -> ObjectString {
        let hash = hash_string(&content);
        ObjectString {
            object: Object::new(ObjectType::ObjString),
            content,
            hash,
        }
    }
}

/// FNV-1a, 32 bit.
pub fn hash_string(key: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in key.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_content_hashes_equal() {
        assert_eq!(hash_string("init"), hash_string("init"));
        assert_ne!(hash_string("init"), hash_string("tini"));
    }

    #[test]
    fn test_empty_string_hash_is_fnv_offset_basis() {
        assert_eq!(hash_string(""), 2166136261);
    }
}
