use crate::chunk::Chunk;
use crate::objects::object::{Object, ObjectType};

/// A compiled function: its bytecode chunk plus call metadata. The name is
/// owned by the function itself; the empty name marks the top-level script.
#[repr(C)]
pub struct ObjectFunction {
    pub object: Object,
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: String,
}

impl ObjectFunction {
    pub fn new(name: String) -> ObjectFunction {
        ObjectFunction {
            object: Object::new(ObjectType::ObjFunction),
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}
