use crate::objects::object::{Object, ObjectType};
use crate::value::Value;

/// A captured variable. While open, `location` points at a live stack slot
/// and `next` links the VM's open-upvalue list (descending stack address).
/// Closing copies the slot into `closed` and redirects `location` there.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub location: *mut Value,
    pub closed: Value,
    pub next: *mut ObjectUpvalue,
}

impl ObjectUpvalue {
    pub fn new(location: *mut Value) -> ObjectUpvalue {
        ObjectUpvalue {
            object: Object::new(ObjectType::ObjUpvalue),
            location,
            closed: Value::Nil,
            next: std::ptr::null_mut(),
        }
    }
}
