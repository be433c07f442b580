use std::mem::size_of;

use super::{
    object_bound_method::ObjectBoundMethod,
    object_class::ObjectClass,
    object_closure::ObjectClosure,
    object_function::ObjectFunction,
    object_instance::ObjectInstance,
    object_native_function::ObjectNativeFunction,
    object_string::ObjectString,
    object_upvalue::ObjectUpvalue,
};

#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ObjectType {
    ObjString,
    ObjFunction,
    ObjNativeFunction,
    ObjClosure,
    ObjUpvalue,
    ObjClass,
    ObjInstance,
    ObjBoundMethod,
}

/// Header embedded at the start of every heap object. `next` threads the
/// object into the heap's all-objects list; `is_marked` belongs to the
/// collector and is never set on allocation.
#[repr(C)]
pub struct Object {
    pub obj_type: ObjectType,
    pub is_marked: bool,
    pub next: *mut Object,
}

impl Object {
    pub fn new(obj_type: ObjectType) -> Object {
        Object {
            obj_type,
            is_marked: false,
            next: std::ptr::null_mut(),
        }
    }

    /// Compute the deep size of the concrete object this header belongs to.
    /// Safety: caller guarantees `self` is embedded at the start of the
    /// concrete object named by `obj_type`.
    pub unsafe fn deep_size(&self) -> usize {
        match self.obj_type {
            ObjectType::ObjString => (*(self as *const _ as *const ObjectString)).deep_size(),
            ObjectType::ObjFunction => (*(self as *const _ as *const ObjectFunction)).deep_size(),
            ObjectType::ObjNativeFunction => {
                (*(self as *const _ as *const ObjectNativeFunction)).deep_size()
            }
            ObjectType::ObjClosure => (*(self as *const _ as *const ObjectClosure)).deep_size(),
            ObjectType::ObjUpvalue => (*(self as *const _ as *const ObjectUpvalue)).deep_size(),
            ObjectType::ObjClass => (*(self as *const _ as *const ObjectClass)).deep_size(),
            ObjectType::ObjInstance => (*(self as *const _ as *const ObjectInstance)).deep_size(),
            ObjectType::ObjBoundMethod => {
                (*(self as *const _ as *const ObjectBoundMethod)).deep_size()
            }
        }
    }
}

/// Heap usage of a managed object: the struct itself plus owned allocations,
/// not traversing into other GC objects.
pub trait GcSize {
    fn shallow_size(&self) -> usize;
    fn deep_size(&self) -> usize;
}

impl GcSize for ObjectString {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectString>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.content.capacity()
    }
}

impl GcSize for ObjectFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectFunction>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.name.capacity() + self.chunk.deep_size()
    }
}

impl GcSize for ObjectNativeFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectNativeFunction>()
    }
    fn deep_size(&self) -> usize {
        // The boxed native itself is opaque; count the name only.
        self.shallow_size() + self.name.capacity()
    }
}

impl GcSize for ObjectClosure {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectClosure>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.upvalues.capacity() * size_of::<*mut ObjectUpvalue>()
    }
}

impl GcSize for ObjectUpvalue {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectUpvalue>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size()
    }
}

impl GcSize for ObjectClass {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectClass>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.name.capacity() + self.methods.deep_size()
    }
}

impl GcSize for ObjectInstance {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectInstance>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.fields.deep_size()
    }
}

impl GcSize for ObjectBoundMethod {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectBoundMethod>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size()
    }
}

pub fn format_function(function: *mut ObjectFunction) -> String {
    let name = unsafe { &(*function).name };
    if name.is_empty() {
        "<script>".to_string()
    } else {
        format!("<fn {}>", name)
    }
}

pub fn format_object(object: *mut Object) -> String {
    unsafe {
        match (*object).obj_type {
            ObjectType::ObjString => (*(object as *mut ObjectString)).content.clone(),
            ObjectType::ObjFunction => format_function(object as *mut ObjectFunction),
            ObjectType::ObjNativeFunction => "<native fn>".to_string(),
            ObjectType::ObjClosure => format_function((*(object as *mut ObjectClosure)).function),
            ObjectType::ObjUpvalue => "upvalue".to_string(),
            ObjectType::ObjClass => (*(object as *mut ObjectClass)).name.clone(),
            ObjectType::ObjInstance => {
                format!("{} instance", (*(*(object as *mut ObjectInstance)).class).name)
            }
            ObjectType::ObjBoundMethod => {
                format_function((*(*(object as *mut ObjectBoundMethod)).method).function)
            }
        }
    }
}
