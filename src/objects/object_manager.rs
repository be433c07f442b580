use std::ptr::null_mut;

use crate::constants::GC_FIRST_THRESHOLD;
use crate::gc::{gc_trace, GcStats};
use crate::objects::{
    object::{GcSize, Object, ObjectType},
    object_bound_method::ObjectBoundMethod,
    object_class::ObjectClass,
    object_closure::ObjectClosure,
    object_function::ObjectFunction,
    object_instance::ObjectInstance,
    object_native_function::{NativeObject, ObjectNativeFunction},
    object_string::ObjectString,
    object_upvalue::ObjectUpvalue,
};
use crate::value::Value;

/// Owns every heap object through the intrusive all-objects list and keeps
/// the collector's byte accounting. Allocation never marks; triggering a
/// collection is the VM's job since only it can see the roots.
pub struct ObjectManager {
    objects: *mut Object,
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub stress: bool,
    pub gray_stack: Vec<*mut Object>,
    pub stats: GcStats,
}

impl ObjectManager {
    pub fn new() -> ObjectManager {
        ObjectManager {
            objects: null_mut(),
            bytes_allocated: 0,
            next_gc: GC_FIRST_THRESHOLD,
            stress: cfg!(feature = "gc_stress"),
            gray_stack: Vec::new(),
            stats: GcStats::default(),
        }
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Link a freshly boxed object into the all-objects list and account its
    /// current deep size.
    fn insert(&mut self, object: *mut Object, size: usize) {
        unsafe {
            (*object).next = self.objects;
        }
        self.objects = object;
        self.bytes_allocated += size;
        gc_trace!(
            "allocate {:p} ({:?}, {} bytes, {} total)",
            object,
            unsafe { (*object).obj_type },
            size,
            self.bytes_allocated
        );
    }

    pub fn alloc_string(&mut self, content: String) -> *mut ObjectString {
        let object = Box::new(ObjectString::new(content));
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        self.insert(ptr as *mut Object, size);
        ptr
    }

    pub fn alloc_function(&mut self, name: String) -> *mut ObjectFunction {
        let object = Box::new(ObjectFunction::new(name));
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        self.insert(ptr as *mut Object, size);
        ptr
    }

    pub fn alloc_native(
        &mut self,
        name: String,
        arity: u8,
        native: Box<dyn NativeObject>,
    ) -> *mut ObjectNativeFunction {
        let object = Box::new(ObjectNativeFunction::new(name, arity, native));
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        self.insert(ptr as *mut Object, size);
        ptr
    }

    pub fn alloc_closure(&mut self, function: *mut ObjectFunction) -> *mut ObjectClosure {
        let object = Box::new(ObjectClosure::new(function));
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        self.insert(ptr as *mut Object, size);
        ptr
    }

    pub fn alloc_upvalue(&mut self, location: *mut Value) -> *mut ObjectUpvalue {
        let object = Box::new(ObjectUpvalue::new(location));
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        self.insert(ptr as *mut Object, size);
        ptr
    }

    pub fn alloc_class(&mut self, name: String) -> *mut ObjectClass {
        let object = Box::new(ObjectClass::new(name));
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        self.insert(ptr as *mut Object, size);
        ptr
    }

    pub fn alloc_instance(&mut self, class: *mut ObjectClass) -> *mut ObjectInstance {
        let object = Box::new(ObjectInstance::new(class));
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        self.insert(ptr as *mut Object, size);
        ptr
    }

    pub fn alloc_bound_method(
        &mut self,
        receiver: Value,
        method: *mut ObjectClosure,
    ) -> *mut ObjectBoundMethod {
        let object = Box::new(ObjectBoundMethod::new(receiver, method));
        let size = object.deep_size();
        let ptr = Box::into_raw(object);
        self.insert(ptr as *mut Object, size);
        ptr
    }

    pub fn mark_object(&mut self, object: *mut Object) {
        if object.is_null() {
            return;
        }
        unsafe {
            if (*object).is_marked {
                return;
            }
            (*object).is_marked = true;
        }
        gc_trace!("mark {:p} ({:?})", object, unsafe { (*object).obj_type });
        // The gray stack is plain host memory on purpose: growing it must
        // never re-enter the collector.
        self.gray_stack.push(object);
    }

    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Obj(object) = value {
            self.mark_object(*object);
        }
    }

    /// Walk the all-objects list, free everything unmarked, clear the mark
    /// on survivors. Returns the freed byte count.
    pub fn sweep(&mut self) -> usize {
        let mut freed_bytes = 0;
        let mut previous: *mut Object = null_mut();
        let mut object = self.objects;
        while !object.is_null() {
            unsafe {
                if (*object).is_marked {
                    (*object).is_marked = false;
                    previous = object;
                    object = (*object).next;
                } else {
                    let unreached = object;
                    object = (*object).next;
                    if previous.is_null() {
                        self.objects = object;
                    } else {
                        (*previous).next = object;
                    }
                    freed_bytes += Self::free_object(unreached);
                }
            }
        }
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        freed_bytes
    }

    unsafe fn free_object(object: *mut Object) -> usize {
        let size = (*object).deep_size();
        gc_trace!("free {:p} ({:?}, {} bytes)", object, (*object).obj_type, size);
        match (*object).obj_type {
            ObjectType::ObjString => drop(Box::from_raw(object as *mut ObjectString)),
            ObjectType::ObjFunction => drop(Box::from_raw(object as *mut ObjectFunction)),
            ObjectType::ObjNativeFunction => {
                drop(Box::from_raw(object as *mut ObjectNativeFunction))
            }
            ObjectType::ObjClosure => drop(Box::from_raw(object as *mut ObjectClosure)),
            ObjectType::ObjUpvalue => drop(Box::from_raw(object as *mut ObjectUpvalue)),
            ObjectType::ObjClass => drop(Box::from_raw(object as *mut ObjectClass)),
            ObjectType::ObjInstance => drop(Box::from_raw(object as *mut ObjectInstance)),
            ObjectType::ObjBoundMethod => drop(Box::from_raw(object as *mut ObjectBoundMethod)),
        }
        size
    }

    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut object = self.objects;
        while !object.is_null() {
            count += 1;
            object = unsafe { (*object).next };
        }
        count
    }

    pub fn free_all(&mut self) {
        let mut object = self.objects;
        while !object.is_null() {
            unsafe {
                let next = (*object).next;
                Self::free_object(object);
                object = next;
            }
        }
        self.objects = null_mut();
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        self.free_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_links_objects_and_accounts_bytes() {
        let mut manager = ObjectManager::new();
        assert_eq!(manager.object_count(), 0);
        manager.alloc_string("one".to_string());
        manager.alloc_string("two".to_string());
        assert_eq!(manager.object_count(), 2);
        assert!(manager.bytes_allocated > 0);
    }

    #[test]
    fn test_sweep_frees_unmarked_and_unmarks_survivors() {
        let mut manager = ObjectManager::new();
        let keep = manager.alloc_string("keep".to_string());
        manager.alloc_string("drop".to_string());

        manager.mark_object(keep as *mut Object);
        manager.gray_stack.clear();
        let freed = manager.sweep();

        assert!(freed > 0);
        assert_eq!(manager.object_count(), 1);
        assert!(!unsafe { (*keep).object.is_marked });
    }

    #[test]
    fn test_allocation_never_marks() {
        let mut manager = ObjectManager::new();
        let string = manager.alloc_string("fresh".to_string());
        assert!(!unsafe { (*string).object.is_marked });
    }
}
