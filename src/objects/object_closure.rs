use crate::objects::object::{Object, ObjectType};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_upvalue::ObjectUpvalue;

/// Runtime wrapper binding a function to its captured upvalues. Functions
/// only become callable through a closure.
#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction) -> ObjectClosure {
        let upvalue_count = unsafe { (*function).upvalue_count };
        ObjectClosure {
            object: Object::new(ObjectType::ObjClosure),
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }
    }
}
