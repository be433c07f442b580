use crate::objects::object::{Object, ObjectType};
use crate::table::Table;

#[repr(C)]
pub struct ObjectClass {
    pub object: Object,
    pub name: String,
    pub methods: Table,
}

impl ObjectClass {
    pub fn new(name: String) -> ObjectClass {
        ObjectClass {
            object: Object::new(ObjectType::ObjClass),
            name,
            methods: Table::new(),
        }
    }
}
