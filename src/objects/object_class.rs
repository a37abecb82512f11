use crate::objects::object::{Object, ObjectType};
use crate::objects::object_string::ObjectString;
use crate::table::Table;

/// Methods map name to closure (kind Method or Initializer). Static fields
/// live beside them and are not copied on inheritance.
#[repr(C)]
pub struct ObjectClass {
    pub object: Object,
    pub name: *mut ObjectString,
    pub methods: Table,
    pub static_fields: Table,
}

impl ObjectClass {
    pub fn new(name: *mut ObjectString) -> Box<ObjectClass> {
        Box::new(ObjectClass {
            object: Object::new(ObjectType::ObjClass),
            name,
            methods: Table::new(),
            static_fields: Table::new(),
        })
    }
}
