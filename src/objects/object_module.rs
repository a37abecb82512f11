use crate::objects::object::{Object, ObjectType};
use crate::objects::object_string::ObjectString;
use crate::table::Table;

/// One loaded source file. Globals are per-module; `public_names` marks the
/// bindings visible to importers and `const_names` the ones that reject
/// re-assignment.
#[repr(C)]
pub struct ObjectModule {
    pub object: Object,
    pub path: *mut ObjectString,
    pub globals: Table,
    pub public_names: Table,
    pub const_names: Table,
}

impl ObjectModule {
    pub fn new(path: *mut ObjectString) -> Box<ObjectModule> {
        Box::new(ObjectModule {
            object: Object::new(ObjectType::ObjModule),
            path,
            globals: Table::new(),
            public_names: Table::new(),
            const_names: Table::new(),
        })
    }
}
