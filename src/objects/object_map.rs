use crate::objects::object::{Object, ObjectType};
use crate::table::ValueMap;

/// The language-level map. All access from bytecode goes through the VM,
/// which supplies key hashes and equality (routing instance keys through
/// their `hash`/`equal` methods).
#[repr(C)]
pub struct ObjectMap {
    pub object: Object,
    pub backing: ValueMap,
}

impl ObjectMap {
    pub fn new() -> Box<ObjectMap> {
        Box::new(ObjectMap {
            object: Object::new(ObjectType::ObjMap),
            backing: ValueMap::new(),
        })
    }
}
