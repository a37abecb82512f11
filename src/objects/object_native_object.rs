use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

pub const NATIVE_OBJECT_VALUE_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeObjectType {
    RangeIter,
    ArrayIter,
    MapIter,
    StringIter,
}

/// Small fixed-size state record used by the built-in iterators, so plain
/// `for .. in` loops over arrays, maps, strings and ranges allocate one
/// object and no instance machinery.
#[repr(C)]
pub struct ObjectNativeObject {
    pub object: Object,
    pub values: [Value; NATIVE_OBJECT_VALUE_SIZE],
    pub native_type: NativeObjectType,
}

impl ObjectNativeObject {
    pub fn new(native_type: NativeObjectType) -> Box<ObjectNativeObject> {
        Box::new(ObjectNativeObject {
            object: Object::new(ObjectType::ObjNativeObject),
            values: [make_nil_value(); NATIVE_OBJECT_VALUE_SIZE],
            native_type,
        })
    }
}
