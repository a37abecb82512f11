use crate::objects::object::{Object, ObjectType};
use crate::objects::object_closure::ObjectClosure;
use crate::value::Value;

/// A closure bound to its receiver, produced by property access on an
/// instance method.
#[repr(C)]
pub struct ObjectMethod {
    pub object: Object,
    pub closure: *mut ObjectClosure,
    pub receiver: Value,
}

impl ObjectMethod {
    pub fn new(closure: *mut ObjectClosure, receiver: Value) -> Box<ObjectMethod> {
        Box::new(ObjectMethod {
            object: Object::new(ObjectType::ObjMethod),
            closure,
            receiver,
        })
    }
}
