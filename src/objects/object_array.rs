use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

#[repr(C)]
pub struct ObjectArray {
    pub object: Object,
    pub values: Vec<Value>,
}

impl ObjectArray {
    pub fn new(length: usize) -> Box<ObjectArray> {
        Box::new(ObjectArray {
            object: Object::new(ObjectType::ObjArray),
            values: vec![make_nil_value(); length],
        })
    }

    pub fn from_values(values: Vec<Value>) -> Box<ObjectArray> {
        Box::new(ObjectArray {
            object: Object::new(ObjectType::ObjArray),
            values,
        })
    }

    pub fn length(&self) -> usize {
        self.values.len()
    }
}
