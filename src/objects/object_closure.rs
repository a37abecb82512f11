use crate::objects::object::{Object, ObjectType};
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_upvalue::ObjectUpvalue;

/// A function bound to its captured upvalues and owning module. Upvalue
/// slots hold pointers because several closures may share one upvalue
/// object.
#[repr(C)]
pub struct ObjectClosure {
    pub object: Object,
    pub function: *mut ObjectFunction,
    pub upvalues: Vec<*mut ObjectUpvalue>,
    pub module: *mut ObjectModule,
}

impl ObjectClosure {
    pub fn new(function: *mut ObjectFunction, module: *mut ObjectModule) -> Box<ObjectClosure> {
        let upvalue_count = unsafe { (*function).upvalue_count };
        Box::new(ObjectClosure {
            object: Object::new(ObjectType::ObjClosure),
            function,
            upvalues: Vec::with_capacity(upvalue_count),
            module,
        })
    }
}
