use crate::objects::object::{Object, ObjectType};
use crate::value::Value;
use crate::vm::{RuntimeThrow, VM};

/// Host function. Arguments live on the VM value stack at
/// `stack[args_start .. args_start + arg_count]`; the callee must not assume
/// they survive further allocation unless it roots them itself.
pub type NativeFn = fn(&mut VM, arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow>;

/// Declared arity >= 0 is enforced by the caller before invocation; -1 means
/// the native validates its own arguments.
#[repr(C)]
pub struct ObjectNativeFunction {
    pub object: Object,
    pub name: String,
    pub arity: i32,
    pub function: NativeFn,
}

impl ObjectNativeFunction {
    pub fn new(name: String, arity: i32, function: NativeFn) -> Box<ObjectNativeFunction> {
        Box::new(ObjectNativeFunction {
            object: Object::new(ObjectType::ObjNativeFunction),
            name,
            arity,
            function,
        })
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::ObjectNativeFunction;

    impl Drop for ObjectNativeFunction {
        fn drop(&mut self) {
            println!("drop native function object: name={}", self.name);
        }
    }
}
