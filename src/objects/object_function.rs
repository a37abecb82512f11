use crate::chunk::Chunk;
use crate::objects::object::{Object, ObjectType};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Script,
    Function,
    Method,
    Lambda,
    Initializer,
}

impl FunctionKind {
    pub fn from_u32(value: u32) -> Option<FunctionKind> {
        match value {
            0 => Some(FunctionKind::Script),
            1 => Some(FunctionKind::Function),
            2 => Some(FunctionKind::Method),
            3 => Some(FunctionKind::Lambda),
            4 => Some(FunctionKind::Initializer),
            _ => None,
        }
    }
}

/// A compiled function: bytecode plus arity shape. `fixed_arity` parameters
/// are required, the next `optional_arity` may arrive as `Absence`, and with
/// `var_arg` the surplus arguments are collected into an array bound to one
/// trailing parameter.
#[repr(C)]
pub struct ObjectFunction {
    pub object: Object,
    pub chunk: Box<Chunk>,
    pub name: String,
    pub fixed_arity: u32,
    pub optional_arity: u32,
    pub var_arg: bool,
    pub upvalue_count: usize,
    pub kind: FunctionKind,
}

impl ObjectFunction {
    pub fn new(kind: FunctionKind, name: String) -> ObjectFunction {
        ObjectFunction {
            object: Object::new(ObjectType::ObjFunction),
            chunk: Box::new(Chunk::new()),
            name,
            fixed_arity: 0,
            optional_arity: 0,
            var_arg: false,
            upvalue_count: 0,
            kind,
        }
    }

    /// The most arguments a direct call may pass (unbounded when variadic).
    pub fn max_arity(&self) -> u32 {
        self.fixed_arity + self.optional_arity
    }
}

#[cfg(feature = "debug_trace_object")]
mod debug_feature {
    use super::ObjectFunction;

    impl Drop for ObjectFunction {
        fn drop(&mut self) {
            println!("drop function object: name={}", self.name);
        }
    }
}
