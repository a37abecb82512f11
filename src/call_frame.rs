use crate::chunk::Chunk;
use crate::objects::{object_closure::ObjectClosure, object_function::ObjectFunction};

/// Per-call record. `fp` is the value-stack index of the callee (slot 0,
/// which holds `this` inside methods); locals live right above it.
pub struct CallFrame {
    pub closure: *mut ObjectClosure,
    pub pc: usize,
    pub fp: usize,
}

impl CallFrame {
    pub fn new(closure: *mut ObjectClosure, fp: usize) -> CallFrame {
        CallFrame {
            closure,
            pc: 0,
            fp,
        }
    }

    #[inline(always)]
    pub fn function(&self) -> &ObjectFunction {
        unsafe { &*(*self.closure).function }
    }

    #[inline(always)]
    pub fn chunk(&self) -> &Chunk {
        &self.function().chunk
    }

    /// Source line of the most recently executed instruction.
    pub fn current_line(&self) -> u32 {
        let chunk = self.chunk();
        let index = self.pc.saturating_sub(1).min(chunk.lines.len().saturating_sub(1));
        chunk.lines.get(index).copied().unwrap_or(0)
    }
}
