use crate::objects::object::{Object, ObjectType};
use crate::value::{make_nil_value, Value};

/// Captured variable. While open, `position` points at the live stack slot;
/// on close the value moves into `closed` and `position` is repointed at the
/// object's own storage, so reads and writes keep going through `position`
/// either way. Open upvalues form a per-VM list through `next`, sorted by
/// descending stack address.
#[repr(C)]
pub struct ObjectUpvalue {
    pub object: Object,
    pub position: *mut Value,
    pub closed: Value,
    pub next: *mut ObjectUpvalue,
}

impl ObjectUpvalue {
    pub fn new(position: *mut Value) -> Box<ObjectUpvalue> {
        Box::new(ObjectUpvalue {
            object: Object::new(ObjectType::ObjUpvalue),
            position,
            closed: make_nil_value(),
            next: std::ptr::null_mut(),
        })
    }

    pub fn close(&mut self) {
        unsafe {
            self.closed = *self.position;
        }
        self.position = &mut self.closed;
    }

    pub fn read(&self) -> Value {
        unsafe { *self.position }
    }

    pub fn write(&mut self, value: Value) {
        unsafe {
            *self.position = value;
        }
    }
}
