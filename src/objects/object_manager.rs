use crate::objects::{
    object::Object,
    object_array::ObjectArray,
    object_class::ObjectClass,
    object_closure::ObjectClosure,
    object_function::{FunctionKind, ObjectFunction},
    object_instance::ObjectInstance,
    object_map::ObjectMap,
    object_method::ObjectMethod,
    object_module::ObjectModule,
    object_native_function::{NativeFn, ObjectNativeFunction},
    object_native_object::{NativeObjectType, ObjectNativeObject},
    object_string::{chars_hash, ObjectString},
    object_upvalue::ObjectUpvalue,
};
use crate::table::Table;
use crate::value::{make_nil_value, Value};

/// Allocation registry: every live heap object appears here exactly once
/// from `Box::into_raw` until the sweep frees it. Doubles as the byte
/// accountant that drives the collection trigger.
pub struct ObjectManager {
    objects: Vec<*mut Object>,
    // Bytes allocated since last drain (deep size of each object when added)
    pending_bytes: usize,
}

impl ObjectManager {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Drain and return bytes allocated since last call.
    pub fn drain_pending_bytes(&mut self) -> usize {
        let bytes = self.pending_bytes;
        self.pending_bytes = 0;
        bytes
    }

    /// Push a newly allocated object pointer, record its deep size, and
    /// return that size.
    fn push_object(&mut self, obj: *mut Object) -> usize {
        let size = unsafe { (*obj).deep_size() };
        self.pending_bytes += size;
        self.objects.push(obj);
        size
    }

    /// Interning allocation: returns the canonical string for this content,
    /// registering a fresh object in `intern_strings` only when the content
    /// is new.
    pub fn alloc_string(&mut self, intern_strings: &mut Table, content: &str) -> *mut ObjectString {
        let hash = chars_hash(content);
        if let Some(existing) = intern_strings.find_string(content, hash) {
            return existing;
        }
        let ptr = Box::into_raw(ObjectString::new(content));
        self.push_object(ptr as *mut Object);
        intern_strings.set(ptr, make_nil_value());
        ptr
    }

    pub fn alloc_function(&mut self, kind: FunctionKind, name: String) -> *mut ObjectFunction {
        let ptr = Box::into_raw(Box::new(ObjectFunction::new(kind, name)));
        self.push_object(ptr as *mut Object);
        ptr
    }

    /// Register a function built elsewhere (compiler or bytecode reader).
    pub fn adopt_function(&mut self, function: Box<ObjectFunction>) -> *mut ObjectFunction {
        let ptr = Box::into_raw(function);
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_closure(
        &mut self,
        function: *mut ObjectFunction,
        module: *mut ObjectModule,
    ) -> *mut ObjectClosure {
        let ptr = Box::into_raw(ObjectClosure::new(function, module));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_upvalue(&mut self, position: *mut Value) -> *mut ObjectUpvalue {
        let ptr = Box::into_raw(ObjectUpvalue::new(position));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_class(&mut self, name: *mut ObjectString) -> *mut ObjectClass {
        let ptr = Box::into_raw(ObjectClass::new(name));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_instance(&mut self, class: *mut ObjectClass) -> *mut ObjectInstance {
        let ptr = Box::into_raw(ObjectInstance::new(class));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_method(&mut self, closure: *mut ObjectClosure, receiver: Value) -> *mut ObjectMethod {
        let ptr = Box::into_raw(ObjectMethod::new(closure, receiver));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_array(&mut self, length: usize) -> *mut ObjectArray {
        let ptr = Box::into_raw(ObjectArray::new(length));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_array_from(&mut self, values: Vec<Value>) -> *mut ObjectArray {
        let ptr = Box::into_raw(ObjectArray::from_values(values));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_map(&mut self) -> *mut ObjectMap {
        let ptr = Box::into_raw(ObjectMap::new());
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_module(&mut self, path: *mut ObjectString) -> *mut ObjectModule {
        let ptr = Box::into_raw(ObjectModule::new(path));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_native_function(
        &mut self,
        name: String,
        arity: i32,
        function: NativeFn,
    ) -> *mut ObjectNativeFunction {
        let ptr = Box::into_raw(ObjectNativeFunction::new(name, arity, function));
        self.push_object(ptr as *mut Object);
        ptr
    }

    pub fn alloc_native_object(&mut self, native_type: NativeObjectType) -> *mut ObjectNativeObject {
        let ptr = Box::into_raw(ObjectNativeObject::new(native_type));
        self.push_object(ptr as *mut Object);
        ptr
    }

    /// Iterate over all managed objects (for GC mark/sweep)
    pub fn iter(&self) -> impl Iterator<Item = &*mut Object> {
        self.objects.iter()
    }

    pub fn live_count(&self) -> usize {
        self.objects.len()
    }

    /// Remove a pointer from the registry during sweep.
    pub fn remove_object(&mut self, ptr: *mut Object) {
        if let Some(pos) = self.objects.iter().position(|&p| p == ptr) {
            self.objects.swap_remove(pos);
        }
    }

    /// Deallocate all objects (for VM shutdown)
    pub unsafe fn free_all(&mut self) {
        for &ptr in &self.objects {
            if !ptr.is_null() {
                Object::free(ptr);
            }
        }
        self.objects.clear();
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        unsafe {
            self.free_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_interning_returns_same_pointer() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let first = manager.alloc_string(&mut intern_strings, "shared");
        let second = manager.alloc_string(&mut intern_strings, "shared");
        let other = manager.alloc_string(&mut intern_strings, "different");
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(intern_strings.len(), 2);
        assert_eq!(manager.live_count(), 2);
    }

    #[test]
    fn test_allocation_accounts_bytes() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        assert_eq!(manager.drain_pending_bytes(), 0);
        manager.alloc_string(&mut intern_strings, "abc");
        assert!(manager.drain_pending_bytes() > 0);
        assert_eq!(manager.drain_pending_bytes(), 0);
    }
}
