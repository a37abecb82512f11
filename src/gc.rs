use std::collections::HashSet;

use crate::{
    objects::{
        object::{Object, ObjectType},
        object_manager::ObjectManager,
        object_upvalue::ObjectUpvalue,
    },
    table::Table,
    value::{as_ref, is_ref, Value},
};

/// Tri-color mark-sweep. White objects are unreached, gray are reached but
/// not yet scanned, black are fully scanned. The header `is_marked` bit
/// shadows non-white membership so weak tables can test reachability without
/// touching the sets; sweep clears it on every survivor.
pub struct GarbageCollector {
    white_set: HashSet<*mut Object>,
    gray_set: HashSet<*mut Object>,
    black_set: HashSet<*mut Object>,
    stats: GCStats,
}

/// Aggregated GC statistics (does not include currently-live total bytes; the VM tracks that).
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with gc_debug feature)
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => { } }
pub(crate) use gc_trace;

impl GarbageCollector {
    pub fn new() -> Self {
        Self {
            white_set: HashSet::new(),
            gray_set: HashSet::new(),
            black_set: HashSet::new(),
            stats: GCStats::default(),
        }
    }

    /// Begin a cycle with every registered object in the white set.
    pub fn prepare_collection(&mut self, object_manager: &ObjectManager) {
        self.reset();
        for &obj_ptr in object_manager.iter() {
            self.white_set.insert(obj_ptr);
        }
    }

    /// Move an object from white to gray and set its mark bit.
    pub fn mark_object(&mut self, obj: *mut Object) {
        if obj.is_null() || self.black_set.contains(&obj) {
            return;
        }

        if self.white_set.remove(&obj) {
            unsafe {
                (*obj).is_marked = true;
            }
            self.gray_set.insert(obj);
            gc_trace!("mark_object enqueue gray ptr={:p}", obj);
        }
    }

    pub fn mark_value(&mut self, value: &Value) {
        if !is_ref(value) {
            return;
        }
        self.mark_object(as_ref(value));
    }

    /// Mark every key object and value of a table.
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key as *mut Object);
            self.mark_value(&value);
        }
    }

    /// Mark the open-upvalue list.
    pub fn mark_open_upvalues(&mut self, head: *mut ObjectUpvalue) {
        let mut curr = head;
        while !curr.is_null() {
            self.mark_object(curr as *mut Object);
            curr = unsafe { (*curr).next };
        }
    }

    /// Process gray objects until none remain.
    pub fn trace_references(&mut self) {
        while !self.gray_set.is_empty() {
            let obj = *self.gray_set.iter().next().unwrap();
            self.gray_set.remove(&obj);
            self.black_set.insert(obj);

            unsafe {
                gc_trace!("trace gray -> black ptr={:p}", obj);
                self.blacken_object(obj);
            }
        }
    }

    /// Mark everything an object references.
    unsafe fn blacken_object(&mut self, object: *mut Object) {
        match (*object).obj_type {
            ObjectType::ObjClosure => {
                let closure = (*object).as_closure();
                self.mark_object(closure.function as *mut Object);
                for upvalue in &closure.upvalues {
                    self.mark_object(*upvalue as *mut Object);
                }
                self.mark_object(closure.module as *mut Object);
            }
            ObjectType::ObjFunction => {
                let function = (*object).as_function();
                for constant in function.chunk.iter_constants() {
                    self.mark_value(constant);
                }
            }
            ObjectType::ObjUpvalue => {
                let upvalue = (*object).as_upvalue();
                self.mark_value(&upvalue.closed);
            }
            ObjectType::ObjClass => {
                let class = (*object).as_class();
                self.mark_object(class.name as *mut Object);
                self.mark_table(&class.methods);
                self.mark_table(&class.static_fields);
            }
            ObjectType::ObjInstance => {
                let instance = (*object).as_instance();
                self.mark_object(instance.class as *mut Object);
                self.mark_table(&instance.fields);
            }
            ObjectType::ObjMethod => {
                let method = (*object).as_method();
                self.mark_object(method.closure as *mut Object);
                self.mark_value(&method.receiver);
            }
            ObjectType::ObjArray => {
                let array = (*object).as_array();
                for element in &array.values {
                    self.mark_value(element);
                }
            }
            ObjectType::ObjMap => {
                let map = (*object).as_map();
                for (key, value) in map.backing.iter_pairs() {
                    self.mark_value(&key);
                    self.mark_value(&value);
                }
            }
            ObjectType::ObjModule => {
                let module = (*object).as_module();
                self.mark_object(module.path as *mut Object);
                self.mark_table(&module.globals);
                self.mark_table(&module.public_names);
                self.mark_table(&module.const_names);
            }
            ObjectType::ObjNativeObject => {
                let native_object = (*object).as_native_object();
                for value in &native_object.values {
                    self.mark_value(value);
                }
            }
            ObjectType::ObjString | ObjectType::ObjNativeFunction => {}
        }
    }

    /// Free everything still white, clear the mark bit on survivors, and
    /// return the freed byte total.
    pub fn sweep(&mut self, object_manager: &mut ObjectManager) -> usize {
        let mut freed_bytes = 0;
        for &obj_ptr in self.white_set.iter() {
            unsafe {
                freed_bytes += (*obj_ptr).deep_size();
            }
            object_manager.remove_object(obj_ptr);
            unsafe {
                Object::free(obj_ptr);
            }
        }
        self.white_set.clear();
        for &obj_ptr in object_manager.iter() {
            unsafe {
                (*obj_ptr).is_marked = false;
            }
        }
        gc_trace!("sweep freed_bytes={}", freed_bytes);
        freed_bytes
    }

    pub fn reset(&mut self) {
        self.white_set.clear();
        self.gray_set.clear();
        self.black_set.clear();
    }

    /// Record a completed GC cycle (invoked by the VM, which knows bytes before/after & threshold)
    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle summary cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_function::FunctionKind;
    use crate::objects::object_manager::ObjectManager;
    use crate::table::Table;
    use crate::value::{make_ref_value, Value};

    #[test]
    fn test_collects_unreachable_objects() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let keep = manager.alloc_string(&mut intern_strings, "keep");
        manager.alloc_string(&mut intern_strings, "drop1");
        manager.alloc_string(&mut intern_strings, "drop2");

        let mut gc = GarbageCollector::new();
        gc.prepare_collection(&manager);
        gc.mark_object(keep as *mut Object);
        gc.trace_references();
        intern_strings.delete_unreachable();
        let freed = gc.sweep(&mut manager);

        assert!(freed > 0, "expected some bytes to be freed");
        assert_eq!(manager.live_count(), 1);
        assert_eq!(intern_strings.len(), 1);
    }

    #[test]
    fn test_closure_keeps_function_and_module_alive() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let path = manager.alloc_string(&mut intern_strings, "<main>");
        let module = manager.alloc_module(path);
        let function = manager.alloc_function(FunctionKind::Function, "f".to_string());
        let closure = manager.alloc_closure(function, module);
        manager.alloc_function(FunctionKind::Function, "unreachable".to_string());

        let mut gc = GarbageCollector::new();
        gc.prepare_collection(&manager);
        gc.mark_value(&make_ref_value(closure as *mut Object));
        gc.trace_references();
        intern_strings.delete_unreachable();
        gc.sweep(&mut manager);

        // closure, function, module and the path string survive
        assert_eq!(manager.live_count(), 4);
    }

    #[test]
    fn test_upvalue_keeps_closed_value_alive() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let captured = manager.alloc_string(&mut intern_strings, "captured");
        let mut slot: Value = make_ref_value(captured as *mut Object);
        let upvalue = manager.alloc_upvalue(&mut slot as *mut Value);
        unsafe {
            (*upvalue).close();
        }

        let mut gc = GarbageCollector::new();
        gc.prepare_collection(&manager);
        gc.mark_object(upvalue as *mut Object);
        gc.trace_references();
        intern_strings.delete_unreachable();
        gc.sweep(&mut manager);

        assert_eq!(manager.live_count(), 2);
    }

    #[test]
    fn test_mark_bits_cleared_after_sweep() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let keep = manager.alloc_string(&mut intern_strings, "keep");

        let mut gc = GarbageCollector::new();
        gc.prepare_collection(&manager);
        gc.mark_object(keep as *mut Object);
        gc.trace_references();
        intern_strings.delete_unreachable();
        gc.sweep(&mut manager);

        for &obj in manager.iter() {
            assert!(!unsafe { (*obj).is_marked });
        }
    }

    #[test]
    fn test_stats_record_cycle() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);
        gc.record_cycle(1000, 400, 600, 1200);
        assert_eq!(gc.stats().cycles, 1);
        assert_eq!(gc.stats().last_freed_bytes, 400);
        assert_eq!(gc.stats().total_freed_bytes, 400);
    }
}
