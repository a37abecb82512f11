use std::path::{Path, PathBuf};

use crate::{
    call_frame::CallFrame,
    chunk::OpCode,
    compiler::Parser,
    debug,
    gc::GarbageCollector,
    natives,
    objects::{
        object::{Object, ObjectType},
        object_array::ObjectArray,
        object_class::ObjectClass,
        object_closure::ObjectClosure,
        object_function::ObjectFunction,
        object_instance::ObjectInstance,
        object_manager::ObjectManager,
        object_map::ObjectMap,
        object_method::ObjectMethod,
        object_module::ObjectModule,
        object_native_function::ObjectNativeFunction,
        object_native_object::{NativeObjectType, ObjectNativeObject},
        object_string::ObjectString,
        object_upvalue::ObjectUpvalue,
    },
    table::Table,
    value::{
        as_bool, as_int, as_number, as_ref, is_absence, is_bool, is_float, is_int, is_nil,
        is_number, is_ref, is_ref_of, is_string, make_bool_value, make_float_value, make_int_value,
        make_nil_value, make_absence_value, make_ref_value, value_hash, value_to_string, Value,
    },
};

pub const FRAME_MAX: usize = 64;
pub const STACK_MAX: usize = FRAME_MAX * 256;
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// Internal invariant violation: not recoverable, abort the process.
macro_rules! implementation_error {
    ($($arg:tt)*) => {{
        eprintln!("Implementation error: {}", format_args!($($arg)*));
        eprintln!("Occurred in file: {}, line: {}", file!(), line!());
        std::process::abort();
    }};
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    InterpretOk,
    InterpretCompileError,
    InterpretRuntimeError,
    InterpretIoError,
}

/// Outcome of a REPL line: `NeedMoreInput` signals an unfinished statement.
pub enum ReplStatus {
    Done(InterpretResult),
    NeedMoreInput,
}

/// A runtime error in flight, carrying the language-level error instance.
/// Propagated out of the dispatch loop until a try handler (or the host)
/// receives it; the Rust rendering of the original longjmp unwind.
pub struct RuntimeThrow {
    pub error: Value,
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorKind {
    Error,
    TypeError,
    IndexError,
    ArgError,
    NameError,
    PropertyError,
    ValueError,
}

struct TryHandler {
    handler_pc: usize,
    stack_depth: usize,
    frame_depth: usize,
    // imports in flight when the handler was recorded; an unwind discards
    // any started after it
    pending_depth: usize,
    module: *mut ObjectModule,
}

/// Interned strings the VM itself needs for protocol dispatch.
pub struct StaticStrings {
    pub init: *mut ObjectString,
    pub length: *mut ObjectString,
    pub iterator: *mut ObjectString,
    pub has_next: *mut ObjectString,
    pub next: *mut ObjectString,
    pub equal: *mut ObjectString,
    pub hash: *mut ObjectString,
    pub message: *mut ObjectString,
    pub position: *mut ObjectString,
}

/// Direct pointers to the prelude classes, cached after the prelude runs so
/// property dispatch on non-instance values skips the builtin table.
#[derive(Default, Clone, Copy)]
pub struct BuiltinClasses {
    pub int_class: Option<*mut ObjectClass>,
    pub float_class: Option<*mut ObjectClass>,
    pub bool_class: Option<*mut ObjectClass>,
    pub nil_class: Option<*mut ObjectClass>,
    pub string_class: Option<*mut ObjectClass>,
    pub array_class: Option<*mut ObjectClass>,
    pub map_class: Option<*mut ObjectClass>,
    pub function_class: Option<*mut ObjectClass>,
    pub closure_class: Option<*mut ObjectClass>,
    pub method_class: Option<*mut ObjectClass>,
    pub native_class: Option<*mut ObjectClass>,
    pub native_object_class: Option<*mut ObjectClass>,
    pub class_class: Option<*mut ObjectClass>,
    pub module_class: Option<*mut ObjectClass>,
    pub error_class: Option<*mut ObjectClass>,
    pub type_error: Option<*mut ObjectClass>,
    pub index_error: Option<*mut ObjectClass>,
    pub arg_error: Option<*mut ObjectClass>,
    pub name_error: Option<*mut ObjectClass>,
    pub property_error: Option<*mut ObjectClass>,
    pub value_error: Option<*mut ObjectClass>,
}

const PRELUDE_SOURCE: &str = include_str!("prelude.lox");

pub struct VM {
    frames: Vec<CallFrame>,
    pub stack: Box<[Value]>,
    pub stack_top_pos: usize,
    open_upvalues: *mut ObjectUpvalue,
    pub object_manager: ObjectManager,
    gc: GarbageCollector,
    pub intern_strings: Table,
    pub builtin: Table,
    /// path string -> module, so a re-import returns the cached module
    modules: Table,
    current_module: *mut ObjectModule,
    main_module: *mut ObjectModule,
    /// modules whose top-level code is running; RestoreModule pops one
    pending_modules: Vec<*mut ObjectModule>,
    try_handlers: Vec<TryHandler>,
    /// extra GC roots for values held across allocation by native code
    pub temp_roots: Vec<Value>,
    allocated_bytes: usize,
    next_gc: usize,
    pub strings: StaticStrings,
    pub classes: BuiltinClasses,
    pub trace_execution: bool,
    pub show_compile_result: bool,
    pub show_labels: bool,
    pub repl_mode: bool,
    /// set by ArrAsVarArg; the next Call spreads its trailing array argument
    var_arg_spread: bool,
}

impl VM {
    pub fn new() -> Box<VM> {
        let mut object_manager = ObjectManager::new();
        let mut intern_strings = Table::new();

        let strings = StaticStrings {
            init: object_manager.alloc_string(&mut intern_strings, "init"),
            length: object_manager.alloc_string(&mut intern_strings, "length"),
            iterator: object_manager.alloc_string(&mut intern_strings, "iterator"),
            has_next: object_manager.alloc_string(&mut intern_strings, "has_next"),
            next: object_manager.alloc_string(&mut intern_strings, "next"),
            equal: object_manager.alloc_string(&mut intern_strings, "equal"),
            hash: object_manager.alloc_string(&mut intern_strings, "hash"),
            message: object_manager.alloc_string(&mut intern_strings, "message"),
            position: object_manager.alloc_string(&mut intern_strings, "position"),
        };

        let main_path = object_manager.alloc_string(&mut intern_strings, "<main>");
        let main_module = object_manager.alloc_module(main_path);

        let mut vm = Box::new(VM {
            frames: Vec::with_capacity(FRAME_MAX),
            stack: vec![make_nil_value(); STACK_MAX].into_boxed_slice(),
            stack_top_pos: 0,
            open_upvalues: std::ptr::null_mut(),
            object_manager,
            gc: GarbageCollector::new(),
            intern_strings,
            builtin: Table::new(),
            modules: Table::new(),
            current_module: main_module,
            main_module,
            pending_modules: vec![],
            try_handlers: vec![],
            temp_roots: vec![],
            allocated_bytes: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            strings,
            classes: BuiltinClasses::default(),
            trace_execution: false,
            show_compile_result: false,
            show_labels: false,
            repl_mode: false,
            var_arg_spread: false,
        });

        natives::install(&mut vm);
        vm.load_prelude();
        vm
    }

    pub fn additional_repl_init(&mut self) {
        self.repl_mode = true;
        natives::install_repl(self);
    }

    // ------------------------------------------------------------------
    // stack primitives
    // ------------------------------------------------------------------

    pub fn push(&mut self, value: Value) {
        if self.stack_top_pos >= STACK_MAX {
            implementation_error!("value stack exhausted");
        }
        self.stack[self.stack_top_pos] = value;
        self.stack_top_pos += 1;
    }

    pub fn pop(&mut self) -> Value {
        if self.stack_top_pos == 0 {
            implementation_error!("value stack underflow");
        }
        self.stack_top_pos -= 1;
        self.stack[self.stack_top_pos]
    }

    pub fn peek(&self) -> Value {
        self.stack[self.stack_top_pos - 1]
    }

    pub fn peek_steps(&self, distance: usize) -> Value {
        self.stack[self.stack_top_pos - distance - 1]
    }

    fn is_falsey(value: &Value) -> bool {
        is_nil(value) || (is_bool(value) && !as_bool(value))
    }

    // ------------------------------------------------------------------
    // error construction
    // ------------------------------------------------------------------

    fn error_class(&self, kind: ErrorKind) -> Option<*mut ObjectClass> {
        match kind {
            ErrorKind::Error => self.classes.error_class,
            ErrorKind::TypeError => self.classes.type_error,
            ErrorKind::IndexError => self.classes.index_error,
            ErrorKind::ArgError => self.classes.arg_error,
            ErrorKind::NameError => self.classes.name_error,
            ErrorKind::PropertyError => self.classes.property_error,
            ErrorKind::ValueError => self.classes.value_error,
        }
    }

    /// Build a language-level error instance with `message` and `position`
    /// fields and wrap it in a throw.
    pub fn runtime_error(&mut self, kind: ErrorKind, message: String) -> RuntimeThrow {
        let class = match self.error_class(kind) {
            Some(class) => class,
            None => {
                // prelude not loaded yet; report bare
                eprintln!("{}", message);
                return RuntimeThrow {
                    error: make_nil_value(),
                };
            }
        };
        let instance = self.object_manager.alloc_instance(class);
        self.push(make_ref_value(instance as *mut Object));
        let message_string = self
            .object_manager
            .alloc_string(&mut self.intern_strings, &message);
        unsafe {
            (*instance)
                .fields
                .set(self.strings.message, make_ref_value(message_string as *mut Object));
        }
        let position = self.backtrace();
        let position_string = self
            .object_manager
            .alloc_string(&mut self.intern_strings, &position);
        unsafe {
            (*instance)
                .fields
                .set(self.strings.position, make_ref_value(position_string as *mut Object));
        }
        let error = self.pop();
        RuntimeThrow { error }
    }

    /// One line per active frame, innermost first.
    pub fn backtrace(&self) -> String {
        let mut result = String::new();
        for frame in self.frames.iter().rev() {
            let function = frame.function();
            let name = if function.name.is_empty() {
                "<script>".to_string()
            } else {
                format!("<fn {}>", function.name)
            };
            result.push_str(&format!("at [line {}] in {}\n", frame.current_line(), name));
        }
        result
    }

    // ------------------------------------------------------------------
    // garbage collection
    // ------------------------------------------------------------------

    /// Collection runs only here, at instruction boundaries, when every live
    /// object is reachable from the stack, frames or tables. Mid-opcode
    /// temporaries never see a collection.
    fn maybe_collect(&mut self) {
        self.allocated_bytes += self.object_manager.drain_pending_bytes();
        let stress = cfg!(feature = "gc_stress");
        if self.allocated_bytes > self.next_gc || (stress && self.allocated_bytes > 0) {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        let before = self.allocated_bytes;
        self.gc.prepare_collection(&self.object_manager);

        // roots: the value stack
        for index in 0..self.stack_top_pos {
            let value = self.stack[index];
            self.gc.mark_value(&value);
        }
        // every active frame's closure
        for frame in &self.frames {
            self.gc.mark_object(frame.closure as *mut Object);
        }
        // the open upvalue list
        self.gc.mark_open_upvalues(self.open_upvalues);
        // builtins, module registry, current/pending modules
        self.gc.mark_table(&self.builtin);
        self.gc.mark_table(&self.modules);
        self.gc.mark_object(self.current_module as *mut Object);
        self.gc.mark_object(self.main_module as *mut Object);
        for &module in &self.pending_modules {
            self.gc.mark_object(module as *mut Object);
        }
        for handler in &self.try_handlers {
            self.gc.mark_object(handler.module as *mut Object);
        }
        // values parked by native code
        for value in &self.temp_roots {
            self.gc.mark_value(value);
        }
        // protocol strings
        for string in [
            self.strings.init,
            self.strings.length,
            self.strings.iterator,
            self.strings.has_next,
            self.strings.next,
            self.strings.equal,
            self.strings.hash,
            self.strings.message,
            self.strings.position,
        ] {
            self.gc.mark_object(string as *mut Object);
        }

        self.gc.trace_references();
        self.intern_strings.delete_unreachable();
        let freed = self.gc.sweep(&mut self.object_manager);

        self.allocated_bytes = self.allocated_bytes.saturating_sub(freed);
        self.next_gc = (self.allocated_bytes * 2).max(INITIAL_GC_THRESHOLD);
        self.gc
            .record_cycle(before, freed, self.allocated_bytes, self.next_gc);
    }

    pub fn gc_stats(&self) -> &crate::gc::GCStats {
        self.gc.stats()
    }

    // ------------------------------------------------------------------
    // upvalues
    // ------------------------------------------------------------------

    /// Find or create the open upvalue for a stack slot; the list stays
    /// sorted by descending stack address so sharing is a prefix walk.
    fn capture_upvalue(&mut self, stack_index: usize) -> *mut ObjectUpvalue {
        let target = &mut self.stack[stack_index] as *mut Value;
        let mut prev: *mut ObjectUpvalue = std::ptr::null_mut();
        let mut curr = self.open_upvalues;
        unsafe {
            while !curr.is_null() && (*curr).position > target {
                prev = curr;
                curr = (*curr).next;
            }
            if !curr.is_null() && (*curr).position == target {
                return curr;
            }
            let created = self.object_manager.alloc_upvalue(target);
            (*created).next = curr;
            if prev.is_null() {
                self.open_upvalues = created;
            } else {
                (*prev).next = created;
            }
            created
        }
    }

    /// Close every open upvalue at or above the given stack slot.
    fn close_upvalues(&mut self, from_index: usize) {
        let boundary = &mut self.stack[from_index] as *mut Value;
        unsafe {
            while !self.open_upvalues.is_null() && (*self.open_upvalues).position >= boundary {
                let upvalue = self.open_upvalues;
                (*upvalue).close();
                self.open_upvalues = (*upvalue).next;
                (*upvalue).next = std::ptr::null_mut();
            }
        }
    }

    pub fn has_open_upvalues_at_or_above(&self, stack_index: usize) -> bool {
        if self.open_upvalues.is_null() {
            return false;
        }
        let boundary = &self.stack[stack_index] as *const Value;
        unsafe { (*self.open_upvalues).position as *const Value >= boundary }
    }

    // ------------------------------------------------------------------
    // calls
    // ------------------------------------------------------------------

    fn call_closure(&mut self, closure: *mut ObjectClosure, arg_count: usize) -> Result<(), RuntimeThrow> {
        let function = unsafe { &*(*closure).function };
        let fixed = function.fixed_arity as usize;
        let optional = function.optional_arity as usize;
        let mut arg_count = arg_count;

        if arg_count < fixed {
            return Err(self.runtime_error(
                ErrorKind::ArgError,
                format!("Expected at least {} arguments but got {}.", fixed, arg_count),
            ));
        }
        if !function.var_arg && arg_count > fixed + optional {
            return Err(self.runtime_error(
                ErrorKind::ArgError,
                format!(
                    "Expected at most {} arguments but got {}.",
                    fixed + optional,
                    arg_count
                ),
            ));
        }
        if self.frames.len() >= FRAME_MAX {
            return Err(self.runtime_error(ErrorKind::Error, "stack overflow".to_string()));
        }

        // optional parameters not supplied arrive as Absence
        while arg_count < fixed + optional {
            self.push(make_absence_value());
            arg_count += 1;
        }
        // a variadic function always receives the surplus as one array
        if function.var_arg {
            let surplus = arg_count - fixed - optional;
            let start = self.stack_top_pos - surplus;
            let values = self.stack[start..self.stack_top_pos].to_vec();
            self.stack_top_pos = start;
            let array = self.object_manager.alloc_array_from(values);
            self.push(make_ref_value(array as *mut Object));
            arg_count = fixed + optional + 1;
        }

        let fp = self.stack_top_pos - arg_count - 1;
        self.frames.push(CallFrame::new(closure, fp));
        Ok(())
    }

    /// CALL: dispatch on the callee at `stack[top - arg_count - 1]`.
    fn call_value(&mut self, arg_count: usize) -> Result<(), RuntimeThrow> {
        let callee = self.peek_steps(arg_count);
        if !is_ref(&callee) {
            return Err(self.runtime_error(
                ErrorKind::TypeError,
                format!("{} is not callable.", value_to_string(&callee)),
            ));
        }
        let object = as_ref(&callee);
        unsafe {
            match (*object).obj_type {
                ObjectType::ObjClosure => self.call_closure(object as *mut ObjectClosure, arg_count),
                ObjectType::ObjClass => {
                    let class = object as *mut ObjectClass;
                    let instance = self.object_manager.alloc_instance(class);
                    let slot = self.stack_top_pos - arg_count - 1;
                    self.stack[slot] = make_ref_value(instance as *mut Object);
                    if let Some(init) = (*class).methods.get(self.strings.init) {
                        self.call_closure(as_ref(&init) as *mut ObjectClosure, arg_count)
                    } else if arg_count != 0 {
                        Err(self.runtime_error(
                            ErrorKind::ArgError,
                            format!("Expected 0 arguments but got {}.", arg_count),
                        ))
                    } else {
                        Ok(())
                    }
                }
                ObjectType::ObjMethod => {
                    let method = object as *mut ObjectMethod;
                    let slot = self.stack_top_pos - arg_count - 1;
                    self.stack[slot] = (*method).receiver;
                    self.call_closure((*method).closure, arg_count)
                }
                ObjectType::ObjNativeFunction => {
                    let native = object as *mut ObjectNativeFunction;
                    let arity = (*native).arity;
                    if arity >= 0 && arg_count != arity as usize {
                        return Err(self.runtime_error(
                            ErrorKind::ArgError,
                            format!("Expected {} arguments but got {}.", arity, arg_count),
                        ));
                    }
                    let args_start = self.stack_top_pos - arg_count;
                    let result = ((*native).function)(self, arg_count, args_start)?;
                    self.stack_top_pos = args_start - 1;
                    self.push(result);
                    Ok(())
                }
                _ => Err(self.runtime_error(
                    ErrorKind::TypeError,
                    format!("{} is not callable.", value_to_string(&callee)),
                )),
            }
        }
    }

    /// Run a callable to completion and hand back its result; used for
    /// protocol methods (`iterator`, `has_next`, `next`, `hash`, `equal`)
    /// invoked from inside an opcode or native.
    pub fn call_value_to_completion(
        &mut self,
        callee: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeThrow> {
        self.push(callee);
        for arg in args {
            self.push(*arg);
        }
        let depth = self.frames.len();
        self.call_value(args.len())?;
        if self.frames.len() > depth {
            self.run_frames(depth)?;
        }
        Ok(self.pop())
    }

    /// Invoke a named method on a receiver to completion.
    pub fn invoke_protocol_method(
        &mut self,
        receiver: Value,
        name: *mut ObjectString,
        args: &[Value],
    ) -> Result<Value, RuntimeThrow> {
        let method = self.find_method_for_value(&receiver, name).ok_or_else(|| {
            let class_name = self.value_class_name(&receiver);
            self.runtime_error(
                ErrorKind::PropertyError,
                format!("'{}' has no method '{}'.", class_name, unsafe {
                    &(*name).content
                }),
            )
        })?;
        self.push(receiver);
        for arg in args {
            self.push(*arg);
        }
        let depth = self.frames.len();
        self.call_closure(method, args.len())?;
        self.run_frames(depth)?;
        Ok(self.pop())
    }

    // ------------------------------------------------------------------
    // property lookup helpers
    // ------------------------------------------------------------------

    /// The class describing a value (instances use their own class; other
    /// kinds dispatch through the cached prelude classes).
    pub fn value_class(&self, value: &Value) -> Option<*mut ObjectClass> {
        if is_int(value) {
            self.classes.int_class
        } else if is_float(value) {
            self.classes.float_class
        } else if is_bool(value) {
            self.classes.bool_class
        } else if is_nil(value) || is_absence(value) {
            self.classes.nil_class
        } else {
            unsafe {
                match (*as_ref(value)).obj_type {
                    ObjectType::ObjString => self.classes.string_class,
                    ObjectType::ObjArray => self.classes.array_class,
                    ObjectType::ObjMap => self.classes.map_class,
                    ObjectType::ObjFunction => self.classes.function_class,
                    ObjectType::ObjClosure => self.classes.closure_class,
                    ObjectType::ObjMethod => self.classes.method_class,
                    ObjectType::ObjNativeFunction => self.classes.native_class,
                    ObjectType::ObjNativeObject => self.classes.native_object_class,
                    ObjectType::ObjModule => self.classes.module_class,
                    ObjectType::ObjClass => self.classes.class_class,
                    ObjectType::ObjInstance => Some((*(as_ref(value) as *mut ObjectInstance)).class),
                    ObjectType::ObjUpvalue => None,
                }
            }
        }
    }

    fn value_class_name(&self, value: &Value) -> String {
        match self.value_class(value) {
            Some(class) => unsafe { (*(*class).name).content.clone() },
            None => "<value>".to_string(),
        }
    }

    /// Resolve a method for any value through its class.
    fn find_method_for_value(&self, value: &Value, name: *mut ObjectString) -> Option<*mut ObjectClosure> {
        let class = self.value_class(value)?;
        let method = unsafe { (*class).methods.get(name)? };
        Some(as_ref(&method) as *mut ObjectClosure)
    }

    // ------------------------------------------------------------------
    // map protocol
    // ------------------------------------------------------------------

    /// Key hash, routed through a script-level `hash` method when the key is
    /// an instance that defines one.
    pub fn hash_value(&mut self, key: &Value) -> Result<u32, RuntimeThrow> {
        if is_ref_of(key, ObjectType::ObjInstance) {
            if self.find_method_for_value(key, self.strings.hash).is_some() {
                let result = self.invoke_protocol_method(*key, self.strings.hash, &[])?;
                if !is_int(&result) {
                    return Err(self.runtime_error(
                        ErrorKind::TypeError,
                        "a 'hash' method must return an int.".to_string(),
                    ));
                }
                return Ok(as_int(&result) as u32);
            }
        }
        Ok(value_hash(key))
    }

    /// Key equality, routed through a script-level `equal` method when
    /// present.
    fn values_equal_protocol(&mut self, stored: &Value, probe: &Value) -> Result<bool, RuntimeThrow> {
        if is_ref_of(probe, ObjectType::ObjInstance)
            && self.find_method_for_value(probe, self.strings.equal).is_some()
        {
            let result = self.invoke_protocol_method(*probe, self.strings.equal, &[*stored])?;
            return Ok(!Self::is_falsey(&result));
        }
        Ok(stored == probe)
    }

    pub fn map_get(&mut self, map: *mut ObjectMap, key: &Value) -> Result<Option<Value>, RuntimeThrow> {
        let hash = self.hash_value(key)?;
        // the map lives behind its own raw pointer, so the reentrant equality
        // callback reaches the VM through one as well
        let vm = self as *mut VM;
        unsafe {
            (*map)
                .backing
                .get_with(key, hash, &mut |a, b| (*vm).values_equal_protocol(a, b))
        }
    }

    pub fn map_set(&mut self, map: *mut ObjectMap, key: Value, value: Value) -> Result<bool, RuntimeThrow> {
        if is_nil(&key) {
            return Err(self.runtime_error(
                ErrorKind::ValueError,
                "nil cannot be used as a map key.".to_string(),
            ));
        }
        let hash = self.hash_value(&key)?;
        let vm = self as *mut VM;
        unsafe {
            (*map)
                .backing
                .set_with(key, value, hash, &mut |a, b| (*vm).values_equal_protocol(a, b))
        }
    }

    pub fn map_delete(&mut self, map: *mut ObjectMap, key: &Value) -> Result<Option<Value>, RuntimeThrow> {
        let hash = self.hash_value(key)?;
        let vm = self as *mut VM;
        unsafe {
            (*map)
                .backing
                .delete_with(key, hash, &mut |a, b| (*vm).values_equal_protocol(a, b))
        }
    }

    // ------------------------------------------------------------------
    // entry points
    // ------------------------------------------------------------------

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let function = {
            let mut parser = Parser::new(&mut self.object_manager, &mut self.intern_strings, self.repl_mode);
            match parser.compile(source) {
                Some(function) => function,
                None => return InterpretResult::InterpretCompileError,
            }
        };
        self.run_script(function)
    }

    /// REPL variant: a compile error at end of input asks for another line.
    pub fn interpret_line(&mut self, source: &str) -> ReplStatus {
        let function = {
            let mut parser = Parser::new(&mut self.object_manager, &mut self.intern_strings, true);
            let function = parser.compile(source);
            if function.is_none() && parser.error_at_eof() {
                return ReplStatus::NeedMoreInput;
            }
            match function {
                Some(function) => function,
                None => return ReplStatus::Done(InterpretResult::InterpretCompileError),
            }
        };
        ReplStatus::Done(self.run_script(function))
    }

    /// Compile `source` and write the top-level function to `path`.
    pub fn produce(&mut self, source: &str, path: &str) -> InterpretResult {
        let function = {
            let mut parser = Parser::new(&mut self.object_manager, &mut self.intern_strings, false);
            match parser.compile(source) {
                Some(function) => function,
                None => return InterpretResult::InterpretCompileError,
            }
        };
        let function = self.object_manager.adopt_function(function);
        match crate::io::write_function_to_file(path, unsafe { &*function }) {
            Ok(()) => InterpretResult::InterpretOk,
            Err(error) => {
                eprintln!("cannot write bytecode to {}: {}", path, error);
                InterpretResult::InterpretIoError
            }
        }
    }

    /// Load a serialized top-level function and execute it.
    pub fn read_run_bytecode(&mut self, path: &str) -> InterpretResult {
        let function = match crate::io::read_function_from_file(
            path,
            &mut self.object_manager,
            &mut self.intern_strings,
        ) {
            Ok(function) => function,
            Err(error) => {
                eprintln!("cannot read bytecode from {}: {}", path, error);
                return InterpretResult::InterpretIoError;
            }
        };
        self.execute_function(function)
    }

    pub fn execute_function(&mut self, function: *mut ObjectFunction) -> InterpretResult {
        if self.show_compile_result {
            debug::disassemble_function(unsafe { &*function }, self.show_labels);
        }
        self.temp_roots.push(make_ref_value(function as *mut Object));
        let closure = self.object_manager.alloc_closure(function, self.main_module);
        self.temp_roots.pop();
        self.push(make_ref_value(closure as *mut Object));

        if let Err(throw) = self.call_closure(closure, 0).and_then(|_| self.run_frames(0)) {
            self.report_uncaught(throw);
            self.reset_after_error();
            return InterpretResult::InterpretRuntimeError;
        }
        // the script's return value
        self.pop();
        InterpretResult::InterpretOk
    }

    fn run_script(&mut self, function: Box<ObjectFunction>) -> InterpretResult {
        let function = self.object_manager.adopt_function(function);
        self.execute_function(function)
    }

    fn report_uncaught(&mut self, throw: RuntimeThrow) {
        let error = throw.error;
        let class_name = self.value_class_name(&error);
        let mut message = String::new();
        let mut position = String::new();
        if is_ref_of(&error, ObjectType::ObjInstance) {
            unsafe {
                let instance = as_ref(&error) as *mut ObjectInstance;
                if let Some(value) = (*instance).fields.get(self.strings.message) {
                    message = value_to_string(&value);
                }
                if let Some(value) = (*instance).fields.get(self.strings.position) {
                    position = value_to_string(&value);
                }
            }
        } else {
            message = value_to_string(&error);
        }
        eprintln!("{}: {}", class_name, message);
        if !position.is_empty() {
            eprint!("{}", position);
        }
    }

    fn reset_after_error(&mut self) {
        self.stack_top_pos = 0;
        self.frames.clear();
        self.try_handlers.clear();
        self.open_upvalues = std::ptr::null_mut();
        self.pending_modules.clear();
        self.var_arg_spread = false;
        self.current_module = self.main_module;
    }

    // ------------------------------------------------------------------
    // dispatch
    // ------------------------------------------------------------------

    /// Run until the frame count drops back to `base_depth`. A throw is
    /// delivered to the innermost try handler recorded above `base_depth`;
    /// anything else propagates to the caller.
    fn run_frames(&mut self, base_depth: usize) -> Result<(), RuntimeThrow> {
        while self.frames.len() > base_depth {
            match self.step() {
                Ok(()) => {}
                Err(throw) => self.deliver_throw(throw, base_depth)?,
            }
        }
        Ok(())
    }

    /// Unwind to the innermost handler: restore stack and frame depths, jump
    /// to the handler and push the error instance. Upvalues are not closed
    /// on this path; the unwind discards the frames wholesale.
    fn deliver_throw(&mut self, throw: RuntimeThrow, base_depth: usize) -> Result<(), RuntimeThrow> {
        match self.try_handlers.last() {
            Some(handler) if handler.frame_depth > base_depth => {
                let handler = self.try_handlers.pop().unwrap();
                self.frames.truncate(handler.frame_depth);
                self.stack_top_pos = handler.stack_depth;
                self.pending_modules.truncate(handler.pending_depth);
                self.current_module = handler.module;
                if let Some(frame) = self.frames.last_mut() {
                    frame.pc = handler.handler_pc;
                }
                self.push(throw.error);
                Ok(())
            }
            _ => Err(throw),
        }
    }

    #[inline(always)]
    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("dispatch requires a frame")
    }

    #[inline(always)]
    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("dispatch requires a frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk().code[frame.pc];
        frame.pc += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let value = frame.chunk().read_u16(frame.pc);
        frame.pc += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        *self.frame().chunk().get_constant(index)
    }

    fn read_constant_string(&mut self) -> *mut ObjectString {
        let value = self.read_constant();
        if !is_string(&value) {
            implementation_error!("constant operand is not a string");
        }
        as_ref(&value) as *mut ObjectString
    }

    fn step(&mut self) -> Result<(), RuntimeThrow> {
        self.maybe_collect();
        debug_feature::trace_instruction(self);

        let instruction = match OpCode::from_byte(self.read_byte()) {
            Some(op) => op,
            None => implementation_error!("unknown opcode"),
        };

        match instruction {
            OpCode::LoadConstant => {
                let constant = self.read_constant();
                self.push(constant);
            }
            OpCode::LoadNil => self.push(make_nil_value()),
            OpCode::LoadTrue => self.push(make_bool_value(true)),
            OpCode::LoadFalse => self.push(make_bool_value(false)),
            OpCode::LoadAbsence => self.push(make_absence_value()),

            OpCode::Negate => {
                let value = self.peek();
                if is_int(&value) {
                    let result = make_int_value(as_int(&value).wrapping_neg());
                    self.pop();
                    self.push(result);
                } else if is_float(&value) {
                    let result = make_float_value(-crate::value::as_float(&value));
                    self.pop();
                    self.push(result);
                } else {
                    return Err(self.runtime_error(
                        ErrorKind::TypeError,
                        "Operand of '-' must be a number.".to_string(),
                    ));
                }
            }
            OpCode::Add => self.op_add()?,
            OpCode::Subtract => self.arithmetic(instruction)?,
            OpCode::Multiply => self.arithmetic(instruction)?,
            OpCode::Divide => self.arithmetic(instruction)?,
            OpCode::Mod => self.arithmetic(instruction)?,
            OpCode::Power => self.op_power()?,
            OpCode::Not => {
                let value = self.pop();
                self.push(make_bool_value(Self::is_falsey(&value)));
            }
            OpCode::TestLess | OpCode::TestGreater => self.comparison(instruction)?,
            OpCode::TestEqual => {
                let b = self.pop();
                let a = self.pop();
                self.push(make_bool_value(a == b));
            }

            OpCode::Pop => {
                self.pop();
            }
            OpCode::Copy => {
                let top = self.peek();
                self.push(top);
            }
            OpCode::Copy2 => {
                let a = self.peek_steps(1);
                self.push(a);
                let b = self.peek_steps(1);
                self.push(b);
            }
            OpCode::CopyN => {
                let distance = self.read_byte() as usize;
                let value = self.peek_steps(distance);
                self.push(value);
            }
            OpCode::Swap => {
                let distance = self.read_byte() as usize;
                let top = self.stack_top_pos - 1;
                self.stack.swap(top, top - distance);
            }
            OpCode::Nop => {}

            OpCode::Print => {
                let value = self.pop();
                println!("{}", value_to_string(&value));
            }
            OpCode::ReplAutoPrint => {
                let value = self.pop();
                if !is_nil(&value) {
                    use colored::Colorize;
                    println!("{}", value_to_string(&value).dimmed());
                }
            }

            OpCode::DefGlobal => self.define_global(false, false),
            OpCode::DefGlobalConst => self.define_global(true, false),
            OpCode::DefPubGlobal => self.define_global(false, true),
            OpCode::DefPubGlobalConst => self.define_global(true, true),
            OpCode::Export => {
                let name = self.read_constant_string();
                unsafe {
                    if !(*self.current_module).globals.has(name) {
                        return Err(self.runtime_error(
                            ErrorKind::NameError,
                            format!("cannot export undefined variable '{}'.", (*name).content),
                        ));
                    }
                    (*self.current_module).public_names.set(name, make_bool_value(true));
                }
            }
            OpCode::GetGlobal => {
                let name = self.read_constant_string();
                let value = unsafe { (*self.current_module).globals.get(name) }
                    .or_else(|| self.builtin.get(name));
                match value {
                    Some(value) => self.push(value),
                    None => {
                        return Err(self.runtime_error(
                            ErrorKind::NameError,
                            format!("undefined variable '{}'.", unsafe { &(*name).content }),
                        ))
                    }
                }
            }
            OpCode::SetGlobal => {
                let name = self.read_constant_string();
                unsafe {
                    if (*self.current_module).const_names.has(name) {
                        return Err(self.runtime_error(
                            ErrorKind::ValueError,
                            "cannot re-assign a const variable".to_string(),
                        ));
                    }
                    let value = self.peek();
                    if !(*self.current_module).globals.set(name, value) {
                        (*self.current_module).globals.delete(name);
                        return Err(self.runtime_error(
                            ErrorKind::NameError,
                            format!("undefined variable '{}'.", (*name).content),
                        ));
                    }
                }
            }
            OpCode::GetLocal => {
                let slot = self.read_byte() as usize;
                let fp = self.frame().fp;
                let value = self.stack[fp + slot];
                self.push(value);
            }
            OpCode::SetLocal => {
                let slot = self.read_byte() as usize;
                let fp = self.frame().fp;
                self.stack[fp + slot] = self.peek();
            }
            OpCode::GetUpvalue => {
                let slot = self.read_byte() as usize;
                let upvalue = unsafe { (&(*self.frame().closure).upvalues)[slot] };
                let value = unsafe { (*upvalue).read() };
                self.push(value);
            }
            OpCode::SetUpvalue => {
                let slot = self.read_byte() as usize;
                let value = self.peek();
                let upvalue = unsafe { (&(*self.frame().closure).upvalues)[slot] };
                unsafe {
                    (*upvalue).write(value);
                }
            }

            OpCode::Jump => {
                let offset = self.read_u16() as usize;
                self.frame_mut().pc += offset;
            }
            OpCode::JumpBack => {
                let offset = self.read_u16() as usize;
                self.frame_mut().pc -= offset;
            }
            OpCode::JumpIfFalse => {
                let offset = self.read_u16() as usize;
                if Self::is_falsey(&self.peek()) {
                    self.frame_mut().pc += offset;
                }
            }
            OpCode::JumpIfTrue => {
                let offset = self.read_u16() as usize;
                if !Self::is_falsey(&self.peek()) {
                    self.frame_mut().pc += offset;
                }
            }
            OpCode::PopJumpIfFalse => {
                let offset = self.read_u16() as usize;
                let condition = self.pop();
                if Self::is_falsey(&condition) {
                    self.frame_mut().pc += offset;
                }
            }
            OpCode::PopJumpIfTrue => {
                let offset = self.read_u16() as usize;
                let condition = self.pop();
                if !Self::is_falsey(&condition) {
                    self.frame_mut().pc += offset;
                }
            }
            OpCode::JumpIfNotEqual => {
                let offset = self.read_u16() as usize;
                if self.peek_steps(0) != self.peek_steps(1) {
                    self.frame_mut().pc += offset;
                }
            }
            OpCode::JumpIfNotAbsence => {
                let offset = self.read_u16() as usize;
                if !is_absence(&self.peek()) {
                    self.frame_mut().pc += offset;
                }
            }

            OpCode::Call => {
                let mut arg_count = self.read_byte() as usize;
                if self.var_arg_spread {
                    self.var_arg_spread = false;
                    arg_count = self.spread_trailing_array(arg_count)?;
                }
                self.call_value(arg_count)?;
            }
            OpCode::MakeClosure => {
                let function_value = self.read_constant();
                let function = as_ref(&function_value) as *mut ObjectFunction;
                let closure = self.object_manager.alloc_closure(function, self.current_module);
                self.push(make_ref_value(closure as *mut Object));
                let upvalue_count = unsafe { (*function).upvalue_count };
                for _ in 0..upvalue_count {
                    let is_local = self.read_byte() == 1;
                    let index = self.read_byte() as usize;
                    let upvalue = if is_local {
                        let fp = self.frame().fp;
                        self.capture_upvalue(fp + index)
                    } else {
                        unsafe { (&(*self.frame().closure).upvalues)[index] }
                    };
                    unsafe {
                        (*closure).upvalues.push(upvalue);
                    }
                }
            }
            OpCode::CloseUpvalue => {
                self.close_upvalues(self.stack_top_pos - 1);
                self.pop();
            }

            OpCode::MakeClass => {
                let name = self.read_constant_string();
                let class = self.object_manager.alloc_class(name);
                self.push(make_ref_value(class as *mut Object));
            }
            OpCode::GetProperty => self.op_get_property()?,
            OpCode::SetProperty => self.op_set_property()?,
            OpCode::MakeMethod => {
                let closure_value = self.peek_steps(0);
                let class_value = self.peek_steps(1);
                let closure = as_ref(&closure_value) as *mut ObjectClosure;
                let class = as_ref(&class_value) as *mut ObjectClass;
                let name = unsafe { (*(*closure).function).name.clone() };
                let name_string = self.object_manager.alloc_string(&mut self.intern_strings, &name);
                unsafe {
                    (*class).methods.set(name_string, closure_value);
                }
                self.pop();
            }
            OpCode::PropertyInvoke => self.op_property_invoke()?,
            OpCode::Inherit => {
                let subclass_value = self.peek_steps(0);
                let superclass_value = self.peek_steps(1);
                if !is_ref_of(&superclass_value, ObjectType::ObjClass) {
                    return Err(self.runtime_error(
                        ErrorKind::TypeError,
                        "superclass must be a class.".to_string(),
                    ));
                }
                let superclass = as_ref(&superclass_value) as *mut ObjectClass;
                let subclass = as_ref(&subclass_value) as *mut ObjectClass;
                // methods copy down; static fields deliberately do not
                unsafe {
                    (*superclass).methods.add_all(&mut (*subclass).methods);
                }
                self.pop();
            }
            OpCode::SuperAccess => {
                let name = self.read_constant_string();
                let superclass = as_ref(&self.pop()) as *mut ObjectClass;
                let receiver = self.peek();
                match unsafe { (*superclass).methods.get(name) } {
                    Some(method_value) => {
                        let closure = as_ref(&method_value) as *mut ObjectClosure;
                        let method = self.object_manager.alloc_method(closure, receiver);
                        self.pop();
                        self.push(make_ref_value(method as *mut Object));
                    }
                    None => {
                        return Err(self.runtime_error(
                            ErrorKind::PropertyError,
                            format!("undefined superclass method '{}'.", unsafe {
                                &(*name).content
                            }),
                        ))
                    }
                }
            }
            OpCode::SuperInvoke => {
                let name = self.read_constant_string();
                let mut arg_count = self.read_byte() as usize;
                let superclass = as_ref(&self.pop()) as *mut ObjectClass;
                if self.var_arg_spread {
                    self.var_arg_spread = false;
                    arg_count = self.spread_trailing_array(arg_count)?;
                }
                match unsafe { (*superclass).methods.get(name) } {
                    Some(method_value) => {
                        let closure = as_ref(&method_value) as *mut ObjectClosure;
                        self.call_closure(closure, arg_count)?;
                    }
                    None => {
                        return Err(self.runtime_error(
                            ErrorKind::PropertyError,
                            format!("undefined superclass method '{}'.", unsafe {
                                &(*name).content
                            }),
                        ))
                    }
                }
            }
            OpCode::MakeStaticField => {
                let name = self.read_constant_string();
                let value = self.pop();
                let class = as_ref(&self.peek()) as *mut ObjectClass;
                unsafe {
                    (*class).static_fields.set(name, value);
                }
            }

            OpCode::MakeArray => {
                let length = self.read_u16() as usize;
                let start = self.stack_top_pos - length;
                let values = self.stack[start..self.stack_top_pos].to_vec();
                self.stack_top_pos = start;
                let array = self.object_manager.alloc_array_from(values);
                self.push(make_ref_value(array as *mut Object));
            }
            OpCode::UnpackArray => {
                let length = self.read_u16() as usize;
                let value = self.pop();
                if !is_ref_of(&value, ObjectType::ObjArray) {
                    return Err(self.runtime_error(
                        ErrorKind::TypeError,
                        "can only unpack an array.".to_string(),
                    ));
                }
                let array = as_ref(&value) as *mut ObjectArray;
                let actual = unsafe { (*array).length() };
                if actual != length {
                    return Err(self.runtime_error(
                        ErrorKind::ValueError,
                        format!("expected an array of {} elements, got {}.", length, actual),
                    ));
                }
                for index in 0..length {
                    let element = unsafe { (&(*array).values)[index] };
                    self.push(element);
                }
            }
            OpCode::IndexingGet => self.op_indexing_get()?,
            OpCode::IndexingSet => self.op_indexing_set()?,
            OpCode::DimensionArray => {
                let dimensions = self.read_byte() as usize;
                self.op_dimension_array(dimensions)?;
            }
            OpCode::NewMap => {
                let map = self.object_manager.alloc_map();
                self.push(make_ref_value(map as *mut Object));
            }
            OpCode::MapAddPair => {
                let value = self.pop();
                let key = self.pop();
                let map = as_ref(&self.peek()) as *mut ObjectMap;
                self.map_set(map, key, value)?;
            }
            OpCode::GetIterator => self.op_get_iterator()?,
            OpCode::JumpForIter => self.op_jump_for_iter()?,
            OpCode::ArrAsVarArg => {
                let top = self.peek();
                if !is_ref_of(&top, ObjectType::ObjArray) {
                    return Err(self.runtime_error(
                        ErrorKind::TypeError,
                        "a spread argument must be an array.".to_string(),
                    ));
                }
                self.var_arg_spread = true;
            }

            OpCode::Import => self.op_import()?,
            OpCode::RestoreModule => {
                // [old_module, nil] -> [new_module]
                self.pop();
                let old_module_value = self.pop();
                self.current_module = as_ref(&old_module_value) as *mut ObjectModule;
                let imported = self
                    .pending_modules
                    .pop()
                    .unwrap_or_else(|| implementation_error!("RestoreModule without pending module"));
                self.push(make_ref_value(imported as *mut Object));
            }
            OpCode::SetTry => {
                let offset = self.read_u16() as usize;
                let handler_pc = self.frame().pc + offset;
                self.try_handlers.push(TryHandler {
                    handler_pc,
                    stack_depth: self.stack_top_pos,
                    frame_depth: self.frames.len(),
                    pending_depth: self.pending_modules.len(),
                    module: self.current_module,
                });
            }
            OpCode::SkipCatch => {
                self.try_handlers.pop();
            }

            OpCode::Return => {
                let result = self.pop();
                let frame = self.frames.pop().expect("return requires a frame");
                self.close_upvalues(frame.fp);
                self.stack_top_pos = frame.fp;
                self.push(result);
                // a return out of a try body leaves its handler behind
                while matches!(self.try_handlers.last(),
                    Some(handler) if handler.frame_depth > self.frames.len())
                {
                    self.try_handlers.pop();
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // arithmetic
    // ------------------------------------------------------------------

    fn op_add(&mut self) -> Result<(), RuntimeThrow> {
        let b = self.peek_steps(0);
        let a = self.peek_steps(1);
        if is_string(&a) || is_string(&b) {
            // any string operand coerces the other to its printable form
            let combined = format!("{}{}", value_to_string(&a), value_to_string(&b));
            let string = self.object_manager.alloc_string(&mut self.intern_strings, &combined);
            self.pop();
            self.pop();
            self.push(make_ref_value(string as *mut Object));
            return Ok(());
        }
        if is_int(&a) && is_int(&b) {
            let result = make_int_value(as_int(&a).wrapping_add(as_int(&b)));
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }
        if is_number(&a) && is_number(&b) {
            let result = make_float_value(as_number(&a) + as_number(&b));
            self.pop();
            self.pop();
            self.push(result);
            return Ok(());
        }
        Err(self.runtime_error(
            ErrorKind::TypeError,
            "Operands of '+' must be numbers or strings.".to_string(),
        ))
    }

    fn arithmetic(&mut self, op: OpCode) -> Result<(), RuntimeThrow> {
        let b = self.peek_steps(0);
        let a = self.peek_steps(1);
        if !is_number(&a) || !is_number(&b) {
            return Err(self.runtime_error(
                ErrorKind::TypeError,
                "Operands must be numbers.".to_string(),
            ));
        }
        if is_int(&a) && is_int(&b) {
            let ia = as_int(&a);
            let ib = as_int(&b);
            let result = match op {
                OpCode::Subtract => ia.wrapping_sub(ib),
                OpCode::Multiply => ia.wrapping_mul(ib),
                OpCode::Divide => {
                    if ib == 0 {
                        return Err(self.runtime_error(
                            ErrorKind::ValueError,
                            "integer division by zero.".to_string(),
                        ));
                    }
                    ia.wrapping_div(ib)
                }
                OpCode::Mod => {
                    if ib == 0 {
                        return Err(self.runtime_error(
                            ErrorKind::ValueError,
                            "integer modulo by zero.".to_string(),
                        ));
                    }
                    ia.wrapping_rem(ib)
                }
                _ => implementation_error!("not an arithmetic opcode"),
            };
            self.pop();
            self.pop();
            self.push(make_int_value(result));
            return Ok(());
        }
        let fa = as_number(&a);
        let fb = as_number(&b);
        let result = match op {
            OpCode::Subtract => fa - fb,
            OpCode::Multiply => fa * fb,
            OpCode::Divide => fa / fb,
            OpCode::Mod => fa % fb,
            _ => implementation_error!("not an arithmetic opcode"),
        };
        self.pop();
        self.pop();
        self.push(make_float_value(result));
        Ok(())
    }

    fn op_power(&mut self) -> Result<(), RuntimeThrow> {
        let b = self.peek_steps(0);
        let a = self.peek_steps(1);
        if !is_number(&a) || !is_number(&b) {
            return Err(self.runtime_error(
                ErrorKind::TypeError,
                "Operands of '**' must be numbers.".to_string(),
            ));
        }
        // integer-valued only for an int base with a non-negative int exponent
        let result = if is_int(&a) && is_int(&b) && as_int(&b) >= 0 {
            make_int_value(as_int(&a).wrapping_pow(as_int(&b) as u32))
        } else {
            make_float_value(as_number(&a).powf(as_number(&b)))
        };
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    fn comparison(&mut self, op: OpCode) -> Result<(), RuntimeThrow> {
        let b = self.peek_steps(0);
        let a = self.peek_steps(1);
        if !is_number(&a) || !is_number(&b) {
            return Err(self.runtime_error(
                ErrorKind::TypeError,
                "Operands of a comparison must be numbers.".to_string(),
            ));
        }
        let result = match op {
            OpCode::TestLess => as_number(&a) < as_number(&b),
            OpCode::TestGreater => as_number(&a) > as_number(&b),
            _ => implementation_error!("not a comparison opcode"),
        };
        self.pop();
        self.pop();
        self.push(make_bool_value(result));
        Ok(())
    }

    // ------------------------------------------------------------------
    // globals
    // ------------------------------------------------------------------

    fn define_global(&mut self, is_const: bool, is_pub: bool) {
        let name = self.read_constant_string();
        let value = self.peek();
        unsafe {
            (*self.current_module).globals.set(name, value);
            if is_const {
                (*self.current_module).const_names.set(name, make_bool_value(true));
            }
            if is_pub {
                (*self.current_module).public_names.set(name, make_bool_value(true));
            }
        }
        self.pop();
    }

    // ------------------------------------------------------------------
    // properties
    // ------------------------------------------------------------------

    fn op_get_property(&mut self) -> Result<(), RuntimeThrow> {
        let name = self.read_constant_string();
        let receiver = self.peek();

        // fast paths for the length of the two sized builtins
        if name == self.strings.length {
            if is_ref_of(&receiver, ObjectType::ObjArray) {
                let array = as_ref(&receiver) as *mut ObjectArray;
                let length = unsafe { (*array).length() };
                self.pop();
                self.push(make_int_value(length as i32));
                return Ok(());
            }
            if is_string(&receiver) {
                let string = as_ref(&receiver) as *mut ObjectString;
                let length = unsafe { (&(*string).content).len() };
                self.pop();
                self.push(make_int_value(length as i32));
                return Ok(());
            }
        }

        if is_ref_of(&receiver, ObjectType::ObjInstance) {
            let instance = as_ref(&receiver) as *mut ObjectInstance;
            if let Some(value) = unsafe { (*instance).fields.get(name) } {
                self.pop();
                self.push(value);
                return Ok(());
            }
        } else if is_ref_of(&receiver, ObjectType::ObjModule) {
            let module = as_ref(&receiver) as *mut ObjectModule;
            unsafe {
                if (*module).public_names.has(name) {
                    if let Some(value) = (*module).globals.get(name) {
                        self.pop();
                        self.push(value);
                        return Ok(());
                    }
                }
            }
            return Err(self.runtime_error(
                ErrorKind::PropertyError,
                format!("module has no public member '{}'.", unsafe { &(*name).content }),
            ));
        } else if is_ref_of(&receiver, ObjectType::ObjClass) {
            let class = as_ref(&receiver) as *mut ObjectClass;
            if let Some(value) = unsafe { (*class).static_fields.get(name) } {
                self.pop();
                self.push(value);
                return Ok(());
            }
        }

        // methods resolve through the value's class (instances included)
        if let Some(closure) = self.find_method_for_value(&receiver, name) {
            let method = self.object_manager.alloc_method(closure, receiver);
            self.pop();
            self.push(make_ref_value(method as *mut Object));
            return Ok(());
        }

        Err(self.runtime_error(
            ErrorKind::PropertyError,
            format!(
                "'{}' has no property '{}'.",
                self.value_class_name(&receiver),
                unsafe { &(*name).content }
            ),
        ))
    }

    fn op_set_property(&mut self) -> Result<(), RuntimeThrow> {
        let name = self.read_constant_string();
        let value = self.peek_steps(0);
        let receiver = self.peek_steps(1);

        if is_ref_of(&receiver, ObjectType::ObjInstance) {
            let instance = as_ref(&receiver) as *mut ObjectInstance;
            unsafe {
                (*instance).fields.set(name, value);
            }
        } else if is_ref_of(&receiver, ObjectType::ObjClass) {
            let class = as_ref(&receiver) as *mut ObjectClass;
            unsafe {
                if !(*class).static_fields.has(name) {
                    return Err(self.runtime_error(
                        ErrorKind::PropertyError,
                        format!("class has no static field '{}'.", (*name).content),
                    ));
                }
                (*class).static_fields.set(name, value);
            }
        } else {
            return Err(self.runtime_error(
                ErrorKind::TypeError,
                "only instances and classes have settable properties.".to_string(),
            ));
        }

        // remove the receiver but keep the assigned value on top
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// Fused property access + call, skipping the bound-method allocation
    /// when the property resolves to a method.
    fn op_property_invoke(&mut self) -> Result<(), RuntimeThrow> {
        let name = self.read_constant_string();
        let mut arg_count = self.read_byte() as usize;
        if self.var_arg_spread {
            self.var_arg_spread = false;
            arg_count = self.spread_trailing_array(arg_count)?;
        }
        let receiver = self.peek_steps(arg_count);

        if is_ref_of(&receiver, ObjectType::ObjInstance) {
            let instance = as_ref(&receiver) as *mut ObjectInstance;
            if let Some(field) = unsafe { (*instance).fields.get(name) } {
                // a callable field is called like any other value
                let slot = self.stack_top_pos - arg_count - 1;
                self.stack[slot] = field;
                return self.call_value(arg_count);
            }
        } else if is_ref_of(&receiver, ObjectType::ObjModule) {
            let module = as_ref(&receiver) as *mut ObjectModule;
            let member = unsafe {
                if (*module).public_names.has(name) {
                    (*module).globals.get(name)
                } else {
                    None
                }
            };
            match member {
                Some(value) => {
                    let slot = self.stack_top_pos - arg_count - 1;
                    self.stack[slot] = value;
                    return self.call_value(arg_count);
                }
                None => {
                    return Err(self.runtime_error(
                        ErrorKind::PropertyError,
                        format!("module has no public member '{}'.", unsafe { &(*name).content }),
                    ))
                }
            }
        } else if is_ref_of(&receiver, ObjectType::ObjClass) {
            let class = as_ref(&receiver) as *mut ObjectClass;
            if let Some(value) = unsafe { (*class).static_fields.get(name) } {
                let slot = self.stack_top_pos - arg_count - 1;
                self.stack[slot] = value;
                return self.call_value(arg_count);
            }
        }

        match self.find_method_for_value(&receiver, name) {
            // the receiver already sits in slot 0 of the new frame
            Some(closure) => self.call_closure(closure, arg_count),
            None => Err(self.runtime_error(
                ErrorKind::PropertyError,
                format!(
                    "'{}' has no property '{}'.",
                    self.value_class_name(&receiver),
                    unsafe { &(*name).content }
                ),
            )),
        }
    }

    // ------------------------------------------------------------------
    // containers
    // ------------------------------------------------------------------

    fn op_indexing_get(&mut self) -> Result<(), RuntimeThrow> {
        let index = self.peek_steps(0);
        let container = self.peek_steps(1);

        if is_ref_of(&container, ObjectType::ObjArray) {
            let array = as_ref(&container) as *mut ObjectArray;
            let position = self.check_index(&index, unsafe { (*array).length() })?;
            let value = unsafe { (&(*array).values)[position] };
            self.pop();
            self.pop();
            self.push(value);
            return Ok(());
        }
        if is_ref_of(&container, ObjectType::ObjMap) {
            let map = as_ref(&container) as *mut ObjectMap;
            let found = self.map_get(map, &index)?;
            return match found {
                Some(value) => {
                    self.pop();
                    self.pop();
                    self.push(value);
                    Ok(())
                }
                None => Err(self.runtime_error(
                    ErrorKind::IndexError,
                    format!("unknown map key: {}.", value_to_string(&index)),
                )),
            };
        }
        if is_string(&container) {
            let string = as_ref(&container) as *mut ObjectString;
            let content = unsafe { &(*string).content };
            let position = self.check_index(&index, content.len())?;
            let one = content[position..position + 1].to_string();
            let result = self.object_manager.alloc_string(&mut self.intern_strings, &one);
            self.pop();
            self.pop();
            self.push(make_ref_value(result as *mut Object));
            return Ok(());
        }
        Err(self.runtime_error(
            ErrorKind::TypeError,
            format!("{} is not indexable.", value_to_string(&container)),
        ))
    }

    fn op_indexing_set(&mut self) -> Result<(), RuntimeThrow> {
        let value = self.peek_steps(0);
        let index = self.peek_steps(1);
        let container = self.peek_steps(2);

        if is_ref_of(&container, ObjectType::ObjArray) {
            let array = as_ref(&container) as *mut ObjectArray;
            let position = self.check_index(&index, unsafe { (*array).length() })?;
            unsafe {
                (&mut (*array).values)[position] = value;
            }
        } else if is_ref_of(&container, ObjectType::ObjMap) {
            let map = as_ref(&container) as *mut ObjectMap;
            self.map_set(map, index, value)?;
        } else {
            return Err(self.runtime_error(
                ErrorKind::TypeError,
                format!("{} does not support index assignment.", value_to_string(&container)),
            ));
        }

        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn check_index(&mut self, index: &Value, length: usize) -> Result<usize, RuntimeThrow> {
        if !is_int(index) {
            return Err(self.runtime_error(
                ErrorKind::TypeError,
                "an index must be an int.".to_string(),
            ));
        }
        let position = as_int(index);
        if position < 0 || position as usize >= length {
            return Err(self.runtime_error(
                ErrorKind::IndexError,
                format!("index {} is out of bound: [0, {}]", position, length as i64 - 1),
            ));
        }
        Ok(position as usize)
    }

    /// `[n; m; ...]`: sizes are on the stack, outermost first. Builds the
    /// nil-filled nested arrays depth-first.
    fn op_dimension_array(&mut self, dimensions: usize) -> Result<(), RuntimeThrow> {
        let start = self.stack_top_pos - dimensions;
        let mut sizes = Vec::with_capacity(dimensions);
        for offset in 0..dimensions {
            let size = self.stack[start + offset];
            if !is_int(&size) || as_int(&size) < 0 {
                return Err(self.runtime_error(
                    ErrorKind::ValueError,
                    "array dimensions must be non-negative ints.".to_string(),
                ));
            }
            sizes.push(as_int(&size) as usize);
        }
        let array = self.build_dimension(&sizes);
        self.stack_top_pos = start;
        self.push(make_ref_value(array as *mut Object));
        Ok(())
    }

    fn build_dimension(&mut self, sizes: &[usize]) -> *mut ObjectArray {
        let array = self.object_manager.alloc_array(sizes[0]);
        if sizes.len() > 1 {
            // keep the parent rooted while the children allocate
            self.push(make_ref_value(array as *mut Object));
            for index in 0..sizes[0] {
                let child = self.build_dimension(&sizes[1..]);
                unsafe {
                    (&mut (*array).values)[index] = make_ref_value(child as *mut Object);
                }
            }
            self.pop();
        }
        array
    }

    // ------------------------------------------------------------------
    // iteration
    // ------------------------------------------------------------------

    fn op_get_iterator(&mut self) -> Result<(), RuntimeThrow> {
        let value = self.peek();
        if is_ref(&value) {
            let object = as_ref(&value);
            unsafe {
                match (*object).obj_type {
                    ObjectType::ObjArray => {
                        let iterator = self.object_manager.alloc_native_object(NativeObjectType::ArrayIter);
                        (*iterator).values[0] = make_int_value(0);
                        (*iterator).values[1] = value;
                        self.pop();
                        self.push(make_ref_value(iterator as *mut Object));
                        return Ok(());
                    }
                    ObjectType::ObjMap => {
                        let iterator = self.object_manager.alloc_native_object(NativeObjectType::MapIter);
                        (*iterator).values[0] = make_int_value(0);
                        (*iterator).values[1] = value;
                        self.pop();
                        self.push(make_ref_value(iterator as *mut Object));
                        return Ok(());
                    }
                    ObjectType::ObjString => {
                        let iterator =
                            self.object_manager.alloc_native_object(NativeObjectType::StringIter);
                        (*iterator).values[0] = make_int_value(0);
                        (*iterator).values[1] = value;
                        self.pop();
                        self.push(make_ref_value(iterator as *mut Object));
                        return Ok(());
                    }
                    // an iterator is its own iterator
                    ObjectType::ObjNativeObject => return Ok(()),
                    ObjectType::ObjInstance => {
                        let receiver = self.pop();
                        let iterator =
                            self.invoke_protocol_method(receiver, self.strings.iterator, &[])?;
                        self.push(iterator);
                        return Ok(());
                    }
                    _ => {}
                }
            }
        }
        Err(self.runtime_error(
            ErrorKind::TypeError,
            format!("{} is not iterable.", value_to_string(&value)),
        ))
    }

    /// [iter] -> [iter, item], or jump when exhausted. A `false` left by
    /// `break` is consumed and exits immediately.
    fn op_jump_for_iter(&mut self) -> Result<(), RuntimeThrow> {
        let offset = self.read_u16() as usize;
        let top = self.peek();

        if is_bool(&top) && !as_bool(&top) {
            self.pop();
            self.frame_mut().pc += offset;
            return Ok(());
        }

        if is_ref_of(&top, ObjectType::ObjNativeObject) {
            let iterator = as_ref(&top) as *mut ObjectNativeObject;
            match self.advance_native_iterator(iterator)? {
                Some(item) => self.push(item),
                None => self.frame_mut().pc += offset,
            }
            return Ok(());
        }

        if is_ref_of(&top, ObjectType::ObjInstance) {
            let has_next = self.invoke_protocol_method(top, self.strings.has_next, &[])?;
            if Self::is_falsey(&has_next) {
                self.frame_mut().pc += offset;
            } else {
                let item = self.invoke_protocol_method(top, self.strings.next, &[])?;
                self.push(item);
            }
            return Ok(());
        }

        Err(self.runtime_error(
            ErrorKind::TypeError,
            format!("{} is not an iterator.", value_to_string(&top)),
        ))
    }

    fn advance_native_iterator(
        &mut self,
        iterator: *mut ObjectNativeObject,
    ) -> Result<Option<Value>, RuntimeThrow> {
        unsafe {
            match (*iterator).native_type {
                NativeObjectType::RangeIter => {
                    // values: [curr, end, step]
                    let curr = as_int(&(*iterator).values[0]);
                    let end = as_int(&(*iterator).values[1]);
                    let step = as_int(&(*iterator).values[2]);
                    let exhausted = if step >= 0 { curr >= end } else { curr <= end };
                    if exhausted {
                        return Ok(None);
                    }
                    (*iterator).values[0] = make_int_value(curr.wrapping_add(step));
                    Ok(Some(make_int_value(curr)))
                }
                NativeObjectType::ArrayIter => {
                    // values: [index, array]
                    let index = as_int(&(*iterator).values[0]) as usize;
                    let array = as_ref(&(*iterator).values[1]) as *mut ObjectArray;
                    if index >= (*array).length() {
                        return Ok(None);
                    }
                    (*iterator).values[0] = make_int_value(index as i32 + 1);
                    Ok(Some((&(*array).values)[index]))
                }
                NativeObjectType::MapIter => {
                    // values: [slot, map]; yields keys
                    let mut slot = as_int(&(*iterator).values[0]) as usize;
                    let map = as_ref(&(*iterator).values[1]) as *mut ObjectMap;
                    while slot < (*map).backing.slot_count() {
                        if let Some((key, _)) = (*map).backing.pair_at(slot) {
                            (*iterator).values[0] = make_int_value(slot as i32 + 1);
                            return Ok(Some(key));
                        }
                        slot += 1;
                    }
                    (*iterator).values[0] = make_int_value(slot as i32);
                    Ok(None)
                }
                NativeObjectType::StringIter => {
                    // values: [byte index, string]
                    let index = as_int(&(*iterator).values[0]) as usize;
                    let string = as_ref(&(*iterator).values[1]) as *mut ObjectString;
                    let content = &(*string).content;
                    if index >= content.len() {
                        return Ok(None);
                    }
                    (*iterator).values[0] = make_int_value(index as i32 + 1);
                    let one = content[index..index + 1].to_string();
                    let item = self.object_manager.alloc_string(&mut self.intern_strings, &one);
                    Ok(Some(make_ref_value(item as *mut Object)))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // calls with spread
    // ------------------------------------------------------------------

    fn spread_trailing_array(&mut self, arg_count: usize) -> Result<usize, RuntimeThrow> {
        let array_value = self.pop();
        let array = as_ref(&array_value) as *mut ObjectArray;
        let elements = unsafe { (*array).values.clone() };
        for element in &elements {
            self.push(*element);
        }
        Ok(arg_count - 1 + elements.len())
    }

    // ------------------------------------------------------------------
    // modules
    // ------------------------------------------------------------------

    /// Relative paths resolve against the importing module's directory.
    fn resolve_module_path(&self, path: &str) -> PathBuf {
        let requested = Path::new(path);
        if requested.is_absolute() {
            return requested.to_path_buf();
        }
        let current_path = unsafe { &(*(*self.current_module).path).content };
        let base = Path::new(current_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        base.join(requested)
    }

    fn op_import(&mut self) -> Result<(), RuntimeThrow> {
        let path_value = self.pop();
        if !is_string(&path_value) {
            return Err(self.runtime_error(
                ErrorKind::TypeError,
                "an import path must be a string.".to_string(),
            ));
        }
        let raw_path = unsafe { (*(as_ref(&path_value) as *mut ObjectString)).content.clone() };
        let resolved = self.resolve_module_path(&raw_path);
        let resolved_str = resolved.to_string_lossy().to_string();
        let path_string = self
            .object_manager
            .alloc_string(&mut self.intern_strings, &resolved_str);

        let old_module = self.current_module;
        self.push(make_ref_value(old_module as *mut Object));

        // a re-import returns the cached module without running it again
        if let Some(cached) = self.modules.get(path_string) {
            let module = as_ref(&cached) as *mut ObjectModule;
            self.pending_modules.push(module);
            self.push(make_nil_value());
            return Ok(());
        }

        let source = match std::fs::read_to_string(&resolved) {
            Ok(source) => source,
            Err(error) => {
                self.pop();
                return Err(self.runtime_error(
                    ErrorKind::ValueError,
                    format!("cannot read module '{}': {}.", resolved_str, error),
                ));
            }
        };

        let function = {
            let mut parser = Parser::new(&mut self.object_manager, &mut self.intern_strings, false);
            parser.compile(&source)
        };
        let function = match function {
            Some(function) => self.object_manager.adopt_function(function),
            None => {
                self.pop();
                return Err(self.runtime_error(
                    ErrorKind::Error,
                    format!("module '{}' failed to compile.", resolved_str),
                ));
            }
        };

        let module = self.object_manager.alloc_module(path_string);
        self.modules.set(path_string, make_ref_value(module as *mut Object));
        self.pending_modules.push(module);
        self.current_module = module;

        self.temp_roots.push(make_ref_value(function as *mut Object));
        let closure = self.object_manager.alloc_closure(function, module);
        self.temp_roots.pop();
        self.push(make_ref_value(closure as *mut Object));
        // the module's top level runs as a normal call; RestoreModule picks
        // up after its Return
        self.call_closure(closure, 0)
    }

    // ------------------------------------------------------------------
    // prelude
    // ------------------------------------------------------------------

    /// Compile and run the embedded prelude in its own module, publish its
    /// public bindings into the builtin table and cache the class pointers.
    fn load_prelude(&mut self) {
        let function = {
            let mut parser = Parser::new(&mut self.object_manager, &mut self.intern_strings, false);
            match parser.compile(PRELUDE_SOURCE) {
                Some(function) => function,
                None => implementation_error!("the prelude failed to compile"),
            }
        };
        let function = self.object_manager.adopt_function(function);

        let path = self
            .object_manager
            .alloc_string(&mut self.intern_strings, "<prelude>");
        let module = self.object_manager.alloc_module(path);
        let saved_module = self.current_module;
        self.current_module = module;
        self.modules.set(path, make_ref_value(module as *mut Object));

        self.temp_roots.push(make_ref_value(function as *mut Object));
        let closure = self.object_manager.alloc_closure(function, module);
        self.temp_roots.pop();
        self.push(make_ref_value(closure as *mut Object));
        if let Err(throw) = self.call_closure(closure, 0).and_then(|_| self.run_frames(0)) {
            self.report_uncaught(throw);
            implementation_error!("the prelude failed to run");
        }
        self.pop();
        self.current_module = saved_module;

        unsafe {
            for (name, value) in (*module).globals.iter() {
                if (*module).public_names.has(name) {
                    self.builtin.set(name, value);
                }
            }
        }
        self.cache_builtin_classes();
    }

    fn builtin_class(&mut self, name: &str) -> Option<*mut ObjectClass> {
        let name_string = self.object_manager.alloc_string(&mut self.intern_strings, name);
        let value = self.builtin.get(name_string)?;
        if is_ref_of(&value, ObjectType::ObjClass) {
            Some(as_ref(&value) as *mut ObjectClass)
        } else {
            None
        }
    }

    fn cache_builtin_classes(&mut self) {
        self.classes = BuiltinClasses {
            int_class: self.builtin_class("Int"),
            float_class: self.builtin_class("Float"),
            bool_class: self.builtin_class("Bool"),
            nil_class: self.builtin_class("Nil"),
            string_class: self.builtin_class("String"),
            array_class: self.builtin_class("Array"),
            map_class: self.builtin_class("Map"),
            function_class: self.builtin_class("Function"),
            closure_class: self.builtin_class("Closure"),
            method_class: self.builtin_class("Method"),
            native_class: self.builtin_class("Native"),
            native_object_class: self.builtin_class("NativeObject"),
            class_class: self.builtin_class("Class"),
            module_class: self.builtin_class("Module"),
            error_class: self.builtin_class("Error"),
            type_error: self.builtin_class("TypeError"),
            index_error: self.builtin_class("IndexError"),
            arg_error: self.builtin_class("ArgError"),
            name_error: self.builtin_class("NameError"),
            property_error: self.builtin_class("PropertyError"),
            value_error: self.builtin_class("ValueError"),
        };
    }

    /// Set the path the main module resolves imports against.
    pub fn set_main_path(&mut self, path: &str) {
        let path_string = self.object_manager.alloc_string(&mut self.intern_strings, path);
        unsafe {
            (*self.main_module).path = path_string;
        }
    }

    pub fn frames_len(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }
}

mod debug_feature {
    use super::*;

    pub fn trace_instruction(vm: &VM) {
        let enabled = cfg!(feature = "debug_trace_execution") || vm.trace_execution;
        if !enabled {
            return;
        }
        if vm.frames_len() == 0 {
            return;
        }

        print!("{: >10}", "");
        for slot in &vm.stack[0..vm.stack_top_pos] {
            print!(" [ {} ]", value_to_string(slot));
        }
        println!();
        let frame = vm.frames().last().unwrap();
        debug::disassemble_instruction(frame.chunk(), frame.pc, &mut debug::Labels::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> InterpretResult {
        let mut vm = VM::new();
        vm.interpret(source)
    }

    #[test]
    fn test_comparison_expression() {
        assert!(run("!(5 - 4 > 3 * 2 == !nil);") == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_string_concatenate() {
        assert!(run("var s = \"st\" + \"ri\" + \"ng\"; print s;") == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_string_number_coercion() {
        assert!(run("print \"n = \" + 42;") == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_int_float_arithmetic() {
        assert!(run("print 7 / 2; print 7.0 / 2; print 2 ** 10; print 7 % 3;")
            == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_integer_division_by_zero_is_runtime_error() {
        assert!(run("1 / 0;") == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_int_wrapping() {
        assert!(run("print 2147483647 + 1;") == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_undefined_global_is_name_error() {
        assert!(run("print missing;") == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_globals_and_locals() {
        assert!(run(
            "var a = 1;
            { var b = a + 2; a = b * 2; }
            print a;"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_const_global_reassignment_fails() {
        assert!(run("const PI = 3; PI = 4;") == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_functions_and_returns() {
        assert!(run(
            "fun add(a, b) { return a + b; }
            print add(1, 2);"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_closures_capture_by_reference() {
        assert!(run(
            "fun makeCounter() { var n = 0; fun inc() { n = n + 1; return n; } return inc; }
            var c = makeCounter();
            print c(); print c(); print c();"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_optional_and_variadic_parameters() {
        assert!(run(
            "fun greet(name, greeting = \"hi\", *rest) {
                return greeting + \" \" + name + \" +\" + rest.length();
            }
            print greet(\"a\");
            print greet(\"a\", \"yo\");
            print greet(\"a\", \"yo\", 1, 2, 3);"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_call_spread() {
        assert!(run(
            "fun sum(a, b, c) { return a + b + c; }
            var args = [1, 2, 3];
            print sum(*args);"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_classes_inheritance_super() {
        assert!(run(
            "class A { greet() { print \"A\"; } }
            class B < A { greet() { super.greet(); print \"B\"; } }
            B().greet();"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_initializer_and_fields() {
        assert!(run(
            "class Point {
                init(x, y) { this.x = x; this.y = y; }
                sum() { return this.x + this.y; }
            }
            var p = Point(3, 4);
            print p.sum();
            p.x = 10;
            print p.sum();"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_static_fields_not_inherited() {
        assert!(run(
            "class A { static count = 1; }
            class B < A {}
            print A.count;"
        ) == InterpretResult::InterpretOk);
        // the subclass does not see the static field
        assert!(run(
            "class A { static count = 1; }
            class B < A {}
            print B.count;"
        ) == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_switch_runs_single_arm() {
        assert!(run(
            "var x = 2;
            switch (x) { case 1: print \"one\"; case 2: print \"two\"; case 3: print \"three\"; default: print \"d\"; }"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_loops_break_continue() {
        assert!(run(
            "var total = 0;
            for (var i = 0; i < 10; i += 1) {
                if (i == 3) { continue; }
                if (i == 6) { break; }
                total += i;
            }
            print total;
            while (true) { break; }"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_arrays_and_maps() {
        assert!(run(
            "var arr = [1, 2, 3];
            arr[0] = 10;
            arr[1] += 5;
            print arr[0] + arr[1] + arr[2];
            var grid = [2; 2];
            grid[0][0] = 1;
            print grid;
            var m = {\"k\": 1};
            m[\"k\"] += 1;
            m[2] = \"two\";
            print m[\"k\"];"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_array_out_of_bounds_is_index_error() {
        assert!(run("var a = [1]; a[1];") == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_for_in_over_array_and_range() {
        assert!(run(
            "var total = 0;
            for (var x in [1, 2, 3]) { total += x; }
            for (var i in range(0, 3)) { total += i; }
            print total;"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_iterator_protocol_on_instances() {
        assert!(run(
            "class Countdown {
                init(n) { this.n = n; }
                iterator() { return this; }
                has_next() { return this.n > 0; }
                next() { this.n -= 1; return this.n + 1; }
            }
            for (var x in Countdown(3)) { print x; }"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_try_catch_name_error() {
        assert!(run(
            "try { print undefined_name; } catch (e) { print e.message; }"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_try_catch_across_frames() {
        assert!(run(
            "fun boom() { return 1 / 0; }
            fun middle() { return boom(); }
            try { middle(); } catch (e) { print \"caught: \" + e.message; }"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_uncaught_error_reports_runtime_error() {
        assert!(run("fun f() { return missing; } f();") == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_frame_depth_limit() {
        assert!(run("fun recurse() { return recurse(); } recurse();")
            == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_destructuring() {
        assert!(run("var [a, b, c] = [1, 2, 3]; print a + b + c;") == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_unpack_wrong_length_fails() {
        assert!(run("var [a, b] = [1];") == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_string_indexing_and_iteration() {
        assert!(run(
            "var s = \"abc\";
            print s[1];
            for (var c in s) { print c; }"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_builtin_length_properties() {
        assert!(run("print [1,2,3].length; print \"abcd\".length;") == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_instance_keys_with_hash_equal() {
        assert!(run(
            "class Key {
                init(id) { this.id = id; }
                hash() { return this.id; }
                equal(other) { return this.id == other.id; }
            }
            var m = {};
            m[Key(1)] = \"one\";
            print m[Key(1)];"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_gc_survives_heavy_allocation() {
        assert!(run(
            "var keep = [];
            for (var i = 0; i < 200; i += 1) {
                var garbage = \"tmp\" + i;
                if (i % 10 == 0) { keep.push(\"kept\" + i); }
            }
            print keep.length();"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_stack_balanced_after_scopes() {
        let mut vm = VM::new();
        let result = vm.interpret("{ var a = 1; { var b = 2; print a + b; } }");
        assert!(result == InterpretResult::InterpretOk);
        assert_eq!(vm.stack_top_pos, 0);
    }

    #[test]
    fn test_no_open_upvalues_after_run() {
        let mut vm = VM::new();
        let result = vm.interpret(
            "fun outer() { var x = 1; fun inner() { return x; } return inner(); }
            print outer();",
        );
        assert!(result == InterpretResult::InterpretOk);
        assert!(!vm.has_open_upvalues_at_or_above(0));
    }
}
