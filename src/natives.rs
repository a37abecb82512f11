use rand::Rng;
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{
    objects::{
        object::{Object, ObjectType},
        object_array::ObjectArray,
        object_map::ObjectMap,
        object_native_function::NativeFn,
        object_native_object::NativeObjectType,
        object_string::ObjectString,
    },
    value::{
        as_bool, as_float, as_int, as_ref, is_bool, is_float, is_int, is_ref_of, is_string,
        make_bool_value, make_float_value, make_int_value, make_nil_value, make_ref_value,
        value_hash, value_to_string, Value,
    },
    vm::{ErrorKind, RuntimeThrow, VM},
};

fn define_native(vm: &mut VM, name: &str, function: NativeFn, arity: i32) {
    let name_string = vm.object_manager.alloc_string(&mut vm.intern_strings, name);
    let native = vm
        .object_manager
        .alloc_native_function(name.to_string(), arity, function);
    vm.builtin.set(name_string, make_ref_value(native as *mut Object));
}

pub fn install(vm: &mut VM) {
    define_native(vm, "clock", native_clock, 0);
    define_native(vm, "int", native_int, 1);
    define_native(vm, "float", native_float, 1);
    define_native(vm, "rand", native_rand, 2);
    define_native(vm, "f", native_format, -1);
    define_native(vm, "read", native_read, -1);
    define_native(vm, "char_at", native_char_at, 2);
    define_native(vm, "type", native_type, 1);
    define_native(vm, "range", native_range, -1);
    define_native(vm, "backtrace", native_backtrace, 0);
    define_native(vm, "native_string_combine_array", native_string_combine_array, 1);
    define_native(vm, "native_value_join", native_value_join, 4);
    define_native(vm, "native_string_join", native_string_join, 4);
    define_native(vm, "native_array_iter", native_array_iter, 1);
    define_native(vm, "native_map_iter", native_map_iter, 1);
    define_native(vm, "native_general_hash", native_general_hash, 1);
    define_native(vm, "native_value_equal", native_value_equal, 2);
    define_native(vm, "native_string_length", native_string_length, 1);
    define_native(vm, "native_string_iter", native_string_iter, 1);
    define_native(vm, "native_array_length", native_array_length, 1);
    define_native(vm, "native_array_push", native_array_push, 2);
    define_native(vm, "native_array_pop", native_array_pop, 1);
    define_native(vm, "native_map_size", native_map_size, 1);
    define_native(vm, "native_map_has", native_map_has, 2);
    define_native(vm, "native_map_remove", native_map_remove, 2);
}

pub fn install_repl(vm: &mut VM) {
    define_native(vm, "help", native_help, 0);
    define_native(vm, "exit", native_exit, -1);
}

fn arg(vm: &VM, args_start: usize, index: usize) -> Value {
    vm.stack[args_start + index]
}

fn type_error(vm: &mut VM, message: &str) -> RuntimeThrow {
    vm.runtime_error(ErrorKind::TypeError, message.to_string())
}

fn expect_string(vm: &mut VM, value: &Value, what: &str) -> Result<*mut ObjectString, RuntimeThrow> {
    if !is_string(value) {
        return Err(type_error(vm, &format!("{} must be a string.", what)));
    }
    Ok(as_ref(value) as *mut ObjectString)
}

fn expect_array(vm: &mut VM, value: &Value, what: &str) -> Result<*mut ObjectArray, RuntimeThrow> {
    if !is_ref_of(value, ObjectType::ObjArray) {
        return Err(type_error(vm, &format!("{} must be an array.", what)));
    }
    Ok(as_ref(value) as *mut ObjectArray)
}

fn expect_map(vm: &mut VM, value: &Value, what: &str) -> Result<*mut ObjectMap, RuntimeThrow> {
    if !is_ref_of(value, ObjectType::ObjMap) {
        return Err(type_error(vm, &format!("{} must be a map.", what)));
    }
    Ok(as_ref(value) as *mut ObjectMap)
}

fn native_clock(_vm: &mut VM, _arg_count: usize, _args_start: usize) -> Result<Value, RuntimeThrow> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");
    Ok(make_float_value(elapsed.as_secs_f64()))
}

fn native_int(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let value = arg(vm, args_start, 0);
    if is_int(&value) {
        return Ok(value);
    }
    if is_float(&value) {
        return Ok(make_int_value(as_float(&value) as i32));
    }
    if is_bool(&value) {
        return Ok(make_int_value(as_bool(&value) as i32));
    }
    if is_string(&value) {
        let string = unsafe { &(*(as_ref(&value) as *mut ObjectString)).content };
        return match string.trim().parse::<i32>() {
            Ok(parsed) => Ok(make_int_value(parsed)),
            Err(_) => Err(vm.runtime_error(
                ErrorKind::ValueError,
                format!("not a valid int: {}", string),
            )),
        };
    }
    Err(vm.runtime_error(ErrorKind::ValueError, "not a valid input".to_string()))
}

fn native_float(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let value = arg(vm, args_start, 0);
    if is_int(&value) {
        return Ok(make_float_value(as_int(&value) as f64));
    }
    if is_float(&value) {
        return Ok(value);
    }
    if is_bool(&value) {
        return Ok(make_float_value(as_bool(&value) as i32 as f64));
    }
    if is_string(&value) {
        let string = unsafe { &(*(as_ref(&value) as *mut ObjectString)).content };
        return match string.trim().parse::<f64>() {
            Ok(parsed) => Ok(make_float_value(parsed)),
            Err(_) => Err(vm.runtime_error(
                ErrorKind::ValueError,
                format!("not a valid float: {}", string),
            )),
        };
    }
    Err(vm.runtime_error(ErrorKind::ValueError, "not a valid input".to_string()))
}

/// rand(a, b): a plus a random int below b.
fn native_rand(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let a = arg(vm, args_start, 0);
    let b = arg(vm, args_start, 1);
    if !is_int(&a) || !is_int(&b) {
        return Err(type_error(vm, "arguments of rand need to be ints"));
    }
    if as_int(&b) <= 0 {
        return Err(vm.runtime_error(
            ErrorKind::ValueError,
            "the rand bound must be positive.".to_string(),
        ));
    }
    let offset = rand::thread_rng().gen_range(0..as_int(&b));
    Ok(make_int_value(as_int(&a).wrapping_add(offset)))
}

/// f(format, ...): each `#` consumes one argument's printable form.
fn native_format(vm: &mut VM, arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    if arg_count == 0 {
        return Err(vm.runtime_error(
            ErrorKind::ArgError,
            "f needs at least a format string.".to_string(),
        ));
    }
    let format_value = arg(vm, args_start, 0);
    let format_string = expect_string(vm, &format_value, "the format")?;
    let format = unsafe { (*format_string).content.clone() };

    let mut result = String::new();
    let mut used = 0;
    for ch in format.chars() {
        if ch == '#' {
            if used == arg_count - 1 {
                return Err(vm.runtime_error(
                    ErrorKind::ArgError,
                    "format: more placeholders than arguments".to_string(),
                ));
            }
            used += 1;
            result.push_str(&value_to_string(&arg(vm, args_start, used)));
        } else {
            result.push(ch);
        }
    }
    if used != arg_count - 1 {
        return Err(vm.runtime_error(
            ErrorKind::ArgError,
            "format: more arguments than placeholders".to_string(),
        ));
    }

    let string = vm.object_manager.alloc_string(&mut vm.intern_strings, &result);
    Ok(make_ref_value(string as *mut Object))
}

/// read([prompt]): one line from stdin, without the newline.
fn native_read(vm: &mut VM, arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    if arg_count > 0 {
        print!("{}", value_to_string(&arg(vm, args_start, 0)));
        std::io::stdout().flush().ok();
    }
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return Err(vm.runtime_error(ErrorKind::ValueError, "cannot read from stdin.".to_string()));
    }
    let trimmed = line.trim_end_matches('\n');
    let string = vm.object_manager.alloc_string(&mut vm.intern_strings, trimmed);
    Ok(make_ref_value(string as *mut Object))
}

fn native_char_at(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let string_value = arg(vm, args_start, 0);
    let index_value = arg(vm, args_start, 1);
    let string = expect_string(vm, &string_value, "the first argument")?;
    if !is_int(&index_value) {
        return Err(type_error(vm, "the index must be an int."));
    }
    let content = unsafe { &(*string).content };
    let index = as_int(&index_value);
    if index < 0 || index as usize >= content.len() {
        return Err(vm.runtime_error(
            ErrorKind::IndexError,
            format!("index {} is out of bound: [0, {}]", index, content.len() as i64 - 1),
        ));
    }
    let index = index as usize;
    let one = content[index..index + 1].to_string();
    let result = vm.object_manager.alloc_string(&mut vm.intern_strings, &one);
    Ok(make_ref_value(result as *mut Object))
}

/// type(v): the class describing the value.
fn native_type(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let value = arg(vm, args_start, 0);
    match vm.value_class(&value) {
        Some(class) => Ok(make_ref_value(class as *mut Object)),
        None => Ok(make_nil_value()),
    }
}

/// range(end) | range(start, end) | range(start, end, step)
fn native_range(vm: &mut VM, arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    if arg_count == 0 || arg_count > 3 {
        return Err(vm.runtime_error(
            ErrorKind::ArgError,
            format!("range expects 1 to 3 arguments but got {}.", arg_count),
        ));
    }
    for index in 0..arg_count {
        if !is_int(&arg(vm, args_start, index)) {
            return Err(type_error(vm, "range arguments must be ints."));
        }
    }
    let (start, end, step) = match arg_count {
        1 => (0, as_int(&arg(vm, args_start, 0)), 1),
        2 => (as_int(&arg(vm, args_start, 0)), as_int(&arg(vm, args_start, 1)), 1),
        _ => (
            as_int(&arg(vm, args_start, 0)),
            as_int(&arg(vm, args_start, 1)),
            as_int(&arg(vm, args_start, 2)),
        ),
    };
    if step == 0 {
        return Err(vm.runtime_error(
            ErrorKind::ValueError,
            "the range step cannot be 0.".to_string(),
        ));
    }
    let iterator = vm.object_manager.alloc_native_object(NativeObjectType::RangeIter);
    unsafe {
        (*iterator).values[0] = make_int_value(start);
        (*iterator).values[1] = make_int_value(end);
        (*iterator).values[2] = make_int_value(step);
    }
    Ok(make_ref_value(iterator as *mut Object))
}

/// One line per active frame, innermost first; becomes the `position` field
/// of error instances.
fn native_backtrace(vm: &mut VM, _arg_count: usize, _args_start: usize) -> Result<Value, RuntimeThrow> {
    let backtrace = vm.backtrace();
    let string = vm.object_manager.alloc_string(&mut vm.intern_strings, &backtrace);
    Ok(make_ref_value(string as *mut Object))
}

fn native_string_combine_array(
    vm: &mut VM,
    _arg_count: usize,
    args_start: usize,
) -> Result<Value, RuntimeThrow> {
    let array_value = arg(vm, args_start, 0);
    let array = expect_array(vm, &array_value, "the argument")?;
    let mut result = String::new();
    unsafe {
        for value in &(*array).values {
            result.push_str(&value_to_string(value));
        }
    }
    let string = vm.object_manager.alloc_string(&mut vm.intern_strings, &result);
    Ok(make_ref_value(string as *mut Object))
}

fn join_values(
    vm: &mut VM,
    args_start: usize,
    strings_only: bool,
) -> Result<Value, RuntimeThrow> {
    // 0: delimiter, 1: prefix, 2: suffix, 3: array
    let delimiter_value = arg(vm, args_start, 0);
    let prefix_value = arg(vm, args_start, 1);
    let suffix_value = arg(vm, args_start, 2);
    let array_value = arg(vm, args_start, 3);
    let delimiter = expect_string(vm, &delimiter_value, "the delimiter")?;
    let prefix = expect_string(vm, &prefix_value, "the prefix")?;
    let suffix = expect_string(vm, &suffix_value, "the suffix")?;
    let array = expect_array(vm, &array_value, "the last argument")?;

    let mut result = unsafe { (*prefix).content.clone() };
    unsafe {
        let length = (*array).length();
        for (index, value) in (*array).values.iter().enumerate() {
            if strings_only && !is_string(value) {
                return Err(type_error(vm, "every element must be a string."));
            }
            result.push_str(&value_to_string(value));
            if index != length - 1 {
                result.push_str(&(*delimiter).content);
            }
        }
        result.push_str(&(*suffix).content);
    }
    let string = vm.object_manager.alloc_string(&mut vm.intern_strings, &result);
    Ok(make_ref_value(string as *mut Object))
}

fn native_string_join(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    join_values(vm, args_start, true)
}

fn native_value_join(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    join_values(vm, args_start, false)
}

fn native_array_iter(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let array_value = arg(vm, args_start, 0);
    expect_array(vm, &array_value, "the argument")?;
    let iterator = vm.object_manager.alloc_native_object(NativeObjectType::ArrayIter);
    unsafe {
        (*iterator).values[0] = make_int_value(0);
        (*iterator).values[1] = array_value;
    }
    Ok(make_ref_value(iterator as *mut Object))
}

fn native_map_iter(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let map_value = arg(vm, args_start, 0);
    expect_map(vm, &map_value, "the argument")?;
    let iterator = vm.object_manager.alloc_native_object(NativeObjectType::MapIter);
    unsafe {
        (*iterator).values[0] = make_int_value(0);
        (*iterator).values[1] = map_value;
    }
    Ok(make_ref_value(iterator as *mut Object))
}

fn native_string_iter(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let string_value = arg(vm, args_start, 0);
    expect_string(vm, &string_value, "the argument")?;
    let iterator = vm.object_manager.alloc_native_object(NativeObjectType::StringIter);
    unsafe {
        (*iterator).values[0] = make_int_value(0);
        (*iterator).values[1] = string_value;
    }
    Ok(make_ref_value(iterator as *mut Object))
}

fn native_general_hash(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let value = arg(vm, args_start, 0);
    Ok(make_int_value(value_hash(&value) as i32))
}

fn native_value_equal(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let a = arg(vm, args_start, 0);
    let b = arg(vm, args_start, 1);
    Ok(make_bool_value(a == b))
}

fn native_string_length(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let string_value = arg(vm, args_start, 0);
    let string = expect_string(vm, &string_value, "the receiver")?;
    Ok(make_int_value(unsafe { (&(*string).content).len() } as i32))
}

fn native_array_length(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let array_value = arg(vm, args_start, 0);
    let array = expect_array(vm, &array_value, "the receiver")?;
    Ok(make_int_value(unsafe { (*array).length() } as i32))
}

fn native_array_push(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let array_value = arg(vm, args_start, 0);
    let value = arg(vm, args_start, 1);
    let array = expect_array(vm, &array_value, "the receiver")?;
    unsafe {
        (*array).values.push(value);
    }
    Ok(array_value)
}

fn native_array_pop(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let array_value = arg(vm, args_start, 0);
    let array = expect_array(vm, &array_value, "the receiver")?;
    match unsafe { (*array).values.pop() } {
        Some(value) => Ok(value),
        None => Err(vm.runtime_error(
            ErrorKind::IndexError,
            "cannot pop from an empty array.".to_string(),
        )),
    }
}

fn native_map_size(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let map_value = arg(vm, args_start, 0);
    let map = expect_map(vm, &map_value, "the receiver")?;
    Ok(make_int_value(unsafe { (*map).backing.len() } as i32))
}

fn native_map_has(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let map_value = arg(vm, args_start, 0);
    let key = arg(vm, args_start, 1);
    let map = expect_map(vm, &map_value, "the receiver")?;
    let found = vm.map_get(map, &key)?;
    Ok(make_bool_value(found.is_some()))
}

fn native_map_remove(vm: &mut VM, _arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let map_value = arg(vm, args_start, 0);
    let key = arg(vm, args_start, 1);
    let map = expect_map(vm, &map_value, "the receiver")?;
    match vm.map_delete(map, &key)? {
        Some(value) => Ok(value),
        None => Ok(make_nil_value()),
    }
}

fn native_help(_vm: &mut VM, _arg_count: usize, _args_start: usize) -> Result<Value, RuntimeThrow> {
    println!("You are in the REPL mode because you ran robusta without any arguments.");
    println!("You can also do `robusta path/to/script` to run a script.");
    println!("Or do `robusta -h` to see more options.");
    println!("In this REPL mode, expression results are printed automatically in gray.");
    println!("You may also omit the last semicolon of a statement.");
    println!("Use exit(), ctrl+C or ctrl+D to quit.");
    Ok(make_nil_value())
}

fn native_exit(vm: &mut VM, arg_count: usize, args_start: usize) -> Result<Value, RuntimeThrow> {
    let code = if arg_count > 0 {
        let value = arg(vm, args_start, 0);
        if is_int(&value) {
            as_int(&value)
        } else {
            0
        }
    } else {
        0
    };
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::InterpretResult;

    #[test]
    fn test_int_float_conversions() {
        let mut vm = VM::new();
        assert!(
            vm.interpret("print int(3.7); print int(\"42\"); print float(1); print float(true);")
                == InterpretResult::InterpretOk
        );
    }

    #[test]
    fn test_format_placeholders() {
        let mut vm = VM::new();
        assert!(
            vm.interpret("print f(\"# plus # is #\", 1, 2, 1 + 2);") == InterpretResult::InterpretOk
        );
    }

    #[test]
    fn test_format_mismatch_is_error() {
        let mut vm = VM::new();
        assert!(vm.interpret("f(\"#\", 1, 2);") == InterpretResult::InterpretRuntimeError);
        let mut vm = VM::new();
        assert!(vm.interpret("f(\"# #\", 1);") == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_type_returns_classes() {
        let mut vm = VM::new();
        assert!(vm.interpret(
            "print type(1); print type(1.5); print type(\"s\"); print type([1]); print type({});
            print type(nil); print type(true); print type(type);"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_range_validation() {
        let mut vm = VM::new();
        assert!(vm.interpret("range(1, 10, 0);") == InterpretResult::InterpretRuntimeError);
    }

    #[test]
    fn test_char_at_bounds() {
        let mut vm = VM::new();
        assert!(vm.interpret("char_at(\"abc\", 5);") == InterpretResult::InterpretRuntimeError);
        let mut vm = VM::new();
        assert!(vm.interpret("print char_at(\"abc\", 1);") == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_array_methods_via_prelude() {
        let mut vm = VM::new();
        assert!(vm.interpret(
            "var arr = [1, 2];
            arr.push(3);
            print arr.length();
            print arr.pop();
            print arr.join(\", \", \"[\", \"]\");"
        ) == InterpretResult::InterpretOk);
    }

    #[test]
    fn test_map_methods_via_prelude() {
        let mut vm = VM::new();
        assert!(vm.interpret(
            "var m = {\"a\": 1, \"b\": 2};
            print m.size();
            print m.has(\"a\");
            m.remove(\"a\");
            print m.has(\"a\");"
        ) == InterpretResult::InterpretOk);
    }
}
