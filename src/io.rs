use std::io::{Error, ErrorKind, Result};

use crate::{
    chunk::Chunk,
    objects::{
        object::{Object, ObjectType},
        object_function::{FunctionKind, ObjectFunction},
        object_manager::ObjectManager,
        object_string::ObjectString,
    },
    table::Table,
    value::{
        as_bool, as_float, as_int, as_ref, is_string, make_absence_value, make_bool_value,
        make_float_value, make_int_value, make_nil_value, make_ref_value, Value, ValueType,
    },
};

// Binary layout (all integers 4-byte little-endian):
//   function:   kind | fixed_arity | chunk | name_string | upvalue_count
//   chunk:      count | count code bytes | count 4-byte lines | value array
//   value arr:  count | count values
//   value:      type_tag | 8-byte payload [| object_kind | object body]
//   string:     length | length+1 bytes (NUL-terminated); -1 encodes null
// Only strings and functions appear as serialized objects; compile output
// cannot contain cycles.

fn bad_data(message: &str) -> Error {
    Error::new(ErrorKind::InvalidData, message)
}

fn write_i32(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn write_string(out: &mut Vec<u8>, content: Option<&str>) {
    match content {
        None => write_i32(out, -1),
        Some(content) => {
            write_i32(out, content.len() as i32);
            out.extend_from_slice(content.as_bytes());
            out.push(0);
        }
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    write_i32(out, value.value_type as i32);
    match value.value_type {
        ValueType::ValueInt => write_u64(out, as_int(value) as i64 as u64),
        ValueType::ValueFloat => write_u64(out, as_float(value).to_bits()),
        ValueType::ValueBool => write_u64(out, as_bool(value) as u64),
        ValueType::ValueNil | ValueType::ValueAbsence => write_u64(out, 0),
        ValueType::ValueRef => {
            write_u64(out, 0);
            let object = as_ref(value);
            unsafe {
                match (*object).obj_type {
                    ObjectType::ObjString => {
                        write_i32(out, ObjectType::ObjString as i32);
                        let string = object as *mut ObjectString;
                        write_string(out, Some(&(*string).content));
                    }
                    ObjectType::ObjFunction => {
                        write_i32(out, ObjectType::ObjFunction as i32);
                        write_function(out, &*(object as *mut ObjectFunction))?;
                    }
                    _ => {
                        return Err(bad_data("only strings and functions are serializable"));
                    }
                }
            }
            return Ok(());
        }
    }
    Ok(())
}

fn write_chunk(out: &mut Vec<u8>, chunk: &Chunk) -> Result<()> {
    write_i32(out, chunk.code.len() as i32);
    out.extend_from_slice(&chunk.code);
    for line in &chunk.lines {
        write_i32(out, *line as i32);
    }
    write_i32(out, chunk.constants.len() as i32);
    for constant in &chunk.constants {
        write_value(out, constant)?;
    }
    Ok(())
}

pub fn write_function(out: &mut Vec<u8>, function: &ObjectFunction) -> Result<()> {
    write_i32(out, function.kind as i32);
    write_i32(out, function.fixed_arity as i32);
    write_chunk(out, &function.chunk)?;
    if function.name.is_empty() {
        write_string(out, None);
    } else {
        write_string(out, Some(&function.name));
    }
    write_i32(out, function.upvalue_count as i32);
    Ok(())
}

pub struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
    manager: &'a mut ObjectManager,
    intern_strings: &'a mut Table,
}

impl<'a> Reader<'a> {
    pub fn new(
        bytes: &'a [u8],
        manager: &'a mut ObjectManager,
        intern_strings: &'a mut Table,
    ) -> Reader<'a> {
        Reader {
            bytes,
            position: 0,
            manager,
            intern_strings,
        }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.position + count > self.bytes.len() {
            return Err(bad_data("unexpected end of bytecode file"));
        }
        let slice = &self.bytes[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_string(&mut self) -> Result<Option<*mut ObjectString>> {
        let length = self.read_i32()?;
        if length == -1 {
            return Ok(None);
        }
        if length < 0 {
            return Err(bad_data("negative string length"));
        }
        let bytes = self.take(length as usize + 1)?;
        let content = std::str::from_utf8(&bytes[..length as usize])
            .map_err(|_| bad_data("string is not valid utf-8"))?;
        Ok(Some(self.manager.alloc_string(self.intern_strings, content)))
    }

    fn read_value(&mut self) -> Result<Value> {
        let tag = self.read_i32()?;
        let payload = self.read_u64()?;
        match tag {
            tag if tag == ValueType::ValueInt as i32 => Ok(make_int_value(payload as i64 as i32)),
            tag if tag == ValueType::ValueFloat as i32 => {
                Ok(make_float_value(f64::from_bits(payload)))
            }
            tag if tag == ValueType::ValueBool as i32 => Ok(make_bool_value(payload != 0)),
            tag if tag == ValueType::ValueNil as i32 => Ok(make_nil_value()),
            tag if tag == ValueType::ValueAbsence as i32 => Ok(make_absence_value()),
            tag if tag == ValueType::ValueRef as i32 => {
                let object_kind = self.read_i32()?;
                if object_kind == ObjectType::ObjString as i32 {
                    match self.read_string()? {
                        Some(string) => Ok(make_ref_value(string as *mut Object)),
                        None => Err(bad_data("a string constant cannot be null")),
                    }
                } else if object_kind == ObjectType::ObjFunction as i32 {
                    let function = self.read_function()?;
                    Ok(make_ref_value(function as *mut Object))
                } else {
                    Err(bad_data("only strings and functions are serializable"))
                }
            }
            _ => Err(bad_data("unknown value tag")),
        }
    }

    fn read_chunk(&mut self) -> Result<Chunk> {
        let count = self.read_i32()?;
        if count < 0 {
            return Err(bad_data("negative chunk length"));
        }
        let mut chunk = Chunk::new();
        chunk.code = self.take(count as usize)?.to_vec();
        chunk.lines = Vec::with_capacity(count as usize);
        for _ in 0..count {
            chunk.lines.push(self.read_i32()? as u32);
        }
        let constant_count = self.read_i32()?;
        if constant_count < 0 {
            return Err(bad_data("negative constant count"));
        }
        for _ in 0..constant_count {
            let value = self.read_value()?;
            chunk.constants.push(value);
        }
        Ok(chunk)
    }

    pub fn read_function(&mut self) -> Result<*mut ObjectFunction> {
        let kind = FunctionKind::from_u32(self.read_i32()? as u32)
            .ok_or_else(|| bad_data("unknown function kind"))?;
        let fixed_arity = self.read_i32()?;
        if fixed_arity < 0 {
            return Err(bad_data("negative arity"));
        }
        let chunk = self.read_chunk()?;
        let name = self.read_string()?;
        let upvalue_count = self.read_i32()?;
        if upvalue_count < 0 {
            return Err(bad_data("negative upvalue count"));
        }

        let name = match name {
            Some(string) => unsafe { (*string).content.clone() },
            None => String::new(),
        };
        let mut function = Box::new(ObjectFunction::new(kind, name));
        function.fixed_arity = fixed_arity as u32;
        function.chunk = Box::new(chunk);
        function.upvalue_count = upvalue_count as usize;
        Ok(self.manager.adopt_function(function))
    }
}

pub fn write_function_to_file(path: &str, function: &ObjectFunction) -> Result<()> {
    let mut out = Vec::new();
    write_function(&mut out, function)?;
    std::fs::write(path, out)
}

pub fn read_function_from_file(
    path: &str,
    manager: &mut ObjectManager,
    intern_strings: &mut Table,
) -> Result<*mut ObjectFunction> {
    let bytes = std::fs::read(path)?;
    let mut reader = Reader::new(&bytes, manager, intern_strings);
    let function = reader.read_function()?;
    if reader.position != bytes.len() {
        return Err(bad_data("trailing bytes after the function"));
    }
    Ok(function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Parser;

    fn compile_and_adopt(
        manager: &mut ObjectManager,
        intern_strings: &mut Table,
        source: &str,
    ) -> *mut ObjectFunction {
        let function = {
            let mut parser = Parser::new(manager, intern_strings, false);
            parser.compile(source).expect("the test source compiles")
        };
        manager.adopt_function(function)
    }

    fn encode(function: *mut ObjectFunction) -> Vec<u8> {
        let mut out = Vec::new();
        write_function(&mut out, unsafe { &*function }).unwrap();
        out
    }

    #[test]
    fn test_round_trip_is_byte_identical() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let function = compile_and_adopt(
            &mut manager,
            &mut intern_strings,
            "fun fib(n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }
            print fib(10);
            var greeting = \"hello \" + \"world\";
            print greeting;",
        );
        let encoded = encode(function);

        let decoded = {
            let mut reader = Reader::new(&encoded, &mut manager, &mut intern_strings);
            reader.read_function().unwrap()
        };
        let re_encoded = encode(decoded);
        assert_eq!(encoded, re_encoded);
    }

    #[test]
    fn test_round_trip_preserves_chunk_and_nested_functions() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let function = compile_and_adopt(
            &mut manager,
            &mut intern_strings,
            "fun outer() { fun inner() { return 1.5; } return inner; }",
        );
        let encoded = encode(function);
        let decoded = {
            let mut reader = Reader::new(&encoded, &mut manager, &mut intern_strings);
            reader.read_function().unwrap()
        };
        unsafe {
            assert_eq!((*function).chunk.code, (*decoded).chunk.code);
            assert_eq!((*function).chunk.lines, (*decoded).chunk.lines);
            assert_eq!(
                (*function).chunk.constants.len(),
                (*decoded).chunk.constants.len()
            );
        }
    }

    #[test]
    fn test_interned_strings_are_shared_with_reader() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let function = compile_and_adopt(&mut manager, &mut intern_strings, "var s = \"shared\";");
        let encoded = encode(function);
        let decoded = {
            let mut reader = Reader::new(&encoded, &mut manager, &mut intern_strings);
            reader.read_function().unwrap()
        };
        // string constants decode to the same interned objects
        unsafe {
            let original: Vec<_> = (*function)
                .chunk
                .iter_constants()
                .filter(|value| is_string(value))
                .map(|value| as_ref(value))
                .collect();
            let restored: Vec<_> = (*decoded)
                .chunk
                .iter_constants()
                .filter(|value| is_string(value))
                .map(|value| as_ref(value))
                .collect();
            assert_eq!(original, restored);
        }
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let function = compile_and_adopt(&mut manager, &mut intern_strings, "print 1 + 2;");
        let mut encoded = encode(function);
        encoded.truncate(encoded.len() - 3);
        let result = {
            let mut reader = Reader::new(&encoded, &mut manager, &mut intern_strings);
            reader.read_function()
        };
        assert!(result.is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let mut manager = ObjectManager::new();
        let mut intern_strings = Table::new();
        let function =
            compile_and_adopt(&mut manager, &mut intern_strings, "print \"from a file\";");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.rbc");
        let path = path.to_str().unwrap();

        write_function_to_file(path, unsafe { &*function }).unwrap();
        let restored = read_function_from_file(path, &mut manager, &mut intern_strings).unwrap();
        assert_eq!(encode(function), encode(restored));
    }
}
