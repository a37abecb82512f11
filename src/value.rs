use crate::objects::object::{Object, ObjectType};
use crate::objects::object_array::ObjectArray;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_map::ObjectMap;
use crate::objects::object_method::ObjectMethod;
use crate::objects::object_module::ObjectModule;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::objects::object_string::{ObjectString, FNV_OFFSET_BASIS, FNV_PRIME};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    ValueInt,
    ValueFloat,
    ValueBool,
    ValueNil,
    ValueAbsence,
    ValueRef,
}

#[derive(Clone, Copy)]
pub union ValueUnion {
    pub int: i32,
    pub float: f64,
    pub boolean: bool,
    pub object: *mut Object,
}

/// The tagged value representation. Payload access goes through the `as_*`
/// helpers, which read the union field matching the tag.
#[derive(Clone, Copy)]
pub struct Value {
    pub value_type: ValueType,
    pub value_as: ValueUnion,
}

pub type ValueArray = Vec<Value>;

impl Value {
    pub fn new() -> Value {
        make_nil_value()
    }
}

impl Default for Value {
    fn default() -> Self {
        make_nil_value()
    }
}

pub fn make_int_value(value: i32) -> Value {
    Value {
        value_type: ValueType::ValueInt,
        value_as: ValueUnion { int: value },
    }
}

pub fn make_float_value(value: f64) -> Value {
    Value {
        value_type: ValueType::ValueFloat,
        value_as: ValueUnion { float: value },
    }
}

pub fn make_bool_value(value: bool) -> Value {
    Value {
        value_type: ValueType::ValueBool,
        value_as: ValueUnion { boolean: value },
    }
}

pub fn make_nil_value() -> Value {
    Value {
        value_type: ValueType::ValueNil,
        value_as: ValueUnion { int: 0 },
    }
}

pub fn make_absence_value() -> Value {
    Value {
        value_type: ValueType::ValueAbsence,
        value_as: ValueUnion { int: 0 },
    }
}

pub fn make_ref_value(object: *mut Object) -> Value {
    Value {
        value_type: ValueType::ValueRef,
        value_as: ValueUnion { object },
    }
}

pub fn is_int(value: &Value) -> bool {
    value.value_type == ValueType::ValueInt
}

pub fn is_float(value: &Value) -> bool {
    value.value_type == ValueType::ValueFloat
}

pub fn is_number(value: &Value) -> bool {
    is_int(value) || is_float(value)
}

pub fn is_bool(value: &Value) -> bool {
    value.value_type == ValueType::ValueBool
}

pub fn is_nil(value: &Value) -> bool {
    value.value_type == ValueType::ValueNil
}

pub fn is_absence(value: &Value) -> bool {
    value.value_type == ValueType::ValueAbsence
}

pub fn is_ref(value: &Value) -> bool {
    value.value_type == ValueType::ValueRef
}

pub fn is_ref_of(value: &Value, obj_type: ObjectType) -> bool {
    is_ref(value) && unsafe { (*as_ref(value)).obj_type == obj_type }
}

pub fn is_string(value: &Value) -> bool {
    is_ref_of(value, ObjectType::ObjString)
}

pub fn as_int(value: &Value) -> i32 {
    unsafe { value.value_as.int }
}

pub fn as_float(value: &Value) -> f64 {
    unsafe { value.value_as.float }
}

/// Widening read: an int payload is promoted to f64.
pub fn as_number(value: &Value) -> f64 {
    match value.value_type {
        ValueType::ValueInt => as_int(value) as f64,
        _ => as_float(value),
    }
}

pub fn as_bool(value: &Value) -> bool {
    unsafe { value.value_as.boolean }
}

pub fn as_ref(value: &Value) -> *mut Object {
    unsafe { value.value_as.object }
}

impl PartialEq for Value {
    /// Equality within a tag uses the payload; across tags it is always
    /// false. In particular `1 == 1.0` is false.
    fn eq(&self, other: &Value) -> bool {
        if self.value_type != other.value_type {
            return false;
        }
        match self.value_type {
            ValueType::ValueInt => as_int(self) == as_int(other),
            ValueType::ValueFloat => as_float(self) == as_float(other),
            ValueType::ValueBool => as_bool(self) == as_bool(other),
            ValueType::ValueNil => true,
            ValueType::ValueAbsence => true,
            // Strings are interned, so pointer identity is content equality.
            ValueType::ValueRef => std::ptr::eq(as_ref(self), as_ref(other)),
        }
    }
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() && value.abs() < 1e16 {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

/// The printable form used by `print`, string coercion and the REPL.
pub fn value_to_string(value: &Value) -> String {
    match value.value_type {
        ValueType::ValueInt => format!("{}", as_int(value)),
        ValueType::ValueFloat => format_float(as_float(value)),
        ValueType::ValueBool => format!("{}", as_bool(value)),
        ValueType::ValueNil => "nil".to_string(),
        ValueType::ValueAbsence => "<absence>".to_string(),
        ValueType::ValueRef => object_to_string(as_ref(value)),
    }
}

fn object_to_string(object: *mut Object) -> String {
    unsafe {
        match (*object).obj_type {
            ObjectType::ObjString => (*(object as *mut ObjectString)).content.clone(),
            ObjectType::ObjFunction => {
                let function = &*(object as *mut ObjectFunction);
                if function.name.is_empty() {
                    "<script>".to_string()
                } else {
                    format!("<fn {}>", function.name)
                }
            }
            ObjectType::ObjClosure => {
                let closure = &*(object as *mut ObjectClosure);
                object_to_string(closure.function as *mut Object)
            }
            ObjectType::ObjNativeFunction => {
                let native = &*(object as *mut ObjectNativeFunction);
                format!("<native fn {}>", native.name)
            }
            ObjectType::ObjUpvalue => "<upvalue>".to_string(),
            ObjectType::ObjClass => {
                let class = &*(object as *mut ObjectClass);
                (*class.name).content.clone()
            }
            ObjectType::ObjInstance => {
                let instance = &*(object as *mut ObjectInstance);
                format!("<{} instance>", (*(*instance.class).name).content)
            }
            ObjectType::ObjMethod => {
                let method = &*(object as *mut ObjectMethod);
                object_to_string(method.closure as *mut Object)
            }
            ObjectType::ObjArray => {
                let array = &*(object as *mut ObjectArray);
                let items: Vec<String> = array.values.iter().map(value_to_string).collect();
                format!("[{}]", items.join(", "))
            }
            ObjectType::ObjMap => {
                let map = &*(object as *mut ObjectMap);
                let items: Vec<String> = map
                    .backing
                    .iter_pairs()
                    .map(|(k, v)| format!("{}: {}", value_to_string(&k), value_to_string(&v)))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            ObjectType::ObjModule => {
                let module = &*(object as *mut ObjectModule);
                format!("<module {}>", (*module.path).content)
            }
            ObjectType::ObjNativeObject => "<native object>".to_string(),
        }
    }
}

pub fn print_value(value: &Value) {
    print!("{}", value_to_string(value));
}

/// FNV-1a over the tagged representation. Strings hash by their interned
/// content, other refs by address.
pub fn value_hash(value: &Value) -> u32 {
    fn fnv_bytes(bytes: &[u8]) -> u32 {
        let mut hash = FNV_OFFSET_BASIS;
        for byte in bytes {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }
    match value.value_type {
        ValueType::ValueInt => fnv_bytes(&as_int(value).to_le_bytes()),
        ValueType::ValueFloat => fnv_bytes(&as_float(value).to_le_bytes()),
        ValueType::ValueBool => {
            let mut hash = FNV_OFFSET_BASIS;
            hash ^= as_bool(value) as u32;
            hash.wrapping_mul(FNV_PRIME)
        }
        ValueType::ValueNil | ValueType::ValueAbsence => 0,
        ValueType::ValueRef => {
            if is_string(value) {
                unsafe { (*(as_ref(value) as *mut ObjectString)).hash }
            } else {
                fnv_bytes(&(as_ref(value) as usize).to_le_bytes())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cross_variant_equality_is_false() {
        assert!(make_int_value(1) != make_float_value(1.0));
        assert!(make_int_value(0) != make_bool_value(false));
        assert!(make_nil_value() != make_absence_value());
        assert!(make_nil_value() == make_nil_value());
        assert!(make_absence_value() == make_absence_value());
    }

    #[test]
    fn test_number_widening() {
        let int = make_int_value(-7);
        let float = make_float_value(2.5);
        assert!(is_number(&int) && is_number(&float));
        assert_eq!(as_number(&int), -7.0);
        assert_eq!(as_number(&float), 2.5);
    }

    #[test]
    fn test_printable_form() {
        assert_eq!(value_to_string(&make_int_value(42)), "42");
        assert_eq!(value_to_string(&make_float_value(3.0)), "3.0");
        assert_eq!(value_to_string(&make_bool_value(true)), "true");
        assert_eq!(value_to_string(&make_nil_value()), "nil");
    }

    #[test]
    fn test_value_hash_is_stable() {
        assert_eq!(value_hash(&make_int_value(123)), value_hash(&make_int_value(123)));
        assert_ne!(value_hash(&make_int_value(1)), value_hash(&make_int_value(2)));
    }
}
