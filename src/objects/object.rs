use std::mem::size_of;

use super::{
    object_array::ObjectArray,
    object_class::ObjectClass,
    object_closure::ObjectClosure,
    object_function::ObjectFunction,
    object_instance::ObjectInstance,
    object_map::ObjectMap,
    object_method::ObjectMethod,
    object_module::ObjectModule,
    object_native_function::ObjectNativeFunction,
    object_native_object::ObjectNativeObject,
    object_string::ObjectString,
    object_upvalue::ObjectUpvalue,
};
use crate::value::Value;

#[repr(u8)]
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy)]
pub enum ObjectType {
    ObjString,
    ObjFunction,
    ObjNativeFunction,
    ObjClosure,
    ObjUpvalue,
    ObjClass,
    ObjInstance,
    ObjMethod,
    ObjArray,
    ObjMap,
    ObjModule,
    ObjNativeObject,
}

/// Common header embedded as the first field of every heap object, so a
/// `*mut Object` can be cast to the concrete type after checking `obj_type`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Object {
    pub obj_type: ObjectType,
    pub is_marked: bool,
}

impl Object {
    pub fn new(obj_type: ObjectType) -> Object {
        Object {
            obj_type,
            is_marked: false,
        }
    }

    /// Compute the deep size of the concrete object this header belongs to.
    /// Safety: caller guarantees `self` is embedded at the start of the
    /// concrete object.
    pub unsafe fn deep_size(&self) -> usize {
        match self.obj_type {
            ObjectType::ObjString => (*(self as *const _ as *const ObjectString)).deep_size(),
            ObjectType::ObjFunction => (*(self as *const _ as *const ObjectFunction)).deep_size(),
            ObjectType::ObjNativeFunction => {
                (*(self as *const _ as *const ObjectNativeFunction)).deep_size()
            }
            ObjectType::ObjClosure => (*(self as *const _ as *const ObjectClosure)).deep_size(),
            ObjectType::ObjUpvalue => (*(self as *const _ as *const ObjectUpvalue)).deep_size(),
            ObjectType::ObjClass => (*(self as *const _ as *const ObjectClass)).deep_size(),
            ObjectType::ObjInstance => (*(self as *const _ as *const ObjectInstance)).deep_size(),
            ObjectType::ObjMethod => (*(self as *const _ as *const ObjectMethod)).deep_size(),
            ObjectType::ObjArray => (*(self as *const _ as *const ObjectArray)).deep_size(),
            ObjectType::ObjMap => (*(self as *const _ as *const ObjectMap)).deep_size(),
            ObjectType::ObjModule => (*(self as *const _ as *const ObjectModule)).deep_size(),
            ObjectType::ObjNativeObject => {
                (*(self as *const _ as *const ObjectNativeObject)).deep_size()
            }
        }
    }

    /// Release the concrete object behind this header. Safety: the pointer
    /// came out of `Box::into_raw` for the matching concrete type and is not
    /// referenced anywhere afterwards.
    pub unsafe fn free(object: *mut Object) {
        match (*object).obj_type {
            ObjectType::ObjString => drop(Box::from_raw(object as *mut ObjectString)),
            ObjectType::ObjFunction => drop(Box::from_raw(object as *mut ObjectFunction)),
            ObjectType::ObjNativeFunction => {
                drop(Box::from_raw(object as *mut ObjectNativeFunction))
            }
            ObjectType::ObjClosure => drop(Box::from_raw(object as *mut ObjectClosure)),
            ObjectType::ObjUpvalue => drop(Box::from_raw(object as *mut ObjectUpvalue)),
            ObjectType::ObjClass => drop(Box::from_raw(object as *mut ObjectClass)),
            ObjectType::ObjInstance => drop(Box::from_raw(object as *mut ObjectInstance)),
            ObjectType::ObjMethod => drop(Box::from_raw(object as *mut ObjectMethod)),
            ObjectType::ObjArray => drop(Box::from_raw(object as *mut ObjectArray)),
            ObjectType::ObjMap => drop(Box::from_raw(object as *mut ObjectMap)),
            ObjectType::ObjModule => drop(Box::from_raw(object as *mut ObjectModule)),
            ObjectType::ObjNativeObject => drop(Box::from_raw(object as *mut ObjectNativeObject)),
        }
    }

    #[inline]
    pub unsafe fn as_string(&self) -> &ObjectString {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjString));
        &*(self as *const _ as *const ObjectString)
    }

    #[inline]
    pub unsafe fn as_function(&self) -> &ObjectFunction {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjFunction));
        &*(self as *const _ as *const ObjectFunction)
    }

    #[inline]
    pub unsafe fn as_closure(&self) -> &ObjectClosure {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjClosure));
        &*(self as *const _ as *const ObjectClosure)
    }

    #[inline]
    pub unsafe fn as_upvalue(&self) -> &ObjectUpvalue {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjUpvalue));
        &*(self as *const _ as *const ObjectUpvalue)
    }

    #[inline]
    pub unsafe fn as_class(&self) -> &ObjectClass {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjClass));
        &*(self as *const _ as *const ObjectClass)
    }

    #[inline]
    pub unsafe fn as_instance(&self) -> &ObjectInstance {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjInstance));
        &*(self as *const _ as *const ObjectInstance)
    }

    #[inline]
    pub unsafe fn as_method(&self) -> &ObjectMethod {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjMethod));
        &*(self as *const _ as *const ObjectMethod)
    }

    #[inline]
    pub unsafe fn as_array(&self) -> &ObjectArray {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjArray));
        &*(self as *const _ as *const ObjectArray)
    }

    #[inline]
    pub unsafe fn as_map(&self) -> &ObjectMap {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjMap));
        &*(self as *const _ as *const ObjectMap)
    }

    #[inline]
    pub unsafe fn as_module(&self) -> &ObjectModule {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjModule));
        &*(self as *const _ as *const ObjectModule)
    }

    #[inline]
    pub unsafe fn as_native_object(&self) -> &ObjectNativeObject {
        debug_assert!(matches!(self.obj_type, ObjectType::ObjNativeObject));
        &*(self as *const _ as *const ObjectNativeObject)
    }
}

/// Heap usage of GC-managed structures (owned data only). Referenced GC
/// objects are not owned and count only as the pointer already present in the
/// shallow size.
pub trait GcSize {
    fn shallow_size(&self) -> usize;
    fn deep_size(&self) -> usize;
}

impl GcSize for ObjectString {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectString>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.content.capacity()
    }
}

impl GcSize for ObjectFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectFunction>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.name.capacity() + self.chunk.deep_size()
    }
}

impl GcSize for ObjectClosure {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectClosure>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.upvalues.capacity() * size_of::<*mut ObjectUpvalue>()
    }
}

impl GcSize for ObjectUpvalue {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectUpvalue>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size()
    }
}

impl GcSize for ObjectClass {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectClass>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.methods.deep_size() + self.static_fields.deep_size()
    }
}

impl GcSize for ObjectInstance {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectInstance>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.fields.deep_size()
    }
}

impl GcSize for ObjectMethod {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectMethod>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size()
    }
}

impl GcSize for ObjectArray {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectArray>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.values.capacity() * size_of::<Value>()
    }
}

impl GcSize for ObjectMap {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectMap>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.backing.deep_size()
    }
}

impl GcSize for ObjectModule {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectModule>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size()
            + self.globals.deep_size()
            + self.public_names.deep_size()
            + self.const_names.deep_size()
    }
}

impl GcSize for ObjectNativeFunction {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectNativeFunction>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size() + self.name.capacity()
    }
}

impl GcSize for ObjectNativeObject {
    fn shallow_size(&self) -> usize {
        size_of::<ObjectNativeObject>()
    }
    fn deep_size(&self) -> usize {
        self.shallow_size()
    }
}
