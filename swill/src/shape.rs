//! Structural description of a message type's declared shape (§4.8).
//!
//! [`DescribeType`] is captured at handler *registration* time from the
//! constructor's generics, never by reflecting on a live value — the same
//! "no runtime introspection" discipline the dispatcher applies to arity and
//! streaming flags (§9 Dynamic handler signatures).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `{type: string, arguments?: mapping<string, TypeDescriptor>}`.
///
/// Generic containers (`Vec<T>`, `Option<T>`, ...) report positionally-keyed
/// arguments (`"0"`, `"1"`, ...); record types report field-named arguments.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TypeDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub arguments: Option<HashMap<String, TypeDescriptor>>,
}

impl TypeDescriptor {
    pub fn leaf(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), arguments: None }
    }

    pub fn container(kind: impl Into<String>, arguments: HashMap<String, TypeDescriptor>) -> Self {
        Self { kind: kind.into(), arguments: Some(arguments) }
    }
}

/// Implemented by every handler's request/response type so the dispatcher can
/// capture its wire shape at registration time for `swill.introspect`.
///
/// The default renders a leaf using the type's Rust path, which is enough
/// for the common case of a newtype or record reported opaquely; record
/// types that want their fields walked override `describe()` directly —
/// there is no derive macro in this crate, so the override is written by
/// hand, the same way `Validate` impls are.
pub trait DescribeType {
    fn describe() -> TypeDescriptor
    where
        Self: Sized,
    {
        TypeDescriptor::leaf(std::any::type_name::<Self>())
    }
}

macro_rules! describe_primitive {
    ($ty:ty, $name:literal) => {
        impl DescribeType for $ty {
            fn describe() -> TypeDescriptor {
                TypeDescriptor::leaf($name)
            }
        }
    };
}

describe_primitive!(bool, "bool");
describe_primitive!(i8, "i8");
describe_primitive!(i16, "i16");
describe_primitive!(i32, "i32");
describe_primitive!(i64, "i64");
describe_primitive!(u8, "u8");
describe_primitive!(u16, "u16");
describe_primitive!(u32, "u32");
describe_primitive!(u64, "u64");
describe_primitive!(f32, "f32");
describe_primitive!(f64, "f64");
describe_primitive!(String, "string");

impl DescribeType for () {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::leaf("void")
    }
}

impl<T: DescribeType> DescribeType for Vec<T> {
    fn describe() -> TypeDescriptor {
        let mut arguments = HashMap::new();
        arguments.insert("0".to_string(), T::describe());
        TypeDescriptor::container("array", arguments)
    }
}

impl<T: DescribeType> DescribeType for Option<T> {
    fn describe() -> TypeDescriptor {
        let mut arguments = HashMap::new();
        arguments.insert("0".to_string(), T::describe());
        TypeDescriptor::container("optional", arguments)
    }
}

impl<K: DescribeType, V: DescribeType> DescribeType for HashMap<K, V> {
    fn describe() -> TypeDescriptor {
        let mut arguments = HashMap::new();
        arguments.insert("key".to_string(), K::describe());
        arguments.insert("value".to_string(), V::describe());
        TypeDescriptor::container("map", arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_type_walks_nested_containers() {
        let described = Vec::<Option<i64>>::describe();
        assert_eq!(described.kind, "array");
        let inner = &described.arguments.unwrap()["0"];
        assert_eq!(inner.kind, "optional");
    }

    #[test]
    fn unknown_record_falls_back_to_its_type_path() {
        struct Widget;
        impl DescribeType for Widget {}
        assert!(Widget::describe().kind.ends_with("Widget"));
    }
}
