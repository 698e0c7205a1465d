//! Cache keys derived from call arguments.
//!
//! Keys are the canonical JSON form of the arguments. JSON has blind spots that would let
//! different arguments share a key (non-finite floats and `Some` around a null-like value
//! both become `null`), so arguments are first walked by `KeyCheck`, which rejects those
//! values and reports whether the arguments are the unit type.

use serde::Serialize;
use serde::ser;
use shared::{Error, Result};
use std::fmt;

/// Lookup key derived from the argument list of a memoized call
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Shared slot for every call made without arguments
    NoArgs,
    /// Canonical JSON serialization of the arguments
    Args(String),
}

impl CacheKey {
    /// Derive the key for `args`.
    ///
    /// Arguments go through `serde_json::Value`, whose objects keep their keys sorted, so
    /// structurally equal arguments map to the same key regardless of map iteration order.
    /// Only the unit type maps to [`CacheKey::NoArgs`]. Arguments JSON cannot represent
    /// faithfully are rejected: maps keyed by sequences, NaN or infinite floats, and `Some`
    /// wrapping a value that serializes to `null`.
    pub fn derive<A>(args: &A) -> Result<Self>
    where
        A: Serialize + ?Sized,
    {
        let shape = args
            .serialize(KeyCheck::default())
            .map_err(|e| Error::KeyDerivation(e.to_string()))?;
        if shape == Shape::Unit {
            return Ok(CacheKey::NoArgs);
        }

        let value = serde_json::to_value(args).map_err(|e| Error::KeyDerivation(e.to_string()))?;
        Ok(CacheKey::Args(value.to_string()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::NoArgs => f.write_str("<no-args>"),
            CacheKey::Args(serialized) => f.write_str(serialized),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct KeyCheckError(String);

impl ser::Error for KeyCheckError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        KeyCheckError(msg.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Unit,
    Value,
}

/// Serializer that produces nothing and only validates the arguments.
///
/// `in_some` is set while serializing the payload of a `Some`, where a null-like value would
/// be indistinguishable from `None` once encoded as JSON.
#[derive(Clone, Copy, Default)]
struct KeyCheck {
    in_some: bool,
}

type Checked = std::result::Result<Shape, KeyCheckError>;

impl KeyCheck {
    fn null_like(self, what: &str) -> Checked {
        if self.in_some {
            return Err(KeyCheckError(format!(
                "Some({what}) serializes like None and cannot be keyed"
            )));
        }
        Ok(Shape::Value)
    }

    fn float(value: f64) -> Checked {
        if value.is_finite() {
            Ok(Shape::Value)
        } else {
            Err(KeyCheckError(format!("non-finite float {value} cannot be keyed")))
        }
    }

    fn nested<T>(value: &T) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        value.serialize(KeyCheck::default()).map(|_| ())
    }
}

impl ser::Serializer for KeyCheck {
    type Ok = Shape;
    type Error = KeyCheckError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _v: bool) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_i8(self, _v: i8) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_i16(self, _v: i16) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_i32(self, _v: i32) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_i64(self, _v: i64) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_i128(self, _v: i128) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_u8(self, _v: u8) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_u16(self, _v: u16) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_u32(self, _v: u32) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_u64(self, _v: u64) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_u128(self, _v: u128) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_f32(self, v: f32) -> Checked {
        Self::float(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Checked {
        Self::float(v)
    }

    fn serialize_char(self, _v: char) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_str(self, _v: &str) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_bytes(self, _v: &[u8]) -> Checked {
        Ok(Shape::Value)
    }

    fn serialize_none(self) -> Checked {
        self.null_like("None")
    }

    fn serialize_some<T>(self, value: &T) -> Checked
    where
        T: Serialize + ?Sized,
    {
        value.serialize(KeyCheck { in_some: true })?;
        Ok(Shape::Value)
    }

    fn serialize_unit(self) -> Checked {
        if self.in_some {
            return self.null_like("()");
        }
        Ok(Shape::Unit)
    }

    fn serialize_unit_struct(self, name: &'static str) -> Checked {
        self.null_like(name)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Checked {
        Ok(Shape::Value)
    }

    // Newtypes are transparent in JSON, so they inherit the caller's position
    fn serialize_newtype_struct<T>(self, _name: &'static str, value: &T) -> Checked
    where
        T: Serialize + ?Sized,
    {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Checked
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(value)?;
        Ok(Shape::Value)
    }

    fn serialize_seq(self, _len: Option<usize>) -> std::result::Result<Self, KeyCheckError> {
        Ok(KeyCheck::default())
    }

    fn serialize_tuple(self, _len: usize) -> std::result::Result<Self, KeyCheckError> {
        Ok(KeyCheck::default())
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> std::result::Result<Self, KeyCheckError> {
        Ok(KeyCheck::default())
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> std::result::Result<Self, KeyCheckError> {
        Ok(KeyCheck::default())
    }

    fn serialize_map(self, _len: Option<usize>) -> std::result::Result<Self, KeyCheckError> {
        Ok(KeyCheck::default())
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> std::result::Result<Self, KeyCheckError> {
        Ok(KeyCheck::default())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> std::result::Result<Self, KeyCheckError> {
        Ok(KeyCheck::default())
    }
}

impl ser::SerializeSeq for KeyCheck {
    type Ok = Shape;
    type Error = KeyCheckError;

    fn serialize_element<T>(&mut self, value: &T) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(value)
    }

    fn end(self) -> Checked {
        Ok(Shape::Value)
    }
}

impl ser::SerializeTuple for KeyCheck {
    type Ok = Shape;
    type Error = KeyCheckError;

    fn serialize_element<T>(&mut self, value: &T) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(value)
    }

    fn end(self) -> Checked {
        Ok(Shape::Value)
    }
}

impl ser::SerializeTupleStruct for KeyCheck {
    type Ok = Shape;
    type Error = KeyCheckError;

    fn serialize_field<T>(&mut self, value: &T) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(value)
    }

    fn end(self) -> Checked {
        Ok(Shape::Value)
    }
}

impl ser::SerializeTupleVariant for KeyCheck {
    type Ok = Shape;
    type Error = KeyCheckError;

    fn serialize_field<T>(&mut self, value: &T) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(value)
    }

    fn end(self) -> Checked {
        Ok(Shape::Value)
    }
}

impl ser::SerializeMap for KeyCheck {
    type Ok = Shape;
    type Error = KeyCheckError;

    fn serialize_key<T>(&mut self, key: &T) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(key)
    }

    fn serialize_value<T>(&mut self, value: &T) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(value)
    }

    fn end(self) -> Checked {
        Ok(Shape::Value)
    }
}

impl ser::SerializeStruct for KeyCheck {
    type Ok = Shape;
    type Error = KeyCheckError;

    fn serialize_field<T>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(value)
    }

    fn end(self) -> Checked {
        Ok(Shape::Value)
    }
}

impl ser::SerializeStructVariant for KeyCheck {
    type Ok = Shape;
    type Error = KeyCheckError;

    fn serialize_field<T>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> std::result::Result<(), KeyCheckError>
    where
        T: Serialize + ?Sized,
    {
        KeyCheck::nested(value)
    }

    fn end(self) -> Checked {
        Ok(Shape::Value)
    }
}
