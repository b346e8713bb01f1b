//! Values on both sides of the interpreter boundary.
//!
//! [`NativeValue`] is what the host works with, [`ForeignValue`] is what is
//! sent across, and [`ForeignObject`] is how the interpreter reports an
//! object it hands back: its runtime type plus every protocol view it
//! supports. Conversions between them live in [`crate::bridge`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A host-side value
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
    Bool(bool),
    List(Vec<NativeValue>),
    /// Key/value pairs; order is not significant
    Map(Vec<(NativeValue, NativeValue)>),
    Tuple(Vec<NativeValue>),
    Bytes(Vec<u8>),
    UInt(u64),
    /// Already marshaled; passes through unchanged
    Foreign(ForeignValue),
}

impl NativeValue {
    /// Runtime type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            NativeValue::Null => "null",
            NativeValue::Int(_) => "int32",
            NativeValue::Long(_) => "int64",
            NativeValue::Double(_) => "double",
            NativeValue::Str(_) => "string",
            NativeValue::Bool(_) => "bool",
            NativeValue::List(_) => "list",
            NativeValue::Map(_) => "map",
            NativeValue::Tuple(_) => "tuple",
            NativeValue::Bytes(_) => "bytes",
            NativeValue::UInt(_) => "uint64",
            NativeValue::Foreign(_) => "foreign",
        }
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        NativeValue::Bytes(data.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NativeValue::Null)
    }

    /// Look up a string key in a map value
    pub fn get(&self, key: &str) -> Option<&NativeValue> {
        match self {
            NativeValue::Map(entries) => entries.iter().find_map(|(k, v)| match k {
                NativeValue::Str(s) if s == key => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }

    /// Whether two values are equal, comparing maps by their entries
    /// regardless of order.
    pub fn same_as(&self, other: &NativeValue) -> bool {
        match (self, other) {
            (NativeValue::Map(a), NativeValue::Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(ka, va)| {
                        b.iter().any(|(kb, vb)| ka.same_as(kb) && va.same_as(vb))
                    })
            }
            (NativeValue::List(a), NativeValue::List(b))
            | (NativeValue::Tuple(a), NativeValue::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            _ => self == other,
        }
    }

    /// Build from JSON. Integers take the narrowest signed width that fits.
    pub fn from_json(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => NativeValue::Null,
            Value::Bool(b) => NativeValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    match i32::try_from(i) {
                        Ok(small) => NativeValue::Int(small),
                        Err(_) => NativeValue::Long(i),
                    }
                } else if let Some(u) = n.as_u64() {
                    NativeValue::UInt(u)
                } else {
                    NativeValue::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => NativeValue::Str(s),
            Value::Array(items) => {
                NativeValue::List(items.into_iter().map(NativeValue::from_json).collect())
            }
            Value::Object(map) => NativeValue::Map(
                map.into_iter()
                    .map(|(k, v)| (NativeValue::Str(k), NativeValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render as JSON. Non-string map keys are rendered as their JSON text.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            NativeValue::Null => Value::Null,
            NativeValue::Int(i) => Value::from(*i),
            NativeValue::Long(i) => Value::from(*i),
            NativeValue::UInt(u) => Value::from(*u),
            NativeValue::Double(f) => float_json(*f),
            NativeValue::Str(s) => Value::String(s.clone()),
            NativeValue::Bool(b) => Value::Bool(*b),
            NativeValue::List(items) | NativeValue::Tuple(items) => {
                Value::Array(items.iter().map(NativeValue::to_json).collect())
            }
            NativeValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            NativeValue::Str(s) => s.clone(),
                            other => other.to_json().to_string(),
                        };
                        (key, v.to_json())
                    })
                    .collect(),
            ),
            NativeValue::Bytes(data) => Value::Array(data.iter().map(|b| Value::from(*b)).collect()),
            NativeValue::Foreign(value) => value.to_json(),
        }
    }
}

impl From<i32> for NativeValue {
    fn from(v: i32) -> Self {
        NativeValue::Int(v)
    }
}

impl From<i64> for NativeValue {
    fn from(v: i64) -> Self {
        NativeValue::Long(v)
    }
}

impl From<u64> for NativeValue {
    fn from(v: u64) -> Self {
        NativeValue::UInt(v)
    }
}

impl From<f64> for NativeValue {
    fn from(v: f64) -> Self {
        NativeValue::Double(v)
    }
}

impl From<bool> for NativeValue {
    fn from(v: bool) -> Self {
        NativeValue::Bool(v)
    }
}

impl From<String> for NativeValue {
    fn from(v: String) -> Self {
        NativeValue::Str(v)
    }
}

impl From<&str> for NativeValue {
    fn from(v: &str) -> Self {
        NativeValue::Str(v.to_string())
    }
}

impl From<ForeignValue> for NativeValue {
    fn from(v: ForeignValue) -> Self {
        NativeValue::Foreign(v)
    }
}

impl<T: Into<NativeValue>> From<Option<T>> for NativeValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(NativeValue::Null)
    }
}

impl<T: Into<NativeValue>> From<Vec<T>> for NativeValue {
    fn from(v: Vec<T>) -> Self {
        NativeValue::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<NativeValue>> From<HashMap<String, T>> for NativeValue {
    fn from(v: HashMap<String, T>) -> Self {
        NativeValue::Map(
            v.into_iter()
                .map(|(k, v)| (NativeValue::Str(k), v.into()))
                .collect(),
        )
    }
}

impl<T: Into<NativeValue>> From<BTreeMap<String, T>> for NativeValue {
    fn from(v: BTreeMap<String, T>) -> Self {
        NativeValue::Map(
            v.into_iter()
                .map(|(k, v)| (NativeValue::Str(k), v.into()))
                .collect(),
        )
    }
}

impl From<(i32,)> for NativeValue {
    fn from(v: (i32,)) -> Self {
        NativeValue::Tuple(vec![v.0.into()])
    }
}

impl From<(i32, i32)> for NativeValue {
    fn from(v: (i32, i32)) -> Self {
        NativeValue::Tuple(vec![v.0.into(), v.1.into()])
    }
}

impl From<(i32, i32, i32)> for NativeValue {
    fn from(v: (i32, i32, i32)) -> Self {
        NativeValue::Tuple(vec![v.0.into(), v.1.into(), v.2.into()])
    }
}

/// JSON number, or the wire label for NaN and the infinities
fn float_json(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| serde_json::Value::String(wire_float::label(value).to_string()))
}

/// Floats on the wire. JSON has no NaN or infinity, so those travel as the
/// strings `"nan"`, `"inf"` and `"-inf"`, which Python's `float()` accepts.
mod wire_float {
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    pub fn label(value: f64) -> &'static str {
        if value.is_nan() {
            "nan"
        } else if value > 0.0 {
            "inf"
        } else {
            "-inf"
        }
    }

    pub fn parse(text: &str) -> Option<f64> {
        match text {
            "nan" => Some(f64::NAN),
            "inf" => Some(f64::INFINITY),
            "-inf" => Some(f64::NEG_INFINITY),
            _ => None,
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(f64),
        Label(String),
    }

    impl Wire {
        fn into_f64<E: de::Error>(self) -> Result<f64, E> {
            match self {
                Wire::Number(f) => Ok(f),
                Wire::Label(text) => {
                    parse(&text).ok_or_else(|| E::custom(format!("invalid float {:?}", text)))
                }
            }
        }
    }

    struct Labeled(f64);

    impl Serialize for Labeled {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serialize(&self.0, serializer)
        }
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_str(label(*value))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Wire::deserialize(deserializer)?.into_f64()
    }

    pub mod option {
        use super::{Labeled, Wire};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<f64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(f) => serializer.serialize_some(&Labeled(*f)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<f64>, D::Error> {
            Option::<Wire>::deserialize(deserializer)?
                .map(Wire::into_f64)
                .transpose()
        }
    }
}

/// A value as it crosses into the interpreter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum ForeignValue {
    Int(i32),
    Long(i64),
    Float(#[serde(with = "wire_float")] f64),
    Str(String),
    Bool(bool),
    List(Vec<ForeignValue>),
    Map(Vec<(ForeignValue, ForeignValue)>),
    Tuple(Vec<ForeignValue>),
    None,
}

impl ForeignValue {
    /// Python-style literal, for diagnostics
    pub fn python_repr(&self) -> String {
        fn join(items: &[ForeignValue]) -> String {
            items
                .iter()
                .map(ForeignValue::python_repr)
                .collect::<Vec<_>>()
                .join(", ")
        }
        match self {
            ForeignValue::Int(i) => i.to_string(),
            ForeignValue::Long(i) => i.to_string(),
            ForeignValue::Float(f) => {
                if !f.is_finite() {
                    format!("float('{}')", wire_float::label(*f))
                } else if f.fract() == 0.0 && f.abs() < 1e16 {
                    format!("{:.1}", f)
                } else {
                    f.to_string()
                }
            }
            ForeignValue::Str(s) => format!("{:?}", s),
            ForeignValue::Bool(true) => "True".to_string(),
            ForeignValue::Bool(false) => "False".to_string(),
            ForeignValue::List(items) => format!("[{}]", join(items)),
            ForeignValue::Tuple(items) if items.len() == 1 => {
                format!("({},)", items[0].python_repr())
            }
            ForeignValue::Tuple(items) => format!("({})", join(items)),
            ForeignValue::Map(entries) => format!(
                "{{{}}}",
                entries
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.python_repr(), v.python_repr()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            ForeignValue::None => "None".to_string(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            ForeignValue::Int(i) => Value::from(*i),
            ForeignValue::Long(i) => Value::from(*i),
            ForeignValue::Float(f) => float_json(*f),
            ForeignValue::Str(s) => Value::String(s.clone()),
            ForeignValue::Bool(b) => Value::Bool(*b),
            ForeignValue::List(items) | ForeignValue::Tuple(items) => {
                Value::Array(items.iter().map(ForeignValue::to_json).collect())
            }
            ForeignValue::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            ForeignValue::Str(s) => s.clone(),
                            other => other.python_repr(),
                        };
                        (key, v.to_json())
                    })
                    .collect(),
            ),
            ForeignValue::None => Value::Null,
        }
    }
}

/// Closed classification of a foreign object, in dispatch priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKind {
    None,
    Int,
    Long,
    Float,
    Str,
    List,
    Dict,
    Tuple,
    Iterable,
    Bool,
    Numeric,
    Unrecognized,
}

/// An object reported back by the interpreter.
///
/// Each optional field is one protocol view of the same object; an integer
/// typically also carries a `number` view, a dict may also carry an `iter`
/// view of its keys. [`ForeignObject::view`] picks the one that wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForeignObject {
    /// Runtime type name on the interpreter side
    #[serde(rename = "type")]
    pub type_name: String,
    pub repr: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub none: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub int: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long: Option<i64>,
    #[serde(default, with = "wire_float::option", skip_serializing_if = "Option::is_none")]
    pub float: Option<f64>,
    #[serde(rename = "str", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<ForeignObject>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dict: Option<Vec<(ForeignObject, ForeignObject)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuple: Option<Vec<ForeignObject>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iter: Option<Vec<ForeignObject>>,
    #[serde(rename = "bool", skip_serializing_if = "Option::is_none")]
    pub boolean: Option<bool>,
    #[serde(default, with = "wire_float::option", skip_serializing_if = "Option::is_none")]
    pub number: Option<f64>,
}

/// The winning protocol view of a [`ForeignObject`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForeignView<'a> {
    None,
    Int(i32),
    Long(i64),
    Float(f64),
    Str(&'a str),
    List(&'a [ForeignObject]),
    Dict(&'a [(ForeignObject, ForeignObject)]),
    Tuple(&'a [ForeignObject]),
    Iterable(&'a [ForeignObject]),
    Bool(bool),
    Numeric(f64),
    Unrecognized,
}

impl ForeignObject {
    /// Object with only a type name and repr; classifies as unrecognized
    pub fn opaque(type_name: impl Into<String>, repr: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            repr: repr.into(),
            ..Default::default()
        }
    }

    /// Select the protocol view by priority. Integers precede the generic
    /// numeric view to keep their width; list, dict and tuple precede the
    /// generic iterable view so containers are never flattened.
    pub fn view(&self) -> ForeignView<'_> {
        if self.none {
            return ForeignView::None;
        }
        if let Some(i) = self.int {
            return ForeignView::Int(i);
        }
        if let Some(i) = self.long {
            return ForeignView::Long(i);
        }
        if let Some(f) = self.float {
            return ForeignView::Float(f);
        }
        if let Some(s) = &self.text {
            return ForeignView::Str(s);
        }
        if let Some(items) = &self.list {
            return ForeignView::List(items);
        }
        if let Some(entries) = &self.dict {
            return ForeignView::Dict(entries);
        }
        if let Some(items) = &self.tuple {
            return ForeignView::Tuple(items);
        }
        if let Some(items) = &self.iter {
            return ForeignView::Iterable(items);
        }
        if let Some(b) = self.boolean {
            return ForeignView::Bool(b);
        }
        if let Some(n) = self.number {
            return ForeignView::Numeric(n);
        }
        ForeignView::Unrecognized
    }

    pub fn classify(&self) -> ForeignKind {
        match self.view() {
            ForeignView::None => ForeignKind::None,
            ForeignView::Int(_) => ForeignKind::Int,
            ForeignView::Long(_) => ForeignKind::Long,
            ForeignView::Float(_) => ForeignKind::Float,
            ForeignView::Str(_) => ForeignKind::Str,
            ForeignView::List(_) => ForeignKind::List,
            ForeignView::Dict(_) => ForeignKind::Dict,
            ForeignView::Tuple(_) => ForeignKind::Tuple,
            ForeignView::Iterable(_) => ForeignKind::Iterable,
            ForeignView::Bool(_) => ForeignKind::Bool,
            ForeignView::Numeric(_) => ForeignKind::Numeric,
            ForeignView::Unrecognized => ForeignKind::Unrecognized,
        }
    }

    /// `<type> repr`, used when an object cannot be converted
    pub fn diagnostic(&self) -> String {
        format!("<{}> {}", self.type_name, self.repr)
    }
}

impl From<&ForeignValue> for ForeignObject {
    /// The description the interpreter gives for an object built from `value`.
    fn from(value: &ForeignValue) -> Self {
        let repr = value.python_repr();
        let base = |type_name: &str| ForeignObject {
            type_name: type_name.to_string(),
            repr: repr.clone(),
            ..Default::default()
        };
        let children = |items: &[ForeignValue]| -> Vec<ForeignObject> {
            items.iter().map(ForeignObject::from).collect()
        };

        match value {
            ForeignValue::Int(i) => ForeignObject {
                int: Some(*i),
                number: Some(f64::from(*i)),
                ..base("int")
            },
            ForeignValue::Long(i) => ForeignObject {
                long: Some(*i),
                number: Some(*i as f64),
                ..base("int")
            },
            ForeignValue::Float(f) => ForeignObject {
                float: Some(*f),
                number: Some(*f),
                ..base("float")
            },
            ForeignValue::Str(s) => ForeignObject {
                text: Some(s.clone()),
                ..base("str")
            },
            ForeignValue::Bool(b) => ForeignObject {
                boolean: Some(*b),
                number: Some(if *b { 1.0 } else { 0.0 }),
                ..base("bool")
            },
            ForeignValue::List(items) => ForeignObject {
                list: Some(children(items)),
                ..base("list")
            },
            ForeignValue::Tuple(items) => ForeignObject {
                tuple: Some(children(items)),
                ..base("tuple")
            },
            ForeignValue::Map(entries) => ForeignObject {
                dict: Some(
                    entries
                        .iter()
                        .map(|(k, v)| (ForeignObject::from(k), ForeignObject::from(v)))
                        .collect(),
                ),
                ..base("dict")
            },
            ForeignValue::None => ForeignObject {
                none: true,
                ..base("NoneType")
            },
        }
    }
}

impl From<ForeignValue> for ForeignObject {
    fn from(value: ForeignValue) -> Self {
        ForeignObject::from(&value)
    }
}
