//! Conversions across the interpreter boundary and the invocation protocol.
//!
//! Outbound conversion is total over the supported shapes and fails fast on
//! anything else. Inbound conversion classifies the reported object by a
//! fixed priority order (see [`ForeignObject::view`]).

use crate::errors::{HostError, Result};
use crate::runtime::RuntimeHandle;
use crate::value::{ForeignObject, ForeignValue, ForeignView, NativeValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Convert a host value into its interpreter representation
pub fn to_foreign<V: Into<NativeValue>>(value: V) -> Result<ForeignValue> {
    convert_outbound(&value.into())
}

fn convert_outbound(value: &NativeValue) -> Result<ForeignValue> {
    match value {
        NativeValue::Null => Ok(ForeignValue::None),
        NativeValue::Int(i) => Ok(ForeignValue::Int(*i)),
        NativeValue::Long(i) => Ok(ForeignValue::Long(*i)),
        NativeValue::Double(f) => Ok(ForeignValue::Float(*f)),
        NativeValue::Str(s) => Ok(ForeignValue::Str(s.clone())),
        NativeValue::Bool(b) => Ok(ForeignValue::Bool(*b)),
        NativeValue::List(items) => Ok(ForeignValue::List(
            items.iter().map(convert_outbound).collect::<Result<_>>()?,
        )),
        NativeValue::Map(entries) => {
            let mut converted = Vec::with_capacity(entries.len());
            for (key, item) in entries {
                let NativeValue::Str(key) = key else {
                    return Err(HostError::UnsupportedConversion(format!(
                        "map with {} keys",
                        key.type_name()
                    )));
                };
                converted.push((ForeignValue::Str(key.clone()), convert_outbound(item)?));
            }
            Ok(ForeignValue::Map(converted))
        }
        NativeValue::Tuple(items) => {
            if !(1..=3).contains(&items.len()) {
                return Err(HostError::UnsupportedConversion(format!(
                    "tuple of {} elements",
                    items.len()
                )));
            }
            items
                .iter()
                .map(|item| match item {
                    NativeValue::Int(i) => Ok(ForeignValue::Int(*i)),
                    NativeValue::Long(i) => Ok(ForeignValue::Long(*i)),
                    other => Err(HostError::UnsupportedConversion(format!(
                        "tuple containing {}",
                        other.type_name()
                    ))),
                })
                .collect::<Result<_>>()
                .map(ForeignValue::Tuple)
        }
        NativeValue::Foreign(value) => Ok(value.clone()),
        NativeValue::Bytes(_) | NativeValue::UInt(_) => Err(
            HostError::UnsupportedConversion(value.type_name().to_string()),
        ),
    }
}

/// Convert an object reported by the interpreter into a host value.
///
/// Tuples and other iterables become lists; objects with only a numeric
/// view become doubles.
pub fn to_native(object: &ForeignObject) -> Result<NativeValue> {
    let all = |items: &[ForeignObject]| -> Result<NativeValue> {
        Ok(NativeValue::List(
            items.iter().map(to_native).collect::<Result<_>>()?,
        ))
    };

    match object.view() {
        ForeignView::None => Ok(NativeValue::Null),
        ForeignView::Int(i) => Ok(NativeValue::Int(i)),
        ForeignView::Long(i) => Ok(NativeValue::Long(i)),
        ForeignView::Float(f) => Ok(NativeValue::Double(f)),
        ForeignView::Str(s) => Ok(NativeValue::Str(s.to_string())),
        ForeignView::List(items) | ForeignView::Tuple(items) | ForeignView::Iterable(items) => {
            all(items)
        }
        ForeignView::Dict(entries) => Ok(NativeValue::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((to_native(k)?, to_native(v)?)))
                .collect::<Result<_>>()?,
        )),
        ForeignView::Bool(b) => Ok(NativeValue::Bool(b)),
        ForeignView::Numeric(n) => Ok(NativeValue::Double(n)),
        ForeignView::Unrecognized => Err(HostError::UnrecognizedForeignType(object.diagnostic())),
    }
}

/// Convert, then require a specific host type
pub fn to_native_typed<T: FromNative>(object: &ForeignObject) -> Result<T> {
    T::from_native(to_native(object)?)
}

/// Host types a converted value can be narrowed to
pub trait FromNative: Sized {
    const TYPE_NAME: &'static str;

    fn from_native(value: NativeValue) -> Result<Self>;
}

fn mismatch<T: FromNative>(found: &NativeValue) -> HostError {
    HostError::TypeMismatch {
        expected: T::TYPE_NAME.to_string(),
        found: found.type_name().to_string(),
    }
}

impl FromNative for NativeValue {
    const TYPE_NAME: &'static str = "any";

    fn from_native(value: NativeValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromNative for i32 {
    const TYPE_NAME: &'static str = "int32";

    fn from_native(value: NativeValue) -> Result<Self> {
        match value {
            NativeValue::Int(i) => Ok(i),
            NativeValue::Long(i) => {
                i32::try_from(i).map_err(|_| mismatch::<Self>(&NativeValue::Long(i)))
            }
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromNative for i64 {
    const TYPE_NAME: &'static str = "int64";

    fn from_native(value: NativeValue) -> Result<Self> {
        match value {
            NativeValue::Int(i) => Ok(i64::from(i)),
            NativeValue::Long(i) => Ok(i),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromNative for f64 {
    const TYPE_NAME: &'static str = "double";

    fn from_native(value: NativeValue) -> Result<Self> {
        match value {
            NativeValue::Double(f) => Ok(f),
            NativeValue::Int(i) => Ok(f64::from(i)),
            NativeValue::Long(i) => Ok(i as f64),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromNative for bool {
    const TYPE_NAME: &'static str = "bool";

    fn from_native(value: NativeValue) -> Result<Self> {
        match value {
            NativeValue::Bool(b) => Ok(b),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl FromNative for String {
    const TYPE_NAME: &'static str = "string";

    fn from_native(value: NativeValue) -> Result<Self> {
        match value {
            NativeValue::Str(s) => Ok(s),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl<T: FromNative> FromNative for Option<T> {
    const TYPE_NAME: &'static str = T::TYPE_NAME;

    fn from_native(value: NativeValue) -> Result<Self> {
        match value {
            NativeValue::Null => Ok(None),
            other => T::from_native(other).map(Some),
        }
    }
}

impl<T: FromNative> FromNative for Vec<T> {
    const TYPE_NAME: &'static str = "list";

    fn from_native(value: NativeValue) -> Result<Self> {
        match value {
            NativeValue::List(items) => items.into_iter().map(T::from_native).collect(),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

impl<T: FromNative> FromNative for HashMap<String, T> {
    const TYPE_NAME: &'static str = "map";

    fn from_native(value: NativeValue) -> Result<Self> {
        match value {
            NativeValue::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| match k {
                    NativeValue::Str(k) => Ok((k, T::from_native(v)?)),
                    other => Err(mismatch::<String>(&other)),
                })
                .collect(),
            other => Err(mismatch::<Self>(&other)),
        }
    }
}

/// How a call crosses the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum CallShape {
    /// `target()`
    NoArgs,
    /// `target(*positional, **keywords)` with at most one positional
    Args {
        positional: Option<ForeignValue>,
        keywords: BTreeMap<String, ForeignValue>,
    },
}

/// A marshaled call, ready for an interpreter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    /// Dotted path, e.g. `package.module.function`
    pub target: String,
    pub call: CallShape,
}

impl CallRequest {
    /// Validate the target and marshal the arguments. Nothing is sent.
    pub fn build(
        target: &str,
        args: Vec<NativeValue>,
        kwargs: BTreeMap<String, NativeValue>,
    ) -> Result<Self> {
        validate_target(target)?;
        if args.len() > 1 {
            return Err(HostError::InvocationError(format!(
                "{} takes at most one positional argument across the bridge, got {}; pass the rest as keywords",
                target,
                args.len()
            )));
        }

        let call = if args.is_empty() && kwargs.is_empty() {
            CallShape::NoArgs
        } else {
            let positional = args.into_iter().next().map(to_foreign).transpose()?;
            let keywords = kwargs
                .into_iter()
                .map(|(k, v)| Ok((k, to_foreign(v)?)))
                .collect::<Result<_>>()?;
            CallShape::Args {
                positional,
                keywords,
            }
        };

        Ok(Self {
            target: target.to_string(),
            call,
        })
    }
}

fn validate_target(target: &str) -> Result<()> {
    let valid = !target.is_empty()
        && target.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
                && chars.all(|c| c == '_' || c.is_alphanumeric())
        });
    if valid {
        Ok(())
    } else {
        Err(HostError::InvocationError(format!(
            "not a dotted function name: {:?}",
            target
        )))
    }
}

/// Call a function in the interpreter by dotted name.
///
/// With no arguments at all the function is called bare. Otherwise the
/// single positional argument (if any) and the keyword map are converted
/// and passed. The handle must be initialized.
pub async fn invoke(
    runtime: &RuntimeHandle,
    target: &str,
    args: Vec<NativeValue>,
    kwargs: BTreeMap<String, NativeValue>,
) -> Result<ForeignObject> {
    let request = CallRequest::build(target, args, kwargs)?;
    let interpreter = runtime.ready_interpreter()?;
    debug!("[BRIDGE] Invoking {}", request.target);
    interpreter.call(&request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeState;
    use crate::testing::ScriptedInterpreter;
    use crate::value::ForeignKind;
    use std::sync::Arc;

    fn round_trip(value: NativeValue) -> NativeValue {
        let foreign = to_foreign(value).unwrap();
        to_native(&ForeignObject::from(foreign)).unwrap()
    }

    #[test]
    fn test_scalars_round_trip() {
        for value in [
            NativeValue::Int(42),
            NativeValue::Int(i32::MIN),
            NativeValue::Long(9_000_000_000),
            NativeValue::Double(2.5),
            NativeValue::from("text"),
            NativeValue::Bool(true),
            NativeValue::Bool(false),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn test_non_finite_doubles_round_trip() {
        for value in [f64::INFINITY, f64::NEG_INFINITY] {
            assert_eq!(
                round_trip(NativeValue::Double(value)),
                NativeValue::Double(value)
            );
        }
        assert!(matches!(
            round_trip(NativeValue::Double(f64::NAN)),
            NativeValue::Double(f) if f.is_nan()
        ));

        // Through the serialized request as the interpreter receives it
        let request =
            CallRequest::build("math.isnan", vec![f64::NAN.into()], BTreeMap::new()).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json["call"]["positional"],
            serde_json::json!({"t": "float", "v": "nan"})
        );
        let decoded: CallRequest = serde_json::from_value(json).unwrap();
        assert!(matches!(
            decoded.call,
            CallShape::Args { positional: Some(ForeignValue::Float(f)), .. } if f.is_nan()
        ));

        let object: ForeignObject =
            serde_json::from_str(r#"{"type": "float", "repr": "-inf", "float": "-inf", "number": "-inf"}"#)
                .unwrap();
        assert_eq!(to_native(&object).unwrap(), NativeValue::Double(f64::NEG_INFINITY));
    }

    #[test]
    fn test_null_and_none() {
        assert_eq!(to_foreign(NativeValue::Null).unwrap(), ForeignValue::None);
        let none = ForeignObject::from(ForeignValue::None);
        assert_eq!(to_native(&none).unwrap(), NativeValue::Null);
        assert_eq!(to_native_typed::<Option<i32>>(&none).unwrap(), None);
    }

    #[test]
    fn test_list_and_map_round_trip() {
        let list = NativeValue::from(vec![1, 2, 3]);
        assert_eq!(round_trip(list.clone()), list);

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), NativeValue::Int(1));
        map.insert("b".to_string(), NativeValue::from(vec!["x", "y"]));
        let map = NativeValue::from(map);
        assert!(round_trip(map.clone()).same_as(&map));
    }

    #[test]
    fn test_tuple_comes_back_as_list() {
        let value = NativeValue::from((1, 2, 3));
        assert_eq!(
            to_foreign(value.clone()).unwrap(),
            ForeignValue::Tuple(vec![
                ForeignValue::Int(1),
                ForeignValue::Int(2),
                ForeignValue::Int(3)
            ])
        );
        assert_eq!(round_trip(value), NativeValue::from(vec![1, 2, 3]));
    }

    #[test]
    fn test_unsupported_outbound() {
        for value in [
            NativeValue::bytes(b"raw".to_vec()),
            NativeValue::UInt(7),
            NativeValue::Tuple(vec![]),
            NativeValue::Tuple(vec![1.into(), 2.into(), 3.into(), 4.into()]),
            NativeValue::Tuple(vec![NativeValue::from("a")]),
            NativeValue::Map(vec![(NativeValue::Int(1), NativeValue::Int(2))]),
            NativeValue::from(vec![NativeValue::bytes(vec![0u8])]),
        ] {
            let result = to_foreign(value.clone());
            assert!(
                matches!(result, Err(HostError::UnsupportedConversion(_))),
                "{value:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_foreign_passes_through() {
        let foreign = ForeignValue::List(vec![ForeignValue::None]);
        assert_eq!(to_foreign(foreign.clone()).unwrap(), foreign);
    }

    #[test]
    fn test_dict_with_iter_view_keeps_values() {
        let key = ForeignObject::from(ForeignValue::Str("k".into()));
        let value = ForeignObject::from(ForeignValue::Int(5));
        let object = ForeignObject {
            dict: Some(vec![(key.clone(), value)]),
            iter: Some(vec![key]),
            ..ForeignObject::opaque("defaultdict", "defaultdict(<class 'int'>, {'k': 5})")
        };
        assert_eq!(object.classify(), ForeignKind::Dict);
        let native = to_native(&object).unwrap();
        assert_eq!(native.get("k"), Some(&NativeValue::Int(5)));
    }

    #[test]
    fn test_generic_iterable_and_numeric() {
        let object = ForeignObject {
            iter: Some(vec![
                ForeignObject::from(ForeignValue::Int(0)),
                ForeignObject::from(ForeignValue::Int(1)),
            ]),
            ..ForeignObject::opaque("range", "range(0, 2)")
        };
        assert_eq!(to_native(&object).unwrap(), NativeValue::from(vec![0, 1]));

        let object = ForeignObject {
            number: Some(0.25),
            ..ForeignObject::opaque("Fraction", "Fraction(1, 4)")
        };
        assert_eq!(to_native(&object).unwrap(), NativeValue::Double(0.25));
    }

    #[test]
    fn test_unrecognized_fails() {
        let object = ForeignObject::opaque("module", "<module 'os'>");
        match to_native(&object) {
            Err(HostError::UnrecognizedForeignType(detail)) => {
                assert!(detail.contains("module"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let nested = ForeignObject {
            list: Some(vec![object]),
            ..ForeignObject::opaque("list", "[<module 'os'>]")
        };
        assert!(matches!(
            to_native(&nested),
            Err(HostError::UnrecognizedForeignType(_))
        ));
    }

    #[test]
    fn test_typed_conversion() {
        let object = ForeignObject::from(ForeignValue::Int(3));
        assert_eq!(to_native_typed::<i64>(&object).unwrap(), 3);
        assert_eq!(to_native_typed::<f64>(&object).unwrap(), 3.0);
        assert!(matches!(
            to_native_typed::<String>(&object),
            Err(HostError::TypeMismatch { expected, found }) if expected == "string" && found == "int32"
        ));

        let object = ForeignObject::from(ForeignValue::Map(vec![(
            ForeignValue::Str("n".into()),
            ForeignValue::List(vec![ForeignValue::Float(1.5)]),
        )]));
        let typed: HashMap<String, Vec<f64>> = to_native_typed(&object).unwrap();
        assert_eq!(typed["n"], vec![1.5]);
    }

    #[test]
    fn test_request_shapes() {
        let request = CallRequest::build("math.pi_value", vec![], BTreeMap::new()).unwrap();
        assert_eq!(request.call, CallShape::NoArgs);

        let mut kwargs = BTreeMap::new();
        kwargs.insert("reverse".to_string(), NativeValue::Bool(true));
        let request =
            CallRequest::build("builtins.sorted", vec![vec![3, 1, 2].into()], kwargs).unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["call"]["shape"], "args");
        assert_eq!(json["call"]["keywords"]["reverse"], serde_json::json!({"t": "bool", "v": true}));

        let mut kwargs = BTreeMap::new();
        kwargs.insert("sep".to_string(), NativeValue::from(","));
        let request = CallRequest::build("pkg.join", vec![], kwargs).unwrap();
        assert!(matches!(request.call, CallShape::Args { positional: None, .. }));
    }

    #[test]
    fn test_request_rejects_extra_positionals_and_bad_targets() {
        let result = CallRequest::build("pkg.f", vec![1.into(), 2.into()], BTreeMap::new());
        assert!(matches!(result, Err(HostError::InvocationError(_))));

        for target in ["", "pkg..f", "pkg.f()", "1pkg.f"] {
            let result = CallRequest::build(target, vec![], BTreeMap::new());
            assert!(matches!(result, Err(HostError::InvocationError(_))), "{target:?}");
        }

        let result = CallRequest::build("pkg.f", vec![NativeValue::UInt(1)], BTreeMap::new());
        assert!(matches!(result, Err(HostError::UnsupportedConversion(_))));
    }

    #[tokio::test]
    async fn test_invoke_sends_request_and_returns_object() {
        let interpreter = Arc::new(ScriptedInterpreter::returning(ForeignValue::Int(6)));
        let mut runtime = RuntimeHandle::new(interpreter.clone());
        runtime.initialize().await.unwrap();

        let result = invoke(&runtime, "pkg.mod.double", vec![3.into()], BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(to_native_typed::<i32>(&result).unwrap(), 6);

        let calls = interpreter.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].target, "pkg.mod.double");
        assert_eq!(
            calls[0].call,
            CallShape::Args {
                positional: Some(ForeignValue::Int(3)),
                keywords: BTreeMap::new()
            }
        );
    }

    #[tokio::test]
    async fn test_invoke_without_arguments_is_bare_call() {
        let interpreter = Arc::new(ScriptedInterpreter::returning(ForeignValue::Str("ok".into())));
        let mut runtime = RuntimeHandle::new(interpreter.clone());
        runtime.initialize().await.unwrap();

        invoke(&runtime, "pkg.sub.fn", vec![], BTreeMap::new())
            .await
            .unwrap();
        let mut kwargs = BTreeMap::new();
        kwargs.insert("flag".to_string(), NativeValue::Null);
        invoke(&runtime, "pkg.sub.fn", vec![], kwargs).await.unwrap();

        let calls = interpreter.calls();
        assert_eq!(calls[0].call, CallShape::NoArgs);
        assert!(matches!(
            &calls[1].call,
            CallShape::Args { positional: None, keywords } if keywords["flag"] == ForeignValue::None
        ));
    }

    #[tokio::test]
    async fn test_invoke_requires_initialized_runtime() {
        let interpreter = Arc::new(ScriptedInterpreter::returning(ForeignValue::None));
        let runtime = RuntimeHandle::new(interpreter.clone());
        assert!(matches!(runtime.state(), RuntimeState::Uninitialized));

        let result = invoke(&runtime, "pkg.f", vec![], BTreeMap::new()).await;
        assert!(matches!(result, Err(HostError::RuntimeUnavailable(_))));
        assert!(interpreter.calls().is_empty());
    }
}
