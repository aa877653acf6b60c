//! Value marshalling between [`DynamicValue`] and V8.
//!
//! Conversion is structural and fully recursive in both directions. Every
//! V8 local created here is wrapped in a [`SandboxHandle`] and counted by
//! the context's [`HandleLedger`]. Container elements are converted inside a
//! nested `HandleScope`, so the per-element temporaries are released as soon
//! as the element is attached to its parent. If conversion fails part way
//! through a structure, the handles created so far are dropped while the
//! error propagates.

use deno_core::v8;
use indexmap::IndexMap;
use thiserror::Error;

use crate::handle::{HandleLedger, SandboxHandle};
use crate::value::DynamicValue;

/// Maximum nesting depth accepted in either direction.
pub const MAX_DEPTH: usize = 64;

/// Errors raised while converting values across the sandbox boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MarshalError {
    /// Nesting exceeds [`MAX_DEPTH`].
    #[error("value nesting exceeds maximum depth of {max}")]
    TooDeep {
        /// Configured maximum.
        max: usize,
    },

    /// The engine refused to allocate a string (it exceeds the engine's
    /// maximum string length).
    #[error("string of {len} bytes cannot be represented in the sandbox")]
    StringTooLong {
        /// Length in bytes.
        len: usize,
    },

    /// An array has more elements than the engine can index.
    #[error("array of {len} elements cannot be represented in the sandbox")]
    ArrayTooLong {
        /// Number of elements.
        len: usize,
    },

    /// Attaching an element or property to its container failed.
    #[error("failed to attach {what}")]
    Attach {
        /// Which element or property.
        what: String,
    },

    /// A sandbox object refers back to one of its ancestors.
    #[error("value contains a circular reference")]
    Circular,

    /// Reading an element or property from the sandbox failed (for example
    /// a getter threw, or execution was terminated).
    #[error("failed to read {what}")]
    Read {
        /// Which element or property.
        what: String,
    },
}

/// Convert a host value into a new sandbox value.
///
/// The returned handle is owned by the caller; dropping it disposes it.
pub fn to_sandbox<'s>(
    scope: &mut v8::HandleScope<'s>,
    ledger: &HandleLedger,
    value: &DynamicValue,
) -> Result<SandboxHandle<'s>, MarshalError> {
    to_sandbox_at(scope, ledger, value, 0)
}

fn to_sandbox_at<'s>(
    scope: &mut v8::HandleScope<'s>,
    ledger: &HandleLedger,
    value: &DynamicValue,
    depth: usize,
) -> Result<SandboxHandle<'s>, MarshalError> {
    match value {
        DynamicValue::Null => Ok(ledger.track(v8::null(scope).into())),
        DynamicValue::Bool(b) => Ok(ledger.track(v8::Boolean::new(scope, *b).into())),
        DynamicValue::Number(n) => Ok(ledger.track(v8::Number::new(scope, *n).into())),
        DynamicValue::String(s) => Ok(ledger.track(new_string(scope, s)?.into())),
        DynamicValue::Array(items) => {
            check_depth(depth)?;
            let len = i32::try_from(items.len())
                .map_err(|_| MarshalError::ArrayTooLong { len: items.len() })?;
            let array = v8::Array::new(scope, len);
            let handle = ledger.track(array.into());

            for (index, item) in items.iter().enumerate() {
                let inner = &mut v8::HandleScope::new(scope);
                let element = to_sandbox_at(inner, ledger, item, depth + 1)?;
                let attached = array.set_index(inner, index as u32, element.local());
                if attached != Some(true) {
                    return Err(MarshalError::Attach {
                        what: format!("array element {index}"),
                    });
                }
            }

            Ok(handle)
        }
        DynamicValue::Object(map) => {
            check_depth(depth)?;
            let object = v8::Object::new(scope);
            let handle = ledger.track(object.into());

            for (key, item) in map {
                let inner = &mut v8::HandleScope::new(scope);
                let key_local = new_string(inner, key)?;
                let key_handle = ledger.track(key_local.into());
                let element = to_sandbox_at(inner, ledger, item, depth + 1)?;
                // Own data property, so keys such as `__proto__` never hit setters.
                let attached =
                    object.create_data_property(inner, key_local.into(), element.local());
                drop(key_handle);
                if attached != Some(true) {
                    return Err(MarshalError::Attach {
                        what: format!("property '{key}'"),
                    });
                }
            }

            Ok(handle)
        }
    }
}

fn new_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    s: &str,
) -> Result<v8::Local<'s, v8::String>, MarshalError> {
    v8::String::new(scope, s).ok_or(MarshalError::StringTooLong { len: s.len() })
}

fn check_depth(depth: usize) -> Result<(), MarshalError> {
    if depth >= MAX_DEPTH {
        return Err(MarshalError::TooDeep { max: MAX_DEPTH });
    }
    Ok(())
}

/// Dump a sandbox value into a plain host value tree.
///
/// The source handle is borrowed, not disposed; that stays the caller's
/// responsibility. Values outside the host model are mapped as follows:
/// `undefined` becomes null, functions and symbols become null, BigInt
/// becomes a (possibly lossy) number, and dates become their string form.
pub fn from_sandbox(
    scope: &mut v8::HandleScope,
    ledger: &HandleLedger,
    handle: &SandboxHandle<'_>,
) -> Result<DynamicValue, MarshalError> {
    let mut ancestors = Ancestors::default();
    read_value(scope, ledger, handle.local(), 0, &mut ancestors)
}

/// Containers on the current conversion path.
///
/// Identity hashes are not unique, so a hash match is only a candidate; the
/// ancestor is confirmed with strict equality.
#[derive(Default)]
struct Ancestors {
    path: Vec<(i32, v8::Global<v8::Object>)>,
}

impl Ancestors {
    /// Push `object` onto the path; `false` if it is already an ancestor.
    fn enter(
        &mut self,
        scope: &mut v8::HandleScope,
        ledger: &HandleLedger,
        object: v8::Local<v8::Object>,
    ) -> bool {
        let hash = object.get_identity_hash().get();
        if self.contains(scope, ledger, object, hash) {
            return false;
        }
        self.path.push((hash, v8::Global::new(scope, object)));
        true
    }

    fn contains(
        &self,
        scope: &mut v8::HandleScope,
        ledger: &HandleLedger,
        object: v8::Local<v8::Object>,
        hash: i32,
    ) -> bool {
        self.path.iter().any(|(ancestor_hash, ancestor)| {
            if *ancestor_hash != hash {
                return false;
            }
            let ancestor = ledger.track(v8::Local::new(scope, ancestor).into());
            ancestor.local().strict_equals(object.into())
        })
    }

    fn exit(&mut self) {
        self.path.pop();
    }
}

fn read_value(
    scope: &mut v8::HandleScope,
    ledger: &HandleLedger,
    value: v8::Local<v8::Value>,
    depth: usize,
    ancestors: &mut Ancestors,
) -> Result<DynamicValue, MarshalError> {
    if value.is_null_or_undefined() {
        return Ok(DynamicValue::Null);
    }
    if value.is_boolean() {
        return Ok(DynamicValue::Bool(value.is_true()));
    }
    if value.is_number() {
        let n = value.number_value(scope).ok_or_else(|| MarshalError::Read {
            what: "number".into(),
        })?;
        return Ok(DynamicValue::Number(n));
    }
    if value.is_string() {
        return Ok(DynamicValue::String(value.to_rust_string_lossy(scope)));
    }
    if value.is_big_int() {
        let digits = value.to_rust_string_lossy(scope);
        let n = digits.parse::<f64>().map_err(|_| MarshalError::Read {
            what: "bigint".into(),
        })?;
        return Ok(DynamicValue::Number(n));
    }
    if value.is_function() || value.is_symbol() {
        return Ok(DynamicValue::Null);
    }
    if value.is_date() {
        return Ok(DynamicValue::String(value.to_rust_string_lossy(scope)));
    }

    if value.is_array() {
        check_depth(depth)?;
        let array = v8::Local::<v8::Array>::try_from(value).map_err(|_| MarshalError::Read {
            what: "array".into(),
        })?;
        if !ancestors.enter(scope, ledger, array.into()) {
            return Err(MarshalError::Circular);
        }

        let len = array.length();
        let mut items = Vec::with_capacity(len as usize);
        for index in 0..len {
            let inner = &mut v8::HandleScope::new(scope);
            let item = array
                .get_index(inner, index)
                .ok_or_else(|| MarshalError::Read {
                    what: format!("array element {index}"),
                })?;
            let item = ledger.track(item);
            items.push(read_value(inner, ledger, item.local(), depth + 1, ancestors)?);
        }

        ancestors.exit();
        return Ok(DynamicValue::Array(items));
    }

    if value.is_object() {
        check_depth(depth)?;
        let object = v8::Local::<v8::Object>::try_from(value).map_err(|_| MarshalError::Read {
            what: "object".into(),
        })?;
        if !ancestors.enter(scope, ledger, object) {
            return Err(MarshalError::Circular);
        }

        let names = object
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| MarshalError::Read {
                what: "property names".into(),
            })?;
        let names = ledger.track(names.into());
        let names_array = v8::Local::<v8::Array>::try_from(names.local()).map_err(|_| {
            MarshalError::Read {
                what: "property names".into(),
            }
        })?;

        let mut map = IndexMap::with_capacity(names_array.length() as usize);
        for index in 0..names_array.length() {
            let inner = &mut v8::HandleScope::new(scope);
            let key = names_array
                .get_index(inner, index)
                .ok_or_else(|| MarshalError::Read {
                    what: format!("property name {index}"),
                })?;
            let key = ledger.track(key);
            let key_str = key.local().to_rust_string_lossy(inner);
            let item = object
                .get(inner, key.local())
                .ok_or_else(|| MarshalError::Read {
                    what: format!("property '{key_str}'"),
                })?;
            let item = ledger.track(item);
            let converted = read_value(inner, ledger, item.local(), depth + 1, ancestors)?;
            map.insert(key_str, converted);
        }

        ancestors.exit();
        return Ok(DynamicValue::Object(map));
    }

    Ok(DynamicValue::String(value.to_rust_string_lossy(scope)))
}
