//! Context injection: filling omitted addressing fields from the sender's
//! `RpcContext`.
//!
//! Payload types declare which of their fields are bound to which context
//! attribute through `ContextBound::BINDINGS`. A `BindingTable` maps each
//! binding name to an extraction function over `RpcContext`. The dispatcher
//! applies the declared bindings to the raw JSON payload before it deserializes
//! it for the handler, so a caller can send `getmeta {}` and the handler sees the
//! caller's own block reference.
//!
//! Injection only writes into zero-valued fields and is idempotent.

use crate::error::RpcError;
use crate::types::{ORef, RpcContext};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

/// Extracts the value for one binding from the context; `None` leaves the
/// field untouched.
pub type Extractor = fn(&RpcContext) -> Option<Value>;

/// A payload field bound to a named context attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldBinding {
    /// JSON field name in the payload.
    pub field: &'static str,
    /// Binding name resolved through the `BindingTable`.
    pub binding: &'static str,
}

impl FieldBinding {
    pub const fn new(field: &'static str, binding: &'static str) -> Self {
        Self { field, binding }
    }
}

/// Payload types that declare context bindings.
pub trait ContextBound {
    const BINDINGS: &'static [FieldBinding] = &[];
}

macro_rules! unbound {
    ($($t:ty),* $(,)?) => {
        $(impl ContextBound for $t {})*
    };
}

unbound!(Value, String, (), bool, i32, i64, u32, u64, usize, f64);

impl<T> ContextBound for Vec<T> {}
impl<T> ContextBound for Option<T> {}

/// Binding names known to the default table.
pub mod binding {
    pub const BLOCK_ID: &str = "BlockId";
    pub const TAB_ID: &str = "TabId";
    pub const BLOCK_OREF: &str = "BlockORef";
}

fn non_empty(s: &str) -> Option<Value> {
    (!s.is_empty()).then(|| Value::String(s.to_string()))
}

/// Mapping from binding name to extraction function.
#[derive(Debug, Clone)]
pub struct BindingTable {
    extractors: HashMap<&'static str, Extractor>,
}

impl Default for BindingTable {
    fn default() -> Self {
        Self::empty()
            .with_binding(binding::BLOCK_ID, |ctx| non_empty(&ctx.block_id))
            .with_binding(binding::TAB_ID, |ctx| non_empty(&ctx.tab_id))
            .with_binding(binding::BLOCK_OREF, |ctx| {
                if ctx.block_id.is_empty() {
                    return None;
                }
                Some(Value::String(ORef::block(&ctx.block_id).to_string()))
            })
    }
}

impl BindingTable {
    /// A table with no bindings.
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// Add or replace a binding.
    pub fn with_binding(mut self, name: &'static str, extractor: Extractor) -> Self {
        self.extractors.insert(name, extractor);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.extractors.contains_key(name)
    }

    /// Fill zero-valued bound fields of `payload` from `ctx`.
    ///
    /// Unknown binding names are logged and returned as `InvalidBinding`
    /// errors; they never stop the remaining bindings from being applied.
    pub fn inject(
        &self,
        payload: &mut Value,
        bindings: &[FieldBinding],
        ctx: &RpcContext,
    ) -> Vec<RpcError> {
        let mut invalid = Vec::new();
        if bindings.is_empty() {
            return invalid;
        }
        if payload.is_null() {
            *payload = Value::Object(Map::new());
        }
        let Some(fields) = payload.as_object_mut() else {
            return invalid;
        };

        for fb in bindings {
            if fields.get(fb.field).is_some_and(|v| !is_zero(v)) {
                continue;
            }
            let Some(extract) = self.extractors.get(fb.binding) else {
                warn!(
                    "Invalid context binding {:?} on field {:?}",
                    fb.binding, fb.field
                );
                invalid.push(RpcError::InvalidBinding {
                    binding: fb.binding.to_string(),
                    field: fb.field.to_string(),
                });
                continue;
            };
            if let Some(value) = extract(ctx) {
                fields.insert(fb.field.to_string(), value);
            }
        }

        invalid
    }
}

/// Whether a JSON value is the zero value of its type.
pub fn is_zero(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const GETMETA: &[FieldBinding] = &[FieldBinding::new("oref", binding::BLOCK_OREF)];
    const MIXED: &[FieldBinding] = &[
        FieldBinding::new("blockid", binding::BLOCK_ID),
        FieldBinding::new("tabid", binding::TAB_ID),
    ];

    fn ctx() -> RpcContext {
        RpcContext::block_controller("b1").with_tab("t1")
    }

    #[test]
    fn test_fills_zero_fields() {
        let table = BindingTable::default();
        let mut payload = json!({"blockid": "", "view": "term"});
        let invalid = table.inject(&mut payload, MIXED, &ctx());
        assert!(invalid.is_empty());
        assert_eq!(payload, json!({"blockid": "b1", "tabid": "t1", "view": "term"}));
    }

    #[test]
    fn test_builds_block_oref() {
        let table = BindingTable::default();
        let mut payload = Value::Null;
        table.inject(&mut payload, GETMETA, &ctx());
        assert_eq!(payload, json!({"oref": "block:b1"}));
    }

    #[test]
    fn test_never_overwrites_caller_values() {
        let table = BindingTable::default();
        let mut payload = json!({"blockid": "other", "tabid": "t5"});
        table.inject(&mut payload, MIXED, &ctx());
        assert_eq!(payload, json!({"blockid": "other", "tabid": "t5"}));
    }

    #[test]
    fn test_injection_is_idempotent() {
        let table = BindingTable::default();
        let mut once = json!({});
        table.inject(&mut once, MIXED, &ctx());
        let mut twice = once.clone();
        table.inject(&mut twice, MIXED, &ctx());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_context_leaves_field_unset() {
        let table = BindingTable::default();
        let mut payload = json!({});
        table.inject(&mut payload, GETMETA, &RpcContext::default());
        assert_eq!(payload, json!({}));
    }

    #[test]
    fn test_unknown_binding_is_reported_and_skipped() {
        const BROKEN: &[FieldBinding] = &[
            FieldBinding::new("widget", "WidgetId"),
            FieldBinding::new("blockid", binding::BLOCK_ID),
        ];
        let table = BindingTable::default();
        let mut payload = json!({});
        let invalid = table.inject(&mut payload, BROKEN, &ctx());

        assert_eq!(invalid.len(), 1);
        assert!(matches!(
            &invalid[0],
            RpcError::InvalidBinding { binding, .. } if binding == "WidgetId"
        ));
        assert_eq!(payload, json!({"blockid": "b1"}));
    }

    #[test]
    fn test_non_object_payload_untouched() {
        let table = BindingTable::default();
        let mut payload = json!("plain string");
        table.inject(&mut payload, MIXED, &ctx());
        assert_eq!(payload, json!("plain string"));
    }

    #[test]
    fn test_custom_binding() {
        const CONN: &[FieldBinding] = &[FieldBinding::new("connection", "Conn")];
        let table = BindingTable::default().with_binding("Conn", |ctx| non_empty(&ctx.conn));
        let mut payload = json!({});
        table.inject(&mut payload, CONN, &RpcContext::conn_server("ssh1"));
        assert_eq!(payload, json!({"connection": "ssh1"}));
    }

    #[test]
    fn test_is_zero() {
        assert!(is_zero(&json!(null)));
        assert!(is_zero(&json!("")));
        assert!(is_zero(&json!(0)));
        assert!(is_zero(&json!(false)));
        assert!(is_zero(&json!([])));
        assert!(!is_zero(&json!("x")));
        assert!(!is_zero(&json!(1)));
    }
}
