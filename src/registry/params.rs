use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::metadata::{ExtensionDescriptor, ParamKind, ParameterSchema};
use crate::core::fingerprint::sha256_hex;
use crate::error::{EngineError, Result};

/// Parameters after defaults were merged in and every value was checked
/// against the schema. Keys are sorted, so the JSON form is canonical.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    values: Map<String, Value>,
    hash: String,
}

impl Default for ResolvedParams {
    fn default() -> Self {
        Self::from_canonical(Map::new())
    }
}

impl ResolvedParams {
    /// Merge `overrides` (a JSON object or null) into the schema defaults of
    /// `descriptor`.
    pub fn resolve(descriptor: &ExtensionDescriptor, overrides: Option<&Value>) -> Result<Self> {
        let invalid = |parameter: &str, reason: String| EngineError::InvalidParameter {
            extension: descriptor.name.clone(),
            parameter: parameter.to_string(),
            reason,
        };

        let empty = Map::new();
        let overrides = match overrides {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(invalid(
                    "*",
                    format!("parameters must be a JSON object, got {other}"),
                ))
            }
        };

        if let Some(unknown) = overrides.keys().find(|k| descriptor.parameter(k).is_none()) {
            return Err(invalid(unknown, "unknown parameter".to_string()));
        }

        let mut values = Map::new();
        for schema in &descriptor.parameters {
            let raw = overrides.get(&schema.name).unwrap_or(&schema.default);
            let value = normalize(schema, raw).map_err(|reason| invalid(&schema.name, reason))?;
            values.insert(schema.name.clone(), value);
        }

        Ok(Self::from_canonical(values))
    }

    fn from_canonical(values: Map<String, Value>) -> Self {
        let hash = sha256_hex(Value::Object(values.clone()).to_string().as_bytes());
        Self { values, hash }
    }

    /// sha256 hex of the canonical JSON form.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    pub fn canonical_json(&self) -> String {
        Value::Object(self.values.clone()).to_string()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_value())?)
    }
}

fn normalize(schema: &ParameterSchema, raw: &Value) -> std::result::Result<Value, String> {
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let value = match schema.kind {
        ParamKind::Number => {
            let n = raw
                .as_f64()
                .ok_or_else(|| format!("expected number, got {raw}"))?;
            if !n.is_finite() {
                return Err(format!("expected a finite number, got {n}"));
            }
            check_range(schema, n)?;
            // -0.0 and 0.0 must hash the same
            Value::from(if n == 0.0 { 0.0 } else { n })
        }
        ParamKind::Integer => {
            let n = match (raw.as_i64(), raw.as_f64()) {
                (Some(i), _) => i,
                (None, Some(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => f as i64,
                _ => return Err(format!("expected integer, got {raw}")),
            };
            check_range(schema, n as f64)?;
            Value::from(n)
        }
        ParamKind::String if raw.is_string() => raw.clone(),
        ParamKind::Boolean if raw.is_boolean() => raw.clone(),
        ParamKind::Array if raw.is_array() => raw.clone(),
        ParamKind::Any => raw.clone(),
        kind => return Err(format!("expected {kind}, got {raw}")),
    };
    Ok(value)
}

fn check_range(schema: &ParameterSchema, n: f64) -> std::result::Result<(), String> {
    if let Some(min) = schema.min {
        if n < min {
            return Err(format!("{n} is below the minimum {min}"));
        }
    }
    if let Some(max) = schema.max {
        if n > max {
            return Err(format!("{n} is above the maximum {max}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn descriptor() -> ExtensionDescriptor {
        ExtensionDescriptor::new("snippets")
            .add_parameter(
                ParameterSchema::new("ms_before", ParamKind::Number, json!(1.0))
                    .with_range(Some(0.0), None),
            )
            .add_parameter(
                ParameterSchema::new("max_spikes", ParamKind::Integer, json!(500))
                    .with_range(Some(1.0), None),
            )
            .add_parameter(ParameterSchema::new("mode", ParamKind::String, json!("average")))
    }

    #[test]
    fn test_defaults_fill_missing_values() {
        let params = ResolvedParams::resolve(&descriptor(), Some(&json!({"mode": "median"}))).unwrap();
        assert_eq!(params.get("ms_before"), Some(&json!(1.0)));
        assert_eq!(params.get("max_spikes"), Some(&json!(500)));
        assert_eq!(params.get("mode"), Some(&json!("median")));
    }

    #[test]
    fn test_hash_ignores_key_order_and_number_spelling() {
        let d = descriptor();
        let a = ResolvedParams::resolve(&d, Some(&json!({"max_spikes": 500.0, "ms_before": 1}))).unwrap();
        let b = ResolvedParams::resolve(&d, Some(&json!({"ms_before": 1.0}))).unwrap();
        let c = ResolvedParams::resolve(&d, None).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(b.hash(), c.hash());

        let other = ResolvedParams::resolve(&d, Some(&json!({"ms_before": 2.0}))).unwrap();
        assert_ne!(a.hash(), other.hash());
    }

    #[test]
    fn test_rejects_unknown_mistyped_and_out_of_range() {
        let d = descriptor();
        for bad in [
            json!({"nope": 1}),
            json!({"mode": 3}),
            json!({"max_spikes": 2.5}),
            json!({"max_spikes": 0}),
            json!({"ms_before": -1.0}),
            json!([1, 2]),
        ] {
            let err = ResolvedParams::resolve(&d, Some(&bad)).unwrap_err();
            assert!(
                matches!(err, EngineError::InvalidParameter { .. }),
                "{bad} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_decode_into_struct() {
        #[derive(Deserialize)]
        struct Window {
            ms_before: f64,
            max_spikes: usize,
            mode: String,
        }
        let params = ResolvedParams::resolve(&descriptor(), None).unwrap();
        let window: Window = params.decode().unwrap();
        assert_eq!(window.ms_before, 1.0);
        assert_eq!(window.max_spikes, 500);
        assert_eq!(window.mode, "average");
    }
}
