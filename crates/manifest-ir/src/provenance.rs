//! Provenance hashing with BLAKE3.
//!
//! Two digests prove where an IR came from and that it has not been altered:
//!
//! - **Content hash**: BLAKE3 of the source text. Used as the compile cache
//!   key and recorded in [`IrProvenance::content_hash`](crate::IrProvenance).
//! - **IR hash**: BLAKE3 of the IR's *canonical JSON* (object keys sorted,
//!   no whitespace) with `provenance.irHash` and `provenance.compiledAt`
//!   removed. The hash field cannot cover itself, and the compile timestamp
//!   is excluded so recompiling identical source reproduces the same digest.
//!
//! Both digests are lowercase 64-character hex strings.
//!
//! # Example
//!
//! ```
//! use manifest_ir::{provenance, Ir};
//!
//! let mut ir = Ir::empty();
//! ir.provenance.ir_hash = provenance::compute_ir_hash(&ir);
//! assert!(provenance::verify_ir_hash(&ir, None).valid);
//!
//! ir.version = "tampered".to_owned();
//! assert!(!provenance::verify_ir_hash(&ir, None).valid);
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Ir;

/// JSON keys stripped from `provenance` before hashing.
const EXCLUDED_PROVENANCE_KEYS: [&str; 2] = ["irHash", "compiledAt"];

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// BLAKE3 hex digest of raw source text.
pub fn content_hash(source: &str) -> String {
    blake3::hash(source.as_bytes()).to_hex().to_string()
}

/// Serialize a JSON value canonically: object keys sorted, compact output.
///
/// Sorting is done here rather than relying on `serde_json::Map` ordering so
/// the digest is stable regardless of which map backend serde_json was built
/// with.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Compute the integrity hash of an IR document.
///
/// The current value of `provenance.irHash` is ignored, so this can be
/// called both when stamping a freshly compiled IR and when verifying a
/// loaded one.
pub fn compute_ir_hash(ir: &Ir) -> String {
    let mut value =
        serde_json::to_value(ir).expect("IR should always be JSON-serializable");
    if let Some(Value::Object(provenance)) = value.get_mut("provenance") {
        for key in EXCLUDED_PROVENANCE_KEYS {
            provenance.remove(key);
        }
    }
    blake3::hash(canonical_json(&value).as_bytes())
        .to_hex()
        .to_string()
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Outcome of recomputing an IR hash and comparing it to an expected value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashVerification {
    /// Whether the recomputed hash equals the expected hash.
    pub valid: bool,
    /// The hash the IR was expected to have.
    pub expected_hash: String,
    /// The hash recomputed from the IR's current contents.
    pub computed_hash: String,
}

/// Recompute the IR hash and compare it against `expected`, or against the
/// IR's self-reported `provenance.irHash` when `expected` is `None`.
///
/// An empty expected hash never verifies.
pub fn verify_ir_hash(ir: &Ir, expected: Option<&str>) -> HashVerification {
    let expected_hash = expected
        .unwrap_or(ir.provenance.ir_hash.as_str())
        .to_owned();
    let computed_hash = compute_ir_hash(ir);
    let valid = !expected_hash.is_empty() && expected_hash == computed_hash;
    if !valid {
        tracing::debug!(
            expected = %expected_hash,
            computed = %computed_hash,
            "IR hash verification failed"
        );
    }
    HashVerification {
        valid,
        expected_hash,
        computed_hash,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IrEntity, IrProperty, IrType};

    fn sample_ir() -> Ir {
        let mut ir = Ir::empty();
        ir.provenance.content_hash = content_hash("entity Counter {}");
        ir.entities.push(IrEntity {
            name: "Counter".to_owned(),
            properties: vec![IrProperty {
                name: "count".to_owned(),
                ty: IrType::named("number"),
                default_value: None,
                modifiers: Vec::new(),
            }],
            ..IrEntity::named("Counter")
        });
        ir.provenance.ir_hash = compute_ir_hash(&ir);
        ir
    }

    #[test]
    fn content_hash_is_64_hex_chars() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello "));
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = serde_json::json!({"b": 1, "a": {"z": [1, {"y": 2, "x": 3}], "c": null}});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":{"c":null,"z":[1,{"x":3,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn hash_ignores_ir_hash_and_timestamp() {
        let mut ir = sample_ir();
        let original = compute_ir_hash(&ir);
        ir.provenance.ir_hash = "something else".to_owned();
        ir.provenance.compiled_at = "2000-01-01T00:00:00Z".to_owned();
        assert_eq!(compute_ir_hash(&ir), original);
    }

    #[test]
    fn untouched_ir_verifies() {
        let ir = sample_ir();
        let result = verify_ir_hash(&ir, None);
        assert!(result.valid);
        assert_eq!(result.expected_hash, result.computed_hash);
    }

    #[test]
    fn mutated_ir_fails_verification() {
        let mut ir = sample_ir();
        ir.entities[0].properties[0].name = "total".to_owned();
        assert!(!verify_ir_hash(&ir, None).valid);
    }

    #[test]
    fn explicit_expected_hash_takes_precedence() {
        let ir = sample_ir();
        assert!(!verify_ir_hash(&ir, Some("deadbeef")).valid);
        assert!(verify_ir_hash(&ir, Some(&ir.provenance.ir_hash)).valid);
    }

    #[test]
    fn empty_expected_hash_never_verifies() {
        let mut ir = sample_ir();
        ir.provenance.ir_hash.clear();
        assert!(!verify_ir_hash(&ir, None).valid);
    }
}
