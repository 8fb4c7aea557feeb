//! Deterministic query identity derived from request-defining fields.

use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};

use serde_json::Value;

use crate::descriptor::{Method, QueryDescriptor};

// Fixed seeds keep signatures stable across processes and runs.
fn fixed_state() -> ahash::RandomState {
    ahash::RandomState::with_seeds(
        0x8f1d_3a2b_6c45_9e07,
        0x2b74_90de_ad11_c3f5,
        0xd601_57e8_4a3c_22b9,
        0x7c92_e1f0_b85d_6614,
    )
}

/// Stable identity of a logical query.
///
/// Derived from a descriptor's method, URL, and body; merge tables do not
/// participate. Two descriptors with the same request-defining fields yield
/// the same signature regardless of body key order, and are treated as the
/// same logical query for deduplication and cancellation targeting.
///
/// A signature is a 64-bit hash; the client keeps the originating request
/// fields on each record and reports
/// [`QueryError::SignatureCollision`](crate::QueryError::SignatureCollision)
/// if two distinct requests ever map to one signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuerySignature(u64);

impl QuerySignature {
    /// Compute the signature of a descriptor.
    ///
    /// Pure and deterministic: depends only on method, URL, and body.
    pub fn of(descriptor: &QueryDescriptor) -> Self {
        let mut hasher = fixed_state().build_hasher();
        descriptor.method().as_str().hash(&mut hasher);
        descriptor.url().hash(&mut hasher);
        match descriptor.body() {
            None => hasher.write_u8(0),
            Some(body) => {
                hasher.write_u8(1);
                hash_value(body, &mut hasher);
            }
        }
        QuerySignature(hasher.finish())
    }

    /// The raw 64-bit value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuerySignature({:016x})", self.0)
    }
}

// Object entries hash in sorted key order, so bodies that differ only in
// key order hash identically. Discriminant and length prefixes keep
// adjacent values from running together.
fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => state.write_u8(0),
        Value::Bool(b) => {
            state.write_u8(1);
            state.write_u8(*b as u8);
        }
        Value::Number(n) => {
            state.write_u8(2);
            n.hash(state);
        }
        Value::String(s) => {
            state.write_u8(3);
            s.hash(state);
        }
        Value::Array(items) => {
            state.write_u8(4);
            state.write_u64(items.len() as u64);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            state.write_u8(5);
            state.write_u64(map.len() as u64);
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by_key(|(key, _)| *key);
            for (key, value) in entries {
                key.hash(state);
                hash_value(value, state);
            }
        }
    }
}

/// Request-defining fields retained for collision detection.
///
/// Equality of the identity is what proves two dispatches are the same
/// logical query; the 64-bit signature alone is not trusted. A record whose
/// identity differs from an incoming dispatch under the same signature is a
/// collision.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestIdentity {
    method: Method,
    url: String,
    body: Option<Value>,
}

impl RequestIdentity {
    pub(crate) fn of(descriptor: &QueryDescriptor) -> Self {
        Self {
            method: descriptor.method(),
            url: descriptor.url().to_string(),
            body: descriptor.body().cloned(),
        }
    }

    pub(crate) fn method(&self) -> Method {
        self.method
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Request line for logs and collision errors.
    pub(crate) fn render(&self) -> String {
        match &self.body {
            Some(body) => format!("{} {} {}", self.method, self.url, body),
            None => format!("{} {}", self.method, self.url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(method: Method, url: &str, body: Option<Value>) -> QueryDescriptor {
        let mut builder = QueryDescriptor::builder(method, url);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_signature_ignores_body_key_order() {
        let a: Value = serde_json::from_str(r#"{"name":"x","age":3,"tags":["a","b"]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"tags":["a","b"],"age":3,"name":"x"}"#).unwrap();
        let d1 = descriptor(Method::Post, "/api/user", Some(a));
        let d2 = descriptor(Method::Post, "/api/user", Some(b));
        assert_eq!(QuerySignature::of(&d1), QuerySignature::of(&d2));
    }

    #[test]
    fn test_signature_ignores_nested_key_order() {
        let a: Value = serde_json::from_str(r#"{"outer":{"x":1,"y":2}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"outer":{"y":2,"x":1}}"#).unwrap();
        let d1 = descriptor(Method::Post, "/api/user", Some(a));
        let d2 = descriptor(Method::Post, "/api/user", Some(b));
        assert_eq!(QuerySignature::of(&d1), QuerySignature::of(&d2));
    }

    #[test]
    fn test_signature_differs_on_body() {
        let d1 = descriptor(Method::Post, "/api/user", Some(json!({"name": "x"})));
        let d2 = descriptor(Method::Post, "/api/user", Some(json!({"name": "y"})));
        assert_ne!(QuerySignature::of(&d1), QuerySignature::of(&d2));
    }

    #[test]
    fn test_signature_differs_on_method_and_url() {
        let base = descriptor(Method::Get, "/api/user", None);
        let other_method = descriptor(Method::Head, "/api/user", None);
        let other_url = descriptor(Method::Get, "/api/users", None);
        assert_ne!(QuerySignature::of(&base), QuerySignature::of(&other_method));
        assert_ne!(QuerySignature::of(&base), QuerySignature::of(&other_url));
    }

    #[test]
    fn test_missing_body_differs_from_null_body() {
        let none = descriptor(Method::Post, "/api/user", None);
        let null = descriptor(Method::Post, "/api/user", Some(Value::Null));
        assert_ne!(QuerySignature::of(&none), QuerySignature::of(&null));
    }

    #[test]
    fn test_array_order_is_significant() {
        let d1 = descriptor(Method::Post, "/api/user", Some(json!({"tags": ["a", "b"]})));
        let d2 = descriptor(Method::Post, "/api/user", Some(json!({"tags": ["b", "a"]})));
        assert_ne!(QuerySignature::of(&d1), QuerySignature::of(&d2));
    }

    #[test]
    fn test_signature_is_stable_across_computations() {
        let d = descriptor(Method::Post, "/api/user", Some(json!({"name": "x"})));
        assert_eq!(QuerySignature::of(&d), QuerySignature::of(&d));
    }

    #[test]
    fn test_identity_equality_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        let d1 = descriptor(Method::Post, "/api/user", Some(a));
        let d2 = descriptor(Method::Post, "/api/user", Some(b));
        assert_eq!(RequestIdentity::of(&d1), RequestIdentity::of(&d2));
    }

    #[test]
    fn test_display_is_hex() {
        let d = descriptor(Method::Get, "/api/user", None);
        let rendered = QuerySignature::of(&d).to_string();
        assert_eq!(rendered.len(), 16);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
