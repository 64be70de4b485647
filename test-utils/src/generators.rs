//! Shared proptest generators.

use proptest::prelude::*;
use serde_json::{Value, json};
use std::time::Duration;

/// Business module names used across the retail back office.
pub const MODULES: &[&str] = &[
    "sales",
    "inventory",
    "purchase_orders",
    "supplier_returns",
    "cash_register",
    "accounting",
    "payment",
    "e_invoicing",
    "dashboard",
];

/// Generate a business module name.
pub fn module_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(MODULES).prop_map(str::to_string)
}

/// Generate a dependency name.
pub fn dependency_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{2,20}-api"
}

/// Generate an HTTP method, mutating or not.
pub fn http_method_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "post", "Patch"])
        .prop_map(str::to_string)
}

/// Generate an idempotency key.
pub fn idempotency_key_strategy() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9-]{8,64}"
}

/// Generate an HTTP status code seen from dependencies.
pub fn http_status_code_strategy() -> impl Strategy<Value = u16> {
    prop::sample::select(vec![
        200u16, 201, 204, 400, 401, 403, 404, 408, 409, 422, 429, 500, 502, 503, 504,
    ])
}

/// Generate a retry delay between 1ms and 5s.
pub fn delay_strategy() -> impl Strategy<Value = Duration> {
    (1u64..5_000).prop_map(Duration::from_millis)
}

/// Generate a small JSON response body.
pub fn response_body_strategy() -> impl Strategy<Value = Value> {
    let note = prop::option::of("[A-Za-z ]{0,24}");
    ("[a-z0-9-]{4,12}", 0u32..10_000, note).prop_map(|(id, qty, note)| {
        json!({
            "id": id,
            "quantity": qty,
            "note": note,
        })
    })
}

/// Generate a value for the safe-coercion helpers, well-formed or not.
pub fn loose_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        (-1.0e9f64..1.0e9).prop_map(|n| json!(n)),
        ".{0,16}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..4).prop_map(|v| json!(v)),
    ]
}
