//! Fuzz path normalization and route classification.
//!
//! Normalization must be idempotent, and a request path must never fall
//! out of the admin area by spelling it differently.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_routing -- -max_total_time=60
//! ```

#![no_main]

use std::sync::OnceLock;

use axum::http::Method;
use libfuzzer_sys::fuzz_target;
use portal_guard::auth::{Capability, RouteClass, RoutePolicy, RouteTable, normalize_path};

fn table() -> &'static RouteTable {
    static TABLE: OnceLock<RouteTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        RouteTable::new(&["admin".to_string()], RoutePolicy::public(RouteClass::Content))
            .and_then(|t| t.route(None, "/admin/*", RoutePolicy::admin()))
            .expect("valid table")
    })
}

fuzz_target!(|path: &str| {
    let once = normalize_path(path);
    let twice = normalize_path(&once);
    assert_eq!(once, twice);
    assert!(once.starts_with('/'));

    let resolved = table().resolve(&Method::GET, &once);
    if once == "/admin" || once.starts_with("/admin/") {
        assert_eq!(resolved.policy.capability, Capability::Admin);
    }
});
