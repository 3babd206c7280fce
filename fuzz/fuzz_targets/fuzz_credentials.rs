//! Fuzz the credential parsing surface.
//!
//! Attacker-controlled header values and session tokens must never panic:
//! every input ends in a credential or an `AuthError`.
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_credentials -- -max_total_time=60
//! ```

#![no_main]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arbitrary::Arbitrary;
use axum::http::{HeaderMap, HeaderValue, header};
use libfuzzer_sys::fuzz_target;
use portal_guard::auth::keys::StaticKeys;
use portal_guard::auth::{
    ADMIN_SESSION_HEADER, Gatekeeper, KeySource, MemorySessionStore, SessionManager, TokenSettings,
    TokenValidator,
};
use portal_guard::clock::{ManualClock, SharedClock};
use portal_guard::middleware::ip::CidrRange;

#[derive(Debug, Arbitrary)]
struct Input<'a> {
    authorization: &'a [u8],
    session_header: &'a [u8],
    cookie: &'a [u8],
    token: &'a str,
    cidr: &'a str,
}

fn gatekeeper() -> &'static Gatekeeper {
    static GATEKEEPER: OnceLock<Gatekeeper> = OnceLock::new();
    GATEKEEPER.get_or_init(|| {
        let clock: SharedClock = Arc::new(ManualClock::new());
        let tokens = TokenValidator::new(
            TokenSettings {
                issuer: "https://issuer.fuzz/".to_string(),
                audience: None,
                leeway_secs: 0,
            },
            KeySource::Static(StaticKeys::new(b"fuzzing-bearer-secret", None)),
            clock.clone(),
        );
        let sessions = SessionManager::new(
            b"fuzzing-session-secret-0123456789abcdef",
            Duration::from_secs(3600),
            Arc::new(MemorySessionStore::new()),
            clock,
        )
        .expect("valid secret");
        Gatekeeper::new(Arc::new(tokens), Arc::new(sessions), "admin_session")
    })
}

fuzz_target!(|input: Input<'_>| {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_bytes(input.authorization) {
        headers.insert(header::AUTHORIZATION, value);
    }
    if let Ok(value) = HeaderValue::from_bytes(input.session_header) {
        headers.insert(ADMIN_SESSION_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_bytes(input.cookie) {
        headers.insert(header::COOKIE, value);
    }
    let _ = gatekeeper().credential(&headers);

    let _ = gatekeeper().sessions().validate_session(input.token);

    if let Some(range) = CidrRange::parse(input.cidr) {
        assert!(range.prefix_len() <= 128);
    }
});
