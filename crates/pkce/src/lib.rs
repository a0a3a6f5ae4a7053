//! PKCE authorization-code primitives
//!
//! Provides verifier/challenge generation, `state` generation, authorization
//! URL construction and the pending-flow store that keeps the verifier across
//! the browser round trip. Nothing in this crate touches the network.
//!
//! Flow:
//! 1. Gateway calls `PkceParams::generate()` + `generate_state()`
//! 2. Pending flow saved via `VerifierStore::store()` under the state
//! 3. Browser redirected to `build_authorization_url()`
//! 4. On callback, `VerifierStore::take()` hands the verifier over exactly once

pub mod authorize;
pub mod error;
pub mod pkce;
pub mod store;

pub use authorize::{AuthorizationRequest, build_authorization_url};
pub use error::{Error, Result};
pub use pkce::{
    ChallengeMethod, MAX_VERIFIER_LEN, MIN_VERIFIER_LEN, PkceParams, compute_challenge,
    generate_state, generate_verifier, is_valid_verifier,
};
pub use store::{
    BoxFuture, InMemoryVerifierStore, PendingFlow, StorageScope, VerifierStore,
};
