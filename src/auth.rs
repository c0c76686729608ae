//! # Request Authentication
//!
//! Connection-time authentication for the WebSocket endpoint: message
//! signature verification with timing-attack hardening, plus the
//! authenticators wired into each server session's open transaction.
//!
//! ## Timing policy:
//! The verifier itself is a pure algorithm; response-timing equalization is
//! kept here as an explicit, testable wrapper. Any verification outcome
//! other than `VERIFIED` is delayed so failures complete a fixed minimum
//! duration after verification started, hiding which step rejected the
//! request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::httpsig::{
    query_canonicalized_header_field, verify_signature, with_failure, HeaderFields, KeyResolution,
    SignatureParameters, VerifierOptions, VerifyFailureCode, VerifyResult,
};
use crate::session::server::{AuthOutcome, ServerSession};

/// Minimum response delay on signature failure.
pub const DEFAULT_MIN_FAILURE_DURATION: Duration = Duration::from_millis(500);

/// Maximum accepted signature age in seconds.
const MAX_SIGNATURE_AGE: u64 = 10;

/// Client secrets by API key. An empty secret explicitly allows unsigned
/// requests for that key.
#[derive(Default, Clone)]
pub struct SecretStore {
    secrets: HashMap<String, Vec<u8>>,
}

impl SecretStore {
    /// Build from `api key → base64 secret` pairs (the configuration form).
    pub fn from_base64(entries: &HashMap<String, String>) -> anyhow::Result<Self> {
        let mut secrets = HashMap::new();
        for (key, encoded) in entries {
            let secret = BASE64
                .decode(encoded)
                .map_err(|e| anyhow::anyhow!("invalid base64 secret for API key {key}: {e}"))?;
            secrets.insert(key.clone(), secret);
        }
        Ok(Self { secrets })
    }

    pub fn lookup(&self, key_id: &str) -> Option<Vec<u8>> {
        self.secrets.get(key_id).cloned()
    }
}

/// Header snapshot plus request metadata captured at upgrade time.
#[derive(Clone)]
pub struct RequestAuthContext {
    pub headers: HeaderFields,
    /// Path and query of the upgrade request (`@request-target`).
    pub request_target: Option<String>,
}

/// Verify the request signature, delaying any failure to a fixed minimum
/// response duration.
pub async fn verify_request_signature(
    context: RequestAuthContext,
    secrets: Arc<SecretStore>,
    min_failure_duration: Duration,
) -> VerifyResult {
    let start = Instant::now();
    let result = verify_request_signature_aux(context, secrets).await;
    if !result.is_verified() {
        let elapsed = start.elapsed();
        if elapsed < min_failure_duration {
            tokio::time::sleep(min_failure_duration - elapsed).await;
        }
    }
    result
}

async fn verify_request_signature_aux(
    context: RequestAuthContext,
    secrets: Arc<SecretStore>,
) -> VerifyResult {
    let Some(api_key) = query_canonicalized_header_field(&context.headers, "x-api-key") else {
        return with_failure(
            VerifyFailureCode::Precondition,
            "Missing \"X-API-KEY\" header field",
        );
    };

    let request_target = context.request_target.clone();
    let resolver_api_key = api_key.clone();
    let resolver_secrets = secrets.clone();

    let result = verify_signature(VerifierOptions {
        header_fields: context.headers.clone(),
        required_components: vec![
            "@request-target".to_string(),
            "@authority".to_string(),
            "audiohook-organization-id".to_string(),
            "audiohook-session-id".to_string(),
            "audiohook-correlation-id".to_string(),
            "x-api-key".to_string(),
        ],
        max_signature_age: Some(MAX_SIGNATURE_AGE),
        signature_selector: None,
        expiration_time_provider: None,
        derived_component_lookup: Some(Box::new(move |name: &str| {
            (name == "@request-target")
                .then(|| request_target.clone())
                .flatten()
        })),
        key_resolver: Box::new(move |parameters: &SignatureParameters| {
            debug!("Signature parameters: {parameters:?}");
            let api_key = resolver_api_key.clone();
            let secrets = resolver_secrets.clone();
            let parameters = parameters.clone();
            Box::pin(async move {
                let Some(nonce) = &parameters.nonce else {
                    return KeyResolution::Failure(with_failure(
                        VerifyFailureCode::Precondition,
                        "Missing \"nonce\" signature parameter",
                    ));
                };
                if nonce.len() < 22 {
                    return KeyResolution::Failure(with_failure(
                        VerifyFailureCode::Precondition,
                        "Provided \"nonce\" signature parameter is too small",
                    ));
                }
                if parameters.keyid.as_deref() != Some(api_key.as_str()) {
                    return KeyResolution::Failure(with_failure(
                        VerifyFailureCode::Precondition,
                        "X-API-KEY header field and signature keyid mismatch",
                    ));
                }
                match secrets.lookup(&api_key) {
                    // An empty secret verifies like an all-zero HMAC key;
                    // trailing zeroes up to the block size are irrelevant to
                    // the key padding.
                    Some(secret) => KeyResolution::GoodKey {
                        key: secret,
                        alg: None,
                    },
                    None => {
                        // Unknown API key: verify against a dummy random key
                        // of correct length with a forced failure so the
                        // timing matches the known-key path.
                        debug!("Unknown API key: {api_key}");
                        let mut dummy = vec![0u8; 32];
                        rand::thread_rng().fill_bytes(&mut dummy);
                        KeyResolution::BadKey {
                            key: dummy,
                            alg: None,
                        }
                    }
                }
            })
        }),
    })
    .await;

    if let VerifyResult::Failure {
        code: VerifyFailureCode::Unsigned,
        ..
    } = &result
    {
        // Unsigned requests are allowed, but only for a known API key whose
        // configured client secret is empty.
        if let Some(secret) = secrets.lookup(&api_key) {
            if secret.is_empty() {
                return VerifyResult::Verified;
            }
        }
    }
    result
}

/// Attach the connection's authenticators to a freshly created session:
/// an organization-id header cross-check and the signature verification
/// result. Verification starts immediately; the open transaction awaits it.
pub fn initiate_request_authentication(
    session: &mut ServerSession,
    context: RequestAuthContext,
    secrets: Arc<SecretStore>,
    min_failure_duration: Duration,
) {
    let org_headers = context.headers.clone();
    if let Err(err) = session.add_authenticator(Box::new(
        move |_session: &mut ServerSession, open_params: &crate::protocol::message::OpenParameters| {
        let header_org = query_canonicalized_header_field(&org_headers, "audiohook-organization-id");
        let open_org = open_params.organization_id.to_string();
        Box::pin(async move {
            match header_org {
                None => {
                    warn!("No \"audiohook-organization-id\" header field");
                    Ok(AuthOutcome::Fail {
                        info: Some("Missing \"audiohook-organization-id\" header field".into()),
                    })
                }
                Some(header_org) if !header_org.eq_ignore_ascii_case(&open_org) => {
                    warn!(
                        "Organization ID mismatch! Header field: {header_org}, 'open' message: {open_org}"
                    );
                    Ok(AuthOutcome::Fail {
                        info: Some(
                            "Mismatch between \"organizationId\" open parameter and \
                             \"audiohook-organization-id\" header field"
                                .into(),
                        ),
                    })
                }
                Some(_) => Ok(AuthOutcome::Pass),
            }
        })
    },
    )) {
        warn!("Failed to register organization authenticator: {err}");
    }

    // Start the signature verification now; the authenticator below waits
    // for it if the 'open' message arrives first.
    let verification =
        tokio::spawn(verify_request_signature(context, secrets, min_failure_duration));

    if let Err(err) = session.add_authenticator(Box::new(
        move |_session: &mut ServerSession, _open_params: &crate::protocol::message::OpenParameters| {
            Box::pin(async move {
                let result = verification
                    .await
                    .map_err(|e| anyhow::anyhow!("signature verification task failed: {e}"))?;
                info!("Signature verification resolved: {result:?}");
                match result {
                    VerifyResult::Verified => Ok(AuthOutcome::Pass),
                    VerifyResult::Failure { code, reason } => Ok(AuthOutcome::Fail {
                        info: Some(match reason {
                            Some(reason) => format!("{code}: {reason}"),
                            None => code.to_string(),
                        }),
                    }),
                }
            })
        },
    )) {
        warn!("Failed to register signature authenticator: {err}");
    }
}
