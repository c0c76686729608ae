//! # HTTP Message Signature Verifier
//!
//! Verification of `Signature-Input`/`Signature` header fields per
//! draft-ietf-httpbis-message-signatures, restricted to `hmac-sha256`.
//!
//! The outcome is a closed result taxonomy, not an error type: callers must
//! branch on `VERIFIED`/`FAILED`/`UNSIGNED`/`EXPIRED`/`INVALID`/
//! `PRECONDITION`/`UNSUPPORTED` explicitly. Timing hardening lives in two
//! places: the HMAC comparison is constant-time with the unsupported-
//! algorithm verdict deferred until after it, and the caller is expected to
//! equalize overall response latency (see `auth`).

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::structured::{
    encode_bare_item, encode_inner_list, encode_item, parse_dictionary, BareItem, InnerList, Item,
    Member,
};

/// Maximum clock skew allowed between the client and server clocks, seconds.
const MAX_CLOCK_SKEW: u64 = 3;

/// Header fields by lowercase name; repeated fields keep their order.
pub type HeaderFields = HashMap<String, Vec<String>>;

const DERIVED_COMPONENTS: &[&str] = &[
    "@method",
    "@authority",
    "@scheme",
    "@target-uri",
    "@request-target",
    "@path",
    "@query",
    "@status",
];

/// Signature parameters recognized on a `signature-input` member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureParameters {
    pub alg: Option<String>,
    pub created: Option<u64>,
    pub expires: Option<u64>,
    pub keyid: Option<String>,
    pub nonce: Option<String>,
}

/// One parsed, validated labeled signature.
#[derive(Debug, Clone)]
pub struct SignatureInfo {
    pub label: String,
    pub parameters: SignatureParameters,
    pub components: Vec<Item>,
    pub signature_base: InnerList,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailureCode {
    Failed,
    Unsigned,
    Expired,
    Invalid,
    Precondition,
    Unsupported,
}

impl std::fmt::Display for VerifyFailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VerifyFailureCode::Failed => "FAILED",
            VerifyFailureCode::Unsigned => "UNSIGNED",
            VerifyFailureCode::Expired => "EXPIRED",
            VerifyFailureCode::Invalid => "INVALID",
            VerifyFailureCode::Precondition => "PRECONDITION",
            VerifyFailureCode::Unsupported => "UNSUPPORTED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Verified,
    Failure {
        code: VerifyFailureCode,
        reason: Option<String>,
    },
}

impl VerifyResult {
    pub fn is_verified(&self) -> bool {
        matches!(self, VerifyResult::Verified)
    }
}

pub fn with_failure(code: VerifyFailureCode, reason: impl Into<String>) -> VerifyResult {
    VerifyResult::Failure {
        code,
        reason: Some(reason.into()),
    }
}

fn failure(code: VerifyFailureCode) -> VerifyResult {
    VerifyResult::Failure { code, reason: None }
}

/// Outcome of key resolution. The bad-key branch carries a dummy key of
/// correct length so failure timing does not distinguish "unknown key id"
/// from "known key id, wrong signature".
#[derive(Debug, Clone)]
pub enum KeyResolution {
    GoodKey { key: Vec<u8>, alg: Option<String> },
    BadKey { key: Vec<u8>, alg: Option<String> },
    Failure(VerifyResult),
}

pub type KeyResolver =
    Box<dyn Fn(&SignatureParameters) -> BoxFuture<'static, KeyResolution> + Send + Sync>;

/// Chooses among multiple labeled signatures; `None` means no match.
pub type SignatureSelector = Box<dyn Fn(&[SignatureInfo]) -> Option<String> + Send + Sync>;

/// Resolves a derived component (`@request-target`, ...) to its value.
pub type DerivedComponentLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Injectable "now" in UNIX seconds for the temporal checks.
pub type ExpirationTimeProvider = Box<dyn Fn(&SignatureParameters) -> u64 + Send + Sync>;

pub struct VerifierOptions {
    pub header_fields: HeaderFields,
    pub required_components: Vec<String>,
    pub max_signature_age: Option<u64>,
    pub signature_selector: Option<SignatureSelector>,
    pub expiration_time_provider: Option<ExpirationTimeProvider>,
    pub derived_component_lookup: Option<DerivedComponentLookup>,
    pub key_resolver: KeyResolver,
}

/// Trim and collapse line-folding continuations to a single space.
pub fn canonicalize_header_field_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(idx) = rest.find("\r\n") {
        let (before, after) = rest.split_at(idx);
        let after = &after[2..];
        let continuation = after.trim_start_matches([' ', '\t']);
        if continuation.len() != after.len() {
            // Folded line: obs-fold becomes a single space.
            out.push_str(before.trim_end_matches([' ', '\t']));
            out.push(' ');
            rest = continuation;
        } else {
            out.push_str(before);
            out.push_str("\r\n");
            rest = after;
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Case-insensitive header lookup with canonicalization; multi-valued
/// fields join with `", "`.
pub fn query_canonicalized_header_field(headers: &HeaderFields, name: &str) -> Option<String> {
    let values = headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, values)| values)?;
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|v| canonicalize_header_field_value(v))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn component_parameters_valid(params: &[(String, BareItem)]) -> bool {
    params.iter().all(|(key, value)| match key.as_str() {
        "key" | "name" => matches!(value, BareItem::String(_)),
        "sf" | "bs" | "req" => matches!(value, BareItem::Boolean(_)),
        _ => false,
    })
}

fn has_flag(params: &[(String, BareItem)], name: &str) -> bool {
    params
        .iter()
        .any(|(key, value)| key == name && value == &BareItem::Boolean(true))
}

fn parse_signature_parameters(list: &InnerList) -> Result<SignatureParameters, VerifyResult> {
    if list.params.is_empty() {
        return Err(with_failure(
            VerifyFailureCode::Invalid,
            "Invalid \"signature-input\" header field value (no parameters)",
        ));
    }
    let mut parameters = SignatureParameters::default();
    for (key, value) in &list.params {
        match key.as_str() {
            "alg" => match value.as_str() {
                Some(v) => parameters.alg = Some(v.to_string()),
                None => {
                    return Err(with_failure(
                        VerifyFailureCode::Invalid,
                        "Invalid \"signature-input\" header field value (alg parameter must be a String)",
                    ))
                }
            },
            "created" => match value.as_integer() {
                Some(v) if v >= 0 => parameters.created = Some(v as u64),
                _ => {
                    return Err(with_failure(
                        VerifyFailureCode::Invalid,
                        "Invalid \"signature-input\" header field value (created parameter must be an Integer)",
                    ))
                }
            },
            "expires" => match value.as_integer() {
                Some(v) if v >= 0 => parameters.expires = Some(v as u64),
                _ => {
                    return Err(with_failure(
                        VerifyFailureCode::Invalid,
                        "Invalid \"signature-input\" header field value (expires parameter must be an Integer)",
                    ))
                }
            },
            "keyid" => match value.as_str() {
                Some(v) => parameters.keyid = Some(v.to_string()),
                None => {
                    return Err(with_failure(
                        VerifyFailureCode::Invalid,
                        "Invalid \"signature-input\" header field value (keyid parameter must be a String)",
                    ))
                }
            },
            "nonce" => match value.as_str() {
                Some(v) => parameters.nonce = Some(v.to_string()),
                None => {
                    return Err(with_failure(
                        VerifyFailureCode::Invalid,
                        "Invalid \"signature-input\" header field value (nonce parameter must be a String)",
                    ))
                }
            },
            other => {
                return Err(with_failure(
                    VerifyFailureCode::Invalid,
                    format!(
                        "Invalid \"signature-input\" header field value (unknown parameter {})",
                        encode_bare_item(&BareItem::String(other.to_string()))
                    ),
                ))
            }
        }
    }
    Ok(parameters)
}

/// Verify the message signature over the supplied header fields.
pub async fn verify_signature(options: VerifierOptions) -> VerifyResult {
    let VerifierOptions {
        header_fields,
        required_components,
        max_signature_age,
        signature_selector,
        expiration_time_provider,
        derived_component_lookup,
        key_resolver,
    } = options;

    let signature_input_fields =
        match query_canonicalized_header_field(&header_fields, "signature-input")
            .map(|v| parse_dictionary(&v))
        {
            None => Vec::new(),
            Some(Ok(dict)) => dict,
            Some(Err(_)) => {
                return with_failure(
                    VerifyFailureCode::Invalid,
                    "Failed to parse \"signature-input\" header field",
                )
            }
        };
    let signature_fields = match query_canonicalized_header_field(&header_fields, "signature")
        .map(|v| parse_dictionary(&v))
    {
        None => Vec::new(),
        Some(Ok(dict)) => dict,
        Some(Err(_)) => {
            return with_failure(
                VerifyFailureCode::Invalid,
                "Failed to parse \"signature\" header field",
            )
        }
    };

    if signature_input_fields.is_empty() {
        if signature_fields.is_empty() {
            return with_failure(
                VerifyFailureCode::Unsigned,
                "No \"signature\" and \"signature-input\" header fields",
            );
        }
        return with_failure(
            VerifyFailureCode::Invalid,
            "Found \"signature\" but no \"signature-input\" header field",
        );
    } else if signature_fields.is_empty() {
        return with_failure(
            VerifyFailureCode::Invalid,
            "Found \"signature-input\" but no \"signature\" header field",
        );
    }

    let mut signatures: Vec<SignatureInfo> = Vec::new();
    for (label, member) in &signature_input_fields {
        let signature = match signature_fields.iter().find(|(k, _)| k == label) {
            Some((_, Member::Item(item))) => match &item.value {
                BareItem::ByteSequence(bytes) => bytes.clone(),
                _ => {
                    return with_failure(
                        VerifyFailureCode::Invalid,
                        format!("Invalid \"signature\" header field value (label: \"{label}\")"),
                    )
                }
            },
            Some(_) => {
                return with_failure(
                    VerifyFailureCode::Invalid,
                    format!("Invalid \"signature\" header field value (label: \"{label}\")"),
                )
            }
            None => {
                return with_failure(
                    VerifyFailureCode::Invalid,
                    format!("Signature with label \"{label}\" not found"),
                )
            }
        };
        let Member::InnerList(signature_base) = member else {
            return with_failure(
                VerifyFailureCode::Invalid,
                format!(
                    "Invalid \"signature-input\" header field value for label \"{label}\" \
                     (Dictionary member value must be an Inner List)"
                ),
            );
        };

        let mut components = Vec::with_capacity(signature_base.items.len());
        for item in &signature_base.items {
            if !matches!(item.value, BareItem::String(_)) {
                return with_failure(
                    VerifyFailureCode::Invalid,
                    "Invalid \"signature-input\" header field value (not an Inner List of Strings)",
                );
            }
            if !component_parameters_valid(&item.params) {
                return with_failure(
                    VerifyFailureCode::Invalid,
                    format!("Invalid signature component: {}", encode_item(item)),
                );
            }
            components.push(item.clone());
        }

        let parameters = match parse_signature_parameters(signature_base) {
            Ok(parameters) => parameters,
            Err(result) => return result,
        };

        signatures.push(SignatureInfo {
            label: label.clone(),
            parameters,
            components,
            signature_base: signature_base.clone(),
            signature,
        });
    }

    // Choose one signature: caller-supplied selector, or the first.
    let label = match &signature_selector {
        Some(selector) => match selector(&signatures) {
            Some(label) => label,
            None => {
                return with_failure(
                    VerifyFailureCode::Precondition,
                    "Multiple signatures and none met selection criteria",
                )
            }
        },
        None => signatures[0].label.clone(),
    };
    let info = signatures
        .iter()
        .find(|s| s.label == label)
        .unwrap_or(&signatures[0]);

    // Temporal checks, only if anything time-related is in play.
    let parameters = &info.parameters;
    if parameters.created.is_some() || parameters.expires.is_some() || max_signature_age.is_some() {
        let now = match &expiration_time_provider {
            Some(provider) => provider(parameters),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        if let Some(created) = parameters.created {
            if created > now + MAX_CLOCK_SKEW {
                return with_failure(
                    VerifyFailureCode::Precondition,
                    "Invalid \"created\" parameter value (time in the future)",
                );
            }
        }
        if let Some(expires) = parameters.expires {
            if expires < now + MAX_CLOCK_SKEW {
                return failure(VerifyFailureCode::Expired);
            }
        }
        if let Some(max_age) = max_signature_age {
            let Some(created) = parameters.created else {
                return with_failure(
                    VerifyFailureCode::Precondition,
                    "Cannot determine signature age (no \"created\" signature parameter)",
                );
            };
            if created + max_age < now + MAX_CLOCK_SKEW {
                return failure(VerifyFailureCode::Expired);
            }
        }
    }

    // Assemble the canonical signature base from the covered components in
    // declared order.
    let mut remaining_required: Vec<String> = required_components;
    let mut included: Vec<String> = Vec::new();
    let mut input_lines: Vec<String> = Vec::new();
    for item in &info.components {
        let Some(name) = item.value.as_str() else {
            // Checked above.
            return failure(VerifyFailureCode::Invalid);
        };
        let encoded = encode_item(item);
        if included.contains(&encoded) {
            return with_failure(
                VerifyFailureCode::Invalid,
                format!("Duplicate {encoded} component reference"),
            );
        }
        let value: String;
        if name.starts_with('@') {
            if name == "@signature-params" {
                return with_failure(
                    VerifyFailureCode::Invalid,
                    "The \"@signature-params\" MUST NOT be listed in covered components.",
                );
            }
            if name == "@query-params" {
                return with_failure(
                    VerifyFailureCode::Unsupported,
                    format!("Derived component {encoded} is not yet supported."),
                );
            }
            if !DERIVED_COMPONENTS.contains(&name) {
                return with_failure(
                    VerifyFailureCode::Invalid,
                    format!("Unknown derived component ({encoded}) in signature base."),
                );
            }
            if !item.params.is_empty() {
                if has_flag(&item.params, "req") {
                    return with_failure(
                        VerifyFailureCode::Unsupported,
                        format!("Related request indicator (req) not yet supported ({encoded})."),
                    );
                }
                return with_failure(
                    VerifyFailureCode::Invalid,
                    format!("Derived component ({encoded}) does not support component parameters."),
                );
            }
            let mut resolved = derived_component_lookup
                .as_ref()
                .and_then(|lookup| lookup(name));
            if resolved.is_none() && name == "@authority" {
                resolved = query_canonicalized_header_field(&header_fields, "host");
            }
            match resolved {
                Some(v) => value = v,
                None => {
                    return with_failure(
                        VerifyFailureCode::Precondition,
                        format!("Cannot resolve reference to {encoded} component"),
                    )
                }
            }
        } else {
            if name == "signature" {
                return with_failure(
                    VerifyFailureCode::Unsupported,
                    format!("Reference to component {encoded} is not yet supported."),
                );
            }
            if !item.params.is_empty() {
                if has_flag(&item.params, "sf") {
                    return with_failure(
                        VerifyFailureCode::Unsupported,
                        format!(
                            "Known structured field component parameter (sf) not yet supported ({encoded})."
                        ),
                    );
                }
                if has_flag(&item.params, "bs") {
                    return with_failure(
                        VerifyFailureCode::Unsupported,
                        format!(
                            "Byte sequence wrapping indicator parameter (bs) not yet supported ({encoded})."
                        ),
                    );
                }
                if has_flag(&item.params, "req") {
                    return with_failure(
                        VerifyFailureCode::Unsupported,
                        format!("Related request indicator (req) not yet supported ({encoded})."),
                    );
                }
                return with_failure(
                    VerifyFailureCode::Invalid,
                    format!("Invalid component parameter(s) for component: {encoded}"),
                );
            }
            match query_canonicalized_header_field(&header_fields, name) {
                Some(field) => value = field,
                None => {
                    return with_failure(
                        VerifyFailureCode::Precondition,
                        format!("Header field \"{name}\" not present"),
                    )
                }
            }
        }
        input_lines.push(format!("{encoded}: {value}"));
        included.push(encoded);
        remaining_required.retain(|r| r != name);
    }
    if !remaining_required.is_empty() {
        return with_failure(
            VerifyFailureCode::Precondition,
            format!(
                "Signature does not cover some of the required component(s): {}",
                remaining_required.join(",")
            ),
        );
    }

    // Re-encode the signature parameters from the parsed representation, not
    // the raw header bytes.
    input_lines.push(format!(
        "\"@signature-params\": {}",
        encode_inner_list(&info.signature_base)
    ));
    let signature_data = input_lines.join("\n");

    let resolution = key_resolver(parameters).await;
    let (key, resolver_alg, good_key) = match resolution {
        KeyResolution::GoodKey { key, alg } => (key, alg, true),
        KeyResolution::BadKey { key, alg } => (key, alg, false),
        KeyResolution::Failure(result) => return result,
    };

    let alg = resolver_alg
        .or_else(|| parameters.alg.clone())
        .unwrap_or_else(|| "hmac-sha256".to_string());
    let bad_alg = if alg != "hmac-sha256" {
        Some(with_failure(
            VerifyFailureCode::Unsupported,
            format!("Signature algorithm \"{alg}\" is not supported"),
        ))
    } else {
        None
    };

    let mut mac = match Hmac::<Sha256>::new_from_slice(&key) {
        Ok(mac) => mac,
        Err(_) => return failure(VerifyFailureCode::Failed),
    };
    mac.update(signature_data.as_bytes());
    let computed = mac.finalize().into_bytes();

    // Constant-time comparison; the bad-algorithm verdict is deferred until
    // after it so the check cannot become a timing oracle, and a match
    // against a deliberately wrong key is never treated as success.
    let matched: bool = info.signature.ct_eq(computed.as_slice()).into();
    if let Some(bad_alg) = bad_alg {
        return bad_alg;
    }
    if matched && good_key {
        VerifyResult::Verified
    } else {
        with_failure(VerifyFailureCode::Failed, "Signatures do not match")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    const KEY: &[u8] = b"test-secret-key-32-bytes-long!!!";
    const CREATED: u64 = 1700000000;

    fn headers(pairs: &[(&str, &str)]) -> HeaderFields {
        let mut map = HeaderFields::new();
        for (name, value) in pairs {
            map.entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
        map
    }

    fn signature_input() -> String {
        format!(
            "sig1=(\"@request-target\" \"@authority\" \"x-api-key\");created={CREATED};\
             keyid=\"key1\";nonce=\"0123456789abcdefghijklmnop\""
        )
    }

    fn canonical_base() -> String {
        [
            "\"@request-target\": /api/v1/audiohook/ws".to_string(),
            "\"@authority\": example.com".to_string(),
            "\"x-api-key\": key1".to_string(),
            format!(
                "\"@signature-params\": (\"@request-target\" \"@authority\" \"x-api-key\");\
                 created={CREATED};keyid=\"key1\";nonce=\"0123456789abcdefghijklmnop\""
            ),
        ]
        .join("\n")
    }

    fn sign(base: &str, key: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
        mac.update(base.as_bytes());
        format!("sig1=:{}:", BASE64.encode(mac.finalize().into_bytes()))
    }

    fn signed_headers() -> HeaderFields {
        headers(&[
            ("host", "example.com"),
            ("x-api-key", "key1"),
            ("signature-input", &signature_input()),
            ("signature", &sign(&canonical_base(), KEY)),
        ])
    }

    fn resolver(resolution: KeyResolution) -> KeyResolver {
        Box::new(move |_: &SignatureParameters| {
            let resolution = resolution.clone();
            Box::pin(async move { resolution })
        })
    }

    fn good_key() -> KeyResolver {
        resolver(KeyResolution::GoodKey {
            key: KEY.to_vec(),
            alg: None,
        })
    }

    fn options(header_fields: HeaderFields, key_resolver: KeyResolver) -> VerifierOptions {
        VerifierOptions {
            header_fields,
            required_components: vec![
                "@request-target".to_string(),
                "@authority".to_string(),
                "x-api-key".to_string(),
            ],
            max_signature_age: Some(10),
            signature_selector: None,
            expiration_time_provider: Some(Box::new(|_: &SignatureParameters| CREATED + 5)),
            derived_component_lookup: Some(Box::new(|name: &str| {
                (name == "@request-target").then(|| "/api/v1/audiohook/ws".to_string())
            })),
            key_resolver,
        }
    }

    fn failure_code(result: &VerifyResult) -> Option<VerifyFailureCode> {
        match result {
            VerifyResult::Verified => None,
            VerifyResult::Failure { code, .. } => Some(*code),
        }
    }

    #[tokio::test]
    async fn test_valid_signature_verifies() {
        let result = verify_signature(options(signed_headers(), good_key())).await;
        assert_eq!(result, VerifyResult::Verified);
    }

    #[tokio::test]
    async fn test_flipped_signature_byte_fails() {
        let mut fields = signed_headers();
        let sig = fields.get_mut("signature").unwrap();
        // Flip one bit inside the base64 payload.
        let mut bytes = sig[0].clone().into_bytes();
        let idx = 10;
        bytes[idx] = if bytes[idx] == b'A' { b'B' } else { b'A' };
        sig[0] = String::from_utf8(bytes).unwrap();

        let result = verify_signature(options(fields, good_key())).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Failed));
    }

    #[tokio::test]
    async fn test_unsigned_when_both_headers_absent() {
        let fields = headers(&[("host", "example.com"), ("x-api-key", "key1")]);
        let result = verify_signature(options(fields, good_key())).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Unsigned));
    }

    #[tokio::test]
    async fn test_invalid_when_exactly_one_header_present() {
        let mut fields = signed_headers();
        fields.remove("signature");
        let result = verify_signature(options(fields, good_key())).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Invalid));

        let mut fields = signed_headers();
        fields.remove("signature-input");
        let result = verify_signature(options(fields, good_key())).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Invalid));
    }

    #[tokio::test]
    async fn test_created_in_future_is_precondition() {
        let mut opts = options(signed_headers(), good_key());
        // One hour before the signature's created timestamp.
        opts.expiration_time_provider = Some(Box::new(|_: &SignatureParameters| CREATED - 3600));
        let result = verify_signature(opts).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Precondition));
    }

    #[tokio::test]
    async fn test_signature_age_expiry() {
        let mut opts = options(signed_headers(), good_key());
        opts.expiration_time_provider = Some(Box::new(|_: &SignatureParameters| CREATED + 3600));
        let result = verify_signature(opts).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Expired));
    }

    #[tokio::test]
    async fn test_max_age_without_created_is_precondition() {
        let input = "sig1=(\"x-api-key\");keyid=\"key1\"";
        let base =
            "\"x-api-key\": key1\n\"@signature-params\": (\"x-api-key\");keyid=\"key1\"".to_string();
        let fields = headers(&[
            ("host", "example.com"),
            ("x-api-key", "key1"),
            ("signature-input", input),
            ("signature", &sign(&base, KEY)),
        ]);
        let mut opts = options(fields, good_key());
        opts.required_components = vec!["x-api-key".to_string()];
        let result = verify_signature(opts).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Precondition));
    }

    #[tokio::test]
    async fn test_unknown_signature_parameter_is_invalid() {
        let mut fields = signed_headers();
        let input = fields.get_mut("signature-input").unwrap();
        input[0].push_str(";sneaky=1");
        let result = verify_signature(options(fields, good_key())).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Invalid));
    }

    #[tokio::test]
    async fn test_signature_params_component_is_invalid() {
        let input = "sig1=(\"@signature-params\");created=1700000000;keyid=\"key1\";nonce=\"0123456789abcdefghijklmnop\"";
        let fields = headers(&[
            ("host", "example.com"),
            ("signature-input", input),
            ("signature", "sig1=:AAAA:"),
        ]);
        let mut opts = options(fields, good_key());
        opts.required_components.clear();
        let result = verify_signature(opts).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Invalid));
    }

    #[tokio::test]
    async fn test_query_params_component_is_unsupported() {
        let input = "sig1=(\"@query-params\");created=1700000000;keyid=\"key1\";nonce=\"0123456789abcdefghijklmnop\"";
        let fields = headers(&[
            ("host", "example.com"),
            ("signature-input", input),
            ("signature", "sig1=:AAAA:"),
        ]);
        let mut opts = options(fields, good_key());
        opts.required_components.clear();
        let result = verify_signature(opts).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Unsupported));
    }

    #[tokio::test]
    async fn test_missing_required_component_is_precondition() {
        let mut opts = options(signed_headers(), good_key());
        opts.required_components
            .push("audiohook-session-id".to_string());
        let result = verify_signature(opts).await;
        let VerifyResult::Failure { code, reason } = result else {
            panic!("expected failure");
        };
        assert_eq!(code, VerifyFailureCode::Precondition);
        assert!(reason.unwrap().contains("audiohook-session-id"));
    }

    #[tokio::test]
    async fn test_missing_covered_header_is_precondition() {
        let mut fields = signed_headers();
        fields.remove("x-api-key");
        let result = verify_signature(options(fields, good_key())).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Precondition));
    }

    #[tokio::test]
    async fn test_bad_key_match_still_fails() {
        // Resolver declares the key bad even though it produces a matching
        // signature; an accidental match must never verify.
        let result = verify_signature(options(
            signed_headers(),
            resolver(KeyResolution::BadKey {
                key: KEY.to_vec(),
                alg: None,
            }),
        ))
        .await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Failed));
    }

    #[tokio::test]
    async fn test_resolver_alg_takes_precedence_and_unsupported() {
        let result = verify_signature(options(
            signed_headers(),
            resolver(KeyResolution::GoodKey {
                key: KEY.to_vec(),
                alg: Some("rsa-pss-sha512".to_string()),
            }),
        ))
        .await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Unsupported));
    }

    #[tokio::test]
    async fn test_resolver_failure_propagates() {
        let result = verify_signature(options(
            signed_headers(),
            resolver(KeyResolution::Failure(with_failure(
                VerifyFailureCode::Precondition,
                "Missing \"nonce\" signature parameter",
            ))),
        ))
        .await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Precondition));
    }

    #[tokio::test]
    async fn test_authority_falls_back_to_host_header() {
        // No derived lookup at all: @authority resolves via the host header,
        // @request-target cannot resolve and becomes a precondition failure.
        let mut opts = options(signed_headers(), good_key());
        opts.derived_component_lookup = None;
        let result = verify_signature(opts).await;
        let VerifyResult::Failure { code, reason } = result else {
            panic!("expected failure");
        };
        assert_eq!(code, VerifyFailureCode::Precondition);
        assert!(reason.unwrap().contains("@request-target"));
    }

    #[tokio::test]
    async fn test_duplicate_component_is_invalid() {
        let input = format!(
            "sig1=(\"x-api-key\" \"x-api-key\");created={CREATED};keyid=\"key1\";nonce=\"0123456789abcdefghijklmnop\""
        );
        let fields = headers(&[
            ("host", "example.com"),
            ("x-api-key", "key1"),
            ("signature-input", &input),
            ("signature", "sig1=:AAAA:"),
        ]);
        let mut opts = options(fields, good_key());
        opts.required_components.clear();
        let result = verify_signature(opts).await;
        assert_eq!(failure_code(&result), Some(VerifyFailureCode::Invalid));
    }

    #[tokio::test]
    async fn test_multi_valued_header_joined_for_signing() {
        let value = query_canonicalized_header_field(
            &headers(&[("x-thing", "a"), ("x-thing", " b ")]),
            "X-Thing",
        );
        assert_eq!(value, Some("a, b".to_string()));
    }
}
