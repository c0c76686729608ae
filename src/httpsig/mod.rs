//! HTTP message-signature verification: the RFC 8941 structured-field
//! parser and the draft-ietf-httpbis-message-signatures verifier built on it.

pub mod structured;
pub mod verifier;

pub use verifier::{
    query_canonicalized_header_field, verify_signature, with_failure, HeaderFields, KeyResolution,
    KeyResolver, SignatureInfo, SignatureParameters, VerifierOptions, VerifyFailureCode,
    VerifyResult,
};
