//! x402 payment protocol types for paywalled stage interactions.
//!
//! A resource server answers an unpaid request with HTTP 402 and a
//! [`PaymentRequirements`] challenge. The payer retries with a signed
//! [`PaymentProof`] in the `X-PAYMENT` header; the server forwards it to an
//! external oracle through [`OracleClient`] to verify and settle on-chain.
//!
//! # Modules
//!
//! - [`requirements`]: challenge construction ([`build_challenge`])
//! - [`payment`]: challenge and proof wire types, header decoding
//! - [`oracle`]: the [`Oracle`] trait and its HTTP client
//! - [`response`]: oracle response types and non-throwing outcomes
//! - [`auth`]: HMAC request signing and constant-time comparison

pub mod auth;
pub mod constants;
pub mod error;
pub mod oracle;
pub mod payment;
pub mod requirements;
pub mod response;

pub use constants::*;
pub use error::X402Error;
pub use oracle::{Oracle, OracleClient};
pub use payment::*;
pub use requirements::build_challenge;
pub use response::*;
