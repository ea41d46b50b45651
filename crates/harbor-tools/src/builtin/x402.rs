// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! x402 payment challenge handling.
//!
//! An HTTP 402 response carries a JSON challenge listing acceptable payment
//! requirements.  When a signer is available, the client signs an
//! authorisation, base64-encodes the payment envelope into an `X-PAYMENT`
//! header, and retries the request exactly once.  Signers are functions
//! and cannot cross the worker boundary, so worker-side fetches surface
//! the challenge instead of paying.

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::context::PaymentSigner;

/// One acceptable payment option from the challenge body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: String,
    pub network: String,
    pub max_amount_required: String,
    pub resource: String,
    pub pay_to: String,
    #[serde(default)]
    pub max_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub asset: Option<String>,
    #[serde(default)]
    pub extra: Option<serde_json::Value>,
}

/// The 402 response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChallenge {
    pub x402_version: u32,
    pub accepts: Vec<PaymentRequirement>,
}

impl PaymentChallenge {
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }
}

/// Build the `X-PAYMENT` header value for the first acceptable requirement.
pub fn build_payment_header(
    challenge: &PaymentChallenge,
    signer: &dyn PaymentSigner,
) -> Result<String, String> {
    let req = challenge
        .accepts
        .first()
        .ok_or_else(|| "challenge lists no acceptable payments".to_string())?;

    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);

    let authorization = serde_json::json!({
        "from": signer.address(),
        "to": req.pay_to,
        "value": req.max_amount_required,
        "nonce": hex::encode(nonce),
        "resource": req.resource,
    });
    let signature = signer.sign(&authorization)?;

    let envelope = serde_json::json!({
        "x402Version": challenge.x402_version,
        "scheme": req.scheme,
        "network": req.network,
        "payload": {
            "signature": signature,
            "authorization": authorization,
        }
    });

    Ok(base64::engine::general_purpose::STANDARD.encode(envelope.to_string()))
}

/// Demonstration signer: HMAC-SHA256 over the canonical authorisation JSON.
/// Real deployments plug in a wallet-backed implementation.
pub struct HmacPaymentSigner {
    address: String,
    key: Vec<u8>,
}

impl HmacPaymentSigner {
    pub fn new(address: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            address: address.into(),
            key: key.into(),
        }
    }
}

impl PaymentSigner for HmacPaymentSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign(&self, authorization: &serde_json::Value) -> Result<String, String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| format!("signer key: {e}"))?;
        mac.update(authorization.to_string().as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
