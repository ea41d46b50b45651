// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! URL fetching with SSRF protection and x402 payment support.
//!
//! Before any request the host is checked against the configured blocklist
//! and resolved; private, loopback, and link-local addresses are refused so
//! the model cannot probe the internal network.  An HTTP 402 response is
//! answered with a signed `X-PAYMENT` retry (once) when a signer is wired
//! into the context, and surfaced as `x402_required` otherwise.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::builtin::x402::{build_payment_header, PaymentChallenge};
use crate::context::{ProgressUpdate, ToolContext};
use crate::tool::{Tool, ToolCall, ToolOutput};

const DEFAULT_MAX_CHARS: usize = 50_000;

pub struct WebFetchTool {
    pub blocked_hosts: Vec<String>,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self {
            blocked_hosts: Vec::new(),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL and convert the response to readable text.\n\
         - http/https only; private and loopback addresses are refused\n\
         - HTML is converted to text, JSON pretty-printed\n\
         - content capped at 50,000 characters (max_chars to adjust)\n\
         - paid resources (HTTP 402) are settled automatically when a \
           payment signer is configured; otherwise the challenge is returned"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url":       { "type": "string", "description": "The URL to fetch (http or https)" },
                "max_chars": { "type": "integer", "description": "Maximum characters to return (default 50000)" }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> ToolOutput {
        let raw_url = call
            .args
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let max_chars = call
            .args
            .get("max_chars")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_MAX_CHARS as u64) as usize;

        let url = match url::Url::parse(raw_url) {
            Ok(u) => u,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid url: {e}")),
        };
        if !matches!(url.scheme(), "http" | "https") {
            return ToolOutput::err(&call.id, "only http/https URLs are supported");
        }

        if let Err(reason) = self.check_host(&url).await {
            return ToolOutput::err(&call.id, format!("blocked: {reason}"))
                .with_metadata(json!({ "security_code": "ssrf_guard" }));
        }

        debug!(url = %url, "web_fetch");
        ctx.report_progress(ProgressUpdate::progress(format!("fetching {url}")));

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent("harbor-agent/0.4")
            .build()
        {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("client error: {e}")),
        };

        let resp = tokio::select! {
            r = client.get(url.clone()).send() => match r {
                Ok(r) => r,
                Err(e) => return ToolOutput::err(&call.id, format!("fetch error: {e}")),
            },
            _ = ctx.cancel.cancelled() => return ToolOutput::err(&call.id, "cancelled"),
        };

        if resp.status().as_u16() == 402 {
            return self.handle_payment_required(call, ctx, &client, &url, resp, max_chars).await;
        }

        finish_response(&call.id, ctx, resp, max_chars).await
    }
}

impl WebFetchTool {
    /// Host blocklist + DNS private-range guard.
    async fn check_host(&self, url: &url::Url) -> Result<(), String> {
        let host = url.host_str().ok_or("url has no host")?.to_lowercase();

        if self
            .blocked_hosts
            .iter()
            .any(|b| host == *b || host.ends_with(&format!(".{b}")))
        {
            return Err(format!("host '{host}' is on the blocklist"));
        }

        // IP literal: check directly.  Hostname: resolve and require every
        // address to be public — a split answer could still be rebound.
        if let Ok(ip) = host.parse::<IpAddr>() {
            if is_private(&ip) {
                return Err("address is in a private range".into());
            }
            return Ok(());
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| format!("dns: {e}"))?;
        for addr in addrs {
            if is_private(&addr.ip()) {
                return Err("host resolves into a private range".into());
            }
        }
        Ok(())
    }

    async fn handle_payment_required(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
        client: &reqwest::Client,
        url: &url::Url,
        resp: reqwest::Response,
        max_chars: usize,
    ) -> ToolOutput {
        let body = resp.text().await.unwrap_or_default();
        let Some(challenge) = PaymentChallenge::parse(&body) else {
            return ToolOutput::err(&call.id, "402 response carried no parseable x402 challenge");
        };

        let Some(signer) = &ctx.payment_signer else {
            // No signer here (including every worker-side context).
            return ToolOutput::err(&call.id, "resource requires x402 payment")
                .with_metadata(json!({
                    "x402_required": true,
                    "challenge": serde_json::to_value(&challenge).unwrap_or(Value::Null),
                }));
        };

        let header = match build_payment_header(&challenge, signer.as_ref()) {
            Ok(h) => h,
            Err(e) => return ToolOutput::err(&call.id, format!("payment signing failed: {e}")),
        };

        debug!(url = %url, "retrying with X-PAYMENT header");
        ctx.report_progress(ProgressUpdate::progress("settling x402 payment"));

        // Exactly one retry; a second 402 means the payment was not accepted.
        let retry = match client
            .get(url.clone())
            .header("X-PAYMENT", header)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("paid retry failed: {e}")),
        };
        if retry.status().as_u16() == 402 {
            warn!(url = %url, "payment was not accepted");
            return ToolOutput::err(&call.id, "payment not accepted (402 after X-PAYMENT)");
        }

        finish_response(&call.id, ctx, retry, max_chars).await
    }
}

async fn finish_response(
    call_id: &str,
    ctx: &ToolContext,
    resp: reqwest::Response,
    max_chars: usize,
) -> ToolOutput {
    let status = resp.status();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_lowercase();

    let body = match resp.text().await {
        Ok(b) => b,
        Err(e) => return ToolOutput::err(call_id, format!("body error: {e}")),
    };

    if !status.is_success() {
        return ToolOutput::err(call_id, format!("HTTP {status}"));
    }

    let content = if content_type.contains("html") {
        html2text::from_read(body.as_bytes(), 100)
    } else if content_type.contains("json") {
        match serde_json::from_str::<Value>(&body) {
            Ok(v) => serde_json::to_string_pretty(&v).unwrap_or(body),
            Err(_) => body,
        }
    } else {
        body
    };

    let sanitized = ctx.security.sanitize_output(&content);
    let mut clean = sanitized.clean;
    if clean.len() > max_chars {
        let total = clean.len();
        let mut cut = max_chars;
        while cut > 0 && !clean.is_char_boundary(cut) {
            cut -= 1;
        }
        clean.truncate(cut);
        clean.push_str(&format!(
            "...[truncated at {max_chars} chars; total {total} chars]"
        ));
    }
    ToolOutput::ok(call_id, clean)
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // CGNAT 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // fe80::/10 link-local
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use harbor_config::SecurityConfig;
    use harbor_security::SecurityPolicy;

    fn ctx() -> ToolContext {
        let policy = Arc::new(SecurityPolicy::with_home(&SecurityConfig::default(), None));
        ToolContext::new("s1", ".", policy)
    }

    fn call(args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "w1".into(),
            name: "web_fetch".into(),
            args,
        }
    }

    #[test]
    fn private_ranges_are_detected() {
        for ip in ["127.0.0.1", "10.0.0.1", "192.168.1.5", "172.16.3.4", "169.254.1.1", "100.64.0.1", "0.0.0.0", "::1", "fc00::1", "fe80::1"] {
            assert!(is_private(&ip.parse().unwrap()), "{ip} should be private");
        }
    }

    #[test]
    fn public_addresses_are_not_private() {
        for ip in ["8.8.8.8", "1.1.1.1", "2606:4700::1111"] {
            assert!(!is_private(&ip.parse().unwrap()), "{ip} should be public");
        }
    }

    #[tokio::test]
    async fn loopback_ip_literal_is_blocked() {
        let out = WebFetchTool::default()
            .execute(&call(json!({"url": "http://127.0.0.1:8080/admin"})), &ctx())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("blocked"));
        assert_eq!(out.metadata.unwrap()["security_code"], json!("ssrf_guard"));
    }

    #[tokio::test]
    async fn blocklisted_host_and_subdomains_are_blocked() {
        let tool = WebFetchTool {
            blocked_hosts: vec!["internal.example".into()],
        };
        for url in [
            "https://internal.example/x",
            "https://api.internal.example/x",
        ] {
            let out = tool.execute(&call(json!({"url": url})), &ctx()).await;
            assert!(out.is_error, "{url} should be blocked");
        }
    }

    #[tokio::test]
    async fn non_http_scheme_is_rejected() {
        let out = WebFetchTool::default()
            .execute(&call(json!({"url": "file:///etc/passwd"})), &ctx())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("http/https"));
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let out = WebFetchTool::default()
            .execute(&call(json!({"url": "not a url"})), &ctx())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("invalid url"));
    }
}
