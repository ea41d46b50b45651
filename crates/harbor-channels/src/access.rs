// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Access control and message shaping shared by channel adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUser {
    pub user_id: String,
    pub username: String,
    pub requested_at: DateTime<Utc>,
}

/// Check the DM policy.  `Ok(())` means allowed; `Err` carries the denial
/// message to send back.  Pairing mode records the requester.
pub fn check_access(
    dm_policy: &str,
    user_id: &str,
    username: &str,
    allowed_users: &[String],
    pending_users: &mut Vec<PendingUser>,
) -> Result<(), String> {
    match dm_policy {
        "allowlist" => {
            if !allowed_users.iter().any(|u| u == user_id) {
                return Err("You're not on the allowlist for this agent.".into());
            }
        }
        "pairing" => {
            if !allowed_users.iter().any(|u| u == user_id) {
                if !pending_users.iter().any(|p| p.user_id == user_id) {
                    pending_users.push(PendingUser {
                        user_id: user_id.to_string(),
                        username: username.to_string(),
                        requested_at: Utc::now(),
                    });
                }
                return Err("Pairing request sent; waiting for operator approval.".into());
            }
        }
        // "open" — allow everyone
        _ => {}
    }
    Ok(())
}

/// Split a long message into chunks at a platform limit, preferring
/// newline then space breaks.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 || text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }
        let mut window_end = max_len;
        while window_end > 0 && !remaining.is_char_boundary(window_end) {
            window_end -= 1;
        }
        let split_at = remaining[..window_end]
            .rfind('\n')
            .or_else(|| remaining[..window_end].rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(window_end);
        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }
    chunks
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_policy_allows_everyone() {
        let mut pending = Vec::new();
        assert!(check_access("open", "42", "alice", &[], &mut pending).is_ok());
        assert!(pending.is_empty());
    }

    #[test]
    fn allowlist_blocks_unknown_users() {
        let mut pending = Vec::new();
        let allowed = vec!["1".to_string()];
        assert!(check_access("allowlist", "1", "a", &allowed, &mut pending).is_ok());
        assert!(check_access("allowlist", "2", "b", &allowed, &mut pending).is_err());
    }

    #[test]
    fn pairing_records_requester_once() {
        let mut pending = Vec::new();
        let allowed: Vec<String> = vec![];
        assert!(check_access("pairing", "9", "zoe", &allowed, &mut pending).is_err());
        assert!(check_access("pairing", "9", "zoe", &allowed, &mut pending).is_err());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].username, "zoe");
    }

    #[test]
    fn paired_user_is_allowed() {
        let mut pending = Vec::new();
        let allowed = vec!["9".to_string()];
        assert!(check_access("pairing", "9", "zoe", &allowed, &mut pending).is_ok());
    }

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hello", 100), vec!["hello"]);
    }

    #[test]
    fn long_message_splits_at_newlines() {
        let text = format!("{}\n{}", "a".repeat(80), "b".repeat(80));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(80));
        assert_eq!(chunks[1], "b".repeat(80));
    }

    #[test]
    fn unbroken_text_hard_splits() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 100));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn split_respects_utf8_boundaries() {
        let text = "é".repeat(100); // 2 bytes each
        let chunks = split_message(&text, 101);
        for c in &chunks {
            assert!(c.len() <= 101);
            // must be valid UTF-8 slices by construction; also no panics
        }
        assert_eq!(chunks.concat(), text);
    }
}
