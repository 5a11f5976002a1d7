//! Access control for sessions via pairing codes and user grants.
//!
//! All state lives in the persisted config document so the running bot and
//! the CLI see the same requests and grants.

use crate::config::{
    AccessPolicy, ChannelMapping, ConfigStore, PairingRequest, PairingStatus, UserGrant,
};
use crate::error::{Error, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Outcome of an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    /// The user may use the session
    Allowed,
    /// The user is blocked; ignore them silently
    Blocked,
    /// The channel's allowlist does not include the user
    NotListed,
    /// Unknown user under the `paired` policy; a pairing code can be issued
    PairingRequired,
    /// Unknown user under the `none` policy
    Denied,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        self == AccessDecision::Allowed
    }
}

/// Who is asking for access, and from where
#[derive(Debug, Clone)]
pub struct PairingRequester {
    pub user_id: String,
    pub display_name: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
}

/// Result of a pairing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingTicket {
    pub code: String,
    pub status: PairingStatus,
    /// A new code was issued by this call
    pub is_new: bool,
}

/// Gatekeeper over grants and pairing requests
pub struct AccessGate {
    store: Arc<ConfigStore>,
}

impl AccessGate {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Decide whether `user_id` may use `session`.
    ///
    /// `mapping` is the channel's mapping, whose allowlist (if any) applies
    /// on top of the default policy.
    pub fn authorize(
        &self,
        user_id: &str,
        session: &str,
        mapping: Option<&ChannelMapping>,
    ) -> AccessDecision {
        self.store.read(|cfg| {
            let grant = cfg.users.get(user_id);
            if grant.is_some_and(|g| g.blocked) {
                return AccessDecision::Blocked;
            }
            if mapping.is_some_and(|m| !m.admits(user_id)) {
                return AccessDecision::NotListed;
            }
            if cfg.default_access == AccessPolicy::All || grant.is_some_and(|g| g.covers(session))
            {
                return AccessDecision::Allowed;
            }
            match cfg.default_access {
                AccessPolicy::Paired => AccessDecision::PairingRequired,
                _ => AccessDecision::Denied,
            }
        })
    }

    /// Issue a pairing code for `session`, or return the one already issued.
    ///
    /// A pending request for the same user and session is returned as is. A
    /// rejected one is returned with its status and never re-issued.
    pub fn request_pairing(
        &self,
        requester: &PairingRequester,
        session: &str,
    ) -> Result<PairingTicket> {
        if requester.user_id.is_empty() {
            return Err(Error::invalid("pairing requires a user id"));
        }

        self.store.update(|cfg| {
            let existing = cfg.pairing_requests.values().find(|r| {
                r.user_id == requester.user_id
                    && r.session == session
                    && r.status != PairingStatus::Approved
            });
            if let Some(existing) = existing {
                return Ok(PairingTicket {
                    code: existing.code.clone(),
                    status: existing.status,
                    is_new: false,
                });
            }

            let code = loop {
                let code = generate_pairing_code();
                if !cfg.pairing_requests.contains_key(&code) {
                    break code;
                }
            };

            cfg.pairing_requests.insert(
                code.clone(),
                PairingRequest {
                    code: code.clone(),
                    user_id: requester.user_id.clone(),
                    display_name: requester.display_name.clone(),
                    channel_id: requester.channel_id.clone(),
                    guild_id: requester.guild_id.clone(),
                    session: session.to_string(),
                    status: PairingStatus::Pending,
                    created_at: Utc::now(),
                    resolved_at: None,
                },
            );
            info!(
                user_id = %requester.user_id,
                session = %session,
                code = %code,
                "pairing requested"
            );

            Ok(PairingTicket {
                code,
                status: PairingStatus::Pending,
                is_new: true,
            })
        })
    }

    /// Approve a pending request and grant its session to the user
    pub fn approve(&self, code: &str) -> Result<PairingRequest> {
        let code = normalize_code(code);
        self.store.update(|cfg| {
            let request = pending_request(&mut cfg.pairing_requests, &code)?;
            request.status = PairingStatus::Approved;
            request.resolved_at = Some(Utc::now());
            let request = request.clone();

            let grant = cfg.users.entry(request.user_id.clone()).or_default();
            grant.sessions.insert(request.session.clone());
            grant.paired_at = Some(Utc::now());
            grant.pairing_code = Some(request.code.clone());

            Ok(request)
        })
    }

    /// Reject a pending request
    pub fn reject(&self, code: &str) -> Result<PairingRequest> {
        let code = normalize_code(code);
        self.store.update(|cfg| {
            let request = pending_request(&mut cfg.pairing_requests, &code)?;
            request.status = PairingStatus::Rejected;
            request.resolved_at = Some(Utc::now());
            Ok(request.clone())
        })
    }

    /// Requests, oldest first, optionally filtered by status
    pub fn list_pairing_requests(&self, status: Option<PairingStatus>) -> Vec<PairingRequest> {
        let mut requests: Vec<PairingRequest> = self.store.read(|cfg| {
            cfg.pairing_requests
                .values()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .cloned()
                .collect()
        });
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    /// Grant `session` (or "*") to a user directly
    pub fn grant(&self, user_id: &str, session: &str) -> Result<()> {
        validate_user_id(user_id)?;
        if session.trim().is_empty() {
            return Err(Error::invalid("session name cannot be empty"));
        }
        self.store.update(|cfg| {
            let grant = cfg.users.entry(user_id.to_string()).or_default();
            grant.sessions.insert(session.to_string());
            Ok(())
        })
    }

    /// Remove one session from a user's grant, or all of them when `session`
    /// is None. Returns whether anything was removed.
    pub fn revoke(&self, user_id: &str, session: Option<&str>) -> Result<bool> {
        self.store.update(|cfg| {
            let grant = cfg
                .users
                .get_mut(user_id)
                .ok_or_else(|| Error::not_found(format!("user {}", user_id)))?;
            Ok(match session {
                Some(session) => grant.sessions.remove(session),
                None => {
                    let had_any = !grant.sessions.is_empty();
                    grant.sessions.clear();
                    had_any
                }
            })
        })
    }

    /// Block a user from every session
    pub fn block(&self, user_id: &str, reason: Option<String>) -> Result<()> {
        validate_user_id(user_id)?;
        self.store.update(|cfg| {
            let grant = cfg.users.entry(user_id.to_string()).or_default();
            grant.blocked = true;
            grant.block_reason = reason;
            Ok(())
        })
    }

    /// Lift a block. Returns false when the user was not blocked.
    pub fn unblock(&self, user_id: &str) -> Result<bool> {
        self.store.update(|cfg| {
            Ok(match cfg.users.get_mut(user_id) {
                Some(grant) if grant.blocked => {
                    grant.blocked = false;
                    grant.block_reason = None;
                    true
                }
                _ => false,
            })
        })
    }

    /// All known users and their grants
    pub fn list_users(&self) -> Vec<(String, UserGrant)> {
        self.store.read(|cfg| {
            cfg.users
                .iter()
                .map(|(id, grant)| (id.clone(), grant.clone()))
                .collect()
        })
    }
}

fn pending_request<'a>(
    requests: &'a mut std::collections::BTreeMap<String, PairingRequest>,
    code: &str,
) -> Result<&'a mut PairingRequest> {
    let request = requests
        .get_mut(code)
        .ok_or_else(|| Error::not_found(format!("pairing code {}", code)))?;
    if request.status != PairingStatus::Pending {
        return Err(Error::invalid(format!(
            "pairing code {} is already {}",
            code, request.status
        )));
    }
    Ok(request)
}

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::invalid("user id cannot be empty"));
    }
    Ok(())
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Generate a 6-character alphanumeric pairing code
fn generate_pairing_code() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789"; // Omit confusing chars

    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}
