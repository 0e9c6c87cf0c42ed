//! Canonical key construction.
//!
//! Every backend addresses records through the same key strings, so these
//! builders are pure and deterministic. Caller-supplied segments are
//! sanitized (the `:` separator becomes `_`) before they are joined, which
//! keeps the segment count of every key fixed no matter what the input is.
//!
//! ```text
//! {tenant}:user:{user}
//! {tenant}:state:{handler}:{user}
//! {tenant}:df:{table}:pkid:{pk}
//! {tenant}:EXPTRIGGER:{action}:{identifier}
//! {tenant}:aistate:{agent}:{user}
//! courier:notify:{tenant}:{user}:{event}
//! ```

use serde::Deserialize;

/// Separator between key segments.
pub const SEPARATOR: char = ':';

/// Segment value that stands for "any" in channel patterns.
pub const WILDCARD: &str = "*";

// ── prefixes ─────────────────────────────────────────────────────────

/// Domain markers used inside keys. Loaded from the `[keys]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeyPrefixes {
    pub user: String,
    pub state: String,
    pub table: String,
    pub pkid: String,
    pub trigger: String,
    pub ai_state: String,
    pub channel: String,
}

impl Default for KeyPrefixes {
    fn default() -> Self {
        Self {
            user: "user".into(),
            state: "state".into(),
            table: "df".into(),
            pkid: "pkid".into(),
            trigger: "EXPTRIGGER".into(),
            ai_state: "aistate".into(),
            channel: "courier:notify".into(),
        }
    }
}

// ── trigger key ──────────────────────────────────────────────────────

/// The parts of an expiry trigger key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerKey {
    pub tenant: String,
    pub action: String,
    pub identifier: String,
}

// ── factory ──────────────────────────────────────────────────────────

/// Builds and parses canonical keys.
#[derive(Debug, Clone, Default)]
pub struct KeyFactory {
    prefixes: KeyPrefixes,
}

impl KeyFactory {
    #[must_use]
    pub fn new(prefixes: KeyPrefixes) -> Self {
        Self { prefixes }
    }

    pub fn prefixes(&self) -> &KeyPrefixes {
        &self.prefixes
    }

    pub fn user(&self, tenant: &str, user_id: &str) -> String {
        format!(
            "{}:{}:{}",
            sanitize(tenant),
            self.prefixes.user,
            sanitize(user_id)
        )
    }

    pub fn handler(&self, tenant: &str, name: &str, user_id: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            sanitize(tenant),
            self.prefixes.state,
            sanitize(name),
            sanitize(user_id)
        )
    }

    pub fn table(&self, tenant: &str, table_name: &str, pkid: &str) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            sanitize(tenant),
            self.prefixes.table,
            sanitize(table_name),
            self.prefixes.pkid,
            sanitize(pkid)
        )
    }

    pub fn trigger(&self, tenant: &str, action: &str, identifier: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            sanitize(tenant),
            self.prefixes.trigger,
            sanitize(action),
            sanitize(identifier)
        )
    }

    pub fn aistate(&self, tenant: &str, agent_name: &str, user_id: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            sanitize(tenant),
            self.prefixes.ai_state,
            sanitize(agent_name),
            sanitize(user_id)
        )
    }

    /// Pub/sub channel for one event type of one user.
    pub fn channel(&self, tenant: &str, user_id: &str, event_type: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.prefixes.channel,
            sanitize(tenant),
            sanitize(user_id),
            sanitize(event_type)
        )
    }

    /// Channel pattern where `user_id` and `event_type` may be [`WILDCARD`].
    ///
    /// Any other value is matched literally, glob metacharacters included.
    pub fn channel_pattern(&self, tenant: &str, user_id: &str, event_type: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            escape_glob(&self.prefixes.channel),
            literal(tenant),
            wildcard_or_literal(user_id),
            wildcard_or_literal(event_type)
        )
    }

    /// Split a trigger key back into its parts.
    ///
    /// Returns `None` for anything that is not a well-formed trigger key of
    /// this factory.
    pub fn parse_trigger(&self, key: &str) -> Option<TriggerKey> {
        let mut parts = key.split(SEPARATOR);
        let tenant = parts.next()?;
        let marker = parts.next()?;
        let action = parts.next()?;
        let identifier = parts.next()?;
        if parts.next().is_some() || marker != self.prefixes.trigger {
            return None;
        }
        if tenant.is_empty() || action.is_empty() || identifier.is_empty() {
            return None;
        }
        Some(TriggerKey {
            tenant: tenant.to_owned(),
            action: action.to_owned(),
            identifier: identifier.to_owned(),
        })
    }

    // ── scan patterns ────────────────────────────────────────────────

    /// Every user record of a tenant.
    pub fn user_pattern(&self, tenant: &str) -> String {
        format!(
            "{}:{}:*",
            literal(tenant),
            escape_glob(&self.prefixes.user)
        )
    }

    /// Every row of one table.
    pub fn table_pattern(&self, tenant: &str, table_name: &str) -> String {
        format!(
            "{}:{}:{}:{}:*",
            literal(tenant),
            escape_glob(&self.prefixes.table),
            literal(table_name),
            escape_glob(&self.prefixes.pkid)
        )
    }

    /// Rows sharing one primary key across all tables of a tenant.
    pub fn pkid_pattern(&self, tenant: &str, pkid: &str) -> String {
        format!(
            "{}:{}:*:{}:{}",
            literal(tenant),
            escape_glob(&self.prefixes.table),
            escape_glob(&self.prefixes.pkid),
            literal(pkid)
        )
    }

    /// Triggers of any action that share one identifier.
    pub fn trigger_pattern(&self, tenant: &str, identifier: &str) -> String {
        format!(
            "{}:{}:*:{}",
            literal(tenant),
            escape_glob(&self.prefixes.trigger),
            literal(identifier)
        )
    }
}

// ── partitions ───────────────────────────────────────────────────────

/// Storage partition for records that belong to one (tenant, user) pair.
///
/// Memory and file backends group records by partition; the file backend
/// maps each partition to one document on disk.
pub fn context_partition(tenant: &str, user_id: &str) -> String {
    format!("{}_{}", sanitize(tenant), sanitize(user_id))
}

/// Storage partition for all table rows of a tenant.
pub fn table_partition(tenant: &str) -> String {
    format!("{}_tables", sanitize(tenant))
}

/// Storage partition for all expiry triggers of a tenant.
pub fn trigger_partition(tenant: &str) -> String {
    format!("{}_triggers", sanitize(tenant))
}

// ── segment helpers ──────────────────────────────────────────────────

/// Replace the key separator inside a caller-supplied segment.
pub fn sanitize(segment: &str) -> String {
    segment.replace(SEPARATOR, "_")
}

/// Escape glob metacharacters so `value` only matches itself.
pub fn escape_glob(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn literal(segment: &str) -> String {
    escape_glob(&sanitize(segment))
}

fn wildcard_or_literal(segment: &str) -> String {
    if segment == WILDCARD {
        WILDCARD.to_owned()
    } else {
        literal(segment)
    }
}
