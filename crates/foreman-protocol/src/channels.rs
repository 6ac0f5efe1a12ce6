// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Channel registry and publish-time access control.
//!
//! Channels fall into three disjoint sets — open, manager-only, and
//! volunteer-only — plus an implicit pass-through set for anything not in
//! the catalogue. A trailing `*` or `#` marks a prefix pattern
//! (`coord/heartbeat/*` matches `coord/heartbeat/node-7`).
//!
//! Access is enforced on **publish** only. Stopping a client from writing
//! into a role-restricted channel is what prevents role forgery;
//! subscription stays permissive so any party may listen where the
//! deployment allows it.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Roles ─────────────────────────────────────────────────────────────────────

/// Authenticated role carried inside bearer tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Manager,
    Volunteer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Manager => "manager",
            Role::Volunteer => "volunteer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Role::Coordinator),
            "manager" => Ok(Role::Manager),
            "volunteer" => Ok(Role::Volunteer),
            _ => Err(()),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Which set a catalogued channel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Open,
    Manager,
    Volunteer,
}

/// The canonical list of channels and their publish rules.
#[derive(Debug, Clone)]
pub struct ChannelRegistry {
    open: Vec<&'static str>,
    manager: Vec<&'static str>,
    volunteer: Vec<&'static str>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self {
            open: vec![
                "auth/register",
                "auth/register_response",
                "auth/login",
                "auth/login_response",
                "auth/volunteer_register",
                "auth/volunteer_register_response",
                "auth/volunteer_login",
                "auth/volunteer_login_response",
                "coord/heartbeat/*",
                "coord/emergency",
                "task/assignment",
                "task/accept",
                "task/complete",
                "task/progress",
            ],
            manager: vec![
                "tasks/new",
                "tasks/assign",
                "tasks/status/*",
                "manager/status",
                "manager/requests",
                "workflow/submit",
                "workflow/submit_response",
                "task/reassignment",
                "task/reassignment/response",
            ],
            volunteer: vec![
                "volunteer/available",
                "volunteer/resources",
                "tasks/result/*",
                "volunteer/data",
                "task/status",
            ],
        }
    }
}

impl ChannelRegistry {
    /// Look a channel up in the catalogue. `None` means pass-through: not a
    /// channel this system manages.
    pub fn access_for(&self, channel: &str) -> Option<Access> {
        if self.open.iter().any(|e| entry_matches(e, channel)) {
            Some(Access::Open)
        } else if self.manager.iter().any(|e| entry_matches(e, channel)) {
            Some(Access::Manager)
        } else if self.volunteer.iter().any(|e| entry_matches(e, channel)) {
            Some(Access::Volunteer)
        } else {
            None
        }
    }

    /// Publish-time rule. Open channels accept anyone; role-restricted
    /// channels accept their role or the coordinator; uncatalogued channels
    /// accept only the coordinator.
    pub fn may_publish(&self, channel: &str, role: Option<Role>) -> bool {
        if role == Some(Role::Coordinator) {
            return true;
        }
        match self.access_for(channel) {
            Some(Access::Open) => true,
            Some(Access::Manager) => role == Some(Role::Manager),
            Some(Access::Volunteer) => role == Some(Role::Volunteer),
            None => false,
        }
    }

    /// Concrete (non-pattern) channel names, for bulk subscription.
    pub fn concrete_channels(&self) -> Vec<&'static str> {
        self.all_entries()
            .filter(|e| !is_pattern(e))
            .collect()
    }

    /// Pattern entries rewritten for `PSUBSCRIBE` (`coord/heartbeat/*`).
    pub fn pattern_channels(&self) -> Vec<String> {
        self.all_entries()
            .filter(|e| is_pattern(e))
            .map(|e| format!("{}*", pattern_prefix(e)))
            .collect()
    }

    fn all_entries(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.open
            .iter()
            .chain(self.manager.iter())
            .chain(self.volunteer.iter())
            .copied()
    }
}

/// A trailing `*` or `#` makes a registry entry a prefix pattern.
fn is_pattern(entry: &str) -> bool {
    entry.ends_with('*') || entry.ends_with('#')
}

fn pattern_prefix(entry: &str) -> &str {
    &entry[..entry.len() - 1]
}

fn entry_matches(entry: &str, channel: &str) -> bool {
    if is_pattern(entry) {
        channel.starts_with(pattern_prefix(entry))
    } else {
        entry == channel
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_channels_accept_anonymous_publish() {
        let reg = ChannelRegistry::default();
        assert!(reg.may_publish("auth/register", None));
        assert!(reg.may_publish("auth/login", None));
        assert!(reg.may_publish("coord/emergency", None));
    }

    #[test]
    fn heartbeat_pattern_matches_suffixes() {
        let reg = ChannelRegistry::default();
        assert_eq!(reg.access_for("coord/heartbeat/node-7"), Some(Access::Open));
        assert!(reg.may_publish("coord/heartbeat/node-7", None));
    }

    #[test]
    fn manager_channel_rejects_anonymous_and_volunteer() {
        let reg = ChannelRegistry::default();
        assert!(!reg.may_publish("tasks/new", None));
        assert!(!reg.may_publish("tasks/new", Some(Role::Volunteer)));
        assert!(reg.may_publish("tasks/new", Some(Role::Manager)));
    }

    #[test]
    fn volunteer_channel_rejects_manager() {
        let reg = ChannelRegistry::default();
        assert!(!reg.may_publish("task/status", Some(Role::Manager)));
        assert!(reg.may_publish("task/status", Some(Role::Volunteer)));
    }

    #[test]
    fn coordinator_publishes_anywhere() {
        let reg = ChannelRegistry::default();
        for ch in ["tasks/new", "task/status", "auth/register", "not/catalogued"] {
            assert!(reg.may_publish(ch, Some(Role::Coordinator)), "{ch}");
        }
    }

    #[test]
    fn uncatalogued_channel_is_pass_through() {
        let reg = ChannelRegistry::default();
        assert_eq!(reg.access_for("some/private/topic"), None);
        assert!(!reg.may_publish("some/private/topic", Some(Role::Manager)));
    }

    #[test]
    fn status_pattern_is_manager_restricted() {
        let reg = ChannelRegistry::default();
        assert_eq!(reg.access_for("tasks/status/42"), Some(Access::Manager));
    }

    #[test]
    fn concrete_and_pattern_split() {
        let reg = ChannelRegistry::default();
        let concrete = reg.concrete_channels();
        assert!(concrete.contains(&"workflow/submit"));
        assert!(!concrete.iter().any(|c| c.ends_with('*')));
        let patterns = reg.pattern_channels();
        assert!(patterns.iter().any(|p| p == "coord/heartbeat/*"));
    }

    #[test]
    fn role_string_round_trip() {
        for role in [Role::Coordinator, Role::Manager, Role::Volunteer] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("admin".parse::<Role>().is_err());
    }
}
