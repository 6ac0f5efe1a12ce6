// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Machine fingerprinting for volunteer deduplication.
//!
//! A node that reinstalls or renames itself should not register a second
//! volunteer row. The fingerprint is a stable tuple of hardware attributes;
//! a returning machine is recognised when the primary attributes alone give
//! a unique hit (at least [`PRIMARY_THRESHOLD`] of them matching), or when
//! primary plus secondary attributes do.

use serde_json::{Map, Value};
use uuid::Uuid;

use foreman_store::Volunteer;

/// Primary attributes; a candidate needs at least this many equal to count
/// as a primary hit.
pub const PRIMARY_THRESHOLD: usize = 3;

const PRIMARY_KEYS: &[&str] = &[
    "cpu_model",
    "cpu_cores",
    "os_architecture",
    "total_ram_mb",
    "available_storage_gb",
];

const SECONDARY_KEYS: &[&str] = &[
    "hostname",
    "operating_system",
    "cpu_max_frequency",
    "bios_id",
    "motherboard_id",
];

/// Build the fingerprint map from a registration payload.
///
/// Flat keys are read from the payload itself; the optional `machine_info`
/// object supplies the nested details (`os.architecture`,
/// `cpu.max_frequency`, BIOS/motherboard identifiers, hostname).
pub fn extract(data: &Map<String, Value>) -> Map<String, Value> {
    let mut fp = Map::new();
    for key in ["cpu_model", "cpu_cores", "total_ram_mb", "available_storage_gb", "operating_system"]
    {
        if let Some(v) = data.get(key) {
            fp.insert(key.to_string(), v.clone());
        }
    }

    if let Some(v) = nested(data, &["machine_info", "os", "architecture"]) {
        fp.insert("os_architecture".into(), v.clone());
    }
    if let Some(v) = nested(data, &["machine_info", "hostname"]) {
        fp.insert("hostname".into(), v.clone());
    }
    if let Some(v) = nested(data, &["machine_info", "cpu", "max_frequency"]) {
        fp.insert("cpu_max_frequency".into(), v.clone());
    }
    if let Some(v) = nested(data, &["machine_info", "bios", "serial_number"]) {
        fp.insert("bios_id".into(), v.clone());
    }
    if let Some(v) = nested(data, &["machine_info", "motherboard", "serial_number"]) {
        fp.insert("motherboard_id".into(), v.clone());
    }
    fp
}

fn nested<'a>(data: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let mut current: &Value = data.get(path[0])?;
    for key in &path[1..] {
        current = current.get(key)?;
    }
    Some(current)
}

/// Find the volunteer row this fingerprint belongs to, if any.
pub fn find_match(fingerprint: &Map<String, Value>, volunteers: &[Volunteer]) -> Option<Uuid> {
    let primary_hits: Vec<&Volunteer> = volunteers
        .iter()
        .filter(|v| key_matches(fingerprint, v, PRIMARY_KEYS) >= PRIMARY_THRESHOLD)
        .collect();
    if primary_hits.len() == 1 {
        return Some(primary_hits[0].id);
    }

    // Primary alone was ambiguous or insufficient: bring in the secondary
    // attributes and require at least one of them to contribute.
    let combined_hits: Vec<&Volunteer> = volunteers
        .iter()
        .filter(|v| {
            let secondary = key_matches(fingerprint, v, SECONDARY_KEYS) + hostname_match(fingerprint, v);
            secondary > 0 && key_matches(fingerprint, v, PRIMARY_KEYS) + secondary >= PRIMARY_THRESHOLD
        })
        .collect();
    if combined_hits.len() == 1 {
        return Some(combined_hits[0].id);
    }
    None
}

fn key_matches(fingerprint: &Map<String, Value>, volunteer: &Volunteer, keys: &[&str]) -> usize {
    keys.iter()
        .filter(|key| {
            matches!(
                (fingerprint.get(**key), volunteer.machine_fingerprint.get(**key)),
                (Some(a), Some(b)) if a == b
            )
        })
        .count()
}

/// The hostname attribute matches when it is contained in the stored
/// volunteer name; machines commonly register as `<hostname>_<node id>`.
fn hostname_match(fingerprint: &Map<String, Value>, volunteer: &Volunteer) -> usize {
    match fingerprint.get("hostname").and_then(|v| v.as_str()) {
        Some(host) if !host.is_empty() && volunteer.name.contains(host) => 1,
        _ => 0,
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
