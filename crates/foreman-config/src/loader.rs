// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/foreman/config.yaml"));
    paths.push(PathBuf::from("/etc/foreman/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/foreman/config.yaml"));
        paths.push(home.join(".config/foreman/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("foreman/config.yaml"));
        paths.push(cfg.join("foreman/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".foreman/config.yaml"));
    paths.push(PathBuf::from(".foreman/config.yml"));
    paths.push(PathBuf::from("foreman.yaml"));
    paths.push(PathBuf::from("foreman.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment overrides. The `extra` argument may provide an explicit path
/// (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).context("invalid configuration")?
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// The six deployment inputs accepted as environment variables. These win
/// over every file layer.
fn apply_env_overrides(
    config: &mut Config,
    get: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<()> {
    if let Some(v) = get("LISTEN_PORT") {
        config.proxy.listen_port = v.parse().context("LISTEN_PORT must be a port number")?;
    }
    if let Some(v) = get("UPSTREAM_HOST") {
        config.upstream.host = v;
    }
    if let Some(v) = get("UPSTREAM_PORT") {
        config.upstream.port = v.parse().context("UPSTREAM_PORT must be a port number")?;
    }
    if let Some(v) = get("TOKEN_SECRET") {
        config.token.secret = v;
    }
    if let Some(v) = get("TOKEN_TTL_HOURS") {
        config.token.ttl_hours = v.parse().context("TOKEN_TTL_HOURS must be an integer")?;
    }
    if let Some(v) = get("STORE_URI") {
        config.store.uri = v;
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = val("proxy:\n  listen_host: 0.0.0.0\n  listen_port: 6380");
        let src = val("proxy:\n  listen_port: 7000");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["proxy"]["listen_host"].as_str(), Some("0.0.0.0"));
        assert_eq!(dst["proxy"]["listen_port"].as_i64(), Some(7000));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/foreman_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "upstream:\n  host: redis.internal\n  port: 6390").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.upstream.host, "redis.internal");
        assert_eq!(cfg.upstream.port, 6390);
    }

    #[test]
    fn env_overrides_win_over_defaults() {
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg, |name| match name {
            "LISTEN_PORT" => Some("6400".into()),
            "UPSTREAM_HOST" => Some("store.internal".into()),
            "TOKEN_SECRET" => Some("s3cr3t".into()),
            "TOKEN_TTL_HOURS" => Some("12".into()),
            "STORE_URI" => Some("memory://".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.proxy.listen_port, 6400);
        assert_eq!(cfg.upstream.host, "store.internal");
        assert_eq!(cfg.token.secret, "s3cr3t");
        assert_eq!(cfg.token.ttl_hours, 12);
    }

    #[test]
    fn invalid_env_port_is_a_config_error() {
        let mut cfg = Config::default();
        let err = apply_env_overrides(&mut cfg, |name| {
            (name == "LISTEN_PORT").then(|| "not-a-port".to_string())
        });
        assert!(err.is_err());
    }
}
