//! The TOML configuration surface: a listener spec, a set of named TSIG
//! keys, and per-zone ACLs, parsed with `serde` rather than against a
//! hand-written grammar.

use std::collections::HashMap;
use std::net::IpAddr;

use camino::Utf8PathBuf;
use serde::Deserialize;

use crate::acl::{AclEntry, RangeKind};
use crate::tsig::registry::AlgorithmName;

//----------- Config -----------------------------------------------------------

/// The daemon's full configuration, as loaded from a single TOML file.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Where the per-zone transfer journals (`<zone>.xfrd`) are kept.
    pub journal_dir: Utf8PathBuf,

    /// Path to the Unix-domain control socket.
    #[serde(default = "default_control_socket")]
    pub control_socket: Utf8PathBuf,

    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(rename = "tsig_key", default)]
    pub tsig_keys: Vec<TsigKeyConfig>,

    #[serde(rename = "zone", default)]
    pub zones: Vec<ZoneConfig>,
}

fn default_control_socket() -> Utf8PathBuf {
    Utf8PathBuf::from("/run/xferd/control.sock")
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::Parse)
    }

    /// Build a lookup table from TSIG key name to its config entry.
    pub fn tsig_key_by_name(&self) -> HashMap<String, &TsigKeyConfig> {
        self.tsig_keys
            .iter()
            .map(|k| (k.name.to_ascii_lowercase(), k))
            .collect()
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Parse(e) => Some(e),
        }
    }
}

//----------- ListenConfig ------------------------------------------------------

/// The set of addresses the outbound AXFR/IXFR server binds to.
///
/// Each address is bound independently (see the data model's note on
/// mixed-family binding); a bind failure on one address does not fall
/// back to another family, it is logged and that address is excluded.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListenConfig {
    #[serde(default)]
    pub addrs: Vec<std::net::SocketAddr>,
}

//----------- LoggingConfig -----------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    File(Utf8PathBuf),
    Syslog,
    Stdout,
    Stderr,
}

impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Stderr
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub target: LogTarget,

    #[serde(default)]
    pub trace_targets: Vec<String>,
}

//----------- TsigKeyConfig ------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct TsigKeyConfig {
    /// The key's owner name, e.g. `"example-key."`.
    pub name: String,

    /// One of `hmac-md5`, `hmac-sha1`, `hmac-sha256`.
    pub algorithm: String,

    /// Base64-encoded secret.
    pub secret: String,
}

//----------- ZoneConfig ---------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct ZoneConfig {
    pub name: String,

    /// Masters to pull transfers from, in the order they should be tried.
    #[serde(default)]
    pub request_xfr_from: Vec<std::net::SocketAddr>,

    /// The TSIG key name to sign outgoing / verify incoming requests with,
    /// when pulling from `request_xfr_from`.
    pub request_xfr_tsig: Option<String>,

    /// Addresses allowed to send this zone a NOTIFY.
    #[serde(default)]
    pub allow_notify_from: Vec<AclAddrConfig>,

    /// Addresses allowed to AXFR/IXFR this zone from us.
    #[serde(default)]
    pub provide_xfr_to: Vec<AclAddrConfig>,

    /// Addresses we send a NOTIFY to when the zone's content changes.
    #[serde(default)]
    pub do_notify_to: Vec<std::net::SocketAddr>,
}

/// A single ACL entry as written in configuration: either a bare address, a
/// `addr/prefixlen` subnet, or the literal wildcard `"*"`, optionally
/// suffixed with `key <name>` to require that address present a verified
/// TSIG signed with the named key (resolved against `[[tsig_key]]` once the
/// whole file is loaded; see [`resolve_acl_tsig_algorithms`]).
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "String")]
pub struct AclAddrConfig {
    pub entry: AclEntry,
}

impl TryFrom<String> for AclAddrConfig {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (addr_part, key_name) = match s.split_once(" key ") {
            Some((addr_part, key_name)) => (addr_part.trim(), Some(key_name.trim())),
            None => (s.trim(), None),
        };

        let mut entry = if addr_part == "*" {
            AclEntry::wildcard()
        } else if let Some((addr, prefix)) = addr_part.split_once('/') {
            let addr: IpAddr = addr.parse().map_err(|_| format!("bad address in {s:?}"))?;
            let prefix: u8 = prefix.parse().map_err(|_| format!("bad prefix in {s:?}"))?;
            AclEntry::subnet(addr, prefix).map_err(|e| e.to_string())?
        } else {
            let addr: IpAddr = addr_part.parse().map_err(|_| format!("bad address {s:?}"))?;
            AclEntry::single(addr)
        };

        if let Some(key_name) = key_name {
            if key_name.is_empty() {
                return Err(format!("empty key name in {s:?}"));
            }
            entry = entry.with_tsig_key_name(key_name);
        }

        Ok(AclAddrConfig { entry })
    }
}

/// Resolve every ACL entry's `key <name>` reference (if any) to the
/// algorithm the named key is registered under, mirroring `acl.c`'s
/// `acl_create`, which looks up the named key once at config-load time
/// rather than at every match. Entries naming an unregistered key are left
/// with no algorithm pinned, so [`AclEntry::matches`] still requires the key
/// name but can't also pin a now-nonexistent algorithm; the caller is
/// expected to have already validated every referenced name exists.
///
/// The algorithm is stored in its canonical wire-form name (matching
/// [`crate::acl::VerifiedTsig::algorithm_name`], which always carries one)
/// rather than verbatim from `TsigKeyConfig::algorithm`, since config
/// accepts either form (`"hmac-sha256"` or `"hmac-sha256."`) but a verified
/// TSIG's algorithm name is always wire-form.
pub fn resolve_acl_tsig_algorithms(acls: &mut [AclAddrConfig], keys: &HashMap<String, &TsigKeyConfig>) {
    for acl in acls {
        if let Some(key_name) = &acl.entry.tsig_key_name {
            if let Some(key) = keys.get(&key_name.to_ascii_lowercase()) {
                if let Some(algorithm) = AlgorithmName::parse(&key.algorithm) {
                    acl.entry = acl.entry.clone().with_tsig_algorithm(algorithm.wire_name());
                }
            }
        }
    }
}

// Keep `RangeKind` reachable from the config module's docs without an
// unused-import warning when no config file exercises every kind.
#[allow(unused_imports)]
use RangeKind as _RangeKindDocLink;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let cfg = Config::from_toml_str(
            r#"
            journal_dir = "/var/lib/xferd/journal"

            [[tsig_key]]
            name = "example-key."
            algorithm = "hmac-sha256"
            secret = "c2VjcmV0"

            [[zone]]
            name = "example.com."
            request_xfr_from = ["192.0.2.1:53"]
            request_xfr_tsig = "example-key."
            allow_notify_from = ["192.0.2.1"]
            provide_xfr_to = ["192.0.2.0/24", "*"]
            do_notify_to = ["192.0.2.53:53"]
            "#,
        )
        .unwrap();

        assert_eq!(cfg.zones.len(), 1);
        assert_eq!(cfg.zones[0].provide_xfr_to.len(), 2);
        assert_eq!(cfg.tsig_key_by_name().len(), 1);
    }

    #[test]
    fn acl_entry_parses_an_optional_tsig_key_reference() {
        let cfg = Config::from_toml_str(
            r#"
            journal_dir = "/var/lib/xferd/journal"

            [[tsig_key]]
            name = "example-key."
            algorithm = "hmac-sha256"
            secret = "c2VjcmV0"

            [[zone]]
            name = "example.com."
            provide_xfr_to = ["192.0.2.1 key example-key.", "*"]
            "#,
        )
        .unwrap();

        let keyed = &cfg.zones[0].provide_xfr_to[0].entry;
        assert_eq!(keyed.tsig_key_name.as_deref(), Some("example-key."));
        assert!(cfg.zones[0].provide_xfr_to[1].entry.tsig_key_name.is_none());

        let mut acls = cfg.zones[0].provide_xfr_to.clone();
        resolve_acl_tsig_algorithms(&mut acls, &cfg.tsig_key_by_name());
        assert_eq!(acls[0].entry.tsig_algorithm_name.as_deref(), Some("hmac-sha256."));
    }
}
