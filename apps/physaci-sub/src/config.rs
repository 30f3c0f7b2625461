//! Configuration resolution for the subscriber.
//!
//! Configuration lives in an operator-edited INI file at a fixed path. The
//! primary file may name a second file via `[local] config_file`; values from
//! that override file win for the `physaci` and `node_server` sections, while
//! `local.*` keys always come from the primary. The signing key is written
//! back with a line-level patch so operator comments and formatting survive.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use url::Url;

/// Fixed location of the operator-managed configuration file.
pub const PRIMARY_CONFIG_PATH: &str = "/etc/opt/physaci_sub/conf.ini";

/// Section assigned to keys that appear before any `[section]` header.
const DEFAULT_SECTION: &str = "local";

/// Sections an override file may supply; anything else in it is ignored.
const OVERRIDE_SECTIONS: [&str; 2] = ["physaci", "node_server"];

const SIG_KEY_SECTION: &str = "node_server";
const SIG_KEY: &str = "node_sig_key";

/// Only lines that begin exactly with this prefix are rewritten by
/// [`ConfigResolver::persist`].
const SIG_KEY_LINE_PREFIX: &str = "node_sig_key=";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing configuration value [{section}] {key}")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("invalid configuration value [{section}] {key}: {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        reason: String,
    },
    #[error("failed to rewrite {path:?}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Validated snapshot of the merged configuration, taken at load time so a
/// bad file fails the run before any network traffic.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_port: u16,
    pub registrar_url: Url,
    pub api_key: String,
    /// Empty when the node has not been issued a signing key yet.
    pub node_sig_key: String,
}

/// Parsed `section -> key -> value` view of one or more INI files.
#[derive(Debug, Clone, Default)]
struct IniValues {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniValues {
    fn parse(raw: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = DEFAULT_SECTION.to_string();
        for line in raw.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }
            if let Some(name) = trimmed
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                current = name.trim().to_string();
                continue;
            }
            // Bare keys without `=value` are legal and read as the empty string.
            let (key, value) = match trimmed.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (trimmed, ""),
            };
            if key.is_empty() {
                continue;
            }
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.to_string(), value.to_string());
        }
        Self { sections }
    }

    fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|keys| keys.get(key))
            .map(String::as_str)
    }

    /// Lays `overrides` on top of `self`, restricted to [`OVERRIDE_SECTIONS`].
    fn merge_overrides(&mut self, overrides: &IniValues) {
        for section in OVERRIDE_SECTIONS {
            let Some(keys) = overrides.sections.get(section) else {
                continue;
            };
            let target = self.sections.entry(section.to_string()).or_default();
            for (key, value) in keys {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    fn set(&mut self, section: &str, key: &str, value: &str) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }
}

/// Loads the layered configuration and owns writes back to whichever file
/// holds the signing key.
#[derive(Debug)]
pub struct ConfigResolver {
    primary_path: PathBuf,
    secondary_path: Option<PathBuf>,
    values: IniValues,
    /// True when the override file supplied a non-empty signing key at load
    /// time; decides which file [`Self::persist`] rewrites.
    sig_key_in_secondary: bool,
}

impl ConfigResolver {
    /// Loads from an explicit primary path, [`PRIMARY_CONFIG_PATH`] in
    /// production. An unreadable primary leaves the configuration empty;
    /// later lookups then fail with [`ConfigError::MissingKey`].
    pub fn load_from(primary_path: PathBuf) -> Self {
        let mut resolver = Self {
            primary_path,
            secondary_path: None,
            values: IniValues::default(),
            sig_key_in_secondary: false,
        };

        let raw = match fs::read_to_string(&resolver.primary_path) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(
                    path = %resolver.primary_path.display(),
                    error = %err,
                    "could not read physaci_sub configuration"
                );
                return resolver;
            }
        };
        resolver.values = IniValues::parse(&raw);

        let Some(secondary) = resolver.override_path() else {
            return resolver;
        };
        match fs::read_to_string(&secondary) {
            Ok(raw) => {
                let overrides = IniValues::parse(&raw);
                resolver.sig_key_in_secondary = overrides
                    .get(SIG_KEY_SECTION, SIG_KEY)
                    .is_some_and(|key| !key.is_empty());
                resolver.values.merge_overrides(&overrides);
            }
            Err(err) => {
                tracing::warn!(
                    path = %secondary.display(),
                    error = %err,
                    "could not read alternate physaci_sub configuration; keeping primary values"
                );
            }
        }
        resolver.secondary_path = Some(secondary);
        resolver
    }

    /// Override file named by the primary, unless it resolves back to the
    /// primary itself.
    fn override_path(&self) -> Option<PathBuf> {
        let configured = self.values.get(DEFAULT_SECTION, "config_file")?;
        if configured.is_empty() {
            return None;
        }
        let configured = PathBuf::from(configured);
        if same_file(&configured, &self.primary_path) {
            return None;
        }
        Some(configured)
    }

    /// Validates the merged view into a [`NodeConfig`]. Every required key is
    /// checked here so misconfiguration surfaces before first use.
    pub fn resolve(&self) -> Result<NodeConfig, ConfigError> {
        let port_raw = self.require(SIG_KEY_SECTION, "listen_port")?;
        let listen_port = port_raw
            .parse::<u16>()
            .map_err(|err| ConfigError::InvalidValue {
                section: SIG_KEY_SECTION,
                key: "listen_port",
                reason: format!("{port_raw:?}: {err}"),
            })?;

        let url_raw = self.require(DEFAULT_SECTION, "physaci_registrar_url")?;
        let registrar_url = Url::parse(url_raw).map_err(|err| ConfigError::InvalidValue {
            section: DEFAULT_SECTION,
            key: "physaci_registrar_url",
            reason: format!("{url_raw:?}: {err}"),
        })?;

        let api_key = self.require("physaci", "api_access_key")?.to_string();
        // An empty signing key is legal (fresh node); a missing one is not.
        let node_sig_key = self.require(SIG_KEY_SECTION, SIG_KEY)?.to_string();

        Ok(NodeConfig {
            listen_port,
            registrar_url,
            api_key,
            node_sig_key,
        })
    }

    fn require(&self, section: &'static str, key: &'static str) -> Result<&str, ConfigError> {
        self.values
            .get(section, key)
            .ok_or(ConfigError::MissingKey { section, key })
    }

    /// Replaces the signing key in memory only. Nothing touches disk until
    /// [`Self::persist`] runs.
    pub fn set_node_sig_key(&mut self, value: &str) {
        self.values.set(SIG_KEY_SECTION, SIG_KEY, value);
    }

    /// File [`Self::persist`] will rewrite: the override file when it owned a
    /// non-empty signing key at load time, the primary file otherwise.
    pub fn target_path(&self) -> &Path {
        if self.sig_key_in_secondary {
            self.secondary_path
                .as_deref()
                .unwrap_or(&self.primary_path)
        } else {
            &self.primary_path
        }
    }

    /// Writes the in-memory signing key back to [`Self::target_path`],
    /// touching only `node_sig_key=` lines so operator comments and layout
    /// survive. Read or write failures are loud; silently dropping a freshly
    /// registered key would strand the node.
    pub fn persist(&self) -> Result<(), ConfigError> {
        let target = self.target_path().to_path_buf();
        let key = self.values.get(SIG_KEY_SECTION, SIG_KEY).unwrap_or("");
        let original = fs::read_to_string(&target).map_err(|source| ConfigError::Persist {
            path: target.clone(),
            source,
        })?;
        let patched = patch_sig_key_lines(&original, key);
        fs::write(&target, patched).map_err(|source| ConfigError::Persist {
            path: target,
            source,
        })?;
        Ok(())
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Rewrites the value of every `node_sig_key=` line, leaving all other lines
/// (and every line terminator) byte-identical.
fn patch_sig_key_lines(original: &str, key: &str) -> String {
    let mut patched = String::with_capacity(original.len() + key.len());
    for line in original.split_inclusive('\n') {
        let (content, terminator) = match line.strip_suffix("\r\n") {
            Some(content) => (content, "\r\n"),
            None => match line.strip_suffix('\n') {
                Some(content) => (content, "\n"),
                None => (line, ""),
            },
        };
        if content.starts_with(SIG_KEY_LINE_PREFIX) {
            patched.push_str(SIG_KEY_LINE_PREFIX);
            patched.push_str(key);
            patched.push_str(terminator);
        } else {
            patched.push_str(line);
        }
    }
    patched
}
