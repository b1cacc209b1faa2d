use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::anyhow;
use config::{Config, File};
use once_cell::sync::OnceCell;
use serde::de::{self, Deserializer};
use serde::Deserialize;

use crate::types::HashMap;
use crate::Result;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub cookie: Cookie,
    #[serde(default)]
    pub auth: Auth,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rwamp/rwamp").required(false))
            .add_source(File::with_name("rwamp").required(false))
            .add_source(config::Environment::with_prefix("rwamp").try_parsing(true));

        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        let inner: Inner = builder.build()?.try_deserialize()?;
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(cfg_name: Option<&str>) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(cfg_name)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default = "Log::level_default")]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
}

impl Default for Log {
    #[inline]
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Self::level_default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
        }
    }
}

impl Log {
    #[inline]
    fn to_default() -> To {
        To::Console
    }
    #[inline]
    fn level_default() -> Level {
        Level { inner: slog::Level::Info }
    }
    #[inline]
    fn dir_default() -> String {
        "/var/log/rwamp".into()
    }
    #[inline]
    fn file_default() -> String {
        "rwamp.log".into()
    }
    #[inline]
    pub fn filename(&self) -> String {
        let file = &self.file;
        if file.is_empty() {
            return "".into();
        }
        if self.dir.is_empty() {
            return file.to_owned();
        }
        let dir = self.dir.trim_end_matches(['/', '\\']);
        format!("{dir}/{file}")
    }
}

#[derive(Debug, Clone, Copy)]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }
    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }
    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

impl<'de> Deserialize<'de> for To {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let to = match (String::deserialize(deserializer)?).to_ascii_lowercase().as_str() {
            "off" => To::Off,
            "file" => To::File,
            "console" => To::Console,
            "both" => To::Both,
            _ => To::Both,
        };
        Ok(to)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Level {
    inner: slog::Level,
}

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.inner
    }
}

impl Deref for Level {
    type Target = slog::Level;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'de> Deserialize<'de> for Level {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level = String::deserialize(deserializer)?;
        let inner = slog::Level::from_str(&level)
            .map_err(|_| de::Error::custom(format!("invalid log level: {}", level)))?;
        Ok(Level { inner })
    }
}

/// Tracking-cookie parameters. The cookie carries a random ID only; all
/// attached state lives in the store.
#[derive(Debug, Clone, Deserialize)]
pub struct Cookie {
    #[serde(default = "Cookie::name_default")]
    pub name: String,
    #[serde(default = "Cookie::length_default")]
    pub length: usize,
    /// Cookie lifetime in seconds (RFC 6265 max-age).
    #[serde(default = "Cookie::max_age_default")]
    pub max_age: u64,
    /// Path of the cookie persistence file. Empty keeps the store in memory.
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub purge_on_startup: bool,
}

impl Default for Cookie {
    #[inline]
    fn default() -> Self {
        Self {
            name: Self::name_default(),
            length: Self::length_default(),
            max_age: Self::max_age_default(),
            file: String::new(),
            purge_on_startup: false,
        }
    }
}

impl Cookie {
    #[inline]
    fn name_default() -> String {
        "cbtid".into()
    }
    #[inline]
    fn length_default() -> usize {
        24
    }
    #[inline]
    fn max_age_default() -> u64 {
        86400 * 7
    }
}

/// Per-method authentication configuration. A method is enabled for the
/// node by giving it a section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Auth {
    #[serde(default)]
    pub wampcra: Option<CraConfig>,
    #[serde(default)]
    pub ticket: Option<TicketConfig>,
    #[serde(default)]
    pub cryptosign: Option<CryptosignConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CraConfig {
    Static {
        #[serde(default)]
        users: HashMap<String, CraPrincipal>,
        #[serde(default)]
        default_role: Option<String>,
    },
    Dynamic {
        authenticator: String,
        #[serde(default)]
        authenticator_realm: Option<String>,
    },
}

/// A WAMP-CRA principal. When `salt` is set the stored secret is the
/// PBKDF2-derived key and the salt parameters are forwarded to the client
/// in the challenge extra.
#[derive(Debug, Clone, Deserialize)]
pub struct CraPrincipal {
    pub secret: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub keylen: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TicketConfig {
    Static {
        #[serde(default)]
        principals: HashMap<String, TicketPrincipal>,
        #[serde(default)]
        default_role: Option<String>,
    },
    Dynamic {
        authenticator: String,
        #[serde(default)]
        authenticator_realm: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketPrincipal {
    pub ticket: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CryptosignConfig {
    Static {
        #[serde(default)]
        principals: HashMap<String, CryptosignPrincipal>,
        #[serde(default)]
        default_role: Option<String>,
    },
    Dynamic {
        authenticator: String,
        #[serde(default)]
        authenticator_realm: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CryptosignPrincipal {
    /// Hex-encoded Ed25519 public keys accepted for this principal.
    pub authorized_keys: Vec<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let inner: Inner = Config::builder().build().unwrap().try_deserialize().unwrap();
        assert_eq!(inner.cookie.name, "cbtid");
        assert_eq!(inner.cookie.length, 24);
        assert_eq!(inner.cookie.max_age, 86400 * 7);
        assert!(!inner.cookie.purge_on_startup);
        assert!(inner.auth.wampcra.is_none());
        assert_eq!(inner.log.level.inner(), slog::Level::Info);
    }

    #[test]
    fn test_auth_sections() {
        let toml = r#"
            [auth.wampcra]
            type = "static"
            [auth.wampcra.users.joe]
            secret = "secret2"
            role = "frontend"

            [auth.ticket]
            type = "dynamic"
            authenticator = "com.example.authenticate"
        "#;
        let inner: Inner = Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        match inner.auth.wampcra.unwrap() {
            CraConfig::Static { users, .. } => {
                assert_eq!(users.get("joe").unwrap().secret, "secret2");
                assert_eq!(users.get("joe").unwrap().role.as_deref(), Some("frontend"));
            }
            CraConfig::Dynamic { .. } => panic!("expected static config"),
        }
        match inner.auth.ticket.unwrap() {
            TicketConfig::Dynamic { authenticator, authenticator_realm } => {
                assert_eq!(authenticator, "com.example.authenticate");
                assert!(authenticator_realm.is_none());
            }
            TicketConfig::Static { .. } => panic!("expected dynamic config"),
        }
    }

    #[test]
    fn test_log_filename() {
        let log = Log { dir: "/var/log/rwamp/".into(), file: "rwamp.log".into(), ..Default::default() };
        assert_eq!(log.filename(), "/var/log/rwamp/rwamp.log");
        let log = Log { dir: "".into(), file: "rwamp.log".into(), ..Default::default() };
        assert_eq!(log.filename(), "rwamp.log");
    }
}
