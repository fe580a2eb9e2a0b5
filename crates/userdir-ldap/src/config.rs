//! Delegate configuration.
//!
//! The configuration is replaced wholesale by an edit; persistence of the
//! resulting value is the host application's concern.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How operations resolve their bind identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BindMode {
    /// Every operation binds with the configured service account
    ServiceAccount,
    /// Operations bind as the calling principal unless an explicit
    /// override is supplied with the call
    PassThroughCaller,
}

/// Object classes accepted either as an explicit list or as a
/// comma-separated string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectClasses {
    /// Explicit list of class names
    List(Vec<String>),
    /// Comma-separated class names, e.g. `"top,person"`
    CommaSeparated(String),
}

impl ObjectClasses {
    /// Normalizes to a list of trimmed class names.
    #[must_use]
    pub fn into_list(self) -> Vec<String> {
        match self {
            Self::List(classes) => classes,
            Self::CommaSeparated(text) => text
                .split(',')
                .map(|class| class.trim().to_string())
                .collect(),
        }
    }
}

/// Recognized options on a configuration edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateSettings {
    /// Attribute users log in with
    pub login_attr: String,
    /// Base DN for user records
    pub users_base: String,
    /// Attribute forming the RDN of user records
    pub rdn_attr: String,
    /// Object classes for inserted records
    pub object_classes: ObjectClasses,
    /// Service account bind DN
    pub bind_dn: String,
    /// Service account bind password
    #[serde(skip_serializing)]
    pub bind_pwd: SecretString,
    /// Bind identity resolution mode
    pub bind_mode: BindMode,
    /// Refuse insert, delete and modify without contacting the server
    pub read_only: bool,
}

/// Active delegate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateConfig {
    login_attr: String,
    base_dn: String,
    rdn_attr: String,
    object_classes: Vec<String>,
    bind_dn: String,
    #[serde(skip_serializing)]
    bind_pwd: SecretString,
    bind_mode: BindMode,
    read_only: bool,
}

impl DelegateConfig {
    /// Builds a configuration from edit settings, replacing any previous
    /// state wholesale.
    #[must_use]
    pub fn from_settings(settings: DelegateSettings) -> Self {
        Self {
            login_attr: settings.login_attr,
            base_dn: settings.users_base,
            rdn_attr: settings.rdn_attr,
            object_classes: settings.object_classes.into_list(),
            bind_dn: settings.bind_dn,
            bind_pwd: settings.bind_pwd,
            bind_mode: settings.bind_mode,
            read_only: settings.read_only,
        }
    }

    /// Returns the login attribute.
    #[must_use]
    pub fn login_attr(&self) -> &str {
        &self.login_attr
    }

    /// Returns the base DN searches run against.
    #[must_use]
    pub fn base_dn(&self) -> &str {
        &self.base_dn
    }

    /// Returns the RDN attribute for user records.
    #[must_use]
    pub fn rdn_attr(&self) -> &str {
        &self.rdn_attr
    }

    /// Returns the object classes for inserted records.
    #[must_use]
    pub fn object_classes(&self) -> &[String] {
        &self.object_classes
    }

    /// Returns the service account bind DN.
    #[must_use]
    pub fn bind_dn(&self) -> &str {
        &self.bind_dn
    }

    /// Returns the service account bind password.
    #[must_use]
    pub fn bind_pwd(&self) -> &str {
        self.bind_pwd.expose_secret()
    }

    /// Returns the bind identity resolution mode.
    #[must_use]
    pub const fn bind_mode(&self) -> BindMode {
        self.bind_mode
    }

    /// Returns true when write operations are disabled.
    #[must_use]
    pub const fn read_only(&self) -> bool {
        self.read_only
    }
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            login_attr: "cn".to_string(),
            base_dn: String::new(),
            rdn_attr: "cn".to_string(),
            object_classes: vec!["top".to_string(), "person".to_string()],
            bind_dn: String::new(),
            bind_pwd: SecretString::from(String::new()),
            bind_mode: BindMode::ServiceAccount,
            read_only: false,
        }
    }
}

/// TLS options applied to `ldaps` connections.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip certificate verification when false
    pub verify: bool,
    /// Custom CA certificate path
    pub ca_cert: Option<PathBuf>,
}

impl TlsOptions {
    /// Creates options with verification enabled and no custom CA.
    #[must_use]
    pub fn new() -> Self {
        Self {
            verify: true,
            ca_cert: None,
        }
    }

    /// Enables or disables certificate verification.
    #[must_use]
    pub const fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Sets a custom CA certificate path.
    #[must_use]
    pub fn with_ca_cert(mut self, path: PathBuf) -> Self {
        self.ca_cert = Some(path);
        self
    }
}
