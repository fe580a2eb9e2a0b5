//! The delegate: search, insert, delete and modify against the directory.
//!
//! Operations never raise past this boundary. A search reports failures
//! inside its result value; the write operations return a message string
//! where the empty string means success. Referral errors are resolved
//! and retried exactly once per operation before being surfaced.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use userdir_core::{Error, IdentityProvider, Principal};
use uuid::Uuid;

use crate::attrs::{decode_values, encode_for_insert, split_binary_marker, AttrInput, AttrValue};
use crate::cache::{ResourceCache, SharedSession};
use crate::config::{DelegateConfig, DelegateSettings, TlsOptions};
use crate::connection::ConnectionManager;
use crate::dn::{clean_dn, clean_rdn, explode_dn};
use crate::server::{ServerDescriptor, ServerRegistry, Transport};
use crate::session::{
    AttributeChange, DirectoryConnector, LdapConnector, ModOp, RawEntry, SearchScope,
};
use crate::Result;

const READ_ONLY_INSERT: &str = "Running in read-only mode, insertion is disabled";
const READ_ONLY_DELETE: &str = "Running in read-only mode, deletion is disabled";
const READ_ONLY_MODIFY: &str = "Running in read-only mode, modification is disabled";

/// A single directory record returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// Distinguished name of the record
    pub dn: String,
    /// Attribute values, decoded to text where possible
    pub attrs: HashMap<String, Vec<AttrValue>>,
}

impl Record {
    /// Returns the first text value of the attribute, if present.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.attrs
            .get(attribute)
            .and_then(|values| values.first())
            .and_then(AttrValue::as_text)
    }

    /// Returns all values of the attribute.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[AttrValue]> {
        self.attrs.get(attribute).map(Vec::as_slice)
    }
}

/// Outcome of a search operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResult {
    /// Failure description; `None` on success
    pub error: Option<String>,
    /// Number of records returned
    pub count: usize,
    /// Records in server order
    pub records: Vec<Record>,
}

impl SearchResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            count: 0,
            records: Vec::new(),
        }
    }
}

/// The delegate interface; alternate directory backends implement this.
#[async_trait]
pub trait DirectoryDelegate: Send + Sync {
    /// Obtains a session bound per the delegate's identity rules.
    async fn connect(&self, bind_override: Option<&Principal>) -> Result<SharedSession>;

    /// Searches under `base` and returns a structured result; never
    /// fails past the boundary.
    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
        bind_override: Option<&Principal>,
    ) -> SearchResult;

    /// Inserts a record at `rdn` under `base`; returns an empty string
    /// on success, a failure message otherwise.
    async fn insert(&self, base: &str, rdn: &str, attrs: &HashMap<String, AttrInput>) -> String;

    /// Deletes the record at `dn`; empty string on success.
    async fn delete(&self, dn: &str) -> String;

    /// Modifies the record at `dn`; empty string on success.
    ///
    /// Without an explicit `mod_type` the supplied attributes are diffed
    /// against the current record; with one, every attribute becomes that
    /// operation.
    async fn modify(
        &self,
        dn: &str,
        mod_type: Option<ModOp>,
        attrs: &HashMap<String, AttrInput>,
    ) -> String;
}

/// Default LDAP implementation of [`DirectoryDelegate`].
pub struct LdapDelegate {
    token: String,
    registry: RwLock<ServerRegistry>,
    config: RwLock<DelegateConfig>,
    manager: ConnectionManager,
}

impl LdapDelegate {
    /// Creates a delegate using the real LDAP connector.
    ///
    /// The cache token is assigned once here and never regenerated for
    /// the life of the instance.
    #[must_use]
    pub fn new(
        config: DelegateConfig,
        cache: Arc<dyn ResourceCache>,
        identity: Arc<dyn IdentityProvider>,
        tls: TlsOptions,
    ) -> Self {
        Self::with_connector(config, Arc::new(LdapConnector), cache, identity, tls)
    }

    /// Creates a delegate with a custom connector.
    #[must_use]
    pub fn with_connector(
        config: DelegateConfig,
        connector: Arc<dyn DirectoryConnector>,
        cache: Arc<dyn ResourceCache>,
        identity: Arc<dyn IdentityProvider>,
        tls: TlsOptions,
    ) -> Self {
        let token = format!("directory-delegate-{}", Uuid::new_v4());
        let cache_key = format!("{token}-connection");
        Self {
            token,
            registry: RwLock::new(ServerRegistry::new()),
            config: RwLock::new(config),
            manager: ConnectionManager::new(cache_key, connector, cache, identity, tls),
        }
    }

    /// Returns the delegate's stable cache token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Adds a server, or updates its timeouts when already present.
    ///
    /// The cached connection is dropped either way: the new server may be
    /// a replacement for one that is failing with slow timeouts.
    pub async fn add_server(&self, descriptor: ServerDescriptor) {
        self.registry.write().await.add(descriptor);
        self.manager.invalidate().await;
    }

    /// Adds a server from a `host[:port]` shorthand, defaulting the port
    /// from the transport.
    ///
    /// # Errors
    ///
    /// Returns [`userdir_core::Error::Config`] when the address does not
    /// parse.
    pub async fn add_server_address(&self, address: &str, transport: Transport) -> Result<()> {
        let descriptor = ServerDescriptor::from_address(address, transport)?;
        self.add_server(descriptor).await;
        Ok(())
    }

    /// Deletes servers at the given zero-based positions and drops the
    /// cached connection so a removed server cannot be reused.
    pub async fn delete_servers(&self, positions: &[usize]) {
        self.registry.write().await.delete(positions);
        self.manager.invalidate().await;
    }

    /// Returns the configured servers in failover order.
    pub async fn servers(&self) -> Vec<ServerDescriptor> {
        self.registry.read().await.servers().to_vec()
    }

    /// Replaces the configuration wholesale.
    pub async fn edit(&self, settings: DelegateSettings) {
        *self.config.write().await = DelegateConfig::from_settings(settings);
    }

    /// Returns a snapshot of the current configuration.
    pub async fn config(&self) -> DelegateConfig {
        self.config.read().await.clone()
    }

    async fn snapshot(&self) -> (ServerRegistry, DelegateConfig) {
        let registry = self.registry.read().await.clone();
        let config = self.config.read().await.clone();
        (registry, config)
    }

    async fn search_raw(
        &self,
        registry: &ServerRegistry,
        config: &DelegateConfig,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
        bind_override: Option<&Principal>,
    ) -> Result<crate::session::RawSearchResult> {
        let shared = self.manager.connect(registry, config, bind_override).await?;
        let outcome = {
            let mut session = shared.lock().await;
            session.search(base, scope, filter, attrs).await
        };

        match outcome {
            Err(Error::Referral(payload)) => {
                let shared = self
                    .manager
                    .connect_referral(registry, config, &payload)
                    .await?;
                let mut session = shared.lock().await;
                // A second referral is not followed; it surfaces below
                // as an ordinary error.
                session.search(base, scope, filter, attrs).await
            }
            other => other,
        }
    }

    fn search_failure(base: &str, filter: &str, err: &Error) -> String {
        match err {
            Error::InvalidCredentials(_) => {
                let msg = "Invalid authentication credentials".to_string();
                debug!("{msg}");
                msg
            }
            Error::NotFound(_) => {
                let msg = format!("Cannot find {filter} under {base}");
                debug!("{msg}");
                msg
            }
            Error::LimitExceeded(_) => {
                let msg = "Too many results for this query".to_string();
                warn!("{msg}");
                msg
            }
            other => {
                let msg = other.to_string();
                error!("{msg}");
                msg
            }
        }
    }

    async fn insert_inner(
        &self,
        registry: &ServerRegistry,
        config: &DelegateConfig,
        dn: &str,
        attribute_list: Vec<(String, Vec<Vec<u8>>)>,
    ) -> String {
        let attempt = async {
            let shared = self.manager.connect(registry, config, None).await?;
            let mut session = shared.lock().await;
            session.add(dn, attribute_list.clone()).await
        }
        .await;

        match attempt {
            Ok(()) => String::new(),
            Err(Error::InvalidCredentials(_)) => {
                format!("InvalidCredentials No permission to insert \"{dn}\"")
            }
            Err(Error::AlreadyExists(_)) => {
                format!("AlreadyExists Record with dn \"{dn}\" already exists")
            }
            Err(Error::Referral(payload)) => {
                let retry = async {
                    let shared = self
                        .manager
                        .connect_referral(registry, config, &payload)
                        .await?;
                    let mut session = shared.lock().await;
                    session.add(dn, attribute_list).await
                }
                .await;
                match retry {
                    Ok(()) => String::new(),
                    Err(Error::InvalidCredentials(_)) => {
                        format!("InvalidCredentials No permission to insert \"{dn}\"")
                    }
                    Err(err) => format!("{} insert failed: {err}", err.kind()),
                }
            }
            Err(err) => format!("{} insert failed: {err}", err.kind()),
        }
    }

    async fn delete_inner(
        &self,
        registry: &ServerRegistry,
        config: &DelegateConfig,
        dn: &str,
        raw_dn: &str,
    ) -> String {
        let attempt = async {
            let shared = self.manager.connect(registry, config, None).await?;
            let mut session = shared.lock().await;
            session.delete(dn).await
        }
        .await;

        match attempt {
            Ok(()) => String::new(),
            Err(Error::InvalidCredentials(_)) => {
                format!("InvalidCredentials No permission to delete \"{raw_dn}\"")
            }
            Err(Error::Referral(payload)) => {
                let retry = async {
                    let shared = self
                        .manager
                        .connect_referral(registry, config, &payload)
                        .await?;
                    let mut session = shared.lock().await;
                    session.delete(dn).await
                }
                .await;
                match retry {
                    Ok(()) => String::new(),
                    Err(Error::InvalidCredentials(_)) => {
                        format!("InvalidCredentials No permission to delete \"{raw_dn}\"")
                    }
                    Err(err) => format!("{} delete failed: {err}", err.kind()),
                }
            }
            Err(err) => format!("{} delete failed: {err}", err.kind()),
        }
    }

    /// Builds the change list for a modify by diffing the request against
    /// the current record, or by applying one explicit operation type to
    /// every attribute.
    fn build_change_list(
        current: &Record,
        mod_type: Option<ModOp>,
        attrs: &HashMap<String, AttrInput>,
    ) -> Vec<AttributeChange> {
        let mut changes = Vec::new();
        let empty_request = vec![AttrValue::Text(String::new())];

        for (key, input) in attrs {
            let (name, _) = split_binary_marker(key);
            let values = input.to_values();

            match mod_type {
                Some(op) => changes.push(AttributeChange {
                    op,
                    attribute: name.to_string(),
                    values: values.iter().map(AttrValue::to_wire).collect(),
                }),
                None => {
                    let current_values = current
                        .attrs
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| empty_request.clone());
                    if current_values != values && values != empty_request {
                        changes.push(AttributeChange {
                            op: ModOp::Replace,
                            attribute: name.to_string(),
                            values: values.iter().map(AttrValue::to_wire).collect(),
                        });
                    } else if current.attrs.contains_key(name) && values == empty_request {
                        changes.push(AttributeChange {
                            op: ModOp::Delete,
                            attribute: name.to_string(),
                            values: Vec::new(),
                        });
                    }
                }
            }
        }

        changes
    }

    async fn modify_inner(
        &self,
        registry: &ServerRegistry,
        config: &DelegateConfig,
        dn: String,
        raw_dn: &str,
        current: &Record,
        mod_type: Option<ModOp>,
        attrs: &HashMap<String, AttrInput>,
    ) -> String {
        let changes = Self::build_change_list(current, mod_type, attrs);

        let new_rdn_value = attrs
            .get(config.rdn_attr())
            .map(AttrInput::to_values)
            .and_then(|values| {
                values
                    .first()
                    .and_then(AttrValue::as_text)
                    .map(str::to_string)
            })
            .filter(|value| !value.is_empty());

        let attempt = async {
            let shared = self.manager.connect(registry, config, None).await?;
            let mut session = shared.lock().await;

            let mut target_dn = dn.clone();
            if let Some(new_value) = &new_rdn_value {
                if current.first(config.rdn_attr()) != Some(new_value.as_str()) {
                    let new_rdn = clean_rdn(&format!("{}={new_value}", config.rdn_attr()));
                    session.modify_rdn(&target_dn, &new_rdn).await?;
                    let mut parts = explode_dn(&target_dn, false);
                    parts[0] = new_rdn;
                    target_dn = parts.join(",");
                }
            }

            if changes.is_empty() {
                debug!("Nothing to modify: {target_dn}");
            } else {
                session.modify(&target_dn, changes.clone()).await?;
            }
            Ok::<String, Error>(target_dn)
        }
        .await;

        match attempt {
            Ok(_) => String::new(),
            Err(Error::InvalidCredentials(_)) => {
                format!("InvalidCredentials No permission to modify \"{raw_dn}\"")
            }
            Err(Error::Referral(payload)) => {
                // The retry re-issues the attribute changes against the
                // cleaned DN; the rename is not repeated.
                let retry = async {
                    let shared = self
                        .manager
                        .connect_referral(registry, config, &payload)
                        .await?;
                    let mut session = shared.lock().await;
                    session.modify(&dn, changes).await
                }
                .await;
                match retry {
                    Ok(()) => String::new(),
                    Err(Error::InvalidCredentials(_)) => {
                        format!("InvalidCredentials No permission to modify \"{raw_dn}\"")
                    }
                    Err(err) => format!("{} modify failed: {err}", err.kind()),
                }
            }
            Err(err) => format!("{} modify failed: {err}", err.kind()),
        }
    }
}

#[async_trait]
impl DirectoryDelegate for LdapDelegate {
    async fn connect(&self, bind_override: Option<&Principal>) -> Result<SharedSession> {
        let (registry, config) = self.snapshot().await;
        self.manager.connect(&registry, &config, bind_override).await
    }

    async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
        bind_override: Option<&Principal>,
    ) -> SearchResult {
        let (registry, config) = self.snapshot().await;
        let base = clean_dn(base);

        let raw = match self
            .search_raw(&registry, &config, &base, scope, filter, attrs, bind_override)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                return SearchResult::failed(Self::search_failure(&base, filter, &err));
            }
        };

        if raw.partial {
            debug!(base = %base, "salvaged a partial result set");
        }

        let mut records = Vec::new();
        for entry in raw.entries {
            // Inline referral stubs are skipped, not reported.
            let RawEntry::Entry { dn, attrs } = entry else {
                continue;
            };
            let decoded = attrs
                .into_iter()
                .map(|(name, values)| {
                    let decoded = decode_values(&name, values);
                    (name, decoded)
                })
                .collect();
            records.push(Record { dn, attrs: decoded });
        }

        SearchResult {
            error: None,
            count: records.len(),
            records,
        }
    }

    async fn insert(&self, base: &str, rdn: &str, attrs: &HashMap<String, AttrInput>) -> String {
        let (registry, config) = self.snapshot().await;
        if config.read_only() {
            info!("{READ_ONLY_INSERT}");
            return READ_ONLY_INSERT.to_string();
        }

        let dn = clean_dn(&format!("{rdn},{base}"));
        let attribute_list: Vec<(String, Vec<Vec<u8>>)> = attrs
            .iter()
            .filter_map(|(name, input)| encode_for_insert(name, input))
            .collect();

        let msg = self
            .insert_inner(&registry, &config, &dn, attribute_list)
            .await;
        if !msg.is_empty() {
            info!("{msg}");
        }
        msg
    }

    async fn delete(&self, dn: &str) -> String {
        let (registry, config) = self.snapshot().await;
        if config.read_only() {
            info!("{READ_ONLY_DELETE}");
            return READ_ONLY_DELETE.to_string();
        }

        let clean = clean_dn(dn);
        let msg = self.delete_inner(&registry, &config, &clean, dn).await;
        if !msg.is_empty() {
            info!("{msg}");
        }
        msg
    }

    async fn modify(
        &self,
        dn: &str,
        mod_type: Option<ModOp>,
        attrs: &HashMap<String, AttrInput>,
    ) -> String {
        let (registry, config) = self.snapshot().await;
        if config.read_only() {
            info!("{READ_ONLY_MODIFY}");
            return READ_ONLY_MODIFY.to_string();
        }

        let clean = clean_dn(dn);
        let lookup = self
            .search(&clean, SearchScope::Base, "(objectClass=*)", &[], None)
            .await;
        if let Some(error) = lookup.error {
            return error;
        }
        if lookup.count == 0 {
            return format!("modify: cannot find dn \"{dn}\"");
        }

        let msg = self
            .modify_inner(
                &registry,
                &config,
                clean,
                dn,
                &lookup.records[0],
                mod_type,
                attrs,
            )
            .await;
        if !msg.is_empty() {
            info!("{msg}");
        }
        msg
    }
}
