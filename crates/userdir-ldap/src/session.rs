//! Session and connector abstractions over the wire client.
//!
//! The delegate never talks to `ldap3` directly; it goes through
//! [`DirectorySession`] and [`DirectoryConnector`] so connection handling
//! and the operation layer can be exercised against mocks.

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use native_tls::{Certificate, TlsConnector};
use std::collections::HashSet;
use std::fs;
use std::time::Duration;
use tokio::time::timeout;
use userdir_core::Error;

use crate::config::TlsOptions;
use crate::Result;

/// Search breadth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Base object only.
    Base,
    /// One level below the base.
    OneLevel,
    /// Entire subtree.
    Subtree,
}

impl From<SearchScope> for Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => Scope::Base,
            SearchScope::OneLevel => Scope::OneLevel,
            SearchScope::Subtree => Scope::Subtree,
        }
    }
}

/// Modification operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModOp {
    /// Add values to an attribute
    Add,
    /// Delete values, or the whole attribute when no values are given
    Delete,
    /// Replace the attribute's values
    Replace,
}

/// A single attribute change within a modify request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeChange {
    /// Operation type
    pub op: ModOp,
    /// Attribute to change
    pub attribute: String,
    /// Wire values; empty with [`ModOp::Delete`] removes the attribute
    pub values: Vec<Vec<u8>>,
}

/// One raw entry in a search result set.
///
/// Some directories (notably Active Directory) emit referral stubs inline
/// in the result set; those surface as [`RawEntry::Referral`] so callers
/// can skip them instead of failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEntry {
    /// A regular directory entry
    Entry {
        /// Distinguished name of the entry
        dn: String,
        /// Attribute names with undecoded wire values
        attrs: Vec<(String, Vec<Vec<u8>>)>,
    },
    /// An inline continuation referral
    Referral(Vec<String>),
}

/// Raw outcome of a search operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSearchResult {
    /// Entries in server order
    pub entries: Vec<RawEntry>,
    /// True when the server reported partial results and the buffered
    /// entries were salvaged
    pub partial: bool,
}

/// Options applied when opening a connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Connect timeout; `None` = client default
    pub connect_timeout: Option<Duration>,
    /// TLS options for `ldaps` targets
    pub tls: TlsOptions,
}

/// A live, bindable directory session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectorySession: Send {
    /// Binds the session as the given identity.
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Runs a search and returns the raw result set.
    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> Result<RawSearchResult>;

    /// Adds a new entry.
    async fn add(&mut self, dn: &str, attrs: Vec<(String, Vec<Vec<u8>>)>) -> Result<()>;

    /// Deletes an entry.
    async fn delete(&mut self, dn: &str) -> Result<()>;

    /// Applies attribute changes to an entry.
    async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()>;

    /// Renames an entry to a new RDN, removing the old one.
    async fn modify_rdn(&mut self, dn: &str, new_rdn: &str) -> Result<()>;

    /// Terminates the session at the protocol level.
    async fn unbind(&mut self) -> Result<()>;

    /// Requests the given protocol version; fails when unsupported.
    fn set_protocol_version(&mut self, version: u8) -> Result<()>;

    /// Enables or disables automatic referral chasing.
    fn set_referral_chasing(&mut self, chase: bool) -> Result<()>;

    /// Sets the per-operation timeout; `None` = client default.
    fn set_operation_timeout(&mut self, timeout: Option<Duration>);
}

/// Opens directory sessions from a connection string.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Opens an unbound session against the given URL.
    async fn open(&self, url: &str, options: &ConnectOptions)
        -> Result<Box<dyn DirectorySession>>;
}

/// Connector backed by `ldap3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LdapConnector;

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn open(
        &self,
        url: &str,
        options: &ConnectOptions,
    ) -> Result<Box<dyn DirectorySession>> {
        let settings = build_settings(options)?;
        let (conn, ldap) = LdapConnAsync::with_settings(settings, url)
            .await
            .map_err(map_ldap_error)?;
        ldap3::drive!(conn);
        Ok(Box::new(LdapSession {
            inner: ldap,
            op_timeout: None,
        }))
    }
}

fn build_settings(options: &ConnectOptions) -> Result<LdapConnSettings> {
    let mut settings = LdapConnSettings::new();

    if let Some(connect_timeout) = options.connect_timeout {
        settings = settings.set_conn_timeout(connect_timeout);
    }

    if !options.tls.verify {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| Error::Config(format!("failed to construct TLS connector: {err}")))?;
        settings = settings.set_connector(connector).set_no_tls_verify(true);
    } else if let Some(cert_path) = &options.tls.ca_cert {
        let pem = fs::read(cert_path).map_err(|err| {
            Error::Config(format!(
                "failed to read CA certificate {}: {err}",
                cert_path.display()
            ))
        })?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|err| Error::Config(format!("invalid CA certificate: {err}")))?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| Error::Config(format!("failed to load CA certificate: {err}")))?;
        settings = settings.set_connector(connector);
    }

    Ok(settings)
}

struct LdapSession {
    inner: ldap3::Ldap,
    op_timeout: Option<Duration>,
}

impl LdapSession {
    async fn with_timeout<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, ldap3::LdapError>>,
    {
        match self.op_timeout {
            Some(limit) => timeout(limit, fut)
                .await
                .map_err(|_| Error::Timeout("operation timed out".to_string()))?
                .map_err(map_ldap_error),
            None => fut.await.map_err(map_ldap_error),
        }
    }
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn simple_bind(&mut self, dn: &str, password: &str) -> Result<()> {
        let mut ldap = self.inner.clone();
        let result = self
            .with_timeout(async move { ldap.simple_bind(dn, password).await })
            .await?;
        check_result_code(&result)
    }

    async fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attrs: &[String],
    ) -> Result<RawSearchResult> {
        let mut ldap = self.inner.clone();
        let base = base.to_string();
        let filter = filter.to_string();
        let attrs = attrs.to_vec();
        let ldap3::SearchResult(entries, res) = self
            .with_timeout(async move {
                ldap.search(&base, scope.into(), &filter, attrs).await
            })
            .await?;

        // partialResults (rc 9): salvage whatever the client buffered.
        let partial = res.rc == 9;
        if !partial {
            check_result_code(&res)?;
        }

        let entries = entries
            .into_iter()
            .map(|raw| {
                if raw.is_ref() {
                    return RawEntry::Referral(Vec::new());
                }
                let entry = SearchEntry::construct(raw);
                let mut attrs: Vec<(String, Vec<Vec<u8>>)> = Vec::new();
                for (name, values) in entry.attrs {
                    attrs.push((
                        name,
                        values.into_iter().map(String::into_bytes).collect(),
                    ));
                }
                for (name, values) in entry.bin_attrs {
                    match attrs.iter_mut().find(|(existing, _)| *existing == name) {
                        Some((_, slot)) => slot.extend(values),
                        None => attrs.push((name, values)),
                    }
                }
                RawEntry::Entry {
                    dn: entry.dn,
                    attrs,
                }
            })
            .collect();

        Ok(RawSearchResult { entries, partial })
    }

    async fn add(&mut self, dn: &str, attrs: Vec<(String, Vec<Vec<u8>>)>) -> Result<()> {
        let mut ldap = self.inner.clone();
        let dn = dn.to_string();
        let attrs: Vec<(Vec<u8>, HashSet<Vec<u8>>)> = attrs
            .into_iter()
            .map(|(name, values)| (name.into_bytes(), values.into_iter().collect()))
            .collect();
        let result = self
            .with_timeout(async move { ldap.add(&dn, attrs).await })
            .await?;
        check_result_code(&result)
    }

    async fn delete(&mut self, dn: &str) -> Result<()> {
        let mut ldap = self.inner.clone();
        let dn = dn.to_string();
        let result = self
            .with_timeout(async move { ldap.delete(&dn).await })
            .await?;
        check_result_code(&result)
    }

    async fn modify(&mut self, dn: &str, changes: Vec<AttributeChange>) -> Result<()> {
        let mut ldap = self.inner.clone();
        let dn = dn.to_string();
        let mods: Vec<Mod<Vec<u8>>> = changes
            .into_iter()
            .map(|change| {
                let attribute = change.attribute.into_bytes();
                let values: HashSet<Vec<u8>> = change.values.into_iter().collect();
                match change.op {
                    ModOp::Add => Mod::Add(attribute, values),
                    ModOp::Delete => Mod::Delete(attribute, values),
                    ModOp::Replace => Mod::Replace(attribute, values),
                }
            })
            .collect();
        let result = self
            .with_timeout(async move { ldap.modify(&dn, mods).await })
            .await?;
        check_result_code(&result)
    }

    async fn modify_rdn(&mut self, dn: &str, new_rdn: &str) -> Result<()> {
        let mut ldap = self.inner.clone();
        let dn = dn.to_string();
        let new_rdn = new_rdn.to_string();
        let result = self
            .with_timeout(async move { ldap.modifydn(&dn, &new_rdn, true, None).await })
            .await?;
        check_result_code(&result)
    }

    async fn unbind(&mut self) -> Result<()> {
        let mut ldap = self.inner.clone();
        self.with_timeout(async move { ldap.unbind().await }).await
    }

    fn set_protocol_version(&mut self, version: u8) -> Result<()> {
        // ldap3 speaks protocol version 3 only.
        if version == 3 {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "protocol version {version} not supported"
            )))
        }
    }

    fn set_referral_chasing(&mut self, chase: bool) -> Result<()> {
        // ldap3 never chases referrals on its own, which is the state the
        // delegate wants; chasing cannot be turned on.
        if chase {
            Err(Error::Protocol(
                "automatic referral chasing not supported".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn set_operation_timeout(&mut self, timeout: Option<Duration>) {
        self.op_timeout = timeout;
    }
}

/// Maps a server result code to the core taxonomy.
fn check_result_code(result: &ldap3::result::LdapResult) -> Result<()> {
    let message = if result.text.is_empty() {
        format!("result code {}", result.rc)
    } else {
        result.text.clone()
    };

    match result.rc {
        0 => Ok(()),
        4 | 11 => Err(Error::LimitExceeded(message)),
        10 => Err(Error::Referral(referral_payload(result))),
        32 => Err(Error::NotFound(message)),
        49 => Err(Error::InvalidCredentials(message)),
        52 => Err(Error::ServerDown(message)),
        68 => Err(Error::AlreadyExists(message)),
        _ => Err(Error::Protocol(message)),
    }
}

/// Renders the free-text payload of a referral result, embedding the
/// referral URLs so the referral handler can extract the first one.
fn referral_payload(result: &ldap3::result::LdapResult) -> String {
    let mut payload = result.text.clone();
    for url in &result.refs {
        if !payload.is_empty() {
            payload.push(' ');
        }
        payload.push_str(url);
    }
    payload
}

fn map_ldap_error(err: ldap3::LdapError) -> Error {
    match err {
        ldap3::LdapError::LdapResult { result } => {
            check_result_code(&result).err().unwrap_or_else(|| {
                Error::Protocol(format!("unexpected success result: {result:?}"))
            })
        }
        ldap3::LdapError::Timeout { .. } => Error::Timeout(err.to_string()),
        other => Error::ServerDown(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ldap_result(rc: u32, text: &str) -> ldap3::result::LdapResult {
        ldap3::result::LdapResult {
            rc,
            matched: String::new(),
            text: text.to_string(),
            refs: Vec::new(),
            ctrls: Vec::new(),
        }
    }

    #[test]
    fn result_code_mapping() {
        assert!(check_result_code(&ldap_result(0, "")).is_ok());
        assert_eq!(
            check_result_code(&ldap_result(49, "bad password")),
            Err(Error::InvalidCredentials("bad password".to_string()))
        );
        assert_eq!(
            check_result_code(&ldap_result(32, "no base")),
            Err(Error::NotFound("no base".to_string()))
        );
        assert_eq!(
            check_result_code(&ldap_result(4, "")),
            Err(Error::LimitExceeded("result code 4".to_string()))
        );
        assert_eq!(
            check_result_code(&ldap_result(68, "exists")),
            Err(Error::AlreadyExists("exists".to_string()))
        );
        assert!(matches!(
            check_result_code(&ldap_result(80, "other")),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn referral_payload_includes_urls() {
        let mut result = ldap_result(10, "Referral:");
        result.refs = vec!["ldap://other.example.com/dc=example,dc=com".to_string()];
        let err = check_result_code(&result).unwrap_err();
        match err {
            Error::Referral(payload) => {
                assert!(payload.contains("ldap://other.example.com"));
            }
            other => panic!("expected referral, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_timeouts_keep_their_own_variant() {
        let elapsed = tokio::time::timeout(Duration::ZERO, std::future::pending::<()>())
            .await
            .unwrap_err();
        let err = map_ldap_error(ldap3::LdapError::Timeout { elapsed });
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn transport_errors_map_to_server_down() {
        let err = map_ldap_error(ldap3::LdapError::EndOfStream);
        assert!(matches!(err, Error::ServerDown(_)));
    }

    #[test]
    fn scope_conversion() {
        assert_eq!(Scope::from(SearchScope::Base), Scope::Base);
        assert_eq!(Scope::from(SearchScope::OneLevel), Scope::OneLevel);
        assert_eq!(Scope::from(SearchScope::Subtree), Scope::Subtree);
    }
}
