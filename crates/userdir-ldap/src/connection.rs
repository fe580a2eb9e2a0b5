//! Connection lifecycle: cached-connection probing and server failover.
//!
//! A connect call first probes the cached session with a real bind and a
//! trivial base search. If the cache is cold or dead, the manager walks
//! the server registry in priority order and binds against the first
//! server that accepts. Referral targets go through the same bind path
//! but are never cached unless they happen to be configured servers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use userdir_core::{Error, IdentityProvider, Principal};

use crate::cache::{ResourceCache, SharedSession};
use crate::config::{BindMode, DelegateConfig, TlsOptions};
use crate::referral::referral_url;
use crate::server::ServerRegistry;
use crate::session::{ConnectOptions, DirectoryConnector, DirectorySession, SearchScope};
use crate::Result;

/// Connect timeout applied to referral targets, which carry no
/// per-server configuration.
const REFERRAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved bind identity for one connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BindIdentity {
    pub dn: String,
    pub password: String,
}

impl BindIdentity {
    fn anonymous() -> Self {
        Self {
            dn: String::new(),
            password: String::new(),
        }
    }
}

/// Obtains bound sessions for the operation layer.
pub struct ConnectionManager {
    cache_key: String,
    connector: Arc<dyn DirectoryConnector>,
    cache: Arc<dyn ResourceCache>,
    identity: Arc<dyn IdentityProvider>,
    tls: TlsOptions,
}

impl ConnectionManager {
    /// Creates a manager tied to the given cache key.
    #[must_use]
    pub fn new(
        cache_key: impl Into<String>,
        connector: Arc<dyn DirectoryConnector>,
        cache: Arc<dyn ResourceCache>,
        identity: Arc<dyn IdentityProvider>,
        tls: TlsOptions,
    ) -> Self {
        Self {
            cache_key: cache_key.into(),
            connector,
            cache,
            identity,
            tls,
        }
    }

    /// Returns the key under which this manager caches its session.
    #[must_use]
    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// Drops the cached session, forcing the next connect to fail over.
    /// The session is unbound best-effort before it is forgotten.
    pub async fn invalidate(&self) {
        if let Some(shared) = self.cache.get(&self.cache_key).await {
            let _ = shared.lock().await.unbind().await;
        }
        self.cache.remove(&self.cache_key).await;
    }

    /// Resolves the bind identity for an operation.
    ///
    /// Precedence: explicit override, then the service account when so
    /// configured, then the calling principal, then anonymous. An
    /// override with an empty password binds with `~` so it cannot
    /// accidentally turn into an anonymous bind.
    pub(crate) fn resolve_identity(
        &self,
        config: &DelegateConfig,
        bind_override: Option<&Principal>,
    ) -> BindIdentity {
        if let Some(principal) = bind_override {
            let password = if principal.secret().is_empty() {
                "~".to_string()
            } else {
                principal.secret().to_string()
            };
            return BindIdentity {
                dn: principal.dn().to_string(),
                password,
            };
        }

        match config.bind_mode() {
            BindMode::ServiceAccount => BindIdentity {
                dn: config.bind_dn().to_string(),
                password: config.bind_pwd().to_string(),
            },
            BindMode::PassThroughCaller => self
                .identity
                .current_principal()
                .map_or_else(BindIdentity::anonymous, |principal| BindIdentity {
                    dn: principal.dn().to_string(),
                    password: principal.secret().to_string(),
                }),
        }
    }

    /// Obtains a session bound for the resolved identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the registry is empty and
    /// [`Error::Connection`] when every server was tried and failed. Other
    /// errors propagate from the probe.
    pub async fn connect(
        &self,
        registry: &ServerRegistry,
        config: &DelegateConfig,
        bind_override: Option<&Principal>,
    ) -> Result<SharedSession> {
        let identity = self.resolve_identity(config, bind_override);

        if let Some(shared) = self.cache.get(&self.cache_key).await {
            let probe = {
                let mut session = shared.lock().await;
                probe_session(session.as_mut(), &identity, config.base_dn()).await
            };
            match probe {
                Ok(()) => return Ok(shared),
                Err(err) if err.is_cache_miss() => {
                    debug!(error = %err, "cached connection is dead, failing over");
                    {
                        let mut session = shared.lock().await;
                        let _ = session.unbind().await;
                    }
                    self.cache.remove(&self.cache_key).await;
                }
                Err(err) => return Err(err),
            }
        }

        let configured = registry.connection_strings();
        let mut last_error: Option<Error> = None;
        let mut last_target = String::new();

        for server in registry.servers() {
            let url = server.connection_string();
            last_target.clone_from(&url);
            let options = ConnectOptions {
                connect_timeout: server.connect_timeout(),
                tls: self.tls.clone(),
            };

            let attempt = self
                .bind_server(
                    &url,
                    &options,
                    &configured,
                    server.operation_timeout(),
                    &identity,
                )
                .await;
            match attempt {
                Ok(shared) => return Ok(shared),
                Err(err) if err.is_transient() => {
                    warn!(server = %url, error = %err, "server unusable, trying next");
                    // The failed session may have just been cached under
                    // our key; evict it so the next server gets a fresh
                    // connection.
                    self.cache.remove(&self.cache_key).await;
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }

        if registry.is_empty() {
            error!("No servers defined");
            return Err(Error::Config("No servers defined".to_string()));
        }

        let cause = last_error.map_or_else(|| "n/a".to_string(), |err| err.to_string());
        let message =
            format!("Failure connecting, last attempted server: {last_target} ({cause})");
        error!("{message}");
        Err(Error::Connection(message))
    }

    /// Opens a session against the referral target embedded in an error
    /// payload and binds it.
    ///
    /// The bind identity is resolved without an explicit override: the
    /// service account or the calling principal only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadReferral`] when the payload has no usable
    /// directory URL.
    pub async fn connect_referral(
        &self,
        registry: &ServerRegistry,
        config: &DelegateConfig,
        payload: &str,
    ) -> Result<SharedSession> {
        let url = referral_url(payload)?;
        let identity = self.resolve_identity(config, None);
        let options = ConnectOptions {
            connect_timeout: Some(REFERRAL_CONNECT_TIMEOUT),
            tls: self.tls.clone(),
        };
        debug!(target = %url, "following referral");
        self.bind_server(&url, &options, &registry.connection_strings(), None, &identity)
            .await
    }

    /// Opens (or fetches from the cache) a session for one target URL,
    /// configures it, and binds.
    ///
    /// The session is cached only when the URL is one of the configured
    /// connection strings; referral targets outside the failover set stay
    /// uncached.
    async fn bind_server(
        &self,
        url: &str,
        options: &ConnectOptions,
        configured: &[String],
        op_timeout: Option<Duration>,
        identity: &BindIdentity,
    ) -> Result<SharedSession> {
        let shared: SharedSession = if configured.iter().any(|known| known == url) {
            self.cache
                .get_or_create(&self.cache_key, self.connector.as_ref(), url, options)
                .await?
        } else {
            Arc::new(Mutex::new(self.connector.open(url, options).await?))
        };

        {
            let mut session = shared.lock().await;

            // Version 3 is preferred; fall back safely when rejected.
            if session.set_protocol_version(3).is_err() {
                session.set_protocol_version(2)?;
            }

            // Referrals are handled explicitly, never chased. A client
            // that cannot change the setting is left alone.
            let _ = session.set_referral_chasing(false);

            session.set_operation_timeout(op_timeout);
            session
                .simple_bind(&identity.dn, &identity.password)
                .await?;
        }

        Ok(shared)
    }
}

/// Liveness check for a cached session: a real bind with the resolved
/// identity plus a trivial base-scope search against the base DN.
async fn probe_session(
    session: &mut (impl DirectorySession + ?Sized),
    identity: &BindIdentity,
    base_dn: &str,
) -> Result<()> {
    session.simple_bind(&identity.dn, &identity.password).await?;
    session
        .search(base_dn, SearchScope::Base, "(objectClass=*)", &[])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::{DelegateSettings, ObjectClasses};
    use crate::server::{ServerDescriptor, Transport};
    use crate::session::{MockDirectoryConnector, MockDirectorySession, RawSearchResult};
    use secrecy::SecretString;
    use userdir_core::AnonymousIdentity;

    fn config(bind_mode: BindMode) -> DelegateConfig {
        DelegateConfig::from_settings(DelegateSettings {
            login_attr: "uid".to_string(),
            users_base: "ou=People,dc=example,dc=com".to_string(),
            rdn_attr: "cn".to_string(),
            object_classes: ObjectClasses::CommaSeparated("top,person".to_string()),
            bind_dn: "cn=Manager,dc=example,dc=com".to_string(),
            bind_pwd: SecretString::from("svc-secret".to_string()),
            bind_mode,
            read_only: false,
        })
    }

    fn registry(hosts: &[&str]) -> ServerRegistry {
        let mut registry = ServerRegistry::new();
        for host in hosts {
            registry.add(ServerDescriptor::new(*host, 389, Transport::Plain));
        }
        registry
    }

    fn manager(connector: MockDirectoryConnector) -> ConnectionManager {
        ConnectionManager::new(
            "test-connection",
            Arc::new(connector),
            Arc::new(MemoryCache::new()),
            Arc::new(AnonymousIdentity),
            TlsOptions::new(),
        )
    }

    fn bindable_session(expected_dn: &'static str) -> MockDirectorySession {
        let mut session = MockDirectorySession::new();
        session
            .expect_set_protocol_version()
            .returning(|_| Ok(()));
        session.expect_set_referral_chasing().returning(|_| Ok(()));
        session.expect_set_operation_timeout().return_const(());
        session
            .expect_simple_bind()
            .withf(move |dn, _| dn == expected_dn)
            .returning(|_, _| Ok(()));
        session
    }

    struct StaticIdentity(Principal);

    impl IdentityProvider for StaticIdentity {
        fn current_principal(&self) -> Option<Principal> {
            Some(self.0.clone())
        }
    }

    #[tokio::test]
    async fn empty_registry_is_a_configuration_error() {
        let mut connector = MockDirectoryConnector::new();
        connector.expect_open().times(0);
        let manager = manager(connector);

        // Sessions have no Debug impl, so take the error side directly.
        let err = manager
            .connect(&ServerRegistry::new(), &config(BindMode::ServiceAccount), None)
            .await
            .err()
            .unwrap();
        assert_eq!(err, Error::Config("No servers defined".to_string()));
    }

    #[tokio::test]
    async fn failover_respects_registry_order() {
        let mut connector = MockDirectoryConnector::new();
        let mut sequence = mockall::Sequence::new();
        connector
            .expect_open()
            .withf(|url, _| url == "ldap://down.example.com:389")
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Err(Error::ServerDown("connection refused".to_string())));
        connector
            .expect_open()
            .withf(|url, _| url == "ldap://up.example.com:389")
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| {
                Ok(Box::new(bindable_session("cn=Manager,dc=example,dc=com")))
            });
        let manager = manager(connector);

        let registry = registry(&["down.example.com", "up.example.com"]);
        let session = manager
            .connect(&registry, &config(BindMode::ServiceAccount), None)
            .await;
        assert!(session.is_ok());
    }

    #[tokio::test]
    async fn exhausted_registry_reports_last_target_and_cause() {
        let mut connector = MockDirectoryConnector::new();
        connector
            .expect_open()
            .times(2)
            .returning(|_, _| Err(Error::Timeout("connect timed out".to_string())));
        let manager = manager(connector);

        let registry = registry(&["a.example.com", "b.example.com"]);
        let err = manager
            .connect(&registry, &config(BindMode::ServiceAccount), None)
            .await
            .err()
            .unwrap();
        match err {
            Error::Connection(message) => {
                assert!(message.contains("ldap://b.example.com:389"));
                assert!(message.contains("connect timed out"));
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bind_rejection_moves_to_next_server() {
        let mut connector = MockDirectoryConnector::new();
        let mut sequence = mockall::Sequence::new();
        connector
            .expect_open()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| {
                let mut session = MockDirectorySession::new();
                session.expect_set_protocol_version().returning(|_| Ok(()));
                session.expect_set_referral_chasing().returning(|_| Ok(()));
                session.expect_set_operation_timeout().return_const(());
                session
                    .expect_simple_bind()
                    .returning(|_, _| Err(Error::InvalidCredentials("denied".to_string())));
                Ok(Box::new(session))
            });
        connector
            .expect_open()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| {
                Ok(Box::new(bindable_session("cn=Manager,dc=example,dc=com")))
            });
        let manager = manager(connector);

        let registry = registry(&["a.example.com", "b.example.com"]);
        assert!(manager
            .connect(&registry, &config(BindMode::ServiceAccount), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn dead_cached_session_falls_over_to_registry() {
        let mut connector = MockDirectoryConnector::new();
        connector.expect_open().times(1).returning(|_, _| {
            Ok(Box::new(bindable_session("cn=Manager,dc=example,dc=com")))
        });
        let manager = manager(connector);
        let registry = registry(&["a.example.com"]);
        let config = config(BindMode::ServiceAccount);

        // Seed the cache with a session whose probe bind fails.
        let mut dead = MockDirectorySession::new();
        dead.expect_simple_bind()
            .returning(|_, _| Err(Error::ServerDown("gone".to_string())));
        dead.expect_unbind().times(1).returning(|| Ok(()));
        seed_cache(&manager, dead).await;

        assert!(manager.connect(&registry, &config, None).await.is_ok());
    }

    #[tokio::test]
    async fn healthy_cached_session_skips_failover() {
        let mut connector = MockDirectoryConnector::new();
        connector.expect_open().times(0);
        let manager = manager(connector);
        let registry = registry(&["a.example.com"]);
        let config = config(BindMode::ServiceAccount);

        let mut healthy = MockDirectorySession::new();
        healthy.expect_simple_bind().returning(|_, _| Ok(()));
        healthy
            .expect_search()
            .withf(|base, scope, filter, _| {
                base == "ou=People,dc=example,dc=com"
                    && *scope == SearchScope::Base
                    && filter == "(objectClass=*)"
            })
            .returning(|_, _, _, _| Ok(RawSearchResult::default()));
        seed_cache(&manager, healthy).await;

        assert!(manager.connect(&registry, &config, None).await.is_ok());
    }

    #[tokio::test]
    async fn invalidate_unbinds_the_cached_session() {
        let manager = manager(MockDirectoryConnector::new());
        let mut cached = MockDirectorySession::new();
        cached.expect_unbind().times(1).returning(|| Ok(()));
        seed_cache(&manager, cached).await;

        manager.invalidate().await;
        assert!(manager.cache.get(manager.cache_key()).await.is_none());
    }

    #[tokio::test]
    async fn identity_precedence() {
        let caller = Principal::new("uid=caller,dc=example,dc=com", "caller-pw");
        let manager = ConnectionManager::new(
            "k",
            Arc::new(MockDirectoryConnector::new()),
            Arc::new(MemoryCache::new()),
            Arc::new(StaticIdentity(caller)),
            TlsOptions::new(),
        );

        // Explicit override wins over everything.
        let principal = Principal::new("uid=explicit,dc=example,dc=com", "pw");
        let identity =
            manager.resolve_identity(&config(BindMode::ServiceAccount), Some(&principal));
        assert_eq!(identity.dn, "uid=explicit,dc=example,dc=com");
        assert_eq!(identity.password, "pw");

        // Empty override password binds with the sentinel, not anonymously.
        let principal = Principal::new("uid=explicit,dc=example,dc=com", "");
        let identity =
            manager.resolve_identity(&config(BindMode::ServiceAccount), Some(&principal));
        assert_eq!(identity.password, "~");

        // Service account mode uses the configured credentials.
        let identity = manager.resolve_identity(&config(BindMode::ServiceAccount), None);
        assert_eq!(identity.dn, "cn=Manager,dc=example,dc=com");
        assert_eq!(identity.password, "svc-secret");

        // Pass-through mode uses the caller.
        let identity = manager.resolve_identity(&config(BindMode::PassThroughCaller), None);
        assert_eq!(identity.dn, "uid=caller,dc=example,dc=com");
        assert_eq!(identity.password, "caller-pw");
    }

    #[tokio::test]
    async fn pass_through_without_caller_is_anonymous() {
        let manager = manager(MockDirectoryConnector::new());
        let identity = manager.resolve_identity(&config(BindMode::PassThroughCaller), None);
        assert_eq!(identity, BindIdentity::anonymous());
    }

    /// Places a mock session in the manager's cache under its key.
    async fn seed_cache(manager: &ConnectionManager, session: MockDirectorySession) {
        let mut seeder = MockDirectoryConnector::new();
        seeder
            .expect_open()
            .return_once(move |_, _| Ok(Box::new(session)));
        manager
            .cache
            .get_or_create(
                manager.cache_key(),
                &seeder,
                "ldap://seed.example.com:389",
                &ConnectOptions::default(),
            )
            .await
            .unwrap();
    }
}
