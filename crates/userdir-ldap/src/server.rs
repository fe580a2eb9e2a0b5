//! Ordered server registry and connection string construction.
//!
//! Insertion order is failover priority order. Two descriptors are the
//! same server when host, port and transport all match; timeouts are
//! mutable details updated in place.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use userdir_core::Error;

use crate::Result;

/// Sentinel timeout meaning "use the client default".
pub const DEFAULT_TIMEOUT: i64 = -1;

/// Transport security for a directory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Plain TCP (`ldap://`)
    Plain,
    /// TLS from connection start (`ldaps://`)
    Tls,
    /// Local IPC socket (`ldapi://`)
    LocalSocket,
}

impl Transport {
    /// Returns the URL scheme for this transport.
    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        match self {
            Self::Plain => "ldap",
            Self::Tls => "ldaps",
            Self::LocalSocket => "ldapi",
        }
    }

    /// Returns the conventional port for this transport; local sockets
    /// have none.
    #[must_use]
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Plain => 389,
            Self::Tls => 636,
            Self::LocalSocket => 0,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A single directory server target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Hostname, address, or socket path for local transport
    pub host: String,
    /// TCP port; ignored for local sockets
    pub port: u16,
    /// Transport security
    pub transport: Transport,
    /// Connect timeout in seconds, `-1` = client default
    pub conn_timeout: i64,
    /// Operation timeout in seconds, `-1` = client default
    pub op_timeout: i64,
}

impl ServerDescriptor {
    /// Creates a descriptor with default timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            host: host.into(),
            port,
            transport,
            conn_timeout: DEFAULT_TIMEOUT,
            op_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Parses a `host[:port]` shorthand, defaulting the port from the
    /// transport. Local-socket targets take the whole string as a path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the port is not a number.
    pub fn from_address(address: &str, transport: Transport) -> Result<Self> {
        if transport == Transport::LocalSocket {
            return Ok(Self::new(address, transport.default_port(), transport));
        }
        match address.split_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    Error::Config(format!("invalid port in server address \"{address}\""))
                })?;
                Ok(Self::new(host, port, transport))
            }
            None => Ok(Self::new(address, transport.default_port(), transport)),
        }
    }

    /// Returns true if `other` names the same server, ignoring timeouts.
    #[must_use]
    pub fn same_server(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port && self.transport == other.transport
    }

    /// Renders the URL-form connection target for this server.
    ///
    /// Local-socket transport is host-only with no port.
    #[must_use]
    pub fn connection_string(&self) -> String {
        match self.transport {
            Transport::LocalSocket => format!("{}://{}", self.transport.scheme(), self.host),
            _ => format!("{}://{}:{}", self.transport.scheme(), self.host, self.port),
        }
    }

    /// Returns the connect timeout when explicitly configured and positive.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        positive_secs(self.conn_timeout)
    }

    /// Returns the operation timeout when explicitly configured and
    /// positive.
    #[must_use]
    pub fn operation_timeout(&self) -> Option<Duration> {
        positive_secs(self.op_timeout)
    }
}

#[allow(clippy::cast_sign_loss)]
fn positive_secs(value: i64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value as u64))
}

/// Ordered set of directory servers; insertion order is failover order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistry {
    servers: Vec<ServerDescriptor>,
}

impl ServerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a server, or updates the timeouts of an existing entry with
    /// the same host, port and transport. Returns true when the set grew.
    ///
    /// Either way the owning delegate must invalidate its cached
    /// connection: a new server is often a replacement for one that is
    /// failing with slow timeouts.
    pub fn add(&mut self, descriptor: ServerDescriptor) -> bool {
        if let Some(existing) = self
            .servers
            .iter_mut()
            .find(|server| server.same_server(&descriptor))
        {
            existing.conn_timeout = descriptor.conn_timeout;
            existing.op_timeout = descriptor.op_timeout;
            false
        } else {
            self.servers.push(descriptor);
            true
        }
    }

    /// Removes the entries at the given zero-based positions.
    ///
    /// Positions refer to the list before the call; the removal set is
    /// computed up front so earlier removals cannot shift later indices.
    /// Out-of-range positions are ignored.
    pub fn delete(&mut self, positions: &[usize]) {
        let servers = std::mem::take(&mut self.servers);
        self.servers = servers
            .into_iter()
            .enumerate()
            .filter(|(idx, _)| !positions.contains(idx))
            .map(|(_, server)| server)
            .collect();
    }

    /// Returns the servers in failover order.
    #[must_use]
    pub fn servers(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    /// Returns true if no servers are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Returns the number of configured servers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Returns the connection strings of every configured server.
    ///
    /// Used to decide whether a freshly opened connection belongs to the
    /// configured failover set and may therefore be cached.
    #[must_use]
    pub fn connection_strings(&self) -> Vec<String> {
        self.servers
            .iter()
            .map(ServerDescriptor::connection_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(host: &str) -> ServerDescriptor {
        ServerDescriptor::new(host, 389, Transport::Plain)
    }

    #[test]
    fn connection_strings_per_transport() {
        assert_eq!(
            ServerDescriptor::new("ldap.example.com", 389, Transport::Plain).connection_string(),
            "ldap://ldap.example.com:389"
        );
        assert_eq!(
            ServerDescriptor::new("ldap.example.com", 636, Transport::Tls).connection_string(),
            "ldaps://ldap.example.com:636"
        );
        assert_eq!(
            ServerDescriptor::new("%2Frun%2Fslapd.sock", 0, Transport::LocalSocket)
                .connection_string(),
            "ldapi://%2Frun%2Fslapd.sock"
        );
    }

    #[test]
    fn connection_strings_parse_as_urls() {
        for descriptor in [
            ServerDescriptor::new("a.example.com", 389, Transport::Plain),
            ServerDescriptor::new("b.example.com", 636, Transport::Tls),
        ] {
            assert!(url::Url::parse(&descriptor.connection_string()).is_ok());
        }
    }

    #[test]
    fn add_deduplicates_and_updates_timeouts() {
        let mut registry = ServerRegistry::new();
        assert!(registry.add(plain("a.example.com")));
        assert!(registry.add(plain("b.example.com")));

        let mut updated = plain("a.example.com");
        updated.conn_timeout = 5;
        updated.op_timeout = 30;
        assert!(!registry.add(updated));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.servers()[0].conn_timeout, 5);
        assert_eq!(registry.servers()[0].op_timeout, 30);
        // Priority order is unchanged by the update.
        assert_eq!(registry.servers()[1].host, "b.example.com");
    }

    #[test]
    fn same_host_different_transport_is_a_new_entry() {
        let mut registry = ServerRegistry::new();
        registry.add(plain("a.example.com"));
        registry.add(ServerDescriptor::new("a.example.com", 389, Transport::Tls));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn delete_uses_pre_mutation_positions() {
        let mut registry = ServerRegistry::new();
        registry.add(plain("a.example.com"));
        registry.add(plain("b.example.com"));
        registry.add(plain("c.example.com"));

        registry.delete(&[0, 2]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.servers()[0].host, "b.example.com");
    }

    #[test]
    fn delete_ignores_out_of_range() {
        let mut registry = ServerRegistry::new();
        registry.add(plain("a.example.com"));
        registry.delete(&[7]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn address_shorthand() {
        let descriptor = ServerDescriptor::from_address("ldap.example.com", Transport::Plain)
            .unwrap();
        assert_eq!(descriptor.port, 389);

        let descriptor =
            ServerDescriptor::from_address("ldap.example.com:1389", Transport::Tls).unwrap();
        assert_eq!(descriptor.host, "ldap.example.com");
        assert_eq!(descriptor.port, 1389);

        let descriptor =
            ServerDescriptor::from_address("%2fvar%2frun%2fldapi", Transport::LocalSocket)
                .unwrap();
        assert_eq!(descriptor.port, 0);

        assert!(ServerDescriptor::from_address("host:notaport", Transport::Plain).is_err());
    }

    #[test]
    fn timeout_sentinels() {
        let mut descriptor = plain("a.example.com");
        assert!(descriptor.connect_timeout().is_none());
        assert!(descriptor.operation_timeout().is_none());

        descriptor.conn_timeout = 5;
        descriptor.op_timeout = 0;
        assert_eq!(descriptor.connect_timeout(), Some(Duration::from_secs(5)));
        assert!(descriptor.operation_timeout().is_none());
    }
}
