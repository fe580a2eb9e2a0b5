//! LDAP delegate with multi-server failover and referral handling.
//!
//! This crate implements a resilient directory client: it keeps a reusable
//! connection in an injected resource cache, walks an ordered server list
//! when that connection dies, chases protocol referrals exactly once per
//! operation, and converts attribute values between text and wire bytes
//! with tolerance for non-conformant servers.

#![deny(missing_docs)]

mod attrs;
mod cache;
mod config;
mod connection;
mod delegate;
mod dn;
mod referral;
mod server;
mod session;

pub use attrs::{decode_values, is_binary_attribute, AttrInput, AttrValue};
pub use cache::{MemoryCache, ResourceCache, SharedSession};
pub use config::{BindMode, DelegateConfig, DelegateSettings, ObjectClasses, TlsOptions};
pub use connection::ConnectionManager;
pub use delegate::{DirectoryDelegate, LdapDelegate, Record, SearchResult};
pub use dn::{clean_dn, clean_rdn, escape_dn_value, escape_filter_value, explode_dn, filter_format};
pub use referral::referral_url;
pub use server::{ServerDescriptor, ServerRegistry, Transport};
pub use session::{
    AttributeChange, ConnectOptions, DirectoryConnector, DirectorySession, LdapConnector, ModOp,
    RawEntry, RawSearchResult, SearchScope,
};

/// Convenient result alias that reuses the core error type.
pub type Result<T> = userdir_core::Result<T>;
