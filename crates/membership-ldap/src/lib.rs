//! LDAP group-membership resolution.
//!
//! This crate resolves the members of directory groups through a
//! [`DirectoryConnection`] and keeps the results in time-bounded caches that are
//! memoized per [`membership_core::CacheConfiguration`].

#![deny(missing_docs)]

mod cache;
mod config;
mod connection;
mod dn;
mod members;
mod resolver;

pub use cache::{CacheRegistry, CacheStats, GroupCache};
pub use config::{
    BindCredentials, LdapConfig, DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_OPERATION_TIMEOUT_SECS,
};
pub use connection::{
    escape_filter_value, DirectoryConnection, LdapDirectory, LdapEntry, SearchScope,
};
pub use dn::{DistinguishedName, DistinguishedNameError, RelativeDistinguishedName};
pub use members::{GroupMembers, GroupMembersBuilder};
pub use resolver::GroupMembershipResolver;

/// Convenient result alias that reuses the core error type.
pub type Result<T> = membership_core::Result<T>;
