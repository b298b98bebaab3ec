//! Directory connection abstraction and its `ldap3` implementation.

use crate::{config::LdapConfig, Result};
use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchResult};
use membership_core::Error;
use native_tls::{Certificate, TlsConnector};
use std::collections::HashMap;
use std::fs;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

/// LDAP result code for a search base that does not exist.
const NO_SUCH_OBJECT: u32 = 32;

/// Represents the search scope for LDAP queries.
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

/// Directory entry returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LdapEntry {
    /// Distinguished name of the entry.
    pub dn: String,
    /// Attribute map (values preserve the order sent by the server).
    pub attributes: HashMap<String, Vec<String>>,
}

impl LdapEntry {
    /// Creates an entry without attributes.
    #[must_use]
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: HashMap::new(),
        }
    }

    /// Adds values to an attribute.
    #[must_use]
    pub fn with_attribute<I, S>(mut self, attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .entry(attribute.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Returns all values for the attribute. Attribute names match case-insensitively.
    #[must_use]
    pub fn values(&self, attribute: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
            .map(|(_, values)| values.as_slice())
    }

    /// Returns the first value of the attribute if present.
    #[must_use]
    pub fn first(&self, attribute: &str) -> Option<&str> {
        self.values(attribute)
            .and_then(|values| values.first().map(String::as_str))
    }
}

/// A shared, already-authenticated directory session.
///
/// Implementations report a missing search base as an empty result and every other
/// failure as an error for which [`Error::is_directory_fault`] holds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryConnection: Send + Sync {
    /// Searches below `base_dn` and returns the matching entries.
    async fn search(
        &self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<LdapEntry>>;
}

/// Directory connection backed by `ldap3`.
pub struct LdapDirectory {
    ldap: Mutex<ldap3::Ldap>,
    operation_timeout: Duration,
}

impl LdapDirectory {
    /// Connects to the directory and performs the configured bind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] for unusable TLS settings and a directory fault when the
    /// connection or the bind fails.
    pub async fn open(config: LdapConfig) -> Result<Self> {
        let settings = build_ldap_settings(&config)?;
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, config.url())
            .await
            .map_err(|err| map_ldap_error("connect", &err))?;
        ldap3::drive!(conn);

        if let Some(credentials) = config.credentials() {
            let result = timeout(
                config.operation_timeout(),
                ldap.simple_bind(credentials.bind_dn().as_str(), credentials.password()),
            )
            .await
            .map_err(|_| Error::Timeout("bind".to_string()))?
            .map_err(|err| map_ldap_error("bind", &err))?;
            result
                .success()
                .map_err(|err| map_ldap_error("bind", &err))?;
        }

        info!(url = config.url(), "directory session opened");
        Ok(Self {
            ldap: Mutex::new(ldap),
            operation_timeout: config.operation_timeout(),
        })
    }

    /// Unbinds the session.
    ///
    /// # Errors
    ///
    /// Returns a directory fault if the unbind request cannot be sent.
    pub async fn close(&self) -> Result<()> {
        let mut ldap = self.ldap.lock().await.clone();
        timeout(self.operation_timeout, ldap.unbind())
            .await
            .map_err(|_| Error::Timeout("unbind".to_string()))?
            .map_err(|err| map_ldap_error("unbind", &err))?;
        info!("directory session closed");
        Ok(())
    }
}

#[async_trait]
impl DirectoryConnection for LdapDirectory {
    async fn search(
        &self,
        base_dn: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<LdapEntry>> {
        // `Ldap` handles are cheap clones multiplexed over the same connection.
        let mut ldap = self.ldap.lock().await.clone();
        debug!(base_dn, ?scope, filter, "directory search");

        let SearchResult(entries, result) = timeout(
            self.operation_timeout,
            ldap.search(base_dn, scope.into(), filter, attributes.to_vec()),
        )
        .await
        .map_err(|_| Error::Timeout(format!("search under `{base_dn}`")))?
        .map_err(|err| map_ldap_error("search", &err))?;

        if result.rc == NO_SUCH_OBJECT {
            return Ok(Vec::new());
        }
        result
            .success()
            .map_err(|err| map_ldap_error("search", &err))?;

        Ok(entries
            .into_iter()
            .map(SearchEntry::construct)
            .map(|entry| LdapEntry {
                dn: entry.dn,
                attributes: entry.attrs,
            })
            .collect())
    }
}

fn build_ldap_settings(config: &LdapConfig) -> Result<LdapConnSettings> {
    let mut settings = LdapConnSettings::new().set_conn_timeout(config.connection_timeout());

    if !config.tls_verify() {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to construct TLS connector: {err}"))
            })?;
        settings = settings.set_connector(connector).set_no_tls_verify(true);
    } else if let Some(cert_path) = config.tls_ca_cert() {
        let pem = fs::read(cert_path).map_err(|err| {
            Error::ConfigError(format!(
                "failed to read directory CA certificate {}: {err}",
                cert_path.display()
            ))
        })?;
        let certificate = Certificate::from_pem(&pem).map_err(|err| {
            Error::ConfigError(format!("invalid directory CA certificate: {err}"))
        })?;
        let connector = TlsConnector::builder()
            .add_root_certificate(certificate)
            .build()
            .map_err(|err| {
                Error::ConfigError(format!("failed to load directory CA certificate: {err}"))
            })?;
        settings = settings.set_connector(connector);
    }

    Ok(settings)
}

fn map_ldap_error(operation: &str, err: &ldap3::LdapError) -> Error {
    match err {
        ldap3::LdapError::Timeout { .. } => Error::Timeout(operation.to_string()),
        ldap3::LdapError::DecodingUTF8 | ldap3::LdapError::AddNoValues => {
            Error::MalformedResponse(format!("{operation}: {err}"))
        }
        _ => Error::directory(operation, err.to_string()),
    }
}

/// Escapes a value for use inside an LDAP search filter (RFC 4515).
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
