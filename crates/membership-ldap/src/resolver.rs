//! Group membership resolution on top of a directory connection.

use membership_core::{CacheConfiguration, Error, GroupSchema, ResolverConfig};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::{
    cache::{CacheRegistry, GroupCache},
    connection::{escape_filter_value, DirectoryConnection, LdapEntry, SearchScope},
    dn::DistinguishedName,
    members::GroupMembers,
    Result,
};

const ENTRY_FILTER: &str = "(objectClass=*)";
const OBJECT_CLASS: &str = "objectClass";
/// Requests no attributes at all (RFC 4511, section 4.5.1.8).
const NO_ATTRIBUTES: &str = "1.1";

/// The configured uid attribute and how many times it has changed.
struct UidAttribute {
    name: Arc<str>,
    generation: u64,
}

/// Resolves group members through a shared directory connection and caches the results.
///
/// One resolver is meant to be shared by every request handler of an authentication
/// subsystem. Caches are created lazily, one per [`CacheConfiguration`] identity.
pub struct GroupMembershipResolver {
    connection: Arc<dyn DirectoryConnection>,
    uid_attribute: RwLock<UidAttribute>,
    schema: GroupSchema,
    user_base_dn: Option<DistinguishedName>,
    caches: CacheRegistry,
}

impl GroupMembershipResolver {
    /// Creates a resolver that reports members by `uid_attribute`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if `uid_attribute` is empty.
    pub fn new(
        connection: Arc<dyn DirectoryConnection>,
        uid_attribute: impl Into<Arc<str>>,
    ) -> Result<Self> {
        Ok(Self {
            connection,
            uid_attribute: RwLock::new(UidAttribute {
                name: checked_uid_attribute(uid_attribute.into())?,
                generation: 0,
            }),
            schema: GroupSchema::default(),
            user_base_dn: None,
            caches: CacheRegistry::new(),
        })
    }

    /// Creates a resolver from a loaded configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the uid attribute is empty or the schema is invalid.
    pub fn from_config(
        connection: Arc<dyn DirectoryConnection>,
        config: &ResolverConfig,
    ) -> Result<Self> {
        Self::new(connection, config.uid_attribute.as_str())?.with_schema(config.schema.clone())
    }

    /// Replaces the directory schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if the schema fails validation or its user base DN
    /// cannot be parsed.
    pub fn with_schema(mut self, schema: GroupSchema) -> Result<Self> {
        schema
            .validate()
            .map_err(|e| Error::ConfigError(format!("Invalid group schema: {e}")))?;
        self.user_base_dn = schema
            .user_base_dn
            .as_deref()
            .map(DistinguishedName::parse)
            .transpose()
            .map_err(|err| Error::ConfigError(format!("invalid user base DN: {err}")))?;
        self.schema = schema;
        Ok(self)
    }

    /// Sets the attribute used as the display value of each member.
    ///
    /// Cached memberships were read with the previous attribute, so every cache is
    /// cleared when the attribute actually changes. Fetches already in flight under the
    /// previous attribute do not populate the caches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] if `uid_attribute` is empty, or [`Error::CacheError`]
    /// if the caches cannot be cleared.
    pub fn configure(&self, uid_attribute: impl Into<Arc<str>>) -> Result<()> {
        let uid_attribute = checked_uid_attribute(uid_attribute.into())?;
        let mut current = self
            .uid_attribute
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if current.name.eq_ignore_ascii_case(&uid_attribute) {
            current.name = uid_attribute;
            return Ok(());
        }

        info!(from = %current.name, to = %uid_attribute, "uid attribute changed, clearing group caches");
        current.name = uid_attribute;
        current.generation += 1;
        // Cleared under the write lock: stores check the generation under the read lock.
        self.caches.clear_all()
    }

    /// The configured uid attribute, exactly as it was handed to the resolver.
    #[must_use]
    pub fn uid_attribute_name(&self) -> Arc<str> {
        self.uid_attribute
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .name
            .clone()
    }

    /// The directory schema in use.
    #[must_use]
    pub const fn schema(&self) -> &GroupSchema {
        &self.schema
    }

    /// Returns the cache for `config`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CacheError`] if the cache registry is unusable.
    pub fn get_cache(&self, config: &CacheConfiguration) -> Result<Arc<GroupCache>> {
        self.caches.get_or_create(config)
    }

    /// Returns the members of `group_dn`, or `None` if no such group exists.
    ///
    /// A live cached result is returned as the very same `Arc`; otherwise the directory is
    /// queried and the fresh result replaces the cached one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a malformed DN, a directory fault when the
    /// directory cannot be queried, or [`Error::CacheError`] for cache failures.
    pub async fn get_group_members(
        &self,
        group_dn: &str,
        cache_config: &CacheConfiguration,
    ) -> Result<Option<Arc<GroupMembers>>> {
        let group = DistinguishedName::parse(group_dn)?;
        let cache = self.get_cache(cache_config)?;

        if let Some(members) = cache.get(group.canonical())? {
            debug!(group = %group, cache = cache_config.name(), "group cache hit");
            return Ok(Some(members));
        }
        debug!(group = %group, cache = cache_config.name(), "group cache miss");

        loop {
            let (uid_attribute, generation) = self.uid_snapshot();
            match self.fetch_group_members(&group, &uid_attribute).await {
                Ok(Some(members)) => {
                    let members = Arc::new(members);
                    if self.store_if_current(&cache, &group, &members, generation)? {
                        return Ok(Some(members));
                    }
                    debug!(group = %group, stale = %uid_attribute, "uid attribute changed during fetch, fetching again");
                }
                Ok(None) => {
                    debug!(group = %group, "group not found");
                    return Ok(None);
                }
                Err(err) => {
                    if err.should_log() {
                        error!(group = %group, error = %err, code = err.error_code(), "failed to resolve group members");
                    } else {
                        warn!(group = %group, error = %err, code = err.error_code(), "failed to resolve group members");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Checks whether `user` belongs to `group_dn`.
    ///
    /// `user` is matched case-insensitively against member DNs and display values. The
    /// canonical (lower-cased) DN of the matching member is returned; a non-member or a
    /// missing group yields `None`.
    ///
    /// # Errors
    ///
    /// Same as [`GroupMembershipResolver::get_group_members`].
    pub async fn is_member_of(
        &self,
        user: &str,
        group_dn: &str,
        cache_config: &CacheConfiguration,
    ) -> Result<Option<String>> {
        let Some(members) = self.get_group_members(group_dn, cache_config).await? else {
            return Ok(None);
        };

        let found = members.find(user).map(str::to_owned);
        debug!(user, group = group_dn, found = found.is_some(), "membership check");
        Ok(found)
    }

    /// Drops the cached membership of `group_dn`. Returns true if an entry was present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a malformed DN or [`Error::CacheError`] for cache
    /// failures.
    pub fn invalidate_group(&self, group_dn: &str, cache_config: &CacheConfiguration) -> Result<bool> {
        let group = DistinguishedName::parse(group_dn)?;
        self.get_cache(cache_config)?.invalidate(group.canonical())
    }

    fn uid_snapshot(&self) -> (Arc<str>, u64) {
        let current = self
            .uid_attribute
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        (current.name.clone(), current.generation)
    }

    /// Caches `members` unless the uid attribute changed since `generation` was read.
    fn store_if_current(
        &self,
        cache: &GroupCache,
        group: &DistinguishedName,
        members: &Arc<GroupMembers>,
        generation: u64,
    ) -> Result<bool> {
        let current = self
            .uid_attribute
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if current.generation != generation {
            return Ok(false);
        }
        cache.put(group.canonical(), members.clone())?;
        Ok(true)
    }

    async fn fetch_group_members(
        &self,
        group: &DistinguishedName,
        uid_attribute: &str,
    ) -> Result<Option<GroupMembers>> {
        let attributes = self.entry_attributes(uid_attribute);

        let Some(group_entry) = self.lookup_entry(group, &attributes).await? else {
            return Ok(None);
        };
        if !self.is_group(&group_entry) {
            debug!(group = %group, "entry exists but is not a group");
            return Ok(None);
        }

        let mut builder = GroupMembers::builder(group.clone());
        let mut visited = HashSet::from([group.canonical().to_string()]);
        let mut pending = VecDeque::from([group_entry]);

        while let Some(entry) = pending.pop_front() {
            for member in self.member_references(&entry).await? {
                if !visited.insert(member.canonical().to_string()) {
                    continue;
                }

                let Some(member_entry) = self.lookup_entry(&member, &attributes).await? else {
                    debug!(group = %group, member = %member, "skipping dangling member reference");
                    continue;
                };

                if self.schema.resolve_nested_groups && self.is_group(&member_entry) {
                    debug!(group = %group, nested = %member, "expanding nested group");
                    pending.push_back(member_entry);
                    continue;
                }

                let uid = member_entry
                    .first(uid_attribute)
                    .unwrap_or_else(|| member.leading_value());
                builder = builder.add_member(&member, uid);
            }
        }

        debug!(group = %group, members = builder.len(), "resolved group members");
        Ok(Some(builder.build()))
    }

    async fn lookup_entry(
        &self,
        dn: &DistinguishedName,
        attributes: &[String],
    ) -> Result<Option<LdapEntry>> {
        let mut entries = self
            .connection
            .search(dn.as_str(), SearchScope::Base, ENTRY_FILTER, attributes)
            .await?;

        if entries.len() > 1 {
            return Err(Error::MalformedResponse(format!(
                "base search on `{dn}` returned {} entries",
                entries.len()
            )));
        }
        Ok(entries.pop())
    }

    /// Member DNs referenced by a group entry, in attribute order.
    async fn member_references(&self, entry: &LdapEntry) -> Result<Vec<DistinguishedName>> {
        let mut references = Vec::new();

        for attribute in &self.schema.member_attributes {
            for value in entry.values(attribute).unwrap_or_default() {
                match DistinguishedName::parse(value) {
                    Ok(dn) => references.push(dn),
                    Err(err) => {
                        warn!(group = %entry.dn, attribute = attribute.as_str(), value = %value, error = %err, "ignoring unparseable member value");
                    }
                }
            }
        }

        for attribute in &self.schema.member_uid_attributes {
            for uid in entry.values(attribute).unwrap_or_default() {
                if let Some(dn) = self.resolve_member_uid(&entry.dn, uid).await? {
                    references.push(dn);
                }
            }
        }

        Ok(references)
    }

    async fn resolve_member_uid(&self, group: &str, uid: &str) -> Result<Option<DistinguishedName>> {
        let Some(base) = &self.user_base_dn else {
            warn!(group, uid, "no user base DN configured, cannot resolve member uid");
            return Ok(None);
        };

        let filter = format!(
            "({}={})",
            self.schema.user_lookup_attribute,
            escape_filter_value(uid)
        );
        let entries = self
            .connection
            .search(
                base.as_str(),
                SearchScope::Subtree,
                &filter,
                &[NO_ATTRIBUTES.to_string()],
            )
            .await?;

        let Some(entry) = entries.first() else {
            warn!(group, uid, "member uid does not match any user");
            return Ok(None);
        };
        if entries.len() > 1 {
            warn!(group, uid, matches = entries.len(), "member uid is ambiguous, using first match");
        }

        DistinguishedName::parse(&entry.dn).map(Some).map_err(|err| {
            Error::MalformedResponse(format!("directory returned invalid DN `{}`: {err}", entry.dn))
        })
    }

    /// Attributes read for groups and members alike, without duplicates.
    fn entry_attributes(&self, uid_attribute: &str) -> Vec<String> {
        let mut attributes: Vec<String> = Vec::new();
        let candidates = std::iter::once(uid_attribute)
            .chain(std::iter::once(OBJECT_CLASS))
            .chain(self.schema.member_attributes.iter().map(String::as_str))
            .chain(self.schema.member_uid_attributes.iter().map(String::as_str));

        for candidate in candidates {
            if !attributes
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(candidate))
            {
                attributes.push(candidate.to_string());
            }
        }
        attributes
    }

    fn is_group(&self, entry: &LdapEntry) -> bool {
        if let Some(classes) = entry.values(OBJECT_CLASS) {
            return self.schema.is_group_class(classes);
        }
        // Without object classes, an entry holding member references is treated as a group.
        self.schema
            .member_attributes
            .iter()
            .chain(&self.schema.member_uid_attributes)
            .any(|attribute| entry.values(attribute).is_some())
    }
}

fn checked_uid_attribute(uid_attribute: Arc<str>) -> Result<Arc<str>> {
    if uid_attribute.trim().is_empty() {
        return Err(Error::ConfigError(
            "uid attribute name cannot be empty".to_string(),
        ));
    }
    Ok(uid_attribute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockDirectoryConnection;
    use membership_core::CacheSettings;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_test::assert_ok;

    const LYDIA: &str = "cn=HMS Lydia,ou=crews,ou=groups,o=sevenSeas";
    const HORNBLOWER: &str = "cn=Horatio Hornblower,ou=people,o=sevenSeas";
    const BUSH: &str = "cn=William Bush,ou=people,o=sevenSeas";
    const PEOPLE: &str = "ou=people,o=sevenSeas";

    fn person(dn: &str, cn: &str, uid: &str) -> LdapEntry {
        LdapEntry::new(dn)
            .with_attribute("objectClass", ["top", "person", "inetOrgPerson"])
            .with_attribute("cn", [cn])
            .with_attribute("uid", [uid])
    }

    fn group(dn: &str, members: &[&str]) -> LdapEntry {
        LdapEntry::new(dn)
            .with_attribute("objectClass", ["top", "groupOfUniqueNames"])
            .with_attribute("uniqueMember", members.iter().copied())
    }

    fn canonical(dn: &str) -> String {
        DistinguishedName::parse(dn).unwrap().canonical().to_string()
    }

    /// Answers base searches by DN and `(attr=value)` subtree searches by attribute.
    fn answer(index: &HashMap<String, LdapEntry>, base: &str, scope: SearchScope, filter: &str) -> Vec<LdapEntry> {
        match scope {
            SearchScope::Base => index.get(&canonical(base)).cloned().into_iter().collect(),
            _ => {
                let (attribute, value) = filter
                    .trim_matches(|c| c == '(' || c == ')')
                    .split_once('=')
                    .unwrap();
                index
                    .values()
                    .filter(|entry| {
                        entry
                            .values(attribute)
                            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value)))
                    })
                    .cloned()
                    .collect()
            }
        }
    }

    fn directory(entries: Vec<LdapEntry>, searches: usize) -> Arc<dyn DirectoryConnection> {
        let index: HashMap<String, LdapEntry> = entries
            .into_iter()
            .map(|entry| (canonical(&entry.dn), entry))
            .collect();

        let mut directory = MockDirectoryConnection::new();
        directory
            .expect_search()
            .times(searches)
            .returning(move |base, scope, filter, _| Ok(answer(&index, base, scope, filter)));
        Arc::new(directory)
    }

    fn sevenseas(searches: usize) -> Arc<dyn DirectoryConnection> {
        directory(
            vec![
                group(LYDIA, &[HORNBLOWER, BUSH]),
                person(HORNBLOWER, "Horatio Hornblower", "hhornblower"),
                person(BUSH, "William Bush", "wbush"),
            ],
            searches,
        )
    }

    fn cache_config() -> CacheConfiguration {
        CacheConfiguration::new(CacheSettings::new().with_ttl_secs(60)).unwrap()
    }

    #[test]
    fn uid_attribute_name_is_the_configured_instance() {
        let resolver = GroupMembershipResolver::new(directory(Vec::new(), 0), "uid").unwrap();
        let cn: Arc<str> = Arc::from("cn");

        resolver.configure(cn.clone()).unwrap();
        assert!(Arc::ptr_eq(&resolver.uid_attribute_name(), &cn));
    }

    #[test]
    fn empty_uid_attribute_is_rejected() {
        let err = GroupMembershipResolver::new(directory(Vec::new(), 0), "")
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConfigError(_)));

        let resolver = GroupMembershipResolver::new(directory(Vec::new(), 0), "cn").unwrap();
        let err = resolver.configure("  ").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
        assert_eq!(&*resolver.uid_attribute_name(), "cn");
    }

    #[test]
    fn get_cache_returns_same_instance() {
        let resolver = GroupMembershipResolver::new(directory(Vec::new(), 0), "cn").unwrap();
        let config = cache_config();

        let first = assert_ok!(resolver.get_cache(&config));
        let second = assert_ok!(resolver.get_cache(&config.clone()));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn get_group_members_resolves_and_caches() {
        // One search for the group, one per member; the second call is served from cache.
        let resolver = GroupMembershipResolver::new(sevenseas(3), "cn").unwrap();
        let config = cache_config();

        let first = resolver.get_group_members(LYDIA, &config).await.unwrap().unwrap();
        let keys: HashSet<&str> = first.member_dns().collect();
        assert_eq!(
            keys,
            HashSet::from([
                "cn=horatio hornblower,ou=people,o=sevenseas",
                "cn=william bush,ou=people,o=sevenseas",
            ])
        );
        assert_eq!(
            first.uid_of(&DistinguishedName::parse(HORNBLOWER).unwrap()),
            Some("Horatio Hornblower")
        );

        let second = resolver
            .get_group_members("CN=hms lydia, OU=Crews, OU=Groups, O=SevenSeas", &config)
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn missing_group_is_not_found_and_not_cached() {
        let resolver = GroupMembershipResolver::new(sevenseas(2), "cn").unwrap();
        let config = cache_config();

        for _ in 0..2 {
            let members = resolver
                .get_group_members("cn=wronggroupdn,ou=people,o=sevenSeas", &config)
                .await
                .unwrap();
            assert!(members.is_none());
        }
        assert!(resolver.get_cache(&config).unwrap().is_empty());
    }

    #[tokio::test]
    async fn existing_group_without_members_is_empty_not_missing() {
        let sophie = "cn=HMS Sophie,ou=crews,ou=groups,o=sevenSeas";
        let resolver = GroupMembershipResolver::new(directory(vec![group(sophie, &[])], 1), "cn").unwrap();

        let members = resolver
            .get_group_members(sophie, &cache_config())
            .await
            .unwrap()
            .unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn non_group_entry_is_not_found() {
        let resolver = GroupMembershipResolver::new(sevenseas(1), "cn").unwrap();
        let members = resolver
            .get_group_members(HORNBLOWER, &cache_config())
            .await
            .unwrap();
        assert!(members.is_none());
    }

    #[tokio::test]
    async fn malformed_group_dn_is_rejected_without_searching() {
        let resolver = GroupMembershipResolver::new(directory(Vec::new(), 0), "cn").unwrap();
        let err = resolver
            .get_group_members("HMS Lydia", &cache_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn directory_faults_propagate() {
        let mut mock = MockDirectoryConnection::new();
        mock.expect_search()
            .times(2)
            .returning(|_, _, _, _| Err(Error::directory("search", "connection reset")));
        let resolver = GroupMembershipResolver::new(Arc::new(mock), "cn").unwrap();
        let config = cache_config();

        let err = resolver.get_group_members(LYDIA, &config).await.unwrap_err();
        assert!(err.is_directory_fault());

        let err = resolver
            .is_member_of("Horatio Hornblower", LYDIA, &config)
            .await
            .unwrap_err();
        assert!(err.is_directory_fault());
        assert!(resolver.get_cache(&config).unwrap().is_empty());
    }

    #[tokio::test]
    async fn member_lookup_fault_fails_the_whole_resolution() {
        let group_entry = group(LYDIA, &[HORNBLOWER]);
        let mut mock = MockDirectoryConnection::new();
        mock.expect_search()
            .withf(|base, _, _, _| base == LYDIA)
            .times(1)
            .returning(move |_, _, _, _| Ok(vec![group_entry.clone()]));
        mock.expect_search()
            .withf(|base, _, _, _| base == HORNBLOWER)
            .times(1)
            .returning(|_, _, _, _| Err(Error::Timeout("search".to_string())));
        let resolver = GroupMembershipResolver::new(Arc::new(mock), "cn").unwrap();

        let err = resolver
            .get_group_members(LYDIA, &cache_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn is_member_of_returns_canonical_dn() {
        let resolver = GroupMembershipResolver::new(sevenseas(4), "cn").unwrap();
        let config = cache_config();

        assert_eq!(
            resolver
                .is_member_of("Horatio Hornblower", LYDIA, &config)
                .await
                .unwrap()
                .as_deref(),
            Some("cn=horatio hornblower,ou=people,o=sevenseas")
        );
        assert_eq!(
            resolver
                .is_member_of(BUSH, LYDIA, &config)
                .await
                .unwrap()
                .as_deref(),
            Some("cn=william bush,ou=people,o=sevenseas")
        );
        assert!(resolver
            .is_member_of("Thomas Quist", LYDIA, &config)
            .await
            .unwrap()
            .is_none());
        assert!(resolver
            .is_member_of("Horatio Hornblower", "cn=wronggroupdn,ou=people,o=sevenSeas", &config)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn uid_attribute_selects_display_value() {
        let resolver = GroupMembershipResolver::new(sevenseas(6), "uid").unwrap();
        let config = cache_config();

        assert_eq!(
            resolver
                .is_member_of("HHORNBLOWER", LYDIA, &config)
                .await
                .unwrap()
                .as_deref(),
            Some("cn=horatio hornblower,ou=people,o=sevenseas")
        );

        // Switching attributes drops cached results, so the group is fetched again.
        resolver.configure("cn").unwrap();
        assert!(resolver.get_cache(&config).unwrap().is_empty());
        assert!(resolver
            .is_member_of("Horatio Hornblower", LYDIA, &config)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn reconfiguring_same_attribute_keeps_cache() {
        let resolver = GroupMembershipResolver::new(sevenseas(3), "cn").unwrap();
        let config = cache_config();

        resolver.get_group_members(LYDIA, &config).await.unwrap();
        resolver.configure("CN").unwrap();
        assert_eq!(resolver.get_cache(&config).unwrap().len(), 1);
        resolver.get_group_members(LYDIA, &config).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_triggers_one_fresh_fetch() {
        let resolver = GroupMembershipResolver::new(sevenseas(6), "cn").unwrap();
        let config = cache_config();

        let first = resolver.get_group_members(LYDIA, &config).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        let cached = resolver.get_group_members(LYDIA, &config).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &cached));

        tokio::time::advance(Duration::from_secs(31)).await;
        let refreshed = resolver.get_group_members(LYDIA, &config).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &refreshed));

        let again = resolver.get_group_members(LYDIA, &config).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&refreshed, &again));
    }

    #[tokio::test]
    async fn separate_cache_configurations_do_not_share_results() {
        let resolver = GroupMembershipResolver::new(sevenseas(6), "cn").unwrap();

        let a = resolver.get_group_members(LYDIA, &cache_config()).await.unwrap().unwrap();
        let b = resolver.get_group_members(LYDIA, &cache_config()).await.unwrap().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), b.len());
    }

    #[tokio::test]
    async fn invalidate_group_forces_refetch() {
        let resolver = GroupMembershipResolver::new(sevenseas(6), "cn").unwrap();
        let config = cache_config();

        resolver.get_group_members(LYDIA, &config).await.unwrap();
        assert!(resolver.invalidate_group(&LYDIA.to_uppercase(), &config).unwrap());
        assert!(!resolver.invalidate_group(LYDIA, &config).unwrap());
        resolver.get_group_members(LYDIA, &config).await.unwrap();
    }

    #[tokio::test]
    async fn nested_groups_are_expanded_once() {
        let crews = "cn=Crews,ou=groups,o=sevenSeas";
        let entries = vec![
            // The nested group refers back to its parent.
            group(crews, &[LYDIA, "cn=Thomas Quist,ou=people,o=sevenSeas"]),
            group(LYDIA, &[HORNBLOWER, BUSH, crews]),
            person(HORNBLOWER, "Horatio Hornblower", "hhornblower"),
            person(BUSH, "William Bush", "wbush"),
            person("cn=Thomas Quist,ou=people,o=sevenSeas", "Thomas Quist", "tquist"),
        ];
        let resolver = GroupMembershipResolver::new(directory(entries, 5), "cn").unwrap();

        let members = resolver
            .get_group_members(crews, &cache_config())
            .await
            .unwrap()
            .unwrap();
        let keys: HashSet<&str> = members.member_dns().collect();
        assert_eq!(
            keys,
            HashSet::from([
                "cn=thomas quist,ou=people,o=sevenseas",
                "cn=horatio hornblower,ou=people,o=sevenseas",
                "cn=william bush,ou=people,o=sevenseas",
            ])
        );
    }

    #[tokio::test]
    async fn nested_groups_listed_as_members_when_expansion_disabled() {
        let crews = "cn=Crews,ou=groups,o=sevenSeas";
        let entries = vec![group(crews, &[LYDIA]), group(LYDIA, &[HORNBLOWER])];
        let resolver = GroupMembershipResolver::new(directory(entries, 2), "cn")
            .unwrap()
            .with_schema(GroupSchema::new().with_nested_groups(false))
            .unwrap();

        let members = resolver
            .get_group_members(crews, &cache_config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            members.iter().collect::<Vec<_>>(),
            vec![("cn=hms lydia,ou=crews,ou=groups,o=sevenseas", "HMS Lydia")]
        );
    }

    #[tokio::test]
    async fn member_uids_resolve_through_user_base() {
        let posix = "cn=gunners,ou=groups,o=sevenSeas";
        let entries = vec![
            LdapEntry::new(posix)
                .with_attribute("objectClass", ["top", "posixGroup"])
                .with_attribute("memberUid", ["hhornblower", "nobody"]),
            person(HORNBLOWER, "Horatio Hornblower", "hhornblower"),
        ];
        // Group, two uid lookups, one member entry.
        let resolver = GroupMembershipResolver::new(directory(entries, 4), "cn")
            .unwrap()
            .with_schema(GroupSchema::new().with_user_base_dn(PEOPLE))
            .unwrap();

        let members = resolver
            .get_group_members(posix, &cache_config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            members.iter().collect::<Vec<_>>(),
            vec![("cn=horatio hornblower,ou=people,o=sevenseas", "Horatio Hornblower")]
        );
    }

    #[tokio::test]
    async fn member_uids_without_user_base_are_skipped() {
        let posix = "cn=gunners,ou=groups,o=sevenSeas";
        let entries = vec![LdapEntry::new(posix)
            .with_attribute("objectClass", ["posixGroup"])
            .with_attribute("memberUid", ["hhornblower"])];
        let resolver = GroupMembershipResolver::new(directory(entries, 1), "cn").unwrap();

        let members = resolver
            .get_group_members(posix, &cache_config())
            .await
            .unwrap()
            .unwrap();
        assert!(members.is_empty());
    }

    #[tokio::test]
    async fn bad_and_dangling_members_are_skipped() {
        let ghost = "cn=Ghost,ou=people,o=sevenSeas";
        let nameless = "cn=Moultrie Crystal,ou=people,o=sevenSeas";
        let entries = vec![
            LdapEntry::new(LYDIA)
                .with_attribute("objectClass", ["groupOfNames"])
                .with_attribute("member", ["not a dn", ghost, nameless]),
            LdapEntry::new(nameless).with_attribute("objectClass", ["person"]),
        ];
        let resolver = GroupMembershipResolver::new(directory(entries, 3), "uid").unwrap();

        let members = resolver
            .get_group_members(LYDIA, &cache_config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            members.iter().collect::<Vec<_>>(),
            vec![("cn=moultrie crystal,ou=people,o=sevenseas", "Moultrie Crystal")]
        );
    }

    #[tokio::test]
    async fn entries_without_object_class_fall_back_to_member_attributes() {
        let entries = vec![
            LdapEntry::new(LYDIA).with_attribute("member", [HORNBLOWER]),
            LdapEntry::new(HORNBLOWER).with_attribute("cn", ["Horatio Hornblower"]),
        ];
        let resolver = GroupMembershipResolver::new(directory(entries, 2), "cn").unwrap();

        let members = resolver
            .get_group_members(LYDIA, &cache_config())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(members.len(), 1);
    }

    #[test]
    fn entry_attributes_are_deduplicated() {
        let resolver = GroupMembershipResolver::new(directory(Vec::new(), 0), "member").unwrap();
        assert_eq!(
            resolver.entry_attributes("member"),
            vec!["member", "objectClass", "uniqueMember", "memberUid"]
        );
    }

    #[test]
    fn from_config_applies_schema() {
        let config = ResolverConfig::new("cn")
            .unwrap()
            .with_schema(GroupSchema::new().with_user_base_dn(PEOPLE));
        let resolver =
            assert_ok!(GroupMembershipResolver::from_config(directory(Vec::new(), 0), &config));
        assert_eq!(&*resolver.uid_attribute_name(), "cn");
        assert_eq!(resolver.schema().user_base_dn.as_deref(), Some(PEOPLE));

        let broken = config.with_schema(GroupSchema::new().with_user_base_dn("people"));
        let err = GroupMembershipResolver::from_config(directory(Vec::new(), 0), &broken)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn invalid_schema_is_rejected() {
        let no_lookup = GroupSchema::new().with_user_lookup_attribute("");
        let err = GroupMembershipResolver::new(directory(Vec::new(), 0), "cn")
            .unwrap()
            .with_schema(no_lookup)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConfigError(_)));

        let no_classes = GroupSchema {
            group_object_classes: Vec::new(),
            ..GroupSchema::default()
        };
        let err = GroupMembershipResolver::new(directory(Vec::new(), 0), "cn")
            .unwrap()
            .with_schema(no_classes)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    /// Holds the first search until released.
    struct GatedDirectory {
        index: HashMap<String, LdapEntry>,
        hold: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DirectoryConnection for GatedDirectory {
        async fn search(
            &self,
            base_dn: &str,
            scope: SearchScope,
            filter: &str,
            _attributes: &[String],
        ) -> Result<Vec<LdapEntry>> {
            if self.hold.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(answer(&self.index, base_dn, scope, filter))
        }
    }

    #[tokio::test]
    async fn reconfiguring_during_a_fetch_discards_the_stale_result() {
        let directory = Arc::new(GatedDirectory {
            index: [
                group(LYDIA, &[HORNBLOWER]),
                person(HORNBLOWER, "Horatio Hornblower", "hhornblower"),
            ]
            .into_iter()
            .map(|entry| (canonical(&entry.dn), entry))
            .collect(),
            hold: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let resolver = Arc::new(GroupMembershipResolver::new(directory.clone(), "uid").unwrap());
        let config = cache_config();

        let pending = tokio::spawn({
            let resolver = resolver.clone();
            let config = config.clone();
            async move { resolver.get_group_members(LYDIA, &config).await }
        });

        directory.entered.notified().await;
        resolver.configure("cn").unwrap();
        directory.release.notify_one();

        let members = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(
            members.uid_of(&DistinguishedName::parse(HORNBLOWER).unwrap()),
            Some("Horatio Hornblower")
        );

        let cached = resolver
            .get_cache(&config)
            .unwrap()
            .get(&canonical(LYDIA))
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&members, &cached));
        assert_eq!(
            resolver
                .is_member_of("Horatio Hornblower", LYDIA, &config)
                .await
                .unwrap()
                .as_deref(),
            Some("cn=horatio hornblower,ou=people,o=sevenseas")
        );
    }
}
