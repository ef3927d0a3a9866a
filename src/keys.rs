//! Cache key construction and invalidation rules
//!
//! [`KeyBuilder`] is the only place cache keys are made. Readers and writers
//! go through the same builder functions, so the key a reader looks up and
//! the key a writer invalidates are byte-identical for the same inputs.
//!
//! # Key layout
//!
//! ```text
//! {namespace}:{entity}:{v1}:{v2}...            detail key, values sorted by param name
//! {namespace}:{entity}:{v...}:rel:{suffix}      related key (versions, latest, ...)
//! {namespace}:{entity}:list[:{scope...}]:{q}    list key, q = sorted k=v&k=v or "all"
//! {namespace}:{entity}:agg:{name}               aggregate key
//! ```
//!
//! Every component is percent-escaped, so keys are ASCII and never contain
//! `:` or `*` inside a component. A value spelling `list`, `agg` or `rel`
//! has its first byte escaped, so it cannot pose as a reserved segment.
//!
//! # Example
//!
//! ```rust
//! use tiered_cache::{Affects, InvalidationRules, KeyBuilder};
//!
//! let rules = InvalidationRules::new().rule(
//!     "app.updated",
//!     [
//!         Affects::detail("app", ["appId"]),
//!         Affects::scoped_lists("apps", ["tenantId"]),
//!     ],
//! );
//! let keys = KeyBuilder::new("app-service").with_rules(rules);
//!
//! let detail = keys.build_key("app", [("appId", "42")]);
//! assert_eq!(detail.as_str(), "app-service:app:42");
//!
//! let plan = keys
//!     .invalidation_keys_for("app.updated", [("appId", "42"), ("tenantId", "t1")])
//!     .unwrap();
//! assert_eq!(plan.keys, vec![detail]);
//! assert_eq!(plan.patterns[0].as_str(), "app-service:apps:list:t1:*");
//! ```

use crate::error::{CacheError, CacheResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Write as _};
use std::str::FromStr;

const LIST_SEGMENT: &str = "list";
const AGGREGATE_SEGMENT: &str = "agg";
const RELATED_SEGMENT: &str = "rel";
const EMPTY_QUERY: &str = "all";

/// A cache key produced by [`KeyBuilder`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Glob pattern with an optional single trailing `*`
///
/// A pattern without `*` matches one key exactly. `prefix*` matches every key
/// starting with `prefix`. No other glob syntax is recognized.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPattern {
    raw: String,
    wildcard: bool,
}

impl KeyPattern {
    /// Parse and validate a pattern
    ///
    /// # Errors
    ///
    /// [`CacheError::InvalidKeyPattern`] for an empty or non-ASCII pattern, or
    /// one where `*` appears anywhere but the last position.
    pub fn parse(pattern: &str) -> CacheResult<Self> {
        let invalid = |reason| CacheError::InvalidKeyPattern {
            pattern: pattern.to_string(),
            reason,
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if !pattern.is_ascii() {
            return Err(invalid("pattern must be ASCII"));
        }
        match pattern.matches('*').count() {
            0 => Ok(Self {
                raw: pattern.to_string(),
                wildcard: false,
            }),
            1 if pattern.ends_with('*') => Ok(Self {
                raw: pattern.to_string(),
                wildcard: true,
            }),
            1 => Err(invalid("wildcard must be the last character")),
            _ => Err(invalid("only a single trailing '*' is supported")),
        }
    }

    /// Pattern matching exactly `key`
    #[must_use]
    pub fn exact(key: &CacheKey) -> Self {
        Self {
            raw: key.0.clone(),
            wildcard: false,
        }
    }

    fn with_prefix(mut prefix: String) -> Self {
        prefix.push('*');
        Self {
            raw: prefix,
            wildcard: true,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the pattern names a single key
    #[must_use]
    pub fn is_exact(&self) -> bool {
        !self.wildcard
    }

    /// The literal part of the pattern (everything before `*`)
    #[must_use]
    pub fn prefix(&self) -> &str {
        if self.wildcard {
            self.raw.strip_suffix('*').unwrap_or(&self.raw)
        } else {
            &self.raw
        }
    }

    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        if self.wildcard {
            key.starts_with(self.prefix())
        } else {
            key == self.raw
        }
    }
}

impl FromStr for KeyPattern {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One class of cache entries made stale by a mutation
///
/// Parameter names (`by`, `scope`) select which of the mutation's affected
/// parameters feed the key. When a named parameter is missing the target
/// widens to a pattern covering the whole entity, so a rule can over-invalidate
/// but never miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Affects {
    /// `{ns}:{entity}:{values of by}`
    Detail { entity: String, by: Vec<String> },
    /// `{ns}:{entity}:{values of by}:rel:{suffix}`
    Related {
        entity: String,
        by: Vec<String>,
        suffix: String,
    },
    /// Every key below the detail key: `{ns}:{entity}:{values of by}:*`
    Subtree { entity: String, by: Vec<String> },
    /// Every list key of the entity, optionally narrowed to one scope
    Lists { entity: String, scope: Vec<String> },
    /// `{ns}:{entity}:agg:{name}`
    Aggregate { entity: String, name: String },
}

fn names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

impl Affects {
    pub fn detail<I, S>(entity: impl Into<String>, by: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Detail {
            entity: entity.into(),
            by: names(by),
        }
    }

    pub fn related<I, S>(entity: impl Into<String>, by: I, suffix: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Related {
            entity: entity.into(),
            by: names(by),
            suffix: suffix.into(),
        }
    }

    pub fn subtree<I, S>(entity: impl Into<String>, by: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Subtree {
            entity: entity.into(),
            by: names(by),
        }
    }

    /// All list keys of `entity`, whatever their scope
    pub fn lists(entity: impl Into<String>) -> Self {
        Self::Lists {
            entity: entity.into(),
            scope: Vec::new(),
        }
    }

    /// List keys of `entity` within the scope given by the named parameters
    pub fn scoped_lists<I, S>(entity: impl Into<String>, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Lists {
            entity: entity.into(),
            scope: names(scope),
        }
    }

    pub fn aggregate(entity: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Aggregate {
            entity: entity.into(),
            name: name.into(),
        }
    }
}

/// Mapping from mutation kind to the entries it makes stale
///
/// Every cached read path needs a matching rule here; a key with no rule is
/// only ever refreshed by TTL expiry.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRules {
    rules: HashMap<String, Vec<Affects>>,
}

impl InvalidationRules {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the targets of `mutation`, appending to any existing rule
    #[must_use]
    pub fn rule(mut self, mutation: impl Into<String>, affects: impl IntoIterator<Item = Affects>) -> Self {
        self.rules.entry(mutation.into()).or_default().extend(affects);
        self
    }

    #[must_use]
    pub fn get(&self, mutation: &str) -> Option<&[Affects]> {
        self.rules.get(mutation).map(Vec::as_slice)
    }

    pub fn mutations(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

/// Exact keys and patterns made stale by one mutation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    pub keys: Vec<CacheKey>,
    pub patterns: Vec<KeyPattern>,
}

impl InvalidationPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.patterns.is_empty()
    }

    fn push_key(&mut self, key: CacheKey) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    fn push_pattern(&mut self, pattern: KeyPattern) {
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
    }

    /// Drop exact keys already covered by one of the plan's patterns
    fn compact(&mut self) {
        let patterns = &self.patterns;
        self.keys
            .retain(|key| !patterns.iter().any(|p| p.matches(key.as_str())));
    }
}

type Params = BTreeMap<String, String>;

fn collect_params<I, K, V>(params: I) -> Params
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    params
        .into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
        .collect()
}

/// Builds every cache key and invalidation plan for one namespace
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    namespace: String,
    rules: InvalidationRules,
}

impl KeyBuilder {
    pub fn new(namespace: &str) -> Self {
        let mut escaped = String::with_capacity(namespace.len());
        escape_into(&mut escaped, namespace);
        Self {
            namespace: escaped,
            rules: InvalidationRules::default(),
        }
    }

    #[must_use]
    pub fn with_rules(mut self, rules: InvalidationRules) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn rules(&self) -> &InvalidationRules {
        &self.rules
    }

    /// Detail key of one entity, e.g. `app-service:app:42`
    pub fn build_key<I, K, V>(&self, entity: &str, params: I) -> CacheKey
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let params = collect_params(params);
        CacheKey(self.detail(entity, params.values()))
    }

    /// Key of a resource hanging off one entity, e.g. `app-service:app:42:rel:versions`
    ///
    /// The `rel` segment keeps related keys apart from detail keys with more
    /// parameters, whatever the suffix.
    pub fn build_related_key<I, K, V>(&self, entity: &str, params: I, suffix: &str) -> CacheKey
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let params = collect_params(params);
        let mut key = self.detail(entity, params.values());
        key.push(':');
        key.push_str(RELATED_SEGMENT);
        key.push(':');
        escape_into(&mut key, suffix);
        CacheKey(key)
    }

    /// Key of a list/query result
    ///
    /// `scope` values become key segments (so a scope can be invalidated as a
    /// whole); `filters` are serialized canonically, independent of the order
    /// they are given in. Pagination cursor and page size belong in `filters`.
    pub fn build_list_key<S, SK, SV, F, FK, FV>(&self, entity: &str, scope: S, filters: F) -> CacheKey
    where
        S: IntoIterator<Item = (SK, SV)>,
        SK: AsRef<str>,
        SV: AsRef<str>,
        F: IntoIterator<Item = (FK, FV)>,
        FK: AsRef<str>,
        FV: AsRef<str>,
    {
        let scope = collect_params(scope);
        let filters = collect_params(filters);

        let mut key = self.list_prefix(entity, scope.values());
        if filters.is_empty() {
            key.push_str(EMPTY_QUERY);
        } else {
            for (i, (name, value)) in filters.iter().enumerate() {
                if i > 0 {
                    key.push('&');
                }
                escape_into(&mut key, name);
                key.push('=');
                escape_into(&mut key, value);
            }
        }
        CacheKey(key)
    }

    /// Key of an aggregate/statistic over an entity type, e.g. `app-service:apps:agg:stats`
    #[must_use]
    pub fn build_aggregate_key(&self, entity: &str, name: &str) -> CacheKey {
        let mut key = self.entity_base(entity);
        key.push(':');
        key.push_str(AGGREGATE_SEGMENT);
        key.push(':');
        escape_into(&mut key, name);
        CacheKey(key)
    }

    /// Pattern covering every key of the namespace
    #[must_use]
    pub fn namespace_pattern(&self) -> KeyPattern {
        KeyPattern::with_prefix(format!("{}:", self.namespace))
    }

    /// Pattern covering every list key of `entity`
    #[must_use]
    pub fn list_pattern(&self, entity: &str) -> KeyPattern {
        KeyPattern::with_prefix(self.list_prefix(entity, std::iter::empty::<&String>()))
    }

    /// Everything made stale by `mutation` on the entities named by `affected`
    ///
    /// # Errors
    ///
    /// [`CacheError::UnknownMutation`] if no rule is registered for `mutation`.
    pub fn invalidation_keys_for<I, K, V>(&self, mutation: &str, affected: I) -> CacheResult<InvalidationPlan>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let targets = self
            .rules
            .get(mutation)
            .ok_or_else(|| CacheError::UnknownMutation(mutation.to_string()))?;
        let affected = collect_params(affected);

        let mut plan = InvalidationPlan::default();
        for target in targets {
            match target {
                Affects::Detail { entity, by } => match select(&affected, by) {
                    Some(values) => plan.push_key(CacheKey(self.detail(entity, values.iter()))),
                    None => plan.push_pattern(self.entity_pattern(entity)),
                },
                Affects::Related { entity, by, suffix } => match select(&affected, by) {
                    Some(values) => {
                        let mut key = self.detail(entity, values.iter());
                        key.push(':');
                        escape_into(&mut key, suffix);
                        plan.push_key(CacheKey(key));
                    }
                    None => plan.push_pattern(self.entity_pattern(entity)),
                },
                Affects::Subtree { entity, by } => match select(&affected, by) {
                    Some(values) => {
                        let mut prefix = self.detail(entity, values.iter());
                        prefix.push(':');
                        plan.push_pattern(KeyPattern::with_prefix(prefix));
                    }
                    None => plan.push_pattern(self.entity_pattern(entity)),
                },
                Affects::Lists { entity, scope } => {
                    let prefix = match select(&affected, scope) {
                        Some(values) => self.list_prefix(entity, values.iter()),
                        None => self.list_prefix(entity, std::iter::empty::<&String>()),
                    };
                    plan.push_pattern(KeyPattern::with_prefix(prefix));
                }
                Affects::Aggregate { entity, name } => {
                    plan.push_key(self.build_aggregate_key(entity, name));
                }
            }
        }
        plan.compact();
        Ok(plan)
    }

    fn entity_base(&self, entity: &str) -> String {
        let mut key = String::with_capacity(self.namespace.len() + entity.len() + 16);
        key.push_str(&self.namespace);
        key.push(':');
        escape_into(&mut key, entity);
        key
    }

    fn entity_pattern(&self, entity: &str) -> KeyPattern {
        let mut prefix = self.entity_base(entity);
        prefix.push(':');
        KeyPattern::with_prefix(prefix)
    }

    fn detail<'a>(&self, entity: &str, values: impl Iterator<Item = &'a String>) -> String {
        let mut key = self.entity_base(entity);
        for value in values {
            key.push(':');
            escape_segment_into(&mut key, value);
        }
        key
    }

    fn list_prefix<'a>(&self, entity: &str, scope: impl Iterator<Item = &'a String>) -> String {
        let mut key = self.entity_base(entity);
        key.push(':');
        key.push_str(LIST_SEGMENT);
        for value in scope {
            key.push(':');
            escape_segment_into(&mut key, value);
        }
        key.push(':');
        key
    }
}

/// Values of the named parameters, in name order; `None` if any is missing
fn select(affected: &Params, names: &[String]) -> Option<Vec<String>> {
    let mut selected: Vec<(&String, &String)> = Vec::with_capacity(names.len());
    for name in names {
        let value = affected.get(name)?;
        selected.push((name, value));
    }
    selected.sort_by(|a, b| a.0.cmp(b.0));
    Some(selected.into_iter().map(|(_, v)| v.clone()).collect())
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'@' | b'+')
}

fn escape_into(out: &mut String, component: &str) {
    for &byte in component.as_bytes() {
        push_byte(out, byte);
    }
}

/// Escape a value segment; values spelling a reserved segment get their first byte encoded
fn escape_segment_into(out: &mut String, value: &str) {
    if [LIST_SEGMENT, AGGREGATE_SEGMENT, RELATED_SEGMENT].contains(&value) {
        let mut bytes = value.bytes();
        if let Some(first) = bytes.next() {
            let _ = write!(out, "%{first:02X}");
        }
        for byte in bytes {
            push_byte(out, byte);
        }
    } else {
        escape_into(out, value);
    }
}

fn push_byte(out: &mut String, byte: u8) {
    if is_unreserved(byte) {
        out.push(char::from(byte));
    } else {
        let _ = write!(out, "%{byte:02X}");
    }
}

/// Distinct keys of a key list, order preserved
pub(crate) fn dedup_keys(keys: &[CacheKey]) -> Vec<CacheKey> {
    let mut seen = HashSet::with_capacity(keys.len());
    keys.iter().filter(|k| seen.insert(k.as_str())).cloned().collect()
}
