use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Login handles: alphanumerics and hyphens, no spaces, at most 39 characters.
static RE_USERNAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9-]{0,38}$").unwrap());

/// Fallback seed when a record carries no identity field at all.
const UNKNOWN_SEED: &str = "unknown";

/// One real contributor after evaluating every alias observed for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalIdentity {
    pub canonical_key: String,
    pub display_label: String,
    /// Raw handle used when asking the upstream about this contributor.
    pub query_handle: String,
    pub aka: BTreeSet<String>,
}

/// Outcome of resolving one record's identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedIdentity {
    pub canonical_key: String,
    pub display_label: String,
}

/// Whether a raw identity field looks like a login handle.
pub fn is_username_like(s: &str) -> bool {
    RE_USERNAME.is_match(s)
}

/// Lowercase and strip everything but alphanumerics.
pub fn normalize_alias(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

/// Session-scoped alias table mapping normalized aliases to canonical keys.
///
/// Alias bindings are append-only: once an alias points at a key it is never
/// rebound, and two existing keys are never merged. When one record carries
/// aliases already bound to different identities, the first bound candidate
/// in seed order wins.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    aliases: HashMap<String, String>,
    identities: BTreeMap<String, CanonicalIdentity>,
    unknown_count: u64,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every alias and identity. Call between unrelated sessions.
    pub fn reset(&mut self) {
        self.aliases.clear();
        self.identities.clear();
        self.unknown_count = 0;
    }

    pub fn resolve(
        &mut self,
        raw_login: Option<&str>,
        raw_display_name: Option<&str>,
        raw_email: Option<&str>,
    ) -> ResolvedIdentity {
        let login = non_empty(raw_login);
        let display = non_empty(raw_display_name);
        let email = non_empty(raw_email);

        let seed = login
            .filter(|l| is_username_like(l))
            .or_else(|| display.filter(|d| is_username_like(d)))
            .or(login)
            .or(display)
            .unwrap_or(UNKNOWN_SEED);

        let label = display
            .filter(|d| !is_username_like(d))
            .unwrap_or(seed)
            .to_string();

        // Seed first so a freshly minted key is derived from it.
        let mut candidates: Vec<String> = Vec::with_capacity(4);
        for raw in [Some(seed), login, display, email].into_iter().flatten() {
            if raw == UNKNOWN_SEED && login.is_none() && display.is_none() {
                continue;
            }
            let alias = normalize_alias(raw);
            if !alias.is_empty() && !candidates.contains(&alias) {
                candidates.push(alias);
            }
        }

        let bound = candidates
            .iter()
            .find_map(|alias| self.aliases.get(alias).cloned());

        if let Some(key) = bound {
            if let Some(identity) = self.identities.get_mut(&key) {
                for alias in candidates {
                    if !self.aliases.contains_key(&alias) {
                        self.aliases.insert(alias.clone(), key.clone());
                        identity.aka.insert(alias);
                    }
                }
                return ResolvedIdentity {
                    canonical_key: key,
                    display_label: identity.display_label.clone(),
                };
            }
        }

        let canonical_key = match candidates.first() {
            Some(first) => first.clone(),
            None => {
                self.unknown_count += 1;
                format!("{UNKNOWN_SEED}-{}", self.unknown_count)
            }
        };
        log::debug!("New identity {canonical_key} (label {label:?})");
        for alias in &candidates {
            self.aliases.insert(alias.clone(), canonical_key.clone());
        }
        self.identities.insert(
            canonical_key.clone(),
            CanonicalIdentity {
                canonical_key: canonical_key.clone(),
                display_label: label.clone(),
                query_handle: seed.to_string(),
                aka: candidates.into_iter().collect(),
            },
        );
        ResolvedIdentity {
            canonical_key,
            display_label: label,
        }
    }

    pub fn identity(&self, canonical_key: &str) -> Option<&CanonicalIdentity> {
        self.identities.get(canonical_key)
    }

    pub fn identities(&self) -> impl Iterator<Item = &CanonicalIdentity> {
        self.identities.values()
    }

    /// Canonical key an alias is bound to, if any.
    pub fn lookup(&self, alias: &str) -> Option<&str> {
        self.aliases.get(&normalize_alias(alias)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
