//! Capabilities: named permissions carried by a mytoken.
//!
//! A set of capabilities can only shrink when a child token is derived. The
//! ceiling for a child is the parent's subtoken capabilities when present,
//! otherwise the parent's own capabilities.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single named permission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

/// Obtain OpenID Connect access tokens.
pub const CAPABILITY_AT: &str = "AT";
/// Create child mytokens.
pub const CAPABILITY_CREATE_MYTOKEN: &str = "create_mytoken";
/// Modify user settings.
pub const CAPABILITY_SETTINGS: &str = "settings";
/// Obtain basic information about the token.
pub const CAPABILITY_TOKENINFO_INTROSPECT: &str = "tokeninfo_introspect";
/// Obtain the event history of the token.
pub const CAPABILITY_TOKENINFO_HISTORY: &str = "tokeninfo_history";
/// List the subtoken tree of the token.
pub const CAPABILITY_TOKENINFO_TREE: &str = "tokeninfo_tree";
/// List all mytokens of the user.
pub const CAPABILITY_LIST_MYTOKENS: &str = "list_mytokens";

/// Every capability the server understands, with its description.
pub const ALL_CAPABILITIES: &[(&str, &str)] = &[
    (CAPABILITY_AT, "Allows obtaining OpenID Connect Access Tokens."),
    (CAPABILITY_CREATE_MYTOKEN, "Allows to create a new mytoken."),
    (CAPABILITY_SETTINGS, "Allows to modify user settings."),
    (
        CAPABILITY_TOKENINFO_INTROSPECT,
        "Allows to obtain basic information about this token.",
    ),
    (
        CAPABILITY_TOKENINFO_HISTORY,
        "Allows to obtain the event history for this token.",
    ),
    (
        CAPABILITY_TOKENINFO_TREE,
        "Allows to list a subtoken-tree for this token.",
    ),
    (CAPABILITY_LIST_MYTOKENS, "Allows to list all mytokens."),
];

/// Granted when a request names no capabilities.
pub const DEFAULT_CAPABILITIES: &[&str] = &[CAPABILITY_AT, CAPABILITY_TOKENINFO_INTROSPECT];

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Description of a known capability, `None` for unknown names.
    pub fn description(&self) -> Option<&'static str> {
        ALL_CAPABILITIES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.0))
            .map(|(_, description)| *description)
    }

    pub fn is_known(&self) -> bool {
        self.description().is_some()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// An unordered set of capabilities.
///
/// Insertion order is kept for stable serialization; duplicates are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Capability>", into = "Vec<Capability>")]
pub struct Capabilities(Vec<Capability>);

impl From<Vec<Capability>> for Capabilities {
    fn from(items: Vec<Capability>) -> Self {
        items.into_iter().collect()
    }
}

impl From<Capabilities> for Vec<Capability> {
    fn from(caps: Capabilities) -> Self {
        caps.0
    }
}

impl FromIterator<Capability> for Capabilities {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut caps = Capabilities::new();
        for c in iter {
            caps.insert(c);
        }
        caps
    }
}

impl<'a> FromIterator<&'a str> for Capabilities {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        iter.into_iter().map(Capability::new).collect()
    }
}

impl Capabilities {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn defaults() -> Self {
        DEFAULT_CAPABILITIES.iter().copied().collect()
    }

    /// The set of all known capabilities.
    pub fn all() -> Self {
        ALL_CAPABILITIES.iter().map(|(name, _)| *name).collect()
    }

    pub fn insert(&mut self, c: Capability) {
        if !self.0.contains(&c) {
            self.0.push(c);
        }
    }

    /// Plain membership.
    pub fn has(&self, name: &str) -> bool {
        self.0.iter().any(|c| c.0 == name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn is_subset_of(&self, other: &Capabilities) -> bool {
        self.0.iter().all(|c| other.0.contains(c))
    }

    /// Reject any capability the server does not know.
    pub fn validate_known(&self) -> Result<()> {
        match self.0.iter().find(|c| !c.is_known()) {
            Some(unknown) => Err(Error::UnknownCapability(unknown.0.clone())),
            None => Ok(()),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|c| c.0.clone()).collect()
    }
}

/// Tighten `wanted` against the ceiling `ceiling`.
///
/// An absent or empty request inherits the full ceiling. Otherwise the
/// result is the part of the request that the ceiling also grants.
pub fn tighten(ceiling: &Capabilities, wanted: Option<&Capabilities>) -> Capabilities {
    match wanted {
        None => ceiling.clone(),
        Some(w) if w.is_empty() => ceiling.clone(),
        Some(w) => w.iter().filter(|c| ceiling.0.contains(c)).cloned().collect(),
    }
}

/// Capabilities of a child token derived from a parent.
///
/// Returns the child's capabilities and its subtoken ceiling. The ceiling is
/// only set when the child may itself create mytokens.
pub fn derive_for_child(
    parent_capabilities: &Capabilities,
    parent_subtoken_capabilities: Option<&Capabilities>,
    requested: Option<&Capabilities>,
    requested_subtoken: Option<&Capabilities>,
) -> (Capabilities, Option<Capabilities>) {
    let ceiling = parent_subtoken_capabilities.unwrap_or(parent_capabilities);
    let capabilities = tighten(ceiling, requested);
    let subtoken_capabilities = if capabilities.has(CAPABILITY_CREATE_MYTOKEN) {
        Some(tighten(ceiling, requested_subtoken))
    } else {
        None
    };
    (capabilities, subtoken_capabilities)
}
