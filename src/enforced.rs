//! Restriction templates enforced by user attributes.
//!
//! A provider can require that every token minted for a user is bound by a
//! restriction template chosen from one of the user's claims (for example an
//! entitlement). The claim value is matched against a name → template
//! mapping; users without a matching value get the default template, or are
//! refused when the provider forbids the default.

use crate::error::{Error, Result};
use crate::restrictions::{tighten, Restrictions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Per-provider configuration of enforced restrictions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcedRestrictionsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Userinfo claim that selects the template.
    #[serde(default = "default_claim_name")]
    pub claim_name: String,
    /// Template used when no claim value matches.
    #[serde(default)]
    pub default_template: Option<String>,
    /// Deny users without a matching claim value instead of using the default.
    #[serde(default)]
    pub forbid_on_default: bool,
    /// Claim value → template name.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
}

fn default_claim_name() -> String {
    "eduperson_entitlement".into()
}

/// The shape of a userinfo claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimValue {
    Single(String),
    Multi(Vec<String>),
    /// Anything that is neither a string nor a list of strings.
    Invalid,
}

impl ClaimValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::String(s) => ClaimValue::Single(s.clone()),
            Value::Array(items) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map_or(ClaimValue::Invalid, ClaimValue::Multi),
            _ => ClaimValue::Invalid,
        }
    }
}

fn default_template(conf: &EnforcedRestrictionsConfig) -> Result<Option<&str>> {
    if conf.forbid_on_default {
        return Err(Error::AccessDenied(
            "you do not have the required attributes to use this service".into(),
        ));
    }
    Ok(conf.default_template.as_deref())
}

/// Pick the template for a claim value.
///
/// An exact match of a single value wins. For a list, the first value in the
/// user's order that has a mapping wins. Returns `None` when enforcement is
/// disabled or the fallback has no template.
pub fn resolve_template<'a>(
    conf: &'a EnforcedRestrictionsConfig,
    claim: Option<&ClaimValue>,
) -> Result<Option<&'a str>> {
    if !conf.enabled {
        return Ok(None);
    }
    match claim {
        None => default_template(conf),
        Some(ClaimValue::Single(value)) => match conf.mapping.get(value) {
            Some(template) => Ok(Some(template.as_str())),
            None => default_template(conf),
        },
        Some(ClaimValue::Multi(values)) => {
            match values.iter().find_map(|v| conf.mapping.get(v)) {
                Some(template) => Ok(Some(template.as_str())),
                None => default_template(conf),
            }
        }
        Some(ClaimValue::Invalid) => Err(Error::InvalidProviderResponse(format!(
            "cannot understand type of claim '{}'",
            conf.claim_name
        ))),
    }
}

/// Resolve the template for a user from their userinfo claims.
pub fn template_for_user<'a>(
    conf: &'a EnforcedRestrictionsConfig,
    userinfo: &serde_json::Map<String, Value>,
) -> Result<Option<&'a str>> {
    let claim = userinfo.get(&conf.claim_name).map(ClaimValue::from_json);
    let template = resolve_template(conf, claim.as_ref())?;
    debug!(claim = %conf.claim_name, template = ?template, "Enforced restriction template resolved");
    Ok(template)
}

/// Bind `requested` by the named template.
pub fn apply_template(
    templates: &HashMap<String, Restrictions>,
    name: &str,
    requested: &Restrictions,
) -> Result<Restrictions> {
    let template = templates
        .get(name)
        .ok_or_else(|| Error::Configuration(format!("unknown restriction template '{}'", name)))?;
    Ok(tighten(template, requested).0)
}
