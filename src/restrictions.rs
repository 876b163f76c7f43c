//! Restrictions: when, where and how often a mytoken may be used.
//!
//! A token carries an ordered list of [`Restriction`]s with disjunctive
//! semantics: an action is allowed if at least one member currently
//! validates. Set-valued fields are allow-lists where empty means
//! "unrestricted", except `geoip_disallow` which is a block-list.
//!
//! Deriving a child token never widens its parent: [`tighten`] only keeps
//! requested members that are at least as strict as some parent member.
//!
//! Usage counters are keyed by a content hash of each member, see
//! [`crate::usage`].

use crate::crypto::sha512_hex;
use crate::error::{Error, Result};
use crate::network::{hosts_are_subset, ip_is_in, HostPattern, Lookups, THIS_IP_PLACEHOLDER};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// A single constraint bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    /// Unix seconds; 0 means no lower bound.
    #[serde(rename = "nbf", default, skip_serializing_if = "is_zero")]
    pub not_before: i64,
    /// Unix seconds; 0 means no upper bound.
    #[serde(rename = "exp", default, skip_serializing_if = "is_zero")]
    pub expires_at: i64,
    /// Space separated scope values.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope: String,
    #[serde(rename = "audience", default, skip_serializing_if = "Vec::is_empty")]
    pub audiences: Vec<String>,
    /// IPs, CIDR networks, hostnames and wildcard hostnames.
    #[serde(default, alias = "ip", skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geoip_allow: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geoip_disallow: Vec<String>,
    /// Number of access tokens that may be obtained; absent is unlimited.
    #[serde(rename = "usages_AT", default, skip_serializing_if = "Option::is_none")]
    pub usages_at: Option<u64>,
    /// Number of other usages; absent is unlimited.
    #[serde(rename = "usages_other", default, skip_serializing_if = "Option::is_none")]
    pub usages_other: Option<u64>,
}

/// Hash input in the format used before `hosts` was renamed from `ip`.
#[derive(Serialize)]
struct LegacyHashView<'a> {
    #[serde(rename = "nbf", skip_serializing_if = "is_zero")]
    not_before: &'a i64,
    #[serde(rename = "exp", skip_serializing_if = "is_zero")]
    expires_at: &'a i64,
    #[serde(skip_serializing_if = "str::is_empty")]
    scope: &'a str,
    #[serde(rename = "audience", skip_serializing_if = "<[String]>::is_empty")]
    audiences: &'a [String],
    #[serde(rename = "ip", skip_serializing_if = "<[String]>::is_empty")]
    hosts: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    geoip_allow: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    geoip_disallow: &'a [String],
    #[serde(rename = "usages_AT", skip_serializing_if = "Option::is_none")]
    usages_at: &'a Option<u64>,
    #[serde(rename = "usages_other", skip_serializing_if = "Option::is_none")]
    usages_other: &'a Option<u64>,
}

/// Restriction keys an operator can disable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestrictionKey {
    #[serde(rename = "nbf")]
    NotBefore,
    #[serde(rename = "exp")]
    ExpiresAt,
    #[serde(rename = "scope")]
    Scope,
    #[serde(rename = "audience")]
    Audiences,
    #[serde(rename = "hosts", alias = "ip")]
    Hosts,
    #[serde(rename = "geoip_allow")]
    GeoIpAllow,
    #[serde(rename = "geoip_disallow")]
    GeoIpDisallow,
    #[serde(rename = "usages_AT")]
    UsagesAt,
    #[serde(rename = "usages_other")]
    UsagesOther,
}

fn split_scopes(scope: &str) -> Vec<&str> {
    scope.split_whitespace().collect()
}

fn is_subset<T: PartialEq>(a: &[T], b: &[T]) -> bool {
    a.iter().all(|x| b.contains(x))
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter().any(|v| v.eq_ignore_ascii_case(value))
}

/// Compare optional counts where `None` is infinity.
fn usage_at_most(r: Option<u64>, b: Option<u64>) -> bool {
    match (r, b) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(r), Some(b)) => r <= b,
    }
}

impl Restriction {
    /// Content hash used to key usage counters.
    pub fn hash(&self) -> Result<String> {
        Ok(sha512_hex(&serde_json::to_vec(self)?))
    }

    /// Content hash in the legacy format (`ip` instead of `hosts`).
    pub fn legacy_hash(&self) -> Result<String> {
        let view = LegacyHashView {
            not_before: &self.not_before,
            expires_at: &self.expires_at,
            scope: &self.scope,
            audiences: &self.audiences,
            hosts: &self.hosts,
            geoip_allow: &self.geoip_allow,
            geoip_disallow: &self.geoip_disallow,
            usages_at: &self.usages_at,
            usages_other: &self.usages_other,
        };
        Ok(sha512_hex(&serde_json::to_vec(&view)?))
    }

    pub fn scopes(&self) -> Vec<&str> {
        split_scopes(&self.scope)
    }

    /// Whether `self` is at least as restrictive as `b` on every dimension.
    pub fn is_tighter_than(&self, b: &Restriction) -> bool {
        if self.not_before < b.not_before {
            return false;
        }
        if b.expires_at != 0 && (self.expires_at == 0 || self.expires_at > b.expires_at) {
            return false;
        }

        let r_scopes = split_scopes(&self.scope);
        let b_scopes = split_scopes(&b.scope);
        if !b_scopes.is_empty() && (r_scopes.is_empty() || !is_subset(&r_scopes, &b_scopes)) {
            return false;
        }
        if !b.audiences.is_empty()
            && (self.audiences.is_empty() || !is_subset(&self.audiences, &b.audiences))
        {
            return false;
        }
        if !b.hosts.is_empty() && (self.hosts.is_empty() || !hosts_are_subset(&self.hosts, &b.hosts))
        {
            return false;
        }
        if !b.geoip_allow.is_empty()
            && (self.geoip_allow.is_empty() || !is_subset(&self.geoip_allow, &b.geoip_allow))
        {
            return false;
        }
        // A block-list is tighter when it blocks more.
        if !is_subset(&b.geoip_disallow, &self.geoip_disallow) {
            return false;
        }

        usage_at_most(self.usages_at, b.usages_at) && usage_at_most(self.usages_other, b.usages_other)
    }

    /// Time window check (inclusive on both ends).
    pub fn verify_time(&self, now: i64) -> bool {
        now >= self.not_before && (self.expires_at == 0 || now <= self.expires_at)
    }

    /// Host and country checks for a requester at `ip`.
    pub fn verify_location(&self, ip: IpAddr, lookups: &Lookups) -> bool {
        if !self.hosts.is_empty() && !ip_is_in(ip, &self.hosts, lookups.dns.as_ref()) {
            return false;
        }
        if self.geoip_allow.is_empty() && self.geoip_disallow.is_empty() {
            return true;
        }
        let country = lookups.geoip.country_code(ip);
        if let Some(cc) = country.as_deref() {
            if contains_ignore_case(&self.geoip_disallow, cc) {
                return false;
            }
        }
        if self.geoip_allow.is_empty() {
            return true;
        }
        match country.as_deref() {
            Some(cc) => contains_ignore_case(&self.geoip_allow, cc),
            None => false,
        }
    }

    /// Reject internally inconsistent restrictions.
    pub fn validate(&self) -> Result<()> {
        if self.not_before < 0 || self.expires_at < 0 {
            return Err(Error::InvalidRestriction(
                "timestamps must not be negative".into(),
            ));
        }
        if self.expires_at != 0 && self.not_before > self.expires_at {
            return Err(Error::InvalidRestriction(format!(
                "nbf {} is after exp {}",
                self.not_before, self.expires_at
            )));
        }
        if let Some(bad) = self.hosts.iter().find(|h| {
            h.trim().is_empty()
                || matches!(HostPattern::parse(h), HostPattern::Hostname(ref n) if n.contains('/'))
        }) {
            return Err(Error::InvalidRestriction(format!("invalid host '{}'", bad)));
        }
        Ok(())
    }
}

/// An ordered, disjunctive list of restrictions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Restrictions(pub Vec<Restriction>);

impl From<Vec<Restriction>> for Restrictions {
    fn from(v: Vec<Restriction>) -> Self {
        Self(v)
    }
}

impl FromIterator<Restriction> for Restrictions {
    fn from_iter<I: IntoIterator<Item = Restriction>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Restrictions {
    type Item = &'a Restriction;
    type IntoIter = std::slice::Iter<'a, Restriction>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl Restrictions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Restriction> {
        self.0.iter()
    }

    pub fn push(&mut self, r: Restriction) {
        self.0.push(r);
    }

    pub fn validate(&self) -> Result<()> {
        self.0.iter().try_for_each(Restriction::validate)
    }

    /// Aggregate expiry: the latest member expiry, or 0 if any member is
    /// unbounded or the list is empty.
    pub fn expires_at(&self) -> i64 {
        if self.0.iter().any(|r| r.expires_at == 0) {
            return 0;
        }
        self.0.iter().map(|r| r.expires_at).max().unwrap_or(0)
    }

    /// Aggregate start: the earliest member start, or 0 if any member is
    /// unbounded or the list is empty.
    pub fn not_before(&self) -> i64 {
        if self.0.iter().any(|r| r.not_before == 0) {
            return 0;
        }
        self.0.iter().map(|r| r.not_before).min().unwrap_or(0)
    }

    /// Union of all member scopes, in first-seen order.
    pub fn scopes(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for s in self.0.iter().flat_map(|r| split_scopes(&r.scope)) {
            if seen.insert(s) {
                out.push(s.to_string());
            }
        }
        out
    }

    /// Union of all member audiences, in first-seen order.
    pub fn audiences(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for a in self.0.iter().flat_map(|r| r.audiences.iter()) {
            if !out.contains(a) {
                out.push(a.clone());
            }
        }
        out
    }

    /// Strip scopes the provider did not grant.
    ///
    /// Members without a scope restriction stay unrestricted. A member whose
    /// scopes were all dropped keeps its original value, so it never widens.
    pub fn set_max_scopes(&mut self, granted: &[String]) {
        for r in &mut self.0 {
            let kept: Vec<&str> = split_scopes(&r.scope)
                .into_iter()
                .filter(|s| granted.iter().any(|g| g == s))
                .collect();
            if !kept.is_empty() {
                r.scope = kept.join(" ");
            }
        }
    }

    /// Strip audiences the provider did not grant. Same rules as
    /// [`Restrictions::set_max_scopes`].
    pub fn set_max_audiences(&mut self, granted: &[String]) {
        for r in &mut self.0 {
            let kept: Vec<String> = r
                .audiences
                .iter()
                .filter(|a| granted.contains(a))
                .cloned()
                .collect();
            if !kept.is_empty() {
                r.audiences = kept;
            }
        }
    }

    /// Cap every member at `now + max_lifetime`. Returns whether anything
    /// changed. A lifetime of 0 means unlimited.
    pub fn enforce_max_lifetime(&mut self, max_lifetime: u64, now: i64) -> bool {
        if max_lifetime == 0 {
            return false;
        }
        let exp = now.saturating_add(i64::try_from(max_lifetime).unwrap_or(i64::MAX));
        if self.0.is_empty() {
            self.0.push(Restriction {
                expires_at: exp,
                ..Default::default()
            });
            return true;
        }
        let mut changed = false;
        for r in &mut self.0 {
            if r.expires_at == 0 || r.expires_at > exp {
                r.expires_at = exp;
                changed = true;
            }
        }
        changed
    }

    /// Replace the `this` placeholder in host lists with the requester address.
    pub fn replace_this_ip(&mut self, ip: IpAddr) {
        let ip = ip.to_string();
        for r in &mut self.0 {
            for h in &mut r.hosts {
                if h.eq_ignore_ascii_case(THIS_IP_PLACEHOLDER) {
                    *h = ip.clone();
                }
            }
        }
    }

    /// Clear fields for restriction keys the operator disabled.
    pub fn clear_unsupported_keys(&mut self, disabled: &[RestrictionKey]) {
        for r in &mut self.0 {
            for key in disabled {
                match key {
                    RestrictionKey::NotBefore => r.not_before = 0,
                    RestrictionKey::ExpiresAt => r.expires_at = 0,
                    RestrictionKey::Scope => r.scope.clear(),
                    RestrictionKey::Audiences => r.audiences.clear(),
                    RestrictionKey::Hosts => r.hosts.clear(),
                    RestrictionKey::GeoIpAllow => r.geoip_allow.clear(),
                    RestrictionKey::GeoIpDisallow => r.geoip_disallow.clear(),
                    RestrictionKey::UsagesAt => r.usages_at = None,
                    RestrictionKey::UsagesOther => r.usages_other = None,
                }
            }
        }
    }

    /// Members usable for all of `scopes`. An empty request keeps everything.
    pub fn with_scopes(&self, scopes: &[String]) -> Restrictions {
        if scopes.is_empty() {
            return self.clone();
        }
        self.0
            .iter()
            .filter(|r| {
                let own = split_scopes(&r.scope);
                own.is_empty() || scopes.iter().all(|s| own.contains(&s.as_str()))
            })
            .cloned()
            .collect()
    }

    /// Members usable for all of `audiences`. An empty request keeps everything.
    pub fn with_audiences(&self, audiences: &[String]) -> Restrictions {
        if audiences.is_empty() {
            return self.clone();
        }
        self.0
            .iter()
            .filter(|r| r.audiences.is_empty() || is_subset(audiences, &r.audiences))
            .cloned()
            .collect()
    }
}

/// Tighten the `wanted` restrictions against a parent's `old` restrictions.
///
/// Each wanted member is kept if it is tighter than the first parent member
/// that admits it; the matched parent member's usage budget is then reduced
/// by the wanted member's budget. Returns the result and whether every
/// wanted member was honored. When no wanted member can be honored, the
/// parent's restrictions are returned unchanged.
pub fn tighten(old: &Restrictions, wanted: &Restrictions) -> (Restrictions, bool) {
    if old.is_empty() {
        return (wanted.clone(), true);
    }
    let mut base = old.0.clone();
    let mut result = Vec::with_capacity(wanted.len());
    let mut dropped = false;

    for w in &wanted.0 {
        match base.iter_mut().find(|o| w.is_tighter_than(o)) {
            Some(o) => {
                result.push(w.clone());
                if let (Some(budget), Some(used)) = (o.usages_other.as_mut(), w.usages_other) {
                    *budget = budget.saturating_sub(used);
                }
                if let (Some(budget), Some(used)) = (o.usages_at.as_mut(), w.usages_at) {
                    *budget = budget.saturating_sub(used);
                }
            }
            None => dropped = true,
        }
    }

    if result.is_empty() {
        return (old.clone(), wanted.is_empty());
    }
    (Restrictions(result), !dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{StaticGeoIp, StaticReverseDns};
    use std::sync::Arc;

    fn scoped(scope: &str, exp: i64) -> Restriction {
        Restriction {
            scope: scope.into(),
            expires_at: exp,
            ..Default::default()
        }
    }

    // -------------------------------------------------------------------------
    // IsTighterThan
    // -------------------------------------------------------------------------

    #[test]
    fn test_tighter_time() {
        let b = Restriction {
            not_before: 100,
            expires_at: 500,
            ..Default::default()
        };
        assert!(Restriction { not_before: 100, expires_at: 500, ..Default::default() }.is_tighter_than(&b));
        assert!(Restriction { not_before: 200, expires_at: 400, ..Default::default() }.is_tighter_than(&b));
        assert!(!Restriction { not_before: 50, expires_at: 400, ..Default::default() }.is_tighter_than(&b));
        assert!(!Restriction { not_before: 200, expires_at: 0, ..Default::default() }.is_tighter_than(&b));
        assert!(!Restriction { not_before: 200, expires_at: 600, ..Default::default() }.is_tighter_than(&b));
        // Unbounded parent admits any expiry.
        assert!(scoped("", 10).is_tighter_than(&Restriction::default()));
        assert!(Restriction::default().is_tighter_than(&Restriction::default()));
    }

    #[test]
    fn test_tighter_scope_and_audience() {
        let b = Restriction {
            scope: "openid profile".into(),
            audiences: vec!["https://a".into(), "https://b".into()],
            ..Default::default()
        };
        let r = Restriction {
            scope: "profile".into(),
            audiences: vec!["https://a".into()],
            ..Default::default()
        };
        assert!(r.is_tighter_than(&b));
        assert!(!Restriction { scope: "".into(), ..r.clone() }.is_tighter_than(&b));
        assert!(!Restriction { scope: "profile email".into(), ..r.clone() }.is_tighter_than(&b));
        assert!(!Restriction { audiences: vec![], ..r.clone() }.is_tighter_than(&b));
        // Anything is tighter than an unrestricted parent dimension.
        assert!(b.is_tighter_than(&Restriction::default()));
    }

    #[test]
    fn test_tighter_geoip() {
        let b = Restriction {
            geoip_allow: vec!["DE".into(), "FR".into()],
            geoip_disallow: vec!["RU".into()],
            ..Default::default()
        };
        let r = Restriction {
            geoip_allow: vec!["DE".into()],
            geoip_disallow: vec!["RU".into(), "CN".into()],
            ..Default::default()
        };
        assert!(r.is_tighter_than(&b));
        let fewer_blocked = Restriction {
            geoip_disallow: vec!["CN".into()],
            ..r.clone()
        };
        assert!(!fewer_blocked.is_tighter_than(&b));
    }

    #[test]
    fn test_tighter_usages() {
        let b = Restriction {
            usages_at: Some(10),
            ..Default::default()
        };
        assert!(Restriction { usages_at: Some(10), ..Default::default() }.is_tighter_than(&b));
        assert!(Restriction { usages_at: Some(0), ..Default::default() }.is_tighter_than(&b));
        assert!(!Restriction { usages_at: Some(11), ..Default::default() }.is_tighter_than(&b));
        assert!(!Restriction::default().is_tighter_than(&b));
        assert!(b.is_tighter_than(&Restriction::default()));
    }

    #[test]
    fn test_tighter_hosts() {
        let b = Restriction {
            hosts: vec!["10.0.0.0/8".into()],
            ..Default::default()
        };
        let r = Restriction {
            hosts: vec!["10.2.0.0/16".into()],
            ..Default::default()
        };
        assert!(r.is_tighter_than(&b));
        assert!(!b.is_tighter_than(&r));
    }

    // -------------------------------------------------------------------------
    // Tighten
    // -------------------------------------------------------------------------

    #[test]
    fn test_tighten_first_match() {
        let old = Restrictions(vec![scoped("a b c", 500), scoped("a", 1000), scoped("d", 50)]);
        let wanted = Restrictions(vec![scoped("a b c", 100)]);
        let (res, ok) = tighten(&old, &wanted);
        assert!(ok);
        assert_eq!(res, wanted);

        let wanted = Restrictions(vec![scoped("a b c d", 100)]);
        let (res, ok) = tighten(&old, &wanted);
        assert!(!ok);
        assert_eq!(res, old);
    }

    #[test]
    fn test_tighten_partial_drop() {
        let old = Restrictions(vec![scoped("a", 500)]);
        let wanted = Restrictions(vec![scoped("a", 100), scoped("b", 100)]);
        let (res, ok) = tighten(&old, &wanted);
        assert!(!ok);
        assert_eq!(res, Restrictions(vec![scoped("a", 100)]));
    }

    #[test]
    fn test_tighten_empty_sides() {
        let r = Restrictions(vec![scoped("a", 100)]);
        assert_eq!(tighten(&Restrictions::new(), &r), (r.clone(), true));
        assert_eq!(tighten(&r, &Restrictions::new()), (r.clone(), true));
    }

    #[test]
    fn test_tighten_debits_usage_budget() {
        let old = Restrictions(vec![
            Restriction { usages_other: Some(5), ..Default::default() },
            Restriction { usages_other: Some(3), scope: "x".into(), ..Default::default() },
        ]);
        // The first child takes the whole budget of the first parent member,
        // so the second child has to fall through to the next one.
        let wanted = Restrictions(vec![
            Restriction { usages_other: Some(5), ..Default::default() },
            Restriction { usages_other: Some(3), scope: "x".into(), ..Default::default() },
        ]);
        let (res, ok) = tighten(&old, &wanted);
        assert!(ok);
        assert_eq!(res, wanted);

        let greedy = Restrictions(vec![
            Restriction { usages_other: Some(4), ..Default::default() },
            Restriction { usages_other: Some(4), ..Default::default() },
        ]);
        let (res, ok) = tighten(&old, &greedy);
        assert!(!ok);
        assert_eq!(res.len(), 1);
    }

    // -------------------------------------------------------------------------
    // Aggregates and helpers
    // -------------------------------------------------------------------------

    #[test]
    fn test_expires_and_not_before() {
        let exp = |v: &[i64]| Restrictions(v.iter().map(|e| scoped("", *e)).collect());
        assert_eq!(Restrictions::new().expires_at(), 0);
        assert_eq!(exp(&[100, 300, 200]).expires_at(), 300);
        assert_eq!(exp(&[100, 0, 300]).expires_at(), 0);

        let nbf = |v: &[i64]| {
            Restrictions(
                v.iter()
                    .map(|n| Restriction { not_before: *n, ..Default::default() })
                    .collect(),
            )
        };
        assert_eq!(Restrictions::new().not_before(), 0);
        assert_eq!(nbf(&[100, 300, 200]).not_before(), 100);
        assert_eq!(nbf(&[100, 0, 300]).not_before(), 0);
    }

    #[test]
    fn test_enforce_max_lifetime() {
        let mut empty = Restrictions::new();
        assert!(empty.enforce_max_lifetime(3600, 1000));
        assert_eq!(empty.0, vec![scoped("", 4600)]);

        let mut r = Restrictions(vec![scoped("a", 2000), scoped("b", 0), scoped("c", 9000)]);
        assert!(r.enforce_max_lifetime(3600, 1000));
        assert_eq!(
            r.0.iter().map(|x| x.expires_at).collect::<Vec<_>>(),
            vec![2000, 4600, 4600]
        );
        assert!(!r.enforce_max_lifetime(3600, 1000));
        assert!(!r.enforce_max_lifetime(0, 1000));
    }

    #[test]
    fn test_set_max_scopes_never_widens() {
        let mut r = Restrictions(vec![scoped("openid admin", 0), scoped("", 0), scoped("admin", 0)]);
        r.set_max_scopes(&["openid".to_string(), "profile".to_string()]);
        assert_eq!(r.0[0].scope, "openid");
        assert_eq!(r.0[1].scope, "");
        assert_eq!(r.0[2].scope, "admin");
    }

    #[test]
    fn test_scope_and_audience_filters() {
        let r = Restrictions(vec![
            scoped("openid", 0),
            scoped("openid storage.read", 0),
            scoped("", 0),
        ]);
        assert_eq!(r.with_scopes(&[]).len(), 3);
        assert_eq!(r.with_scopes(&["storage.read".to_string()]).len(), 2);
        assert_eq!(r.scopes(), vec!["openid".to_string(), "storage.read".to_string()]);

        let a = Restrictions(vec![Restriction {
            audiences: vec!["x".into()],
            ..Default::default()
        }]);
        assert_eq!(a.with_audiences(&["x".to_string()]).len(), 1);
        assert!(a.with_audiences(&["y".to_string()]).is_empty());
    }

    #[test]
    fn test_replace_this_ip_and_clear_keys() {
        let mut r = Restrictions(vec![Restriction {
            hosts: vec!["this".into(), "10.0.0.0/8".into()],
            usages_at: Some(3),
            geoip_allow: vec!["DE".into()],
            ..Default::default()
        }]);
        r.replace_this_ip("192.168.1.5".parse().unwrap());
        assert_eq!(r.0[0].hosts, vec!["192.168.1.5".to_string(), "10.0.0.0/8".to_string()]);
        r.clear_unsupported_keys(&[RestrictionKey::UsagesAt, RestrictionKey::GeoIpAllow]);
        assert_eq!(r.0[0].usages_at, None);
        assert!(r.0[0].geoip_allow.is_empty());
        assert_eq!(r.0[0].hosts.len(), 2);
    }

    // -------------------------------------------------------------------------
    // Validity
    // -------------------------------------------------------------------------

    #[test]
    fn test_verify_time_bounds_inclusive() {
        let r = Restriction {
            not_before: 100,
            expires_at: 200,
            ..Default::default()
        };
        assert!(!r.verify_time(99));
        assert!(r.verify_time(100));
        assert!(r.verify_time(200));
        assert!(!r.verify_time(201));
        assert!(Restriction::default().verify_time(0));
    }

    #[test]
    fn test_verify_location() {
        let lookups = Lookups {
            geoip: Arc::new(
                StaticGeoIp::new()
                    .with("141.52.0.0/16".parse().unwrap(), "DE")
                    .with("5.0.0.0/8".parse().unwrap(), "RU"),
            ),
            dns: Arc::new(StaticReverseDns::new()),
        };
        let de: IpAddr = "141.52.3.4".parse().unwrap();
        let ru: IpAddr = "5.1.1.1".parse().unwrap();
        let unknown: IpAddr = "8.8.8.8".parse().unwrap();

        let allow = Restriction {
            geoip_allow: vec!["de".into()],
            ..Default::default()
        };
        assert!(allow.verify_location(de, &lookups));
        assert!(!allow.verify_location(ru, &lookups));
        assert!(!allow.verify_location(unknown, &lookups));

        let block = Restriction {
            geoip_disallow: vec!["RU".into()],
            ..Default::default()
        };
        assert!(block.verify_location(de, &lookups));
        assert!(!block.verify_location(ru, &lookups));
        assert!(block.verify_location(unknown, &lookups));

        let hosts = Restriction {
            hosts: vec!["141.52.0.0/16".into()],
            ..Default::default()
        };
        assert!(hosts.verify_location(de, &lookups));
        assert!(!hosts.verify_location(unknown, &lookups));
    }

    // -------------------------------------------------------------------------
    // Serialization and hashing
    // -------------------------------------------------------------------------

    #[test]
    fn test_json_keys() {
        let r = Restriction {
            expires_at: 10,
            hosts: vec!["1.2.3.4".into()],
            usages_at: Some(2),
            ..Default::default()
        };
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"exp":10,"hosts":["1.2.3.4"],"usages_AT":2}"#);
        let legacy: Restriction = serde_json::from_str(r#"{"exp":10,"ip":["1.2.3.4"],"usages_AT":2}"#).unwrap();
        assert_eq!(legacy, r);
    }

    #[test]
    fn test_hashes() {
        let r = scoped("openid", 100);
        assert_eq!(r.hash().unwrap(), scoped("openid", 100).hash().unwrap());
        assert_ne!(r.hash().unwrap(), scoped("openid", 101).hash().unwrap());
        assert_eq!(r.hash().unwrap().len(), 128);
        // Without hosts both formats coincide.
        assert_eq!(r.hash().unwrap(), r.legacy_hash().unwrap());

        let with_hosts = Restriction {
            hosts: vec!["1.2.3.4".into()],
            ..Default::default()
        };
        assert_ne!(with_hosts.hash().unwrap(), with_hosts.legacy_hash().unwrap());
    }

    #[test]
    fn test_validate() {
        assert!(scoped("a", 10).validate().is_ok());
        let bad = Restriction {
            not_before: 20,
            expires_at: 10,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidRestriction(_))));
        let bad_host = Restriction {
            hosts: vec!["10.0.0.0/99".into()],
            ..Default::default()
        };
        assert!(bad_host.validate().is_err());
    }
}
