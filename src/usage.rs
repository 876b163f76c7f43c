//! Usage counting for restrictions.
//!
//! Counters are keyed by (token, restriction hash). Selecting a usable
//! restriction reads the counters; recording the use increments the counter
//! in a single conditional upsert that refuses to pass the cap, so two
//! concurrent requests can never both take the last use.

use crate::db::{self, Tx, UsageRow};
use crate::error::{Error, Result};
use crate::mytoken::MytokenId;
use crate::network::Lookups;
use crate::restrictions::{Restriction, Restrictions};
use std::net::IpAddr;
use tracing::debug;

/// What a token is being used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    /// Obtaining an access token.
    AccessToken,
    /// Anything else, e.g. creating a child token.
    Other,
}

impl UsageKind {
    fn cap(self, r: &Restriction) -> Option<u64> {
        match self {
            UsageKind::AccessToken => r.usages_at,
            UsageKind::Other => r.usages_other,
        }
    }

    fn count(self, row: &UsageRow) -> u64 {
        match self {
            UsageKind::AccessToken => row.usages_at,
            UsageKind::Other => row.usages_other,
        }
    }
}

/// Key of the existing counter row for `r`, trying the current hash first.
async fn existing_row(tx: &mut Tx, id: MytokenId, r: &Restriction) -> Result<Option<(String, UsageRow)>> {
    let hash = r.hash()?;
    if let Some(row) = db::get_usage(tx, &id, &hash).await? {
        return Ok(Some((hash, row)));
    }
    let legacy = r.legacy_hash()?;
    Ok(db::get_usage(tx, &id, &legacy).await?.map(|row| (legacy, row)))
}

/// Recorded usages of `r` by token `id`; `None` if it was never used.
pub async fn usages(tx: &mut Tx, id: MytokenId, r: &Restriction, kind: UsageKind) -> Result<Option<u64>> {
    Ok(existing_row(tx, id, r).await?.map(|(_, row)| kind.count(&row)))
}

async fn usage_ok(tx: &mut Tx, id: MytokenId, r: &Restriction, kind: UsageKind) -> Result<bool> {
    let Some(cap) = kind.cap(r) else {
        return Ok(true);
    };
    Ok(match usages(tx, id, r, kind).await? {
        None => cap > 0,
        Some(used) => used < cap,
    })
}

/// Whether `r` currently admits a use of `kind` from `ip`.
pub async fn verify(
    tx: &mut Tx,
    id: MytokenId,
    r: &Restriction,
    kind: UsageKind,
    ip: IpAddr,
    lookups: &Lookups,
    now: i64,
) -> Result<bool> {
    if !r.verify_time(now) || !r.verify_location(ip, lookups) {
        return Ok(false);
    }
    usage_ok(tx, id, r, kind).await
}

/// The members of `restrictions` that currently admit a use of `kind`.
pub async fn valid_for(
    tx: &mut Tx,
    id: MytokenId,
    restrictions: &Restrictions,
    kind: UsageKind,
    ip: IpAddr,
    lookups: &Lookups,
    now: i64,
) -> Result<Restrictions> {
    let mut out = Restrictions::new();
    for r in restrictions {
        if verify(tx, id, r, kind, ip, lookups, now).await? {
            out.push(r.clone());
        }
    }
    Ok(out)
}

pub async fn valid_for_at(
    tx: &mut Tx,
    id: MytokenId,
    restrictions: &Restrictions,
    ip: IpAddr,
    lookups: &Lookups,
    now: i64,
) -> Result<Restrictions> {
    valid_for(tx, id, restrictions, UsageKind::AccessToken, ip, lookups, now).await
}

pub async fn valid_for_other(
    tx: &mut Tx,
    id: MytokenId,
    restrictions: &Restrictions,
    ip: IpAddr,
    lookups: &Lookups,
    now: i64,
) -> Result<Restrictions> {
    valid_for(tx, id, restrictions, UsageKind::Other, ip, lookups, now).await
}

/// Whether the token may obtain an access token. An unrestricted token always may.
pub async fn verify_for_at(
    tx: &mut Tx,
    id: MytokenId,
    restrictions: &Restrictions,
    ip: IpAddr,
    lookups: &Lookups,
    now: i64,
) -> Result<bool> {
    verify_any(tx, id, restrictions, UsageKind::AccessToken, ip, lookups, now).await
}

/// Whether the token may be used for anything other than an access token.
pub async fn verify_for_other(
    tx: &mut Tx,
    id: MytokenId,
    restrictions: &Restrictions,
    ip: IpAddr,
    lookups: &Lookups,
    now: i64,
) -> Result<bool> {
    verify_any(tx, id, restrictions, UsageKind::Other, ip, lookups, now).await
}

async fn verify_any(
    tx: &mut Tx,
    id: MytokenId,
    restrictions: &Restrictions,
    kind: UsageKind,
    ip: IpAddr,
    lookups: &Lookups,
    now: i64,
) -> Result<bool> {
    if restrictions.is_empty() {
        return Ok(true);
    }
    for r in restrictions {
        if verify(tx, id, r, kind, ip, lookups, now).await? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Count one use of `r`.
///
/// Increments the existing row (current or legacy hash), or inserts a row
/// under the current hash. Fails with [`Error::UsageRestricted`] when the
/// counter already reached the restriction's cap, e.g. because a concurrent
/// request took the last use.
pub async fn record_use(tx: &mut Tx, id: MytokenId, r: &Restriction, kind: UsageKind) -> Result<u64> {
    let hash = match existing_row(tx, id, r).await? {
        Some((hash, _)) => hash,
        None => r.hash()?,
    };
    let access_token = kind == UsageKind::AccessToken;
    match db::increment_usage(tx, &id, &hash, access_token, kind.cap(r)).await? {
        Some(count) => {
            debug!(mytoken_id = %id, count, kind = ?kind, "Restriction usage recorded");
            Ok(count)
        }
        None => Err(Error::UsageRestricted("usage limit reached".into())),
    }
}

pub async fn used_at(tx: &mut Tx, id: MytokenId, r: &Restriction) -> Result<u64> {
    record_use(tx, id, r, UsageKind::AccessToken).await
}

pub async fn used_other(tx: &mut Tx, id: MytokenId, r: &Restriction) -> Result<u64> {
    record_use(tx, id, r, UsageKind::Other).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_count_n_uses() {
        let db = Database::in_memory().await.unwrap();
        let id = MytokenId::new();
        let r = Restriction {
            usages_at: Some(100),
            ..Default::default()
        };
        let mut tx = db.begin().await.unwrap();
        for _ in 0..7 {
            used_at(&mut tx, id, &r).await.unwrap();
        }
        tx.commit().await.unwrap();
        let mut tx = db.begin().await.unwrap();
        assert_eq!(usages(&mut tx, id, &r, UsageKind::AccessToken).await.unwrap(), Some(7));
        assert_eq!(usages(&mut tx, id, &r, UsageKind::Other).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_cap_boundary() {
        let db = Database::in_memory().await.unwrap();
        let id = MytokenId::new();
        let r = Restriction {
            usages_at: Some(5),
            ..Default::default()
        };
        let lookups = Lookups::default();
        let rs = Restrictions(vec![r.clone()]);
        let mut tx = db.begin().await.unwrap();
        for _ in 0..4 {
            used_at(&mut tx, id, &r).await.unwrap();
        }
        assert!(verify_for_at(&mut tx, id, &rs, localhost(), &lookups, 0).await.unwrap());
        used_at(&mut tx, id, &r).await.unwrap();
        assert!(!verify_for_at(&mut tx, id, &rs, localhost(), &lookups, 0).await.unwrap());
        // Other uses are counted separately.
        assert!(verify_for_other(&mut tx, id, &rs, localhost(), &lookups, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_use_refuses_past_cap() {
        let db = Database::in_memory().await.unwrap();
        let id = MytokenId::new();
        let r = Restriction {
            usages_other: Some(2),
            ..Default::default()
        };
        let mut tx = db.begin().await.unwrap();
        assert_eq!(used_other(&mut tx, id, &r).await.unwrap(), 1);
        assert_eq!(used_other(&mut tx, id, &r).await.unwrap(), 2);
        let err = used_other(&mut tx, id, &r).await.unwrap_err();
        assert!(matches!(err, Error::UsageRestricted(_)));
        assert_eq!(usages(&mut tx, id, &r, UsageKind::Other).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_zero_cap_and_unrestricted() {
        let db = Database::in_memory().await.unwrap();
        let id = MytokenId::new();
        let lookups = Lookups::default();
        let zero = Restrictions(vec![Restriction {
            usages_other: Some(0),
            ..Default::default()
        }]);
        let mut tx = db.begin().await.unwrap();
        assert!(!verify_for_other(&mut tx, id, &zero, localhost(), &lookups, 0).await.unwrap());
        assert!(verify_for_other(&mut tx, id, &Restrictions::new(), localhost(), &lookups, 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_legacy_hash_row_is_used() {
        let db = Database::in_memory().await.unwrap();
        let id = MytokenId::new();
        let r = Restriction {
            hosts: vec!["127.0.0.1".into()],
            usages_at: Some(2),
            ..Default::default()
        };
        let legacy = r.legacy_hash().unwrap();
        let mut tx = db.begin().await.unwrap();
        db::increment_usage(&mut tx, &id, &legacy, true, None).await.unwrap();
        assert_eq!(usages(&mut tx, id, &r, UsageKind::AccessToken).await.unwrap(), Some(1));
        assert_eq!(used_at(&mut tx, id, &r).await.unwrap(), 2);
        let current = r.hash().unwrap();
        assert!(db::get_usage(&mut tx, &id, &current).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_valid_for_filters_members() {
        let db = Database::in_memory().await.unwrap();
        let id = MytokenId::new();
        let lookups = Lookups::default();
        let expired = Restriction {
            expires_at: 10,
            ..Default::default()
        };
        let open = Restriction {
            scope: "openid".into(),
            ..Default::default()
        };
        let rs = Restrictions(vec![expired, open.clone()]);
        let mut tx = db.begin().await.unwrap();
        let valid = valid_for_at(&mut tx, id, &rs, localhost(), &lookups, 100).await.unwrap();
        assert_eq!(valid, Restrictions(vec![open]));
    }
}
