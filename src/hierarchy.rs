//! Token hierarchy: storing mytokens, their refresh tokens and their
//! parent/root links, and revoking them.
//!
//! Tokens form a forest. `parent_id` points one level up and `root_id`
//! points directly at the root of the tree (it is `None` on roots). Child
//! tokens share the refresh token of their tree; each token holds its own
//! copy of the refresh-token key, sealed under its signed JWT, so only a
//! holder of a valid token can recover the refresh token.
//!
//! ## Revocation
//!
//! A recursive revoke deletes the target and every descendant. A
//! non-recursive revoke deletes only the target; its direct children become
//! roots of their own trees and their descendants are re-pointed at them.

use crate::crypto::{open_str, random_string, seal_str};
use crate::db::{self, CryptedRefreshToken, EncryptionKeyRow, MytokenRow, RefreshTokenId, Tx};
use crate::error::{Error, Result};
use crate::mytoken::{Mytoken, MytokenId, Rotation};
use crate::network::ClientMetadata;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

/// Length of the random refresh-token key.
const RT_KEY_LEN: usize = 64;

/// Metadata recorded when a token is stored.
#[derive(Debug, Clone, Default)]
pub struct StoreMeta {
    pub client: ClientMetadata,
    pub now: i64,
}

// ============================================================================
// Store
// ============================================================================

fn new_row(mt: &Mytoken, rt_id: RefreshTokenId, meta: &StoreMeta) -> MytokenRow {
    MytokenRow {
        id: mt.id,
        seq_no: mt.seq_no,
        parent_id: None,
        root_id: None,
        rt_id,
        name: mt.name.clone(),
        created: meta.now,
        last_rotated: meta.now,
        expires_at: mt.expires_at,
        client: meta.client.clone(),
        oidc_sub: mt.oidc_sub.clone(),
        oidc_iss: mt.oidc_iss.clone(),
        rotation: mt.rotation.clone(),
    }
}

/// Store a root token together with a new refresh token.
pub async fn store_root(
    tx: &mut Tx,
    mt: &Mytoken,
    jwt: &str,
    refresh_token: &str,
    meta: &StoreMeta,
) -> Result<()> {
    let key = random_string(RT_KEY_LEN);
    let rt_id = Uuid::new_v4();
    let crypted = CryptedRefreshToken {
        sealed: seal_str(refresh_token, &key)?,
        created: meta.now,
    };
    db::insert_refresh_token(tx, &rt_id, &crypted).await?;
    let key_row = EncryptionKeyRow {
        rt_id,
        sealed_key: seal_str(&key, jwt)?,
    };
    db::insert_encryption_key(tx, &mt.id, &key_row).await?;
    db::insert_mytoken(tx, &new_row(mt, rt_id, meta)).await?;
    info!(mytoken_id = %mt.id, rt_id = %rt_id, "Root mytoken stored");
    Ok(())
}

/// Store a child token that shares its parent's refresh token.
pub async fn store_child(
    tx: &mut Tx,
    mt: &Mytoken,
    jwt: &str,
    parent_id: MytokenId,
    parent_jwt: &str,
    meta: &StoreMeta,
) -> Result<()> {
    let parent = db::get_mytoken(tx, &parent_id)
        .await?
        .ok_or(Error::TokenRevoked)?;
    let (key, rt_id) = encryption_key(tx, &parent_id, parent_jwt).await?;
    let key_row = EncryptionKeyRow {
        rt_id,
        sealed_key: seal_str(&key, jwt)?,
    };
    db::insert_encryption_key(tx, &mt.id, &key_row).await?;
    let mut row = new_row(mt, rt_id, meta);
    row.parent_id = Some(parent_id);
    row.root_id = Some(parent.root_id.unwrap_or(parent.id));
    db::insert_mytoken(tx, &row).await?;
    info!(mytoken_id = %mt.id, parent_id = %parent_id, rt_id = %rt_id, "Child mytoken stored");
    Ok(())
}

pub async fn get(tx: &mut Tx, id: &MytokenId) -> Result<Option<MytokenRow>> {
    db::get_mytoken(tx, id).await
}

// ============================================================================
// Refresh tokens
// ============================================================================

async fn encryption_key(tx: &mut Tx, id: &MytokenId, jwt: &str) -> Result<(String, RefreshTokenId)> {
    let row = db::get_encryption_key(tx, id)
        .await?
        .ok_or_else(|| Error::Storage(format!("no encryption key for {}", id)))?;
    Ok((open_str(&row.sealed_key, jwt)?, row.rt_id))
}

/// Decrypt the refresh token of `id` using its signed `jwt`.
pub async fn refresh_token(tx: &mut Tx, id: &MytokenId, jwt: &str) -> Result<Option<String>> {
    let Some(row) = db::get_encryption_key(tx, id).await? else {
        return Ok(None);
    };
    let key = open_str(&row.sealed_key, jwt)?;
    match db::get_refresh_token(tx, &row.rt_id).await? {
        Some(crypted) => Ok(Some(open_str(&crypted.sealed, &key)?)),
        None => Ok(None),
    }
}

/// Replace the refresh token shared by `id`'s tree, e.g. after the provider
/// rotated it.
pub async fn update_refresh_token(tx: &mut Tx, id: &MytokenId, jwt: &str, refresh_token: &str) -> Result<()> {
    let (key, rt_id) = encryption_key(tx, id, jwt).await?;
    let sealed = seal_str(refresh_token, &key)?;
    if db::update_refresh_token(tx, &rt_id, &sealed).await? {
        Ok(())
    } else {
        Err(Error::Storage(format!("refresh token {} missing", rt_id)))
    }
}

/// Number of tokens that still reference refresh token `rt_id`.
pub async fn rt_occurrences(tx: &mut Tx, rt_id: &RefreshTokenId) -> Result<u64> {
    db::count_rt_references(tx, rt_id).await
}

// ============================================================================
// Rotation
// ============================================================================

/// Persist a new generation of `id`: bump the seq_no and reseal the key
/// under the new JWT.
pub async fn record_rotation(
    tx: &mut Tx,
    id: &MytokenId,
    seq_no: u64,
    old_jwt: &str,
    new_jwt: &str,
    now: i64,
) -> Result<()> {
    let (key, _) = encryption_key(tx, id, old_jwt).await?;
    let sealed_key = seal_str(&key, new_jwt)?;
    if !db::update_generation(tx, id, seq_no, now).await? {
        return Err(Error::TokenRevoked);
    }
    db::update_encryption_key(tx, id, &sealed_key).await?;
    debug!(mytoken_id = %id, seq_no, "Mytoken rotated");
    Ok(())
}

/// Whether token `id` in generation `seq_no` is no longer usable.
///
/// Absent rows, outdated generations and rotated tokens past their rotation
/// lifetime all count as revoked.
pub async fn is_revoked(
    tx: &mut Tx,
    id: &MytokenId,
    seq_no: u64,
    rotation: Option<&Rotation>,
    now: i64,
) -> Result<bool> {
    let Some(row) = db::get_mytoken(tx, id).await? else {
        return Ok(true);
    };
    Ok(generation_revoked(&row, seq_no, rotation, now))
}

fn generation_revoked(row: &MytokenRow, seq_no: u64, rotation: Option<&Rotation>, now: i64) -> bool {
    if row.seq_no != seq_no {
        return true;
    }
    match rotation.map(|r| r.lifetime).filter(|l| *l > 0) {
        Some(lifetime) => {
            row.last_rotated.saturating_add(i64::try_from(lifetime).unwrap_or(i64::MAX)) < now
        }
        None => false,
    }
}

// ============================================================================
// Revocation
// ============================================================================

/// All transitive descendants of `id`, breadth first, excluding `id`.
pub async fn descendants(tx: &mut Tx, id: &MytokenId) -> Result<Vec<MytokenId>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*id]);
    while let Some(current) = queue.pop_front() {
        for child in db::child_ids(tx, &current).await? {
            if seen.insert(child) {
                out.push(child);
                queue.push_back(child);
            }
        }
    }
    Ok(out)
}

/// Delete `id` and, if `recursive`, all of its descendants.
///
/// Returns the deleted ids. Revoking an unknown token deletes nothing.
pub async fn revoke(tx: &mut Tx, id: &MytokenId, recursive: bool) -> Result<Vec<MytokenId>> {
    if db::get_mytoken(tx, id).await?.is_none() {
        return Ok(Vec::new());
    }
    if recursive {
        let mut doomed = vec![*id];
        doomed.extend(descendants(tx, id).await?);
        for d in &doomed {
            db::delete_mytoken(tx, d).await?;
        }
        info!(mytoken_id = %id, count = doomed.len(), "Mytoken revoked recursively");
        return Ok(doomed);
    }

    let children = db::child_ids(tx, id).await?;
    for child in &children {
        let subtree = descendants(tx, child).await?;
        db::set_links(tx, child, None, None).await?;
        for d in subtree {
            db::set_root(tx, &d, child).await?;
        }
    }
    db::delete_mytoken(tx, id).await?;
    info!(mytoken_id = %id, orphans = children.len(), "Mytoken revoked");
    Ok(vec![*id])
}

/// Revoke `id` and clean up its refresh token.
///
/// Returns the plaintext refresh token when no token references it anymore,
/// so the caller can revoke it at the provider.
pub async fn revoke_with_refresh_token(
    tx: &mut Tx,
    id: &MytokenId,
    jwt: &str,
    recursive: bool,
) -> Result<Option<String>> {
    let rt_id = db::get_encryption_key(tx, id).await?.map(|k| k.rt_id);
    let rt = refresh_token(tx, id, jwt).await?;
    revoke(tx, id, recursive).await?;
    let Some(rt_id) = rt_id else {
        return Ok(None);
    };
    if rt_occurrences(tx, &rt_id).await? > 0 {
        return Ok(None);
    }
    db::delete_refresh_token(tx, &rt_id).await?;
    debug!(rt_id = %rt_id, "Unreferenced refresh token deleted");
    Ok(rt)
}

// ============================================================================
// Trees
// ============================================================================

/// Public view of a stored token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MytokenEntry {
    pub id: MytokenId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created: i64,
    pub ip: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expires_at: i64,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MytokenEntryTree {
    pub token: MytokenEntry,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<MytokenEntryTree>,
}

impl MytokenEntryTree {
    /// Number of tokens in the tree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(|c| c.size()).sum::<usize>()
    }
}

fn entry(row: &MytokenRow) -> MytokenEntry {
    MytokenEntry {
        id: row.id,
        name: row.name.clone(),
        created: row.created,
        ip: row.client.ip.to_string(),
        expires_at: row.expires_at,
    }
}

fn children_index(rows: &HashMap<MytokenId, MytokenRow>) -> HashMap<MytokenId, Vec<MytokenId>> {
    let mut index: HashMap<MytokenId, Vec<MytokenId>> = HashMap::new();
    for row in rows.values() {
        if let Some(parent) = row.parent_id {
            index.entry(parent).or_default().push(row.id);
        }
    }
    index
}

fn build_tree(
    rows: &HashMap<MytokenId, MytokenRow>,
    index: &HashMap<MytokenId, Vec<MytokenId>>,
    id: &MytokenId,
) -> Option<MytokenEntryTree> {
    let row = rows.get(id)?;
    let mut children: Vec<MytokenEntryTree> = index
        .get(id)
        .into_iter()
        .flatten()
        .filter_map(|c| build_tree(rows, index, c))
        .collect();
    children.sort_by_key(|c| c.token.created);
    Some(MytokenEntryTree {
        token: entry(row),
        children,
    })
}

/// The subtree rooted at `id`.
pub async fn subtree(tx: &mut Tx, id: &MytokenId) -> Result<Option<MytokenEntryTree>> {
    let mut rows = HashMap::new();
    for member in std::iter::once(*id).chain(descendants(tx, id).await?) {
        if let Some(row) = db::get_mytoken(tx, &member).await? {
            rows.insert(member, row);
        }
    }
    Ok(build_tree(&rows, &children_index(&rows), id))
}

/// Every token tree of the user identified by issuer and subject.
pub async fn all_trees(tx: &mut Tx, oidc_iss: &str, oidc_sub: &str) -> Result<Vec<MytokenEntryTree>> {
    let rows: HashMap<MytokenId, MytokenRow> = db::user_mytokens(tx, oidc_iss, oidc_sub)
        .await?
        .into_iter()
        .map(|r| (r.id, r))
        .collect();
    let index = children_index(&rows);
    let mut trees: Vec<MytokenEntryTree> = rows
        .values()
        .filter(|r| r.is_root())
        .filter_map(|r| build_tree(&rows, &index, &r.id))
        .collect();
    trees.sort_by_key(|t| t.token.created);
    Ok(trees)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::mytoken::NewMytoken;

    const ISSUER: &str = "https://mytoken.example";

    struct Minted {
        mt: Mytoken,
        jwt: String,
    }

    fn mint(key: &crate::crypto::SigningKey, now: i64) -> Minted {
        let mt = Mytoken::new(
            NewMytoken {
                oidc_sub: "alice".into(),
                oidc_iss: "https://op.example".into(),
                ..Default::default()
            },
            ISSUER,
            now,
        );
        let jwt = mt.to_jwt(key).unwrap();
        Minted { mt, jwt }
    }

    fn meta(now: i64) -> StoreMeta {
        StoreMeta {
            client: ClientMetadata::default(),
            now,
        }
    }

    /// root -> child -> grandchild
    async fn chain(db: &Database) -> (Minted, Minted, Minted) {
        let key = crate::crypto::SigningKey::generate();
        let root = mint(&key, 1);
        let child = mint(&key, 2);
        let grandchild = mint(&key, 3);
        let mut tx = db.begin().await.unwrap();
        store_root(&mut tx, &root.mt, &root.jwt, "rt-secret", &meta(1)).await.unwrap();
        store_child(&mut tx, &child.mt, &child.jwt, root.mt.id, &root.jwt, &meta(2))
            .await
            .unwrap();
        store_child(&mut tx, &grandchild.mt, &grandchild.jwt, child.mt.id, &child.jwt, &meta(3))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (root, child, grandchild)
    }

    #[tokio::test]
    async fn test_root_pointers() {
        let db = Database::in_memory().await.unwrap();
        let (root, child, grandchild) = chain(&db).await;
        let t = db.snapshot().await.unwrap();
        assert_eq!(t.mytokens[&root.mt.id].root_id, None);
        assert_eq!(t.mytokens[&child.mt.id].root_id, Some(root.mt.id));
        assert_eq!(t.mytokens[&grandchild.mt.id].root_id, Some(root.mt.id));
        assert_eq!(t.mytokens[&grandchild.mt.id].parent_id, Some(child.mt.id));
    }

    #[tokio::test]
    async fn test_refresh_token_shared_and_sealed() {
        let db = Database::in_memory().await.unwrap();
        let (root, _child, grandchild) = chain(&db).await;
        let mut tx = db.begin().await.unwrap();
        let g = &grandchild;
        assert_eq!(refresh_token(&mut tx, &g.mt.id, &g.jwt).await.unwrap().as_deref(), Some("rt-secret"));
        // The wrong JWT cannot open the key.
        assert!(refresh_token(&mut tx, &g.mt.id, &root.jwt).await.is_err());
        let rt_id = get(&mut tx, &root.mt.id).await.unwrap().unwrap().rt_id;
        assert_eq!(rt_occurrences(&mut tx, &rt_id).await.unwrap(), 3);
        update_refresh_token(&mut tx, &root.mt.id, &root.jwt, "rt-rotated").await.unwrap();
        assert_eq!(refresh_token(&mut tx, &g.mt.id, &g.jwt).await.unwrap().as_deref(), Some("rt-rotated"));
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_recursive_revoke_removes_chain() {
        let db = Database::in_memory().await.unwrap();
        let (root, _, _) = chain(&db).await;
        let id = root.mt.id;
        let deleted = db
            .transact(move |tx| Box::pin(async move { revoke(tx, &id, true).await }))
            .await
            .unwrap();
        assert_eq!(deleted.len(), 3);
        assert!(db.snapshot().await.unwrap().mytokens.is_empty());
    }

    #[tokio::test]
    async fn test_non_recursive_revoke_reroots_children() {
        let db = Database::in_memory().await.unwrap();
        let (root, child, grandchild) = chain(&db).await;
        let id = root.mt.id;
        let deleted = db
            .transact(move |tx| Box::pin(async move { revoke(tx, &id, false).await }))
            .await
            .unwrap();
        assert_eq!(deleted, vec![root.mt.id]);
        let t = db.snapshot().await.unwrap();
        assert_eq!(t.mytokens.len(), 2);
        let c = &t.mytokens[&child.mt.id];
        assert_eq!((c.parent_id, c.root_id), (None, None));
        let g = &t.mytokens[&grandchild.mt.id];
        assert_eq!(g.parent_id, Some(child.mt.id));
        assert_eq!(g.root_id, Some(child.mt.id));
    }

    #[tokio::test]
    async fn test_revoke_interior_node() {
        let db = Database::in_memory().await.unwrap();
        let (root, child, grandchild) = chain(&db).await;
        let id = child.mt.id;
        db.transact(move |tx| Box::pin(async move { revoke(tx, &id, false).await }))
            .await
            .unwrap();
        let t = db.snapshot().await.unwrap();
        assert!(t.mytokens.contains_key(&root.mt.id));
        let g = &t.mytokens[&grandchild.mt.id];
        assert_eq!((g.parent_id, g.root_id), (None, None));
    }

    #[tokio::test]
    async fn test_refresh_token_deleted_with_last_reference() {
        let db = Database::in_memory().await.unwrap();
        let (root, child, _) = chain(&db).await;
        let mut tx = db.begin().await.unwrap();
        let rt = revoke_with_refresh_token(&mut tx, &child.mt.id, &child.jwt, true).await.unwrap();
        assert_eq!(rt, None);
        let rt = revoke_with_refresh_token(&mut tx, &root.mt.id, &root.jwt, false).await.unwrap();
        assert_eq!(rt.as_deref(), Some("rt-secret"));
        tx.commit().await.unwrap();
        assert!(db.snapshot().await.unwrap().refresh_tokens.is_empty());
    }

    #[tokio::test]
    async fn test_is_revoked() {
        let db = Database::in_memory().await.unwrap();
        let (root, _, _) = chain(&db).await;
        let rotation = Rotation {
            on_other: true,
            lifetime: 100,
            ..Default::default()
        };
        let mut tx = db.begin().await.unwrap();
        let id = root.mt.id;
        assert!(!is_revoked(&mut tx, &id, 1, None, 50).await.unwrap());
        assert!(is_revoked(&mut tx, &id, 2, None, 50).await.unwrap());
        assert!(is_revoked(&mut tx, &MytokenId::new(), 1, None, 50).await.unwrap());
        assert!(!is_revoked(&mut tx, &id, 1, Some(&rotation), 101).await.unwrap());
        assert!(is_revoked(&mut tx, &id, 1, Some(&rotation), 102).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_rotation_reseals_key() {
        let db = Database::in_memory().await.unwrap();
        let key = crate::crypto::SigningKey::generate();
        let root = mint(&key, 1);
        let rotated = root.mt.rotate(10);
        let new_jwt = rotated.to_jwt(&key).unwrap();
        let id = root.mt.id;
        let mut tx = db.begin().await.unwrap();
        store_root(&mut tx, &root.mt, &root.jwt, "rt", &meta(1)).await.unwrap();
        record_rotation(&mut tx, &id, rotated.seq_no, &root.jwt, &new_jwt, 10).await.unwrap();
        assert_eq!(refresh_token(&mut tx, &id, &new_jwt).await.unwrap().as_deref(), Some("rt"));
        assert!(refresh_token(&mut tx, &id, &root.jwt).await.is_err());
        assert!(is_revoked(&mut tx, &id, 1, None, 10).await.unwrap());
        assert!(!is_revoked(&mut tx, &id, 2, None, 10).await.unwrap());
    }

    #[tokio::test]
    async fn test_trees() {
        let db = Database::in_memory().await.unwrap();
        let (root, child, _) = chain(&db).await;
        let mut tx = db.begin().await.unwrap();
        let tree = subtree(&mut tx, &root.mt.id).await.unwrap().unwrap();
        assert_eq!(tree.size(), 3);
        assert_eq!(subtree(&mut tx, &child.mt.id).await.unwrap().unwrap().size(), 2);
        assert!(subtree(&mut tx, &MytokenId::new()).await.unwrap().is_none());
        let all = all_trees(&mut tx, "https://op.example", "alice").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all_trees(&mut tx, "https://op.example", "bob").await.unwrap().is_empty());
    }
}
