//! Per-token event history.
//!
//! Every state change of a mytoken is recorded with the requester's
//! metadata. Events are stored in the same transaction as the change they
//! describe, and are deleted together with their token.

use crate::db::{self, EventRow, Tx};
use crate::error::Result;
use crate::mytoken::MytokenId;
use crate::network::ClientMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Event Types
// ============================================================================

/// Things that can happen to a mytoken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    /// Minted from an authorization code flow
    Created,
    /// An access token was obtained
    #[serde(rename = "AT_created")]
    AtCreated,
    /// A child mytoken was minted from this one
    #[serde(rename = "MT_created")]
    SubtokenCreated,
    /// Minted from a parent and shares its refresh token
    #[serde(rename = "inherited_RT")]
    InheritedRt,
    TransferCodeCreated,
    TransferCodeUsed,
    /// Exchanged from a polling code
    TokenFromPollingCode,
    TokenRotated,
    TokeninfoIntrospect,
    TokeninfoHistory,
    TokeninfoSubtokens,
    TokeninfoListMytokens,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Created => "created",
            Event::AtCreated => "AT_created",
            Event::SubtokenCreated => "MT_created",
            Event::InheritedRt => "inherited_RT",
            Event::TransferCodeCreated => "transfer_code_created",
            Event::TransferCodeUsed => "transfer_code_used",
            Event::TokenFromPollingCode => "token_from_polling_code",
            Event::TokenRotated => "token_rotated",
            Event::TokeninfoIntrospect => "tokeninfo_introspect",
            Event::TokeninfoHistory => "tokeninfo_history",
            Event::TokeninfoSubtokens => "tokeninfo_subtokens",
            Event::TokeninfoListMytokens => "tokeninfo_list_mytokens",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a token's history, as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub event: Event,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    pub time: i64,
}

// ============================================================================
// Storage
// ============================================================================

/// Record `event` for `mytoken_id`.
pub async fn log_event(
    tx: &mut Tx,
    mytoken_id: MytokenId,
    event: Event,
    comment: impl Into<String>,
    client: &ClientMetadata,
    now: i64,
) -> Result<()> {
    let row = EventRow {
        mytoken_id,
        event,
        comment: comment.into(),
        client: client.clone(),
        time: now,
    };
    db::insert_event(tx, &row).await
}

/// Events of `mytoken_id`, oldest first.
pub async fn history(tx: &mut Tx, mytoken_id: &MytokenId) -> Result<Vec<EventEntry>> {
    Ok(db::events_of(tx, mytoken_id)
        .await?
        .into_iter()
        .map(|e| EventEntry {
            event: e.event,
            comment: e.comment,
            ip: e.client.ip.to_string(),
            user_agent: e.client.user_agent,
            time: e.time,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&Event::AtCreated).unwrap(), r#""AT_created""#);
        assert_eq!(serde_json::to_string(&Event::InheritedRt).unwrap(), r#""inherited_RT""#);
        assert_eq!(
            serde_json::to_string(&Event::TokenRotated).unwrap(),
            format!("\"{}\"", Event::TokenRotated)
        );
        let back: Event = serde_json::from_str(r#""MT_created""#).unwrap();
        assert_eq!(back, Event::SubtokenCreated);
    }

    #[tokio::test]
    async fn test_history_is_per_token_and_ordered() {
        let db = Database::in_memory().await.unwrap();
        let a = MytokenId::new();
        let b = MytokenId::new();
        let client = ClientMetadata::default();
        let mut tx = db.begin().await.unwrap();
        log_event(&mut tx, a, Event::AtCreated, "", &client, 20).await.unwrap();
        log_event(&mut tx, b, Event::Created, "", &client, 5).await.unwrap();
        log_event(&mut tx, a, Event::Created, "from code", &client, 10).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        let h = history(&mut tx, &a).await.unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h[0].event, Event::Created);
        assert_eq!(h[0].comment, "from code");
        assert_eq!(h[0].ip, "127.0.0.1");
        assert_eq!(h[1].event, Event::AtCreated);
    }
}
