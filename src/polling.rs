//! Redeeming polling and transfer codes.
//!
//! Both kinds of code are popped: the first successful redemption deletes
//! the code, so every later attempt sees `bad_code`.

use crate::cluster::Cluster;
use crate::context::Context;
use std::sync::Arc;
use crate::db::Tx;
use crate::error::{Error, Result};
use crate::event::{log_event, Event};
use crate::mytoken::Mytoken;
use crate::network::ClientMetadata;
use crate::proxy::{check_code, delete_code, pop_token, CodeStatus};
use crate::response::{token_response, MytokenResponse};
use tracing::{debug, info};

/// Outcome of one poll, before it is turned into a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// The code is unknown or was already redeemed.
    NotFound,
    Expired,
    Declined,
    Pending,
    Ready(String),
}

/// Check a polling code and pop its token if the flow completed.
///
/// Expired and declined codes are deleted.
pub async fn poll_status(tx: &mut Tx, code: &str, now: i64) -> Result<(PollStatus, CodeStatus)> {
    let status = check_code(tx, code, now).await?;
    if !status.found {
        return Ok((PollStatus::NotFound, status));
    }
    if status.consent_declined {
        delete_code(tx, code).await?;
        return Ok((PollStatus::Declined, status));
    }
    if status.expired {
        delete_code(tx, code).await?;
        return Ok((PollStatus::Expired, status));
    }
    let outcome = match pop_token(tx, code).await? {
        Some(jwt) => PollStatus::Ready(jwt),
        None => PollStatus::Pending,
    };
    Ok((outcome, status))
}

/// Handle `grant_type=polling_code`.
pub async fn poll(
    ctx: &Arc<Context>,
    cluster: &Cluster,
    code: &str,
    client: &ClientMetadata,
    now: i64,
) -> Result<MytokenResponse> {
    let ctx = Arc::clone(ctx);
    let code = code.to_string();
    let client = client.clone();
    // Deletions of expired or declined codes must commit even though the
    // poll fails, so the error travels inside a committed transaction.
    let result = cluster
        .transact(move |tx| {
            Box::pin(async move {
                let (outcome, status) = poll_status(tx, &code, now).await?;
                let jwt = match outcome {
                    PollStatus::Ready(jwt) => jwt,
                    PollStatus::NotFound => return Ok(Err(Error::BadCode)),
                    PollStatus::Declined => return Ok(Err(Error::ConsentDeclined)),
                    PollStatus::Expired => return Ok(Err(Error::CodeExpired)),
                    PollStatus::Pending => return Ok(Err(Error::AuthorizationPending)),
                };
                let mt = Mytoken::parse(&jwt, &ctx.public_key, ctx.issuer(), now)?;
                log_event(tx, mt.id, Event::TokenFromPollingCode, "", &client, now).await?;
                token_response(
                    &ctx.config,
                    tx,
                    &mt,
                    &jwt,
                    status.response_type,
                    status.max_token_len,
                    &client,
                    now,
                )
                .await
                .map(Ok)
            })
        })
        .await?;
    match &result {
        Ok(_) => info!("Polling code redeemed"),
        Err(e) => debug!(outcome = %e.name(), "Polling code not redeemed"),
    }
    result
}

/// Handle `grant_type=transfer_code`.
pub async fn exchange_transfer_code(
    ctx: &Arc<Context>,
    cluster: &Cluster,
    code: &str,
    client: &ClientMetadata,
    now: i64,
) -> Result<MytokenResponse> {
    let ctx = Arc::clone(ctx);
    let code = code.to_string();
    let client = client.clone();
    let result = cluster
        .transact(move |tx| {
            Box::pin(async move {
                let status = check_code(tx, &code, now).await?;
                if !status.found {
                    return Ok(Err(Error::BadCode));
                }
                if status.expired {
                    delete_code(tx, &code).await?;
                    return Ok(Err(Error::CodeExpired));
                }
                let Some(jwt) = pop_token(tx, &code).await? else {
                    return Ok(Err(Error::BadCode));
                };
                let mt = Mytoken::parse(&jwt, &ctx.public_key, ctx.issuer(), now)?;
                log_event(tx, mt.id, Event::TransferCodeUsed, "", &client, now).await?;
                token_response(
                    &ctx.config,
                    tx,
                    &mt,
                    &jwt,
                    status.response_type,
                    status.max_token_len,
                    &client,
                    now,
                )
                .await
                .map(Ok)
            })
        })
        .await?;
    if result.is_ok() {
        info!("Transfer code redeemed");
    }
    result
}
