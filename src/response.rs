//! Handing a minted mytoken to the client.
//!
//! A client asks for a representation (`response_type`) and may cap the
//! token length. The JWT is returned when it fits; otherwise a short token
//! stands in for it, or, when short tokens are disabled, a transfer code.

use crate::capabilities::Capabilities;
use crate::config::Config;
use crate::db::Tx;
use crate::error::Result;
use crate::event::{log_event, Event};
use crate::mytoken::{Mytoken, ResponseType, Rotation};
use crate::network::ClientMetadata;
use crate::proxy::{ShortToken, TransferCode};
use crate::restrictions::Restrictions;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Response to a successful mytoken request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MytokenResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mytoken: Option<String>,
    pub mytoken_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_code: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Restrictions::is_empty")]
    pub restrictions: Restrictions,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtoken_capabilities: Option<Capabilities>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Rotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_update: Option<TokenUpdate>,
}

/// A rotated token the client must use from now on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUpdate {
    pub mytoken: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expires_in: u64,
}

/// Decide the representation for a token of this length.
pub fn select_response_type(
    config: &Config,
    requested: ResponseType,
    jwt_len: usize,
    max_token_len: usize,
) -> ResponseType {
    let short = &config.features.short_tokens;
    let short_fits = short.enabled && (max_token_len == 0 || short.len <= max_token_len);
    let jwt_fits = max_token_len == 0 || jwt_len <= max_token_len;
    match requested {
        ResponseType::TransferCode => ResponseType::TransferCode,
        ResponseType::Token if jwt_fits => ResponseType::Token,
        ResponseType::ShortToken if short_fits => ResponseType::ShortToken,
        ResponseType::ShortToken if jwt_fits => ResponseType::Token,
        _ if short_fits => ResponseType::ShortToken,
        _ => ResponseType::TransferCode,
    }
}

/// Build the response for a freshly minted or redeemed token, storing the
/// short token or transfer code it needs.
#[allow(clippy::too_many_arguments)]
pub async fn token_response(
    config: &Config,
    tx: &mut Tx,
    mt: &Mytoken,
    jwt: &str,
    requested: ResponseType,
    max_token_len: usize,
    client: &ClientMetadata,
    now: i64,
) -> Result<MytokenResponse> {
    let response_type = select_response_type(config, requested, jwt.len(), max_token_len);
    let mut res = MytokenResponse {
        mytoken: None,
        mytoken_type: response_type,
        transfer_code: None,
        expires_in: mt.expires_in(now),
        restrictions: mt.restrictions.clone(),
        capabilities: mt.capabilities.clone(),
        subtoken_capabilities: mt.subtoken_capabilities.clone(),
        rotation: mt.rotation.clone(),
        token_update: None,
    };
    match response_type {
        ResponseType::Token => res.mytoken = Some(jwt.to_string()),
        ResponseType::ShortToken => {
            let short = ShortToken::new(jwt, mt.id, config.features.short_tokens.len)?;
            short.store(tx).await?;
            res.mytoken = Some(short.token().to_string());
        }
        ResponseType::TransferCode => {
            let tc_config = &config.features.transfer_codes;
            let tc = TransferCode::new(
                jwt,
                mt.id,
                false,
                ResponseType::Token,
                tc_config.len,
                tc_config.expires_after,
                now,
            )?;
            tc.store(tx).await?;
            log_event(tx, mt.id, Event::TransferCodeCreated, "", client, now).await?;
            res.transfer_code = Some(tc.code().to_string());
            res.expires_in = tc_config.expires_after;
        }
    }
    debug!(mytoken_id = %mt.id, requested = %requested, returned = %response_type, "Token response built");
    Ok(res)
}
