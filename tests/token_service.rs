//! Service operations on existing mytokens: subtokens, access tokens,
//! rotation, short tokens, transfer codes, revocation and tokeninfo.

mod common;

use common::*;
use mytoken::capabilities::{
    CAPABILITY_AT, CAPABILITY_CREATE_MYTOKEN, CAPABILITY_LIST_MYTOKENS,
    CAPABILITY_TOKENINFO_HISTORY, CAPABILITY_TOKENINFO_INTROSPECT, CAPABILITY_TOKENINFO_TREE,
};
use mytoken::hierarchy::refresh_token;
use mytoken::service::TokeninfoBody;
use mytoken::{
    AccessTokenRequest, Capabilities, ClientType, CodeExchangeOutcome, Error, Event, MytokenRequest,
    OidcFlowRequest, ResponseType, Restriction, Restrictions, RevocationRequest, Rotation,
    SubtokenRequest, TokenEndpointResponse, TokeninfoAction, TokeninfoRequest, TransferCodeRequest,
};

fn caps(names: &[&str]) -> Capabilities {
    names.iter().copied().collect()
}

fn all_caps() -> Capabilities {
    caps(&[
        CAPABILITY_AT,
        CAPABILITY_CREATE_MYTOKEN,
        CAPABILITY_TOKENINFO_INTROSPECT,
        CAPABILITY_TOKENINFO_HISTORY,
        CAPABILITY_TOKENINFO_TREE,
        CAPABILITY_LIST_MYTOKENS,
    ])
}

fn root_request(capabilities: Capabilities) -> OidcFlowRequest {
    OidcFlowRequest {
        capabilities: Some(capabilities),
        ..flow_request()
    }
}

fn expiring(exp: i64) -> Restrictions {
    vec![Restriction {
        expires_at: exp,
        ..Default::default()
    }]
    .into()
}

fn at_request(mytoken: &str) -> AccessTokenRequest {
    AccessTokenRequest {
        mytoken: mytoken.into(),
        ..Default::default()
    }
}

fn subtoken_request(parent: &str) -> SubtokenRequest {
    SubtokenRequest {
        mytoken: parent.into(),
        ..Default::default()
    }
}

// ============================================================================
// Subtokens
// ============================================================================

#[tokio::test]
async fn test_subtoken_requires_capability() {
    let h = harness().await;
    let root = h.mint_jwt(flow_request()).await;
    let err = h
        .service
        .create_subtoken(subtoken_request(&root), &client(), NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientCapabilities(_)));
    assert_eq!(err.http_status(), 403);
}

#[tokio::test]
async fn test_subtoken_inherits_and_narrows() {
    let h = harness().await;
    let root = h
        .mint_jwt(OidcFlowRequest {
            restrictions: expiring(NOW + 1000),
            ..root_request(all_caps())
        })
        .await;
    let root_id = h.parse(&root).id;

    let req = SubtokenRequest {
        restrictions: expiring(NOW + 500),
        capabilities: Some(caps(&[CAPABILITY_AT, CAPABILITY_TOKENINFO_INTROSPECT])),
        name: Some("ci".into()),
        ..subtoken_request(&root)
    };
    let res = h.service.create_subtoken(req, &client(), NOW).await.unwrap();
    assert_eq!(res.restrictions, expiring(NOW + 500));
    assert_eq!(res.expires_in, 500);
    assert!(res.subtoken_capabilities.is_none());
    assert!(res.token_update.is_none());

    let child = h.parse(res.mytoken.as_deref().unwrap());
    assert_eq!(child.oidc_sub, "alice");
    assert_eq!(
        child.capabilities,
        caps(&[CAPABILITY_AT, CAPABILITY_TOKENINFO_INTROSPECT])
    );

    let tables = h.db.snapshot().await.unwrap();
    let row = tables.mytokens.get(&child.id).unwrap();
    assert_eq!(row.parent_id, Some(root_id));
    assert_eq!(row.root_id, Some(root_id));
    assert_eq!(row.rt_id, tables.mytokens[&root_id].rt_id);
    assert!(tables
        .events
        .iter()
        .any(|e| e.mytoken_id == child.id && e.event == Event::InheritedRt));
    assert!(tables
        .events
        .iter()
        .any(|e| e.mytoken_id == root_id && e.event == Event::SubtokenCreated && e.comment == "ci"));

    // The child shares the parent's refresh token.
    let at = h
        .service
        .access_token(at_request(res.mytoken.as_deref().unwrap()), &client(), NOW)
        .await
        .unwrap();
    assert_eq!(at.access_token, "at-1");
}

#[tokio::test]
async fn test_subtoken_wider_than_parent() {
    let h = harness().await;
    let root = h
        .mint_jwt(OidcFlowRequest {
            restrictions: expiring(NOW + 1000),
            ..root_request(all_caps())
        })
        .await;

    let strict = SubtokenRequest {
        restrictions: expiring(NOW + 2000),
        failed_on_restrictions_not_tighter: true,
        ..subtoken_request(&root)
    };
    assert!(matches!(
        h.service.create_subtoken(strict.clone(), &client(), NOW).await,
        Err(Error::RestrictionsNotTighter)
    ));

    let lenient = SubtokenRequest {
        failed_on_restrictions_not_tighter: false,
        ..strict
    };
    let res = h.service.create_subtoken(lenient, &client(), NOW).await.unwrap();
    assert_eq!(res.restrictions, expiring(NOW + 1000));
}

#[tokio::test]
async fn test_subtoken_without_shared_capabilities() {
    let h = harness().await;
    let root = h
        .mint_jwt(root_request(caps(&[CAPABILITY_AT, CAPABILITY_CREATE_MYTOKEN])))
        .await;
    let req = SubtokenRequest {
        capabilities: Some(caps(&["settings"])),
        ..subtoken_request(&root)
    };
    assert!(matches!(
        h.service.create_subtoken(req, &client(), NOW).await,
        Err(Error::NoCapabilities)
    ));
    // Nothing is stored for a failed request.
    assert_eq!(h.db.snapshot().await.unwrap().mytokens.len(), 1);
}

#[tokio::test]
async fn test_subtoken_through_token_endpoint() {
    let h = harness().await;
    let root = h.mint_jwt(root_request(all_caps())).await;
    let body = serde_json::json!({
        "grant_type": "mytoken",
        "mytoken": root,
        "oidc_issuer": OP,
        "capabilities": ["AT"],
    });
    let req = MytokenRequest::from_json(body.to_string().as_bytes()).unwrap();
    match h.service.handle_token_request(req, &client(), NOW).await.unwrap() {
        TokenEndpointResponse::Mytoken(res) => assert_eq!(res.capabilities, caps(&["AT"])),
        other => panic!("unexpected response {:?}", other),
    }

    let wrong_issuer = MytokenRequest::Mytoken(SubtokenRequest {
        issuer: Some("https://other.example".into()),
        ..subtoken_request(&root)
    });
    assert!(matches!(
        h.service.handle_token_request(wrong_issuer, &client(), NOW).await,
        Err(Error::InvalidRequest(_))
    ));
}

// ============================================================================
// Access tokens
// ============================================================================

#[tokio::test]
async fn test_access_token_usage_cap() {
    let h = harness().await;
    let root = h
        .mint_jwt(OidcFlowRequest {
            restrictions: vec![Restriction {
                usages_at: Some(2),
                ..Default::default()
            }]
            .into(),
            ..flow_request()
        })
        .await;

    for expected in ["at-1", "at-2"] {
        let at = h
            .service
            .access_token(
                AccessTokenRequest {
                    comment: Some("job".into()),
                    ..at_request(&root)
                },
                &client(),
                NOW,
            )
            .await
            .unwrap();
        assert_eq!(at.access_token, expected);
        assert_eq!(at.token_type, "Bearer");
    }
    let err = h
        .service
        .access_token(at_request(&root), &client(), NOW)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UsageRestricted(_)));
    assert_eq!(h.provider.refresh_calls(), 2);

    let tables = h.db.snapshot().await.unwrap();
    let created: Vec<_> = tables
        .events
        .iter()
        .filter(|e| e.event == Event::AtCreated)
        .collect();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|e| e.comment == "job"));
    // One from the code exchange and two refreshes.
    assert_eq!(tables.access_tokens.len(), 3);
}

#[tokio::test]
async fn test_access_token_scope_must_fit_restriction() {
    let h = harness().await;
    let root = h
        .mint_jwt(OidcFlowRequest {
            restrictions: vec![Restriction {
                scope: "storage.read".into(),
                ..Default::default()
            }]
            .into(),
            ..flow_request()
        })
        .await;

    let at = h
        .service
        .access_token(at_request(&root), &client(), NOW)
        .await
        .unwrap();
    assert_eq!(at.scope, "storage.read");

    let wider = AccessTokenRequest {
        scope: Some("storage.read storage.write".into()),
        ..at_request(&root)
    };
    assert!(matches!(
        h.service.access_token(wider, &client(), NOW).await,
        Err(Error::UsageRestricted(_))
    ));
}

#[tokio::test]
async fn test_access_token_requires_capability() {
    let h = harness().await;
    let root = h
        .mint_jwt(root_request(caps(&[CAPABILITY_TOKENINFO_INTROSPECT])))
        .await;
    assert!(matches!(
        h.service.access_token(at_request(&root), &client(), NOW).await,
        Err(Error::InsufficientCapabilities(_))
    ));
    assert_eq!(h.provider.refresh_calls(), 0);
}

#[tokio::test]
async fn test_provider_refresh_token_rotation_is_stored() {
    let mut provider = MockProvider::new();
    provider.rotate_refresh_tokens = true;
    let h = harness_with(config(), provider).await;
    let root = h.mint_jwt(flow_request()).await;
    let id = h.parse(&root).id;

    h.service
        .access_token(at_request(&root), &client(), NOW)
        .await
        .unwrap();
    let jwt = root.clone();
    let rt = h
        .db
        .transact(move |tx| Box::pin(async move { refresh_token(tx, &id, &jwt).await }))
        .await
        .unwrap();
    assert_eq!(rt.as_deref(), Some("rt-2"));
}

// ============================================================================
// Rotation
// ============================================================================

fn rotating(auto_revoke: bool) -> OidcFlowRequest {
    OidcFlowRequest {
        rotation: Some(Rotation {
            on_at: true,
            auto_revoke,
            ..Default::default()
        }),
        ..flow_request()
    }
}

#[tokio::test]
async fn test_rotation_on_access_token() {
    let h = harness().await;
    let gen1 = h.mint_jwt(rotating(false)).await;

    let at = h
        .service
        .access_token(at_request(&gen1), &client(), NOW)
        .await
        .unwrap();
    let gen2 = at.token_update.expect("rotated token").mytoken;
    assert_eq!(h.parse(&gen2).seq_no, 2);

    // The old generation is dead, the new one works.
    assert!(matches!(
        h.service.access_token(at_request(&gen1), &client(), NOW).await,
        Err(Error::TokenRevoked)
    ));
    let at = h
        .service
        .access_token(at_request(&gen2), &client(), NOW)
        .await
        .unwrap();
    assert_eq!(h.parse(&at.token_update.unwrap().mytoken).seq_no, 3);
    assert!(h
        .db
        .snapshot()
        .await
        .unwrap()
        .events
        .iter()
        .any(|e| e.event == Event::TokenRotated));
}

#[tokio::test]
async fn test_replay_revokes_tree() {
    let h = harness().await;
    let gen1 = h
        .mint_jwt(OidcFlowRequest {
            capabilities: Some(all_caps()),
            ..rotating(true)
        })
        .await;
    let child = h
        .service
        .create_subtoken(subtoken_request(&gen1), &client(), NOW)
        .await
        .unwrap()
        .mytoken
        .unwrap();

    let gen2 = h
        .service
        .access_token(at_request(&gen1), &client(), NOW)
        .await
        .unwrap()
        .token_update
        .unwrap()
        .mytoken;

    assert!(matches!(
        h.service.access_token(at_request(&gen1), &client(), NOW).await,
        Err(Error::TokenRevoked)
    ));
    assert!(h.db.snapshot().await.unwrap().mytokens.is_empty());
    for token in [&gen2, &child] {
        assert!(matches!(
            h.service.access_token(at_request(token), &client(), NOW).await,
            Err(Error::TokenRevoked)
        ));
    }
}

// ============================================================================
// Short tokens
// ============================================================================

#[tokio::test]
async fn test_long_token_falls_back_to_short_token() {
    let h = harness().await;
    let res = h
        .mint(OidcFlowRequest {
            max_token_len: 100,
            ..flow_request()
        })
        .await;
    assert_eq!(res.mytoken_type, ResponseType::ShortToken);
    let short = res.mytoken.unwrap();
    assert_eq!(short.len(), 64);
    assert_eq!(h.db.snapshot().await.unwrap().proxy_tokens.len(), 1);

    let at = h
        .service
        .access_token(at_request(&short), &client(), NOW)
        .await
        .unwrap();
    assert_eq!(at.access_token, "at-1");

    assert!(matches!(
        h.service.access_token(at_request("not-a-short-token"), &client(), NOW).await,
        Err(Error::InvalidToken(_))
    ));
}

#[tokio::test]
async fn test_short_token_survives_rotation() {
    let h = harness().await;
    let short = h
        .mint(OidcFlowRequest {
            response_type: ResponseType::ShortToken,
            ..rotating(true)
        })
        .await
        .mytoken
        .unwrap();

    for _ in 0..3 {
        let at = h
            .service
            .access_token(at_request(&short), &client(), NOW)
            .await
            .unwrap();
        assert!(at.token_update.is_none());
    }
    let tables = h.db.snapshot().await.unwrap();
    let row = tables.mytokens.values().next().unwrap();
    assert_eq!(row.seq_no, 4);
}

// ============================================================================
// Transfer codes
// ============================================================================

#[tokio::test]
async fn test_transfer_code_roundtrip() {
    let h = harness().await;
    let root = h.mint_jwt(flow_request()).await;
    let id = h.parse(&root).id;

    let tc = h
        .service
        .create_transfer_code(
            TransferCodeRequest {
                mytoken: root.clone(),
                ..Default::default()
            },
            &client(),
            NOW,
        ).await
        .unwrap();
    assert_eq!(tc.transfer_code.len(), 8);
    assert_eq!(tc.expires_in, 300);

    let body = format!(
        r#"{{"grant_type":"transfer_code","transfer_code":"{}"}}"#,
        tc.transfer_code
    );
    let req = MytokenRequest::from_json(body.as_bytes()).unwrap();
    match h.service.handle_token_request(req, &client(), NOW + 10).await.unwrap() {
        TokenEndpointResponse::Mytoken(res) => assert_eq!(res.mytoken.as_deref(), Some(root.as_str())),
        other => panic!("unexpected response {:?}", other),
    }

    assert!(matches!(
        h.service.exchange_transfer_code(&tc.transfer_code, &client(), NOW + 20).await,
        Err(Error::BadCode)
    ));
    let events: Vec<Event> = h
        .db
        .snapshot()
        .await
        .unwrap()
        .events
        .into_iter()
        .filter(|e| e.mytoken_id == id)
        .map(|e| e.event)
        .collect();
    assert!(events.contains(&Event::TransferCodeCreated));
    assert!(events.contains(&Event::TransferCodeUsed));
}

#[tokio::test]
async fn test_transfer_code_response_type() {
    let h = harness().await;
    let res = h
        .mint(OidcFlowRequest {
            response_type: ResponseType::TransferCode,
            ..flow_request()
        })
        .await;
    assert_eq!(res.mytoken_type, ResponseType::TransferCode);
    assert!(res.mytoken.is_none());
    let code = res.transfer_code.unwrap();
    let redeemed = h
        .service
        .exchange_transfer_code(&code, &client(), NOW + 301).await
        .unwrap_err();
    assert!(matches!(redeemed, Error::CodeExpired));
}

// ============================================================================
// Revocation
// ============================================================================

async fn root_with_child(h: &Harness) -> (String, String) {
    let root = h.mint_jwt(root_request(all_caps())).await;
    let child = h
        .service
        .create_subtoken(subtoken_request(&root), &client(), NOW)
        .await
        .unwrap()
        .mytoken
        .unwrap();
    (root, child)
}

fn revocation(token: &str, recursive: bool) -> RevocationRequest {
    RevocationRequest {
        token: token.into(),
        recursive,
    }
}

#[tokio::test]
async fn test_revoke_recursive() {
    let h = harness().await;
    let (root, child) = root_with_child(&h).await;
    h.service.revoke(revocation(&root, true), NOW).await.unwrap();

    let tables = h.db.snapshot().await.unwrap();
    assert!(tables.mytokens.is_empty());
    assert!(tables.refresh_tokens.is_empty());
    assert_eq!(h.provider.revoked(), vec!["rt-1".to_string()]);
    assert!(matches!(
        h.service.access_token(at_request(&child), &client(), NOW).await,
        Err(Error::TokenRevoked)
    ));
}

#[tokio::test]
async fn test_revoke_keeps_orphans() {
    let h = harness().await;
    let (root, child) = root_with_child(&h).await;
    h.service.revoke(revocation(&root, false), NOW).await.unwrap();

    // The child still references the refresh token.
    assert!(h.provider.revoked().is_empty());
    let child_id = h.parse(&child).id;
    let tables = h.db.snapshot().await.unwrap();
    assert_eq!(tables.mytokens.len(), 1);
    assert!(tables.mytokens[&child_id].is_root());
    h.service
        .access_token(at_request(&child), &client(), NOW)
        .await
        .unwrap();

    h.service.revoke(revocation(&child, false), NOW).await.unwrap();
    assert_eq!(h.provider.revoked(), vec!["rt-1".to_string()]);
}

#[tokio::test]
async fn test_revoke_codes_and_short_tokens() {
    let h = harness().await;
    let root = h.mint_jwt(flow_request()).await;

    // A transfer code for an existing token: only the code goes away.
    let tc = h
        .service
        .create_transfer_code(
            TransferCodeRequest {
                mytoken: root.clone(),
                ..Default::default()
            },
            &client(),
            NOW,
        ).await
        .unwrap();
    h.service
        .revoke(revocation(&tc.transfer_code, false), NOW)
        .await
        .unwrap();
    assert!(matches!(
        h.service.exchange_transfer_code(&tc.transfer_code, &client(), NOW).await,
        Err(Error::BadCode)
    ));
    assert_eq!(h.db.snapshot().await.unwrap().mytokens.len(), 1);

    let short = h
        .mint(OidcFlowRequest {
            response_type: ResponseType::ShortToken,
            ..flow_request()
        })
        .await
        .mytoken
        .unwrap();
    h.service.revoke(revocation(&short, false), NOW).await.unwrap();
    let tables = h.db.snapshot().await.unwrap();
    assert_eq!(tables.mytokens.len(), 1);
    assert!(tables.proxy_tokens.is_empty());

    assert!(matches!(
        h.service.revoke(revocation("nonsense", false), NOW).await,
        Err(Error::InvalidToken(_))
    ));
}

#[tokio::test]
async fn test_revoke_polling_code_revokes_minted_token() {
    let h = harness().await;
    let (started, state) = h
        .consent(OidcFlowRequest {
            client_type: ClientType::Native,
            ..flow_request()
        })
        .await;
    assert!(matches!(
        h.redirect(&state, "authcode").await.unwrap(),
        CodeExchangeOutcome::Native { .. }
    ));
    assert_eq!(h.db.snapshot().await.unwrap().mytokens.len(), 1);

    let polling_code = started.polling_info.unwrap().polling_code;
    h.service
        .revoke(revocation(&polling_code, true), NOW)
        .await
        .unwrap();
    assert!(h.db.snapshot().await.unwrap().mytokens.is_empty());
    assert!(matches!(
        h.service.poll(&polling_code, &client(), NOW).await,
        Err(Error::BadCode)
    ));
}

// ============================================================================
// Tokeninfo
// ============================================================================

#[tokio::test]
async fn test_tokeninfo_actions() {
    let h = harness().await;
    let (root, _child) = root_with_child(&h).await;
    let root_id = h.parse(&root).id;
    let info = |action| TokeninfoRequest {
        action,
        mytoken: root.clone(),
    };

    match h.service.tokeninfo(info(TokeninfoAction::Introspect), &client(), NOW).await.unwrap().body {
        TokeninfoBody::Introspect { valid, token } => {
            assert!(valid);
            assert_eq!(token.id, root_id);
        }
        other => panic!("unexpected body {:?}", other),
    }

    match h.service.tokeninfo(info(TokeninfoAction::SubtokenTree), &client(), NOW).await.unwrap().body {
        TokeninfoBody::Tree { mytokens } => {
            assert_eq!(mytokens.token.id, root_id);
            assert_eq!(mytokens.children.len(), 1);
        }
        other => panic!("unexpected body {:?}", other),
    }

    match h.service.tokeninfo(info(TokeninfoAction::ListMytokens), &client(), NOW).await.unwrap().body {
        TokeninfoBody::List { mytokens } => assert_eq!(mytokens.len(), 1),
        other => panic!("unexpected body {:?}", other),
    }

    match h.service.tokeninfo(info(TokeninfoAction::EventHistory), &client(), NOW).await.unwrap().body {
        TokeninfoBody::History { events } => {
            let kinds: Vec<Event> = events.iter().map(|e| e.event).collect();
            for expected in [
                Event::Created,
                Event::SubtokenCreated,
                Event::TokeninfoIntrospect,
                Event::TokeninfoSubtokens,
                Event::TokeninfoListMytokens,
                Event::TokeninfoHistory,
            ] {
                assert!(kinds.contains(&expected), "missing {:?}", expected);
            }
            assert!(events.iter().all(|e| e.ip == "192.0.2.10"));
        }
        other => panic!("unexpected body {:?}", other),
    }
}

#[tokio::test]
async fn test_tokeninfo_requires_capability_and_usage() {
    let h = harness().await;
    let root = h.mint_jwt(flow_request()).await;
    assert!(matches!(
        h.service.event_history(&root, &client(), NOW).await,
        Err(Error::InsufficientCapabilities(_))
    ));

    let limited = h
        .mint_jwt(OidcFlowRequest {
            restrictions: vec![Restriction {
                usages_other: Some(1),
                ..Default::default()
            }]
            .into(),
            ..flow_request()
        })
        .await;
    h.service.introspect(&limited, &client(), NOW).await.unwrap();
    assert!(matches!(
        h.service.introspect(&limited, &client(), NOW).await,
        Err(Error::UsageRestricted(_))
    ));
}

#[tokio::test]
async fn test_tokeninfo_rotates_on_other() {
    let h = harness().await;
    let gen1 = h
        .mint_jwt(OidcFlowRequest {
            rotation: Some(Rotation {
                on_other: true,
                ..Default::default()
            }),
            ..flow_request()
        })
        .await;
    let res = h.service.introspect(&gen1, &client(), NOW).await.unwrap();
    let gen2 = res.token_update.unwrap().mytoken;
    assert_eq!(h.parse(&gen2).seq_no, 2);
    assert!(matches!(
        h.service.introspect(&gen1, &client(), NOW).await,
        Err(Error::TokenRevoked)
    ));
}
