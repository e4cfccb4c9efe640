mod common;

use axum::http::header::AUTHORIZATION;
use axum::http::StatusCode;
use serde_json::Value;

use common::{login, new_user_id, test_config, test_server, test_server_with, INTERNAL_TOKEN};
use relay_api::db::Store;
use relay_api::models::user_status::PresenceStatus;
use relay_api::relay::RelayEvent;

#[tokio::test]
async fn health_reports_connection_count() {
    let (server, app) = test_server();
    let resp = server.get("/health").await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);

    app.state
        .relay
        .handle(RelayEvent::Connected {
            connection_id: "conn_1".into(),
            sender: None,
        })
        .await
        .unwrap();
    let body: Value = server.get("/health").await.json();
    assert_eq!(body["connections"], 1);
}

#[tokio::test]
async fn unknown_user_is_offline() {
    let (server, app) = test_server();
    let pat = login(&app.state, &new_user_id()).await;

    let resp = server
        .get("/api/v1/users/usr_nobody/presence")
        .add_header(AUTHORIZATION, format!("Bearer {pat}"))
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert_eq!(body["user_id"], "usr_nobody");
    assert_eq!(body["status"], "offline");
    assert_eq!(body["connected"], false);
    assert!(body["last_seen"].is_null());
}

#[tokio::test]
async fn presence_follows_connection_lifecycle() {
    let (server, app) = test_server();
    let viewer = login(&app.state, &new_user_id()).await;
    let user = new_user_id();
    let relay = &app.state.relay;

    relay
        .handle(RelayEvent::Connected {
            connection_id: "conn_a".into(),
            sender: None,
        })
        .await
        .unwrap();
    relay
        .handle(RelayEvent::Registered {
            connection_id: "conn_a".into(),
            user_id: user.clone(),
        })
        .await
        .unwrap()
        .settle()
        .await;

    let body: Value = server
        .get(&format!("/api/v1/users/{user}/presence"))
        .add_header(AUTHORIZATION, format!("Bearer {viewer}"))
        .await
        .json();
    assert_eq!(body["status"], "online");
    assert_eq!(body["connected"], true);

    relay
        .handle(RelayEvent::PresenceUpdate {
            user_id: user.clone(),
            status: PresenceStatus::Away,
        })
        .await
        .unwrap()
        .settle()
        .await;
    let body: Value = server
        .get(&format!("/api/v1/users/{user}/presence"))
        .add_header(AUTHORIZATION, format!("Bearer {viewer}"))
        .await
        .json();
    assert_eq!(body["status"], "away");

    relay
        .handle(RelayEvent::Disconnected {
            connection_id: "conn_a".into(),
        })
        .await
        .unwrap()
        .settle()
        .await;
    let body: Value = server
        .get(&format!("/api/v1/users/{user}/presence"))
        .add_header(AUTHORIZATION, format!("Bearer {viewer}"))
        .await
        .json();
    assert_eq!(body["status"], "offline");
    assert_eq!(body["connected"], false);
    assert!(body["last_seen"].is_string());

    assert_eq!(
        app.store.status_log(&user),
        vec![
            PresenceStatus::Online,
            PresenceStatus::Away,
            PresenceStatus::Offline
        ]
    );
}

#[tokio::test]
async fn presence_matches_friends_during_offline_grace() {
    let mut config = test_config();
    config.presence.offline_grace = std::time::Duration::from_millis(300);
    let (server, app) = test_server_with(config);
    let viewer = login(&app.state, &new_user_id()).await;
    let user = new_user_id();
    let relay = &app.state.relay;

    relay
        .handle(RelayEvent::Registered {
            connection_id: "conn_a".into(),
            user_id: user.clone(),
        })
        .await
        .unwrap()
        .settle()
        .await;

    let pending = relay
        .handle(RelayEvent::Disconnected {
            connection_id: "conn_a".into(),
        })
        .await
        .unwrap();

    // Friends have not been told yet, so neither is anyone else.
    let body: Value = server
        .get(&format!("/api/v1/users/{user}/presence"))
        .add_header(AUTHORIZATION, format!("Bearer {viewer}"))
        .await
        .json();
    assert_eq!(body["status"], "online");
    assert_eq!(body["connected"], false);

    pending.settle().await;
    let body: Value = server
        .get(&format!("/api/v1/users/{user}/presence"))
        .add_header(AUTHORIZATION, format!("Bearer {viewer}"))
        .await
        .json();
    assert_eq!(body["status"], "offline");
}

#[tokio::test]
async fn presence_requires_auth() {
    let (server, _app) = test_server();
    server
        .get("/api/v1/users/usr_x/presence")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn internal_refresh_rewrites_status() {
    let (server, app) = test_server();
    let user = new_user_id();

    server
        .post(&format!("/internal/v1/presence/{user}/refresh"))
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    server
        .post(&format!("/internal/v1/presence/{user}/refresh"))
        .add_header(AUTHORIZATION, format!("Bearer {INTERNAL_TOKEN}"))
        .await
        .assert_status(StatusCode::ACCEPTED);

    // The refresh runs in the background.
    let mut row = None;
    for _ in 0..50 {
        row = app.store.get_status(&user).await.unwrap();
        if row.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(row.expect("status row").status, PresenceStatus::Offline);
}

#[tokio::test]
async fn internal_refresh_rejects_non_user_ids() {
    let (server, app) = test_server();

    server
        .post("/internal/v1/presence/conn_01HZY8Q6QJ5Z0V7D3B7X4W1M2N/refresh")
        .add_header(AUTHORIZATION, format!("Bearer {INTERNAL_TOKEN}"))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let row = app
        .store
        .get_status("conn_01HZY8Q6QJ5Z0V7D3B7X4W1M2N")
        .await
        .unwrap();
    assert!(row.is_none());
}

#[tokio::test]
async fn ticket_is_minted_for_authenticated_user() {
    let (server, app) = test_server();
    let user = new_user_id();
    let pat = login(&app.state, &user).await;

    server
        .post("/api/v1/gateway/ticket")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);

    let resp = server
        .post("/api/v1/gateway/ticket")
        .add_header(AUTHORIZATION, format!("Bearer {pat}"))
        .await;
    resp.assert_status_ok();
    let body: Value = resp.json();
    assert!(body["ticket"].as_str().unwrap().starts_with("wst_"));
    assert_eq!(body["expires_in"], 30);

    let ticket = body["ticket"].as_str().unwrap();
    let data = relay_api::auth::tokens::consume_ws_ticket(app.state.kv.as_ref(), ticket)
        .await
        .unwrap()
        .expect("ticket stored");
    assert_eq!(data.user_id, user);
}
