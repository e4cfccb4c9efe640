#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum_test::TestServer;
use parking_lot::Mutex;

use circle_common::SnowflakeGenerator;
use relay_api::auth::tokens::{self, TokenData};
use relay_api::config::{Config, PresenceConfig, PushConfig};
use relay_api::db::kv::{KeyValueStore, MemoryStore};
use relay_api::db::InMemoryStore;
use relay_api::models::notification::Notification;
use relay_api::models::push_subscription::PushSubscription;
use relay_api::notifications::{PushOutcome, PushService};
use relay_api::AppState;

pub const INTERNAL_TOKEN: &str = "test-internal-token";

/// Push service that records every attempt. Endpoints in `gone` report
/// permanent failure.
#[derive(Default)]
pub struct RecordingPush {
    pub gone: Mutex<HashSet<String>>,
    pub sent: Mutex<Vec<(String, i64)>>,
}

impl RecordingPush {
    pub fn mark_gone(&self, endpoint: &str) {
        self.gone.lock().insert(endpoint.to_string());
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(e, _)| e.clone()).collect()
    }
}

#[async_trait]
impl PushService for RecordingPush {
    async fn send(&self, sub: &PushSubscription, notification: &Notification) -> PushOutcome {
        if self.gone.lock().contains(&sub.endpoint) {
            return PushOutcome::PermanentlyFailed;
        }
        self.sent
            .lock()
            .push((sub.endpoint.clone(), notification.id));
        PushOutcome::Delivered
    }
}

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryStore>,
    pub push: Arc<RecordingPush>,
}

pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        redis_url: None,
        port: 0,
        internal_api_token: Some(INTERNAL_TOKEN.to_string()),
        worker_id: 0,
        presence: PresenceConfig {
            heartbeat_interval: Duration::from_secs(5),
            offline_grace: Duration::ZERO,
            ..PresenceConfig::default()
        },
        push: PushConfig::default(),
        store_timeout: Duration::from_secs(1),
    }
}

/// Build a test AppState over in-memory stores.
pub fn test_state() -> TestApp {
    test_state_with(test_config())
}

pub fn test_state_with(config: Config) -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let push = Arc::new(RecordingPush::default());
    let state = AppState::new(
        config,
        store.clone(),
        kv,
        push.clone(),
        Arc::new(SnowflakeGenerator::new(0)),
    );
    TestApp { state, store, push }
}

pub fn test_router(state: &AppState) -> Router {
    relay_api::routes::router().with_state(state.clone())
}

pub fn test_server() -> (TestServer, TestApp) {
    test_server_with(test_config())
}

pub fn test_server_with(config: Config) -> (TestServer, TestApp) {
    let app = test_state_with(config);
    let server = TestServer::new(test_router(&app.state)).unwrap();
    (server, app)
}

/// Issue a PAT for `user_id` the way the account service would.
pub async fn login(state: &AppState, user_id: &str) -> String {
    let pat = tokens::generate_pat();
    tokens::store_pat(
        state.kv.as_ref(),
        &pat,
        &TokenData {
            user_id: user_id.to_string(),
        },
    )
    .await
    .expect("store PAT");
    pat
}

pub fn new_user_id() -> String {
    circle_common::id::prefixed_ulid(circle_common::id::prefix::USER)
}

pub fn notification_body(user_id: &str, title: &str) -> serde_json::Value {
    serde_json::json!({
        "user_id": user_id,
        "type": "message",
        "title": title,
        "message": "You have a new message",
        "actor_id": "usr_sender",
        "related_id": "msg_1",
        "related_type": "message",
        "action_url": "/messages/1",
    })
}
