// SPDX-License-Identifier: Apache-2.0

use pgexec_lib::commands::query::PollStatus;
use pgexec_lib::config::Settings;
use pgexec_lib::engine::{DatabaseTarget, EditorKind, ServerConfig, SessionStore};
use pgexec_lib::AppState;

fn server(server_id: i32) -> ServerConfig {
    ServerConfig {
        server_id,
        name: "local".to_string(),
        host: "127.0.0.1".to_string(),
        // Nothing listens here, connections must not be attempted by these tests
        port: 1,
        username: "postgres".to_string(),
        password: None,
        ssl: false,
        connect_timeout_secs: Some(1),
    }
}

#[tokio::test]
async fn test_app_state_initialization() {
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(Settings::default().with_process_dir(dir.path()));

    assert!(state.registry.is_empty());
    assert!(state.sessions.is_empty());
    assert_eq!(state.processes.root(), dir.path());

    state.register_server(server(7));
    assert_eq!(state.registry.list(), vec![7]);
    assert!(state.unregister_server(7));
    assert!(!state.unregister_server(7));
}

#[tokio::test]
async fn test_transaction_lifecycle_without_connecting() {
    let state = AppState::default();
    let manager = state.register_server(server(3));
    let store = state.sessions.as_ref();

    let trans_id = state
        .bridge
        .initialize(store, 3, DatabaseTarget::new(5, "postgres"), EditorKind::QueryTool)
        .unwrap();
    assert!(store.contains(&trans_id));

    let toggled = state.bridge.set_auto_commit(store, &trans_id, false).await.unwrap();
    assert_eq!(toggled.http_status(), 200);

    // No connect flag: nothing is opened and nothing is dispatched
    let reply = state
        .bridge
        .execute(store, &trans_id, "SELECT 1;", false)
        .await
        .unwrap()
        .data()
        .unwrap();
    assert!(!reply.status);
    assert_eq!(manager.connection_count(), 1);

    let polled = state.bridge.poll(store, &trans_id).await.unwrap().data().unwrap();
    assert_eq!(polled.status, PollStatus::NotConnected);

    assert!(state.bridge.close(store, &trans_id).await.unwrap());
    assert!(!store.contains(&trans_id));
}

#[test]
fn test_initialize_requires_registered_server() {
    let state = AppState::default();
    let result = state.bridge.initialize(
        state.sessions.as_ref(),
        99,
        DatabaseTarget::new(1, "postgres"),
        EditorKind::QueryTool,
    );
    assert!(result.is_err());
    assert!(state.sessions.is_empty());
}
