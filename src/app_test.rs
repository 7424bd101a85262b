use std::time::Duration;

use super::*;
use crate::connection::ReconnectPolicy;
use crate::drainer::DrainTiming;
use crate::test_helpers::{FakeFavoritesApi, FakeNotifyServer, SequenceProvider, wait_until};
use crate::types::{FavoriteRecord, MovieId};

fn test_config(server: &FakeNotifyServer) -> ClientConfig {
    ClientConfig {
        socket_base_url: server.socket_base(),
        timing: DrainTiming { dwell: Duration::from_millis(300), fade: Duration::from_millis(10) },
        ..ClientConfig::default()
    }
}

fn client_for(server: &FakeNotifyServer) -> NotificationClient {
    NotificationClient::new(test_config(server), Arc::new(SequenceProvider::new()), Arc::new(FakeFavoritesApi::new()))
}

/// Every message the notification area switched to, in order.
fn record_display(client: &NotificationClient) -> Arc<Mutex<Vec<String>>> {
    let mut displayed = client.displayed();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let out = seen.clone();
    tokio::spawn(async move {
        while displayed.changed().await.is_ok() {
            if let DisplayState::Displaying { message } = &*displayed.borrow_and_update() {
                out.lock().unwrap().push(message.clone());
            }
        }
    });
    seen
}

fn shown(seen: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    seen.lock().unwrap().clone()
}

fn ana() -> Identity {
    Identity::new("user-ana", "Ana")
}

fn bo() -> Identity {
    Identity::new("user-bo", "Bo")
}

#[tokio::test]
async fn login_connects_and_shows_greeting() {
    let server = FakeNotifyServer::start().await;
    let client = client_for(&server);
    let seen = record_display(&client);

    let session = client.login(ana()).await.unwrap();
    assert_eq!(session.credential.as_str(), "token-1");

    let mut connected = client.connected();
    connected.wait_for(|flag| *flag).await.unwrap();
    wait_until("greeting shown", || shown(&seen) == ["Connected to movie notifications!"]).await;

    let handshakes = server.handshakes();
    assert_eq!(handshakes.len(), 1);
    assert_eq!(handshakes[0].0, "user-ana");
    assert_eq!(handshakes[0].1.get("credential").map(String::as_str), Some("token-1"));
    wait_until("favorites loaded", || client.favorites().is_loaded()).await;
}

#[tokio::test]
async fn favoriting_notifies_the_other_client() {
    let server = FakeNotifyServer::start().await;
    let ana_client = client_for(&server);
    let bo_client = client_for(&server);
    let ana_seen = record_display(&ana_client);
    let bo_seen = record_display(&bo_client);

    ana_client.login(ana()).await.unwrap();
    ana_client.connected().wait_for(|flag| *flag).await.unwrap();
    bo_client.login(bo()).await.unwrap();
    bo_client.connected().wait_for(|flag| *flag).await.unwrap();
    wait_until("both connections accepted", || server.open_connections() == 2).await;

    let inception = FavoriteRecord::new(27205, "Inception");
    ana_client.favorites().add_favorite(&inception).await.unwrap();
    assert!(ana_client.favorites().is_favorite(MovieId(27205)));

    wait_until("sender sees confirmation", || {
        shown(&ana_seen).iter().any(|message| message == "You just favorited Inception")
    })
    .await;
    wait_until("peer sees broadcast", || {
        shown(&bo_seen).iter().any(|message| message == "Ana just favorited Inception")
    })
    .await;

    let broadcasts = server.received_of_type("favorite_movie");
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0]["user_name"], "Ana");
    assert_eq!(broadcasts[0]["movie"]["id"], 27205);
}

#[tokio::test]
async fn logout_tears_everything_down() {
    let server = FakeNotifyServer::start().await;
    let client = client_for(&server);

    client.login(ana()).await.unwrap();
    client.connected().wait_for(|flag| *flag).await.unwrap();
    wait_until("favorites loaded", || client.favorites().is_loaded()).await;

    assert!(client.logout());
    assert!(client.session().is_none());
    assert!(!client.connection().is_connected());
    assert!(!*client.connected().borrow());
    assert!(client.queue().is_empty());
    assert!(!client.favorites().is_loaded());
    wait_until("server saw normal close", || server.close_codes() == [1000]).await;

    assert!(!client.logout());
}

#[tokio::test]
async fn toggle_mutes_and_unmutes() {
    let server = FakeNotifyServer::start().await;
    let client = client_for(&server);

    client.login(ana()).await.unwrap();
    let mut connected = client.connected();
    connected.wait_for(|flag| *flag).await.unwrap();

    assert!(!client.toggle_notifications());
    connected.wait_for(|flag| !*flag).await.unwrap();
    wait_until("server saw normal close", || server.close_codes() == [1000]).await;
    assert!(client.queue().is_empty());

    assert!(client.toggle_notifications());
    connected.wait_for(|flag| *flag).await.unwrap();
    assert_eq!(server.connections(), 2);
    assert!(client.session().is_some());
}

#[tokio::test]
async fn toggle_without_session_does_nothing() {
    let server = FakeNotifyServer::start().await;
    let client = client_for(&server);

    assert!(!client.toggle_notifications());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connections(), 0);
}

#[tokio::test]
async fn credential_loss_tears_down_notifications() {
    let server = FakeNotifyServer::start().await;
    let config = ClientConfig { credential_refresh: Duration::from_millis(100), ..test_config(&server) };
    let client = NotificationClient::new(
        config,
        Arc::new(SequenceProvider::failing_after(1)),
        Arc::new(FakeFavoritesApi::new()),
    );

    client.login(ana()).await.unwrap();
    client.connected().wait_for(|flag| *flag).await.unwrap();

    wait_until("session dropped", || client.session().is_none()).await;
    wait_until("transport closed", || server.close_codes() == [1000]).await;
    assert!(!client.connection().is_connected());
    assert!(!client.favorites().is_loaded());
    assert!(client.queue().is_empty());
}

#[tokio::test]
async fn second_login_replaces_the_first_connection() {
    let server = FakeNotifyServer::start().await;
    let client = client_for(&server);

    client.login(ana()).await.unwrap();
    client.connected().wait_for(|flag| *flag).await.unwrap();

    let session = client.login(bo()).await.unwrap();
    assert_eq!(session.identity, bo());
    client.connected().wait_for(|flag| *flag).await.unwrap();

    wait_until("only the new connection stays open", || {
        server.connections() == 2 && server.open_connections() == 1
    })
    .await;
    assert_eq!(server.close_codes(), [1000]);
    let users: Vec<String> = server.handshakes().into_iter().map(|(user, _)| user).collect();
    assert_eq!(users, ["user-ana", "user-bo"]);
}

#[tokio::test]
async fn reconnect_after_refresh_uses_the_current_credential() {
    let server = FakeNotifyServer::start().await;
    let config = ClientConfig {
        credential_refresh: Duration::from_millis(200),
        reconnect: ReconnectPolicy { enabled: true, max_attempts: 3, delay: Duration::from_millis(20) },
        ..test_config(&server)
    };
    let client =
        NotificationClient::new(config, Arc::new(SequenceProvider::new()), Arc::new(FakeFavoritesApi::new()));

    client.login(ana()).await.unwrap();
    client.connected().wait_for(|flag| *flag).await.unwrap();
    wait_until("server accepted", || server.open_connections() == 1).await;
    wait_until("credential rotated", || {
        client.session().is_some_and(|session| session.credential.as_str() != "token-1")
    })
    .await;

    assert!(server.drop_connection(0));
    wait_until("reconnected", || server.handshakes().len() == 2).await;

    let presented = server.handshakes()[1].1.get("credential").cloned().unwrap();
    assert_ne!(presented, "token-1");
    assert!(presented.starts_with("token-"));
}
