//! Client/server replication over loopback TCP.
//!
//! Each test stands up a real server on an ephemeral port, connects a
//! real client and drives state through the public model API only; the
//! wire, retain store, subscriptions and ack plumbing all run for real.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tremolo_common::model::{AudioService, PlayState, Song};
use tremolo_player::status::StatusToken;
use tremolo_player::sync::topics::Command;
use tremolo_player::sync::{SyncClient, SyncServer};
use uuid::Uuid;

async fn start_server(service: Arc<RwLock<AudioService>>) -> SyncServer {
    let server = SyncServer::bind(service, 0).await.unwrap();
    server.sync(&StatusToken::new()).await.unwrap();
    server
}

async fn connect_client(service: Arc<RwLock<AudioService>>, server: &SyncServer) -> SyncClient {
    let addr = format!("127.0.0.1:{}", server.local_addr().port());
    let client = SyncClient::connect(service, &addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.sync(&StatusToken::new()))
        .await
        .expect("sync timed out")
        .unwrap();
    client
}

async fn eventually<F, Fut>(mut check: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn song(index: i32, title: &str, path: &str) -> Song {
    Song::new(index, Some(title), None, path)
}

#[tokio::test]
async fn test_client_mirrors_server_snapshot_after_sync() {
    let server_service = Arc::new(RwLock::new(AudioService::new()));
    {
        let mut service = server_service.write().await;
        service.set_play_state(PlayState::Playing);
        service.set_volume(0.7);
        service.update_playlist(Uuid::nil(), |playlist, bus| {
            playlist.set_songs(vec![song(0, "Hymn", "/m/hymn.flac")], bus);
        });
    }
    let server = start_server(server_service.clone()).await;

    let client_service = Arc::new(RwLock::new(AudioService::new()));
    let client = connect_client(client_service.clone(), &server).await;

    // sync() returning means every retained topic delivered and applied.
    {
        let service = client_service.read().await;
        assert_eq!(service.play_state(), PlayState::Playing);
        assert_eq!(service.volume(), 0.7);
        let songs = service.source_playlist().songs();
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].title.as_deref(), Some("Hymn"));
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_server_change_propagates_while_open() {
    let server_service = Arc::new(RwLock::new(AudioService::new()));
    let server = start_server(server_service.clone()).await;
    let client_service = Arc::new(RwLock::new(AudioService::new()));
    let client = connect_client(client_service.clone(), &server).await;

    server_service.write().await.set_volume(0.25);

    eventually(
        || {
            let service = client_service.clone();
            async move { (service.read().await.volume() - 0.25).abs() < f32::EPSILON }
        },
        "client to observe the new volume",
    )
    .await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_client_change_propagates_and_stays_stable() {
    let server_service = Arc::new(RwLock::new(AudioService::new()));
    let server = start_server(server_service.clone()).await;
    let client_service = Arc::new(RwLock::new(AudioService::new()));
    let client = connect_client(client_service.clone(), &server).await;

    client_service.write().await.set_play_state(PlayState::Paused);

    eventually(
        || {
            let service = server_service.clone();
            async move { service.read().await.play_state() == PlayState::Paused }
        },
        "server to observe the paused state",
    )
    .await;

    // No echo storm: both sides settle on the same value and stay there.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server_service.read().await.play_state(), PlayState::Paused);
    assert_eq!(client_service.read().await.play_state(), PlayState::Paused);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_new_playlist_is_subscribed_dynamically() {
    let server_service = Arc::new(RwLock::new(AudioService::new()));
    let server = start_server(server_service.clone()).await;
    let client_service = Arc::new(RwLock::new(AudioService::new()));
    let client = connect_client(client_service.clone(), &server).await;

    let id = Uuid::new_v4();
    {
        let mut service = server_service.write().await;
        service.update_or_create_playlist(id, |playlist, bus| {
            playlist.set_songs(vec![song(0, "One", "/1"), song(1, "Two", "/2")], bus);
        });
        service.set_playlists(vec![id]);
    }

    // The client learns about the playlist from the Playlists topic,
    // subscribes its topics on the fly and receives the retained songs.
    eventually(
        || {
            let service = client_service.clone();
            async move {
                service
                    .read()
                    .await
                    .playlist(id)
                    .is_some_and(|playlist| playlist.songs().len() == 2)
            }
        },
        "client to pick up the new playlist's songs",
    )
    .await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_sync_completes_against_playlist_added_after_snapshot() {
    let server_service = Arc::new(RwLock::new(AudioService::new()));
    let server = start_server(server_service.clone()).await;

    // Added after the snapshot was published; only the Playlists topic
    // changes, the playlist's own topics were never explicitly set. The
    // server must still retain all of them, or the client's countdown
    // would wait on topics that never arrive.
    let id = Uuid::new_v4();
    server_service.write().await.set_playlists(vec![id]);

    let client_service = Arc::new(RwLock::new(AudioService::new()));
    let client = connect_client(client_service.clone(), &server).await;

    {
        let service = client_service.read().await;
        assert!(service.playlist(id).is_some());
        assert_eq!(service.playlist_ids(), &[id]);
    }

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_playlist_added_locally_still_receives_remote_changes() {
    let server_service = Arc::new(RwLock::new(AudioService::new()));
    let server = start_server(server_service.clone()).await;
    let client_service = Arc::new(RwLock::new(AudioService::new()));
    let client = connect_client(client_service.clone(), &server).await;

    // The add originates on the client: the server suppresses the echo of
    // the list change, so only a local resubscribe can cover the new
    // playlist's topics.
    let id = Uuid::new_v4();
    client_service.write().await.set_playlists(vec![id]);

    eventually(
        || {
            let service = server_service.clone();
            async move { service.read().await.playlist(id).is_some() }
        },
        "server to learn about the client's playlist",
    )
    .await;

    server_service.write().await.update_playlist(id, |playlist, bus| {
        playlist.set_songs(vec![song(0, "Alpha", "/alpha"), song(1, "Beta", "/beta")], bus);
    });

    eventually(
        || {
            let service = client_service.clone();
            async move {
                service
                    .read()
                    .await
                    .playlist(id)
                    .is_some_and(|playlist| playlist.songs().len() == 2)
            }
        },
        "client to receive changes to the playlist it added",
    )
    .await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_command_from_client_flips_server_state_and_replicates_back() {
    let server_service = Arc::new(RwLock::new(AudioService::new()));
    let server = start_server(server_service.clone()).await;
    let client_service = Arc::new(RwLock::new(AudioService::new()));
    let client = connect_client(client_service.clone(), &server).await;

    assert_eq!(client_service.read().await.play_state(), PlayState::Stopped);
    client.send_command(Command::Toggle);

    eventually(
        || {
            let service = server_service.clone();
            async move { service.read().await.play_state() == PlayState::Playing }
        },
        "server to execute the toggle command",
    )
    .await;
    eventually(
        || {
            let service = client_service.clone();
            async move { service.read().await.play_state() == PlayState::Playing }
        },
        "resulting state to replicate back to the client",
    )
    .await;

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_second_client_receives_first_clients_changes() {
    let server_service = Arc::new(RwLock::new(AudioService::new()));
    let server = start_server(server_service.clone()).await;

    let first_service = Arc::new(RwLock::new(AudioService::new()));
    let first = connect_client(first_service.clone(), &server).await;
    let second_service = Arc::new(RwLock::new(AudioService::new()));
    let second = connect_client(second_service.clone(), &server).await;

    first_service.write().await.set_volume(0.9);

    eventually(
        || {
            let service = second_service.clone();
            async move { (service.read().await.volume() - 0.9).abs() < f32::EPSILON }
        },
        "second client to observe the first client's change",
    )
    .await;

    first.close().await;
    second.close().await;
    server.close().await;
}
