use crate::helpers::*;
use remotefx::prelude::*;
use remotefx::protocol::{descriptions_from_lines, ProtocolError};

#[tokio::test]
async fn test_plugin_list_on_connect() {
    let server = TestServer::with_config(ServerConfig {
        exclude_plugins: vec!["builtin:invert".into()],
        ..Default::default()
    })
    .await;
    let client = TestClient::connect(server.addr, stereo_format()).await;

    let ids: Vec<_> = client.plugins.iter().map(|p| p.identifier.as_str()).collect();
    assert_eq!(ids, ["builtin:gain", "builtin:delay", "builtin:transpose"]);

    drop(client);
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_plugin_rejected() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;

    assert_eq!(client.add_plugin("vst3:does-not-exist").await, -1);

    // Chain stayed empty: the first add reports zero latency at index 0.
    assert_eq!(client.add_plugin("builtin:gain").await, 0);
    client.send(Message::DelPlugin { index: 1 }).await;
    assert!(matches!(client.recv().await, Message::Result { rc: -1, .. }));

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_parameters_and_settings_round_trip() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    client.add_plugin("builtin:gain").await;

    client
        .send(Message::ParameterValue {
            index: 0,
            param_index: 0,
            value: 0.75,
        })
        .await;
    client.send(Message::GetPluginSettings { index: 0 }).await;
    let Message::PluginSettings(saved) = client.recv().await else {
        panic!("expected PluginSettings");
    };
    assert!(!saved.is_empty());

    // Restore the saved settings into a second instance.
    client
        .send(Message::AddPlugin {
            identifier: "builtin:gain".into(),
        })
        .await;
    assert!(matches!(client.recv().await, Message::Result { rc: 0, .. }));
    let Message::Presets(presets) = client.recv().await else {
        panic!("expected Presets");
    };
    assert_eq!(presets.len(), 3);
    let Message::Parameters(params) = client.recv().await else {
        panic!("expected Parameters");
    };
    assert_eq!(params.len(), 1);
    client.send(Message::PluginSettings(saved)).await;

    client
        .send(Message::GetParameterValue {
            index: 1,
            param_index: 0,
        })
        .await;
    assert_eq!(
        client.recv().await,
        Message::ParameterValue {
            index: 1,
            param_index: 0,
            value: 0.75
        }
    );

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_recents_shared_across_sessions() {
    let server = TestServer::start().await;

    let mut first = TestClient::connect(server.addr, stereo_format()).await;
    first.add_plugin("builtin:delay:32").await;
    first.add_plugin("builtin:gain").await;
    // Round trip so the last PluginSettings has been handled.
    first.send(Message::RecentsList(String::new())).await;
    assert!(matches!(first.recv().await, Message::RecentsList(_)));
    first.send(Message::Quit).await;

    let mut second = TestClient::connect(server.addr, stereo_format()).await;
    second.send(Message::RecentsList(String::new())).await;
    let Message::RecentsList(lines) = second.recv().await else {
        panic!("expected RecentsList");
    };
    let recents = descriptions_from_lines(&lines);
    let ids: Vec<_> = recents.iter().map(|p| p.identifier.as_str()).collect();
    assert_eq!(ids, ["builtin:gain", "builtin:delay:32"]);

    second.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_quit_ignores_queued_commands() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;

    let mut bytes = Message::Quit.encode().unwrap();
    bytes.extend(
        Message::AddPlugin {
            identifier: "builtin:gain".into(),
        }
        .encode()
        .unwrap(),
    );
    tokio::io::AsyncWriteExt::write_all(&mut client.writer, &bytes)
        .await
        .unwrap();

    assert!(matches!(
        client.reader.read_message(REPLY_TIMEOUT).await,
        Err(ProtocolError::ConnectionClosed)
    ));
    server.stop().await;
}

#[tokio::test]
async fn test_server_shutdown_closes_sessions() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    client.add_plugin("builtin:gain").await;

    server.stop().await;
    assert!(matches!(
        client.reader.read_message(REPLY_TIMEOUT).await,
        Err(ProtocolError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_protocol_violation_ends_only_that_session() {
    let server = TestServer::start().await;
    let mut bad = TestClient::connect(server.addr, stereo_format()).await;
    let mut good = TestClient::connect(server.addr, stereo_format()).await;

    bad.send(Message::Parameters(Vec::new())).await;
    assert!(bad.reader.read_message(REPLY_TIMEOUT).await.is_err());

    assert_eq!(good.add_plugin("builtin:delay:5").await, 5);
    good.send(Message::Quit).await;
    server.stop().await;
}
