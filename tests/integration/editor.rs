use crate::helpers::*;
use remotefx::prelude::*;
use remotefx::server::InputEvent;
use std::time::Duration;

#[tokio::test]
async fn test_editor_frames_follow_parameter_changes() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    client.add_plugin("builtin:gain").await;

    client.send(Message::EditPlugin { index: 0 }).await;
    let first = client.next_frame().await;
    assert!(first.is_full());
    assert_eq!((first.width, first.height), (240, 24));

    client
        .send(Message::ParameterValue {
            index: 0,
            param_index: 0,
            value: 1.0,
        })
        .await;
    let update = client.next_frame().await;
    assert!(!update.is_hidden());
    assert!(!update.is_full());
    assert!(update.rect_width > 0 && update.rect_width < 240);

    client.send(Message::HidePlugin).await;
    assert!(client.next_frame().await.is_hidden());

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_input_relayed_to_window_system() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    client.add_plugin("builtin:gain").await;

    // Without an editor, input is dropped.
    client
        .send(Message::Mouse(MouseEvent::new(MouseEventKind::Move, 1.0, 1.0)))
        .await;
    client.send(Message::EditPlugin { index: 0 }).await;
    client
        .send(Message::Mouse(MouseEvent::new(
            MouseEventKind::LeftDown,
            10.0,
            12.0,
        )))
        .await;
    client.send(Message::Key([65u16, 66].into_iter().collect())).await;
    client.send(Message::GetPluginSettings { index: 0 }).await;
    client.recv().await;

    let events = server.windows.take_events();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[0],
        InputEvent::Mouse {
            kind: MouseEventKind::LeftDown,
            ..
        }
    ));
    assert_eq!(events[1], InputEvent::Key(vec![65, 66]));

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_deleting_edited_plugin_hides_editor() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    client.add_plugin("builtin:gain").await;

    client.send(Message::EditPlugin { index: 0 }).await;
    assert!(!client.next_frame().await.is_hidden());

    client.send(Message::DelPlugin { index: 0 }).await;
    assert!(matches!(client.recv().await, Message::Result { rc: 0, .. }));
    loop {
        if client.next_frame().await.is_hidden() {
            break;
        }
    }

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_editor_taken_over_by_another_session() {
    let server = TestServer::start().await;
    let mut first = TestClient::connect(server.addr, stereo_format()).await;
    let mut second = TestClient::connect(server.addr, stereo_format()).await;
    first.add_plugin("builtin:gain").await;
    second.add_plugin("builtin:gain").await;

    second.send(Message::EditPlugin { index: 0 }).await;
    assert!(second.next_frame().await.is_full());

    first.send(Message::EditPlugin { index: 0 }).await;
    assert!(first.next_frame().await.is_full());
    assert!(second.next_frame().await.is_hidden());

    first
        .send(Message::ParameterValue {
            index: 0,
            param_index: 0,
            value: 1.0,
        })
        .await;
    let update = first.next_frame().await;
    assert!(!update.is_hidden() && !update.is_full());

    // The displaced session never sees the other client's pixels.
    let leaked = second
        .screen
        .poll_message(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(leaked.is_none(), "unexpected frame after takeover: {:?}", leaked);

    first.send(Message::Quit).await;
    second.send(Message::Quit).await;
    server.stop().await;
}
