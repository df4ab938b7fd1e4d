use crate::helpers::*;
use approx::assert_relative_eq;
use remotefx::prelude::*;

#[tokio::test]
async fn test_empty_chain_passes_silence() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;

    let (header, out) = client.process(&[vec![0.0f32; 256], vec![0.0f32; 256]]).await;
    assert_eq!(header.latency_samples, 0);
    assert_eq!(header.samples, 256);
    assert!(out.iter().flatten().all(|&s| s == 0.0));

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_latency_sums_and_survives_exchange() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;

    assert_eq!(client.add_plugin("builtin:delay:10").await, 10);
    assert_eq!(client.add_plugin("builtin:delay:20").await, 30);

    client
        .send(Message::ExchangePlugins { idx_a: 0, idx_b: 1 })
        .await;
    // Removing the 10-sample delay, now at index 1, confirms the new order.
    client.send(Message::DelPlugin { index: 1 }).await;
    assert!(matches!(client.recv().await, Message::Result { rc: 20, .. }));
    assert_eq!(client.add_plugin("builtin:delay:10").await, 30);

    let (header, _) = client.process(&[vec![0.0f32; 64], vec![0.0f32; 64]]).await;
    assert_eq!(header.latency_samples, 30);
    assert_eq!(impulse_position(&mut client, 64, 4).await, Some(30));

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_bypassed_latency_is_compensated() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    client.add_plugin("builtin:delay:10").await;
    client.add_plugin("builtin:delay:20").await;
    client.send(Message::BypassPlugin { index: 1 }).await;

    assert_eq!(impulse_position(&mut client, 64, 4).await, Some(30));

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_gain_parameter_and_preset() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    client.add_plugin("builtin:gain").await;

    let (_, out) = client.process(&[vec![0.25f32; 32], vec![-0.5f32; 32]]).await;
    assert_relative_eq!(out[0][0], 0.25);
    assert_relative_eq!(out[1][31], -0.5);

    client
        .send(Message::ParameterValue {
            index: 0,
            param_index: 0,
            value: 1.0,
        })
        .await;
    // Any reply orders the parameter change before the next block.
    client.send(Message::GetPluginSettings { index: 0 }).await;
    client.recv().await;
    let (_, out) = client.process(&[vec![0.25f32; 32], vec![-0.5f32; 32]]).await;
    assert_relative_eq!(out[0][0], 0.5);
    assert_relative_eq!(out[1][0], -1.0);

    client.send(Message::Preset { index: 0, preset: 1 }).await;
    client.send(Message::GetPluginSettings { index: 0 }).await;
    client.recv().await;
    let (_, out) = client.process(&[vec![0.25f32; 32], vec![-0.5f32; 32]]).await;
    assert!(out.iter().flatten().all(|&s| s == 0.0));

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_double_precision_session() {
    let server = TestServer::start().await;
    let format = AudioFormat::new(1, 96_000.0, 128).double_precision();
    let mut client = TestClient::connect(server.addr, format).await;
    client.add_plugin("builtin:invert").await;

    let input = vec![0.123_456_789_012f64; 128];
    let (header, out) = client.process(&[input]).await;
    assert_eq!(header.sample_format, SampleFormat::F64);
    assert_eq!(out[0][0], -0.123_456_789_012f64);

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_precision_switches_per_chunk() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    client.add_plugin("builtin:gain").await;

    let (header, out) = client.process(&[vec![0.5f64; 64], vec![0.5f64; 64]]).await;
    assert_eq!(header.sample_format, SampleFormat::F64);
    assert_relative_eq!(out[0][63], 0.5);

    let (header, out) = client.process(&[vec![0.5f32; 64], vec![0.5f32; 64]]).await;
    assert_eq!(header.sample_format, SampleFormat::F32);
    assert_relative_eq!(out[1][0], 0.5);

    client.send(Message::Quit).await;
    server.stop().await;
}

#[tokio::test]
async fn test_channel_mismatch_ends_session() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;

    let header = AudioChunkHeader::new(1, 16, SampleFormat::F32);
    tokio::io::AsyncWriteExt::write_all(&mut client.audio, &header.to_bytes())
        .await
        .unwrap();

    // The audio failure takes the whole session down.
    assert!(client.reader.read_message(REPLY_TIMEOUT).await.is_err());
    server.stop().await;
}

#[tokio::test]
async fn test_midi_round_trip_through_transpose() {
    let server = TestServer::start().await;
    let mut client = TestClient::connect(server.addr, stereo_format()).await;
    assert_eq!(client.add_plugin("builtin:transpose").await, 0);
    client.send(Message::Preset { index: 0, preset: 2 }).await;
    client.send(Message::GetPluginSettings { index: 0 }).await;
    client.recv().await;

    let position = TransportPosition {
        bpm: 140.0,
        time_in_samples: 48_000,
        is_playing: true,
        ..Default::default()
    };
    let midi = [
        MidiEvent::new(0, &[0x90, 48, 100]),
        MidiEvent::new(100, &[0x80, 48, 0]),
    ];
    let block = vec![0.25f32; 128];
    let (header, out, events) = client
        .process_events(&[block.clone(), block], &midi, &position)
        .await;

    assert_eq!(header.latency_samples, 0);
    assert_relative_eq!(out[1][127], 0.25);
    assert_eq!(
        events,
        vec![
            MidiEvent::new(0, &[0x90, 60, 100]),
            MidiEvent::new(100, &[0x80, 60, 0]),
        ]
    );

    client.send(Message::Quit).await;
    server.stop().await;
}
