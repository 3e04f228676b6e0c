// ABOUTME: Integration tests for entities, filters, subscriptions and playback
// ABOUTME: Uses several connections against one shared loopback server

use pulsebridge::error::Error;
use pulsebridge::{
    play, ClientConfig, Connection, EventType, Filter, LoopbackServer, Module, SampleFormat, SampleSpec, Stream,
    StreamFlags, VolumeControl,
};
use std::io::{Cursor, Write};
use std::time::Duration;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

fn connect(server: &LoopbackServer, name: &str) -> Connection {
    let _ = env_logger::builder().is_test(true).try_init();
    Connection::connect(server, ClientConfig::new(name)).unwrap()
}

#[test]
fn test_clients_filter_by_name_and_property() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "filter-test");

    let all = conn.clients(&Filter::default()).unwrap();
    assert_eq!(all.len(), 2);

    let mine = conn.clients(&Filter::new(["name/filter-test"])).unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].driver_name, "protocol-native.c");

    let players = conn
        .clients(&Filter::new(["properties.application.name/contains:music"]))
        .unwrap();
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].name, "music-player");

    let nobody = conn.clients(&Filter::new(["index/gt:100"])).unwrap();
    assert!(nobody.is_empty());
    conn.disconnect();
}

#[test]
fn test_set_name_is_visible_to_other_clients() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "before");
    let observer = connect(&server, "observer");

    conn.set_name("after").unwrap();
    let renamed = observer.clients(&Filter::new(["name/after"])).unwrap();
    assert_eq!(renamed.len(), 1);

    conn.disconnect();
    observer.disconnect();
}

#[test]
fn test_sources_and_monitors() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "sources");

    let monitors = conn.sources(&Filter::new(["properties.device.class/monitor"])).unwrap();
    assert_eq!(monitors.len(), 2);
    assert!(monitors.iter().all(|s| s.is_monitor()));

    let mic = conn.sources(&Filter::new(["muted/true"])).unwrap();
    assert_eq!(mic.len(), 1);
    assert!(!mic[0].is_monitor());
    conn.disconnect();
}

#[test]
fn test_sink_volume_and_mute() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "mixer");

    let mut sink = conn.sinks(&Filter::default()).unwrap().remove(0);
    sink.set_volume(0.5).unwrap();
    assert!((sink.info.volume_factor - 0.5).abs() < 1e-3);

    sink.increase_volume(0.25).unwrap();
    assert!((sink.info.volume_factor - 0.75).abs() < 1e-3);

    sink.decrease_volume(5.0).unwrap();
    assert_eq!(sink.info.volume_factor, 0.0);

    sink.toggle_mute().unwrap();
    assert!(sink.info.muted);
    sink.unmute().unwrap();
    assert!(!sink.info.muted);
    conn.disconnect();
}

#[test]
fn test_subscription_receives_server_events() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "watcher");
    let events = conn.subscribe(&[EventType::Server]).unwrap();

    conn.set_default_sink("null").unwrap();
    assert_eq!(events.recv_timeout(EVENT_TIMEOUT).unwrap(), EventType::Server);
    assert_eq!(server.default_sink(), "null");
    conn.disconnect();
}

#[test]
fn test_subscription_filters_event_kinds() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "sink-watcher");
    let events = conn.subscribe(&[EventType::Sink]).unwrap();

    conn.set_default_source("null.monitor").unwrap();
    conn.sinks(&Filter::default()).unwrap().remove(0).mute().unwrap();

    assert_eq!(events.recv_timeout(EVENT_TIMEOUT).unwrap(), EventType::Sink);
    assert!(events.try_recv().is_err());
    conn.disconnect();
}

#[test]
fn test_unknown_default_sink_fails() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "typo");
    assert!(matches!(conn.set_default_sink("nowhere"), Err(Error::Operation(_))));
    assert_ne!(server.default_sink(), "nowhere");
    conn.disconnect();
}

#[test]
fn test_module_loaded_by_one_client_is_seen_by_another() {
    let server = LoopbackServer::new();
    let loader = connect(&server, "loader");
    let viewer = connect(&server, "viewer");

    let mut module = Module::new(&loader, "module-loopback", "latency_msec=20");
    module.load().unwrap();

    let seen = viewer.modules(&Filter::new(["name/module-loopback"])).unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].index, module.index);

    module.unload().unwrap();
    assert!(viewer.modules(&Filter::new(["name/module-loopback"])).unwrap().is_empty());

    loader.disconnect();
    viewer.disconnect();
}

#[test]
fn test_play_reader_to_completion() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "player");

    let tone: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    play(&conn, "tone", None, Cursor::new(tone)).unwrap();

    assert_eq!(server.played_bytes("tone"), 20_000);
    let inputs = conn.sink_inputs(&Filter::new(["name/tone"])).unwrap();
    assert!(inputs.is_empty());
    conn.disconnect();
}

#[test]
fn test_stream_shows_up_as_sink_input() {
    let server = LoopbackServer::new();
    let conn = connect(&server, "streamer");

    let spec = SampleSpec::new(SampleFormat::Float32le, 48000, 2);
    let mut stream = Stream::playback(&conn, "voice", Some(spec), StreamFlags::START_CORKED).unwrap();
    assert!(stream.is_corked());
    stream.write_all(&[0u8; 8 * 480]).unwrap();

    let inputs = conn.sink_inputs(&Filter::new(["name/voice"])).unwrap();
    assert_eq!(inputs.len(), 1);

    stream.uncork().unwrap();
    stream.drain().unwrap();
    assert_eq!(server.played_bytes("voice"), 8 * 480);

    stream.destroy();
    assert!(conn.sink_inputs(&Filter::new(["name/voice"])).unwrap().is_empty());
    conn.disconnect();
}

#[test]
fn test_failed_stream_setup() {
    let server = LoopbackServer::new().fail_streams("No such sink");
    let conn = connect(&server, "unlucky");

    match Stream::playback(&conn, "doomed", None, StreamFlags::NONE) {
        Err(Error::Stream(msg)) => assert!(msg.contains("No such sink")),
        other => panic!("expected stream error, got {:?}", other.map(|s| s.name().to_string())),
    }
    conn.disconnect();
}
