use crossbeam::channel::{self, Receiver};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::runtime::Runtime;
use voxspace::protocol::messages::{
    ClientHandshake, ClientStatus, Message, STATUS_CODE_INVALID_HANDSHAKE, STATUS_CODE_OK,
    STATUS_CODE_REJECTED,
};
use voxspace::protocol::ProtocolClient;
use voxspace::server::{Handle, RejectReason, ServerConfig, VoiceChannel, VoiceServer};

const WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, PartialEq)]
enum Seen {
    Connected(Handle),
    Rejected(RejectReason),
    Disconnected(Handle),
    Talking(Handle, bool),
    MicrophoneMuted(Handle, bool),
}

fn start_server(config: ServerConfig) -> (VoiceServer, Receiver<Seen>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let server = VoiceServer::new();
    let (tx, rx) = channel::unbounded();

    let sink = tx.clone();
    server.register_client_connected(move |h| {
        let _ = sink.send(Seen::Connected(h));
    });
    let sink = tx.clone();
    server.register_client_rejected(move |_, reason| {
        let _ = sink.send(Seen::Rejected(reason));
    });
    let sink = tx.clone();
    server.register_client_disconnected(move |h| {
        let _ = sink.send(Seen::Disconnected(h));
    });
    let sink = tx.clone();
    server.register_client_talking_changed(move |h, on| {
        let _ = sink.send(Seen::Talking(h, on));
    });
    server.register_client_microphone_mute_changed(move |h, on| {
        let _ = tx.send(Seen::MicrophoneMuted(h, on));
    });

    server.create(config).unwrap();
    server.start().unwrap();
    (server, rx)
}

fn local_config() -> ServerConfig {
    ServerConfig::new(0, VoiceChannel::new("abc", 130, "secret"))
        .bind_host(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .tick_interval_ms(10)
        .worker_threads(1)
}

fn url(server: &VoiceServer) -> String {
    format!("ws://{}/voice", server.local_addr().unwrap())
}

fn hello(voice_client_id: u16) -> ClientHandshake {
    ClientHandshake {
        status_code: STATUS_CODE_OK,
        game_version: "1.0".to_string(),
        voice_client_id,
    }
}

/// Read until the server closes the socket
async fn wait_closed(client: &mut ProtocolClient) -> bool {
    loop {
        match client.recv_timeout(WAIT).await {
            Ok(Some(_)) => continue,
            Ok(None) => return true,
            Err(_) => return false,
        }
    }
}

#[test]
fn test_connect_and_host_removal() {
    let (server, events) = start_server(local_config());
    let rt = Runtime::new().unwrap();

    let mut client = rt
        .block_on(ProtocolClient::connect(&url(&server), hello(0)))
        .unwrap();
    assert!(client.is_accepted());
    assert_eq!(client.handle(), Some(1));
    let channel = client.handshake().channel.clone().expect("join instructions");
    assert_eq!(channel.server_id, "abc");
    assert_eq!(channel.channel_id, 130);

    assert_eq!(events.recv_timeout(WAIT).unwrap(), Seen::Connected(1));
    server.set_client_position(1, 0.0, 0.0, 0.0, 0.0).unwrap();
    assert_eq!(server.client_count(), 1);

    server.remove_client(1).unwrap();
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Seen::Disconnected(1));
    assert_eq!(server.client_count(), 0);
    assert!(rt.block_on(wait_closed(&mut client)));

    server.flush_events();
    assert!(events.try_recv().is_err(), "Disconnected fires once");
    server.destroy();
}

#[test]
fn test_observer_rejects_connection() {
    let (server, events) = start_server(local_config());
    server.register_client_connecting(|request| request.voice_client_id != 666);

    let client =
        tokio_test::block_on(ProtocolClient::connect(&url(&server), hello(666))).unwrap();
    assert!(!client.is_accepted());
    assert_eq!(client.handshake().status_code, STATUS_CODE_REJECTED);
    assert_eq!(client.handle(), None);

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Seen::Rejected(RejectReason::Observer)
    );
    assert_eq!(server.client_count(), 0);
    server.destroy();
}

#[test]
fn test_failed_client_handshake_is_refused() {
    let (server, events) = start_server(local_config());
    let rt = Runtime::new().unwrap();

    let mut bad = hello(3);
    bad.status_code = 7;
    let client = rt
        .block_on(ProtocolClient::connect(&url(&server), bad))
        .unwrap();
    assert_eq!(client.handshake().status_code, STATUS_CODE_INVALID_HANDSHAKE);

    server.flush_events();
    assert!(events.try_recv().is_err(), "no observer is consulted");
    server.destroy();
}

#[test]
fn test_status_reports_fire_events() {
    let (server, events) = start_server(local_config());
    let rt = Runtime::new().unwrap();

    let mut client = rt
        .block_on(ProtocolClient::connect(&url(&server), hello(5)))
        .unwrap();
    let handle = client.handle().unwrap();
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Seen::Connected(handle));

    rt.block_on(client.send_status(ClientStatus {
        talking: true,
        microphone_muted: false,
        speakers_muted: false,
        voice_client_id: None,
    }))
    .unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Seen::Talking(handle, true)
    );

    rt.block_on(client.send_status(ClientStatus {
        talking: true,
        microphone_muted: true,
        speakers_muted: false,
        voice_client_id: None,
    }))
    .unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Seen::MicrophoneMuted(handle, true)
    );

    rt.block_on(client.disconnect("bye")).unwrap();
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        Seen::Disconnected(handle)
    );
    server.destroy();
}

#[test]
fn test_listeners_receive_audible_speakers() {
    let (server, _events) = start_server(local_config());
    let rt = Runtime::new().unwrap();

    let mut listener = rt
        .block_on(ProtocolClient::connect(&url(&server), hello(10)))
        .unwrap();
    let speaker = rt
        .block_on(ProtocolClient::connect(&url(&server), hello(11)))
        .unwrap();
    let speaker_handle = speaker.handle().unwrap();
    server
        .set_client_position(speaker_handle, 10.0, 0.0, 0.0, 0.0)
        .unwrap();

    let update = rt.block_on(async {
        loop {
            match listener.recv_timeout(WAIT).await.unwrap() {
                Some(Message::ServerUpdate(update))
                    if update.volumes.iter().any(|v| v.handle == speaker_handle) =>
                {
                    break update;
                }
                Some(_) => continue,
                None => panic!("server closed the listener"),
            }
        }
    });
    let entry = update
        .volumes
        .iter()
        .find(|v| v.handle == speaker_handle)
        .unwrap();
    assert_eq!(entry.voice_client_id, 11);
    assert!(entry.volume > 0.0 && entry.volume <= 1.0);

    // Muting for everyone makes the listener drop the speaker.
    server.mute_client_for_all(speaker_handle, true).unwrap();
    let dropped = rt.block_on(async {
        loop {
            match listener.recv_timeout(WAIT).await.unwrap() {
                Some(Message::ServerUpdate(update)) => {
                    if let Some(v) = update.volumes.iter().find(|v| v.handle == speaker_handle) {
                        if v.muted {
                            break true;
                        }
                    }
                }
                Some(_) => continue,
                None => break false,
            }
        }
    });
    assert!(dropped);
    server.destroy();
}

#[test]
fn test_stop_is_silent_and_closes_clients() {
    let (server, events) = start_server(local_config());
    let rt = Runtime::new().unwrap();

    let mut client = rt
        .block_on(ProtocolClient::connect(&url(&server), hello(1)))
        .unwrap();
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Seen::Connected(1));

    server.stop().unwrap();
    assert!(!server.is_running());
    assert_eq!(server.client_count(), 0);

    server.flush_events();
    assert!(events.try_recv().is_err(), "bulk removal fires no events");

    // Either the close frame or a dropped socket ends the session.
    let _ = rt.block_on(wait_closed(&mut client));
    server.destroy();
}

#[test]
fn test_stop_can_notify_when_configured() {
    let (server, events) = start_server(local_config().silent_bulk_removal(false));
    let rt = Runtime::new().unwrap();

    let _client = rt
        .block_on(ProtocolClient::connect(&url(&server), hello(1)))
        .unwrap();
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Seen::Connected(1));

    server.stop().unwrap();
    assert_eq!(events.recv_timeout(WAIT).unwrap(), Seen::Disconnected(1));
    server.destroy();
}
