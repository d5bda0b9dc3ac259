//! Integration tests for the tinywhip server
//!
//! Each test starts the real router on a random local port and talks to it
//! over HTTP, using webrtc-rs peer connections as the remote side.
//!
//! Run with: cargo test -p tinywhip-server --test integration_tests

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tinywhip_media::{build_codecs, SupportedCodec};
use tinywhip_server::sfu::{PublishedTrack, StreamEntry};
use tinywhip_server::state::{AppState, Config};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

/// Test helper to start a test server
async fn start_test_server() -> TestServer {
    TestServer::start().await.expect("Failed to start test server")
}

/// Test server wrapper
struct TestServer {
    addr: std::net::SocketAddr,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> anyhow::Result<Self> {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            gathering_timeout: Duration::from_secs(5),
            ..Config::default()
        };

        let (router, state) = tinywhip_server::create_app(config);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A browser-like peer connection with the engine's default codecs
async fn client_peer_connection() -> Arc<RTCPeerConnection> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().unwrap();
    let registry = register_default_interceptors(Registry::new(), &mut media_engine).unwrap();
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();
    Arc::new(
        api.new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap(),
    )
}

async fn client_offer(pc: &RTCPeerConnection) -> String {
    let mut gather_complete = pc.gathering_complete_promise().await;
    let offer = pc.create_offer(None).await.unwrap();
    pc.set_local_description(offer).await.unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), gather_complete.recv()).await;
    pc.local_description().await.unwrap().sdp
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_VP8.to_owned(),
        clock_rate: 90000,
        ..Default::default()
    }
}

/// A published VP8 track, as the publisher's ingest task would register it
fn vp8_published_track(stream_id: &str) -> PublishedTrack {
    let vp8 = build_codecs(&[SupportedCodec::Vp8]).remove(0);
    let local_track = Arc::new(TrackLocalStaticRTP::new(
        vp8.parameters.capability.clone(),
        "video".to_owned(),
        stream_id.to_owned(),
    ));
    PublishedTrack::new(vp8, local_track)
}

async fn recvonly_video_offer(pc: &RTCPeerConnection) -> String {
    pc.add_transceiver_from_kind(
        RTPCodecType::Video,
        Some(RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        }),
    )
    .await
    .unwrap();
    client_offer(pc).await
}

/// Poll `check` until it holds or `timeout` passes
async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Write a VP8 keyframe-looking packet every 20ms until aborted
async fn send_vp8(track: Arc<TrackLocalStaticRTP>) {
    let mut seq: u16 = 0;
    loop {
        let mut packet = Packet::default();
        packet.header.version = 2;
        packet.header.marker = true;
        packet.header.sequence_number = seq;
        packet.header.timestamp = seq as u32 * 3000;
        packet.payload = Bytes::from_static(&[0x10, 0x00, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x01]);

        // Fails until the track is bound to a negotiated sender
        let _ = track.write_rtp(&packet).await;

        seq = seq.wrapping_add(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Publish a stream with the server making the offer; returns the session URL
async fn publish_with_server_offer(
    client: &Client,
    server: &TestServer,
    stream_id: &str,
) -> (String, String) {
    let response = client
        .post(server.url(&format!("/whip/{}", stream_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let location = response.headers()["location"].to_str().unwrap().to_string();
    let offer = response.text().await.unwrap();
    (server.url(&location), offer)
}

#[tokio::test]
async fn test_whep_unknown_stream_is_not_found() {
    let server = start_test_server().await;
    let client = Client::new();

    let response = client
        .post(server.url("/whep/stream1"))
        .header("Content-Type", "application/sdp")
        .body("v=0\r\n")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.text().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_whip_offer_gets_answer_and_location() {
    let server = start_test_server().await;
    let client = Client::new();

    let publisher = client_peer_connection().await;
    let track = Arc::new(TrackLocalStaticRTP::new(
        vp8_capability(),
        "video".to_owned(),
        "stream1".to_owned(),
    ));
    publisher
        .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .unwrap();
    let offer = client_offer(&publisher).await;

    let response = client
        .post(server.url("/whip/stream1"))
        .header("Content-Type", "application/sdp")
        .body(offer)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()["content-type"], "application/sdp");
    let location = response.headers()["location"].to_str().unwrap().to_string();
    assert!(location.starts_with('/'));

    let answer = response.text().await.unwrap();
    assert!(answer.contains("m=video"));
    assert!(answer.contains("VP8/90000"));

    publisher
        .set_remote_description(RTCSessionDescription::answer(answer).unwrap())
        .await
        .unwrap();

    assert!(server.state.sfu.streams().get("stream1").await.is_ok());
    assert_eq!(server.state.sfu.sessions().len().await, 1);

    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_whep_answer_only_contains_published_codecs() {
    let server = start_test_server().await;
    let client = Client::new();

    let streams = server.state.sfu.streams();
    streams
        .publish(Arc::new(StreamEntry::new(
            "stream1".to_owned(),
            uuid::Uuid::new_v4(),
        )))
        .await;
    streams
        .append_track("stream1", vp8_published_track("stream1"))
        .await
        .unwrap();

    let subscriber = client_peer_connection().await;
    let offer = recvonly_video_offer(&subscriber).await;
    assert!(offer.contains("H264") || offer.contains("VP9"));

    let response = client
        .post(server.url("/whep/stream1"))
        .header("Content-Type", "application/sdp")
        .body(offer)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let answer = response.text().await.unwrap();
    assert!(answer.contains("VP8/90000"));
    assert!(!answer.contains("H264"));
    assert!(!answer.contains("VP9"));
    assert!(!answer.contains("opus"));

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_whep_on_stream_without_live_tracks_is_not_found() {
    let server = start_test_server().await;
    let client = Client::new();

    let (_session_url, _offer) = publish_with_server_offer(&client, &server, "quiet").await;

    let response = client
        .post(server.url("/whep/quiet"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rejected_whip_keeps_live_stream() {
    let server = start_test_server().await;
    let client = Client::new();

    let (session_url, _offer) = publish_with_server_offer(&client, &server, "live").await;
    let live = server.state.sfu.streams().get("live").await.unwrap();

    let response = client
        .post(server.url("/whip/live"))
        .header("Content-Type", "application/sdp")
        .body("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The live publisher still owns the stream
    let current = server.state.sfu.streams().get("live").await.unwrap();
    assert!(Arc::ptr_eq(&current, &live));
    assert_eq!(server.state.sfu.sessions().len().await, 1);
    assert_eq!(server.url(&format!("/{}", current.publisher())), session_url);
}

#[tokio::test]
async fn test_closing_publisher_closes_its_subscribers() {
    let server = start_test_server().await;
    let client = Client::new();

    let (publisher_url, _offer) = publish_with_server_offer(&client, &server, "stream1").await;
    let entry = server.state.sfu.streams().get("stream1").await.unwrap();
    entry.push(vp8_published_track("stream1")).await;

    let subscriber = client_peer_connection().await;
    let offer = recvonly_video_offer(&subscriber).await;
    let response = client
        .post(server.url("/whep/stream1"))
        .header("Content-Type", "application/sdp")
        .body(offer)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let subscriber_url = server.url(response.headers()["location"].to_str().unwrap());
    assert_eq!(server.state.sfu.sessions().len().await, 2);

    let response = client.delete(&publisher_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(server.state.sfu.sessions().is_empty().await);
    let response = client.delete(&subscriber_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    subscriber.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_media_is_relayed_until_publisher_leaves() {
    let server = start_test_server().await;
    let client = Client::new();
    let timeout = Duration::from_secs(15);

    // Publisher connects through WHIP and sends VP8
    let publisher = client_peer_connection().await;
    let video = Arc::new(TrackLocalStaticRTP::new(
        vp8_capability(),
        "video".to_owned(),
        "live".to_owned(),
    ));
    publisher
        .add_track(video.clone() as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .unwrap();
    let offer = client_offer(&publisher).await;

    let response = client
        .post(server.url("/whip/live"))
        .header("Content-Type", "application/sdp")
        .body(offer)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let publisher_url = server.url(response.headers()["location"].to_str().unwrap());
    let answer = response.text().await.unwrap();
    publisher
        .set_remote_description(RTCSessionDescription::answer(answer).unwrap())
        .await
        .unwrap();

    let sending = tokio::spawn(send_vp8(video));

    // The ingest task publishes the track once media arrives
    let entry = server.state.sfu.streams().get("live").await.unwrap();
    let published = wait_until(timeout, || {
        let entry = entry.clone();
        async move { entry.len().await == 1 }
    })
    .await;
    assert!(published, "publisher track never reached the stream entry");

    // A subscriber receives the relayed packets
    let subscriber = client_peer_connection().await;
    let (packets_tx, mut packets_rx) = tokio::sync::mpsc::unbounded_channel();
    subscriber.on_track(Box::new(move |track, _receiver, _transceiver| {
        let packets_tx = packets_tx.clone();
        tokio::spawn(async move {
            while let Ok((packet, _)) = track.read_rtp().await {
                if packets_tx.send(packet).is_err() {
                    break;
                }
            }
        });
        Box::pin(async {})
    }));
    let offer = recvonly_video_offer(&subscriber).await;

    let response = client
        .post(server.url("/whep/live"))
        .header("Content-Type", "application/sdp")
        .body(offer)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let answer = response.text().await.unwrap();
    assert!(answer.contains("VP8/90000"));
    subscriber
        .set_remote_description(RTCSessionDescription::answer(answer).unwrap())
        .await
        .unwrap();

    let relayed = tokio::time::timeout(timeout, packets_rx.recv())
        .await
        .expect("no media relayed to the subscriber")
        .unwrap();
    assert_eq!(relayed.payload[..2], [0x10, 0x00]);
    assert_eq!(server.state.sfu.sessions().len().await, 2);

    // DELETE stops the relay, which prunes its track from the old entry
    let response = client.delete(&publisher_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(server.state.sfu.streams().get("live").await.is_err());

    let pruned = wait_until(Duration::from_secs(5), || {
        let entry = entry.clone();
        async move { entry.is_empty().await }
    })
    .await;
    assert!(pruned, "relay kept running after its session was deleted");
    assert!(server.state.sfu.sessions().is_empty().await);

    sending.abort();
    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_server_offer_completed_by_patch() {
    let server = start_test_server().await;
    let client = Client::new();

    let (session_url, offer) = publish_with_server_offer(&client, &server, "stream1").await;
    assert!(offer.contains("m=audio"));
    assert!(offer.contains("m=video"));
    assert!(offer.contains("a=recvonly"));

    let publisher = client_peer_connection().await;
    publisher
        .set_remote_description(RTCSessionDescription::offer(offer).unwrap())
        .await
        .unwrap();
    let answer = publisher.create_answer(None).await.unwrap();
    publisher.set_local_description(answer).await.unwrap();
    let answer = publisher.local_description().await.unwrap().sdp;

    let response = client
        .patch(&session_url)
        .header("Content-Type", "application/sdp")
        .body(answer)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_patch_trickle_ice_is_not_implemented() {
    let server = start_test_server().await;
    let client = Client::new();

    let (session_url, _offer) = publish_with_server_offer(&client, &server, "stream1").await;

    let response = client
        .patch(&session_url)
        .header("Content-Type", "application/trickle-ice-sdpfrag")
        .body("a=candidate:1 1 udp 2130706431 127.0.0.1 5000 typ host\r\n")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_delete_session() {
    let server = start_test_server().await;
    let client = Client::new();

    let (session_url, _offer) = publish_with_server_offer(&client, &server, "stream1").await;
    assert_eq!(server.state.sfu.sessions().len().await, 1);

    let response = client.delete(&session_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert!(server.state.sfu.sessions().is_empty().await);
    assert!(server.state.sfu.streams().get("stream1").await.is_err());

    // The session is gone for every later signaling request
    let response = client.delete(&session_url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .patch(&session_url)
        .header("Content-Type", "application/sdp")
        .body("v=0\r\n")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_sessions_are_not_found() {
    let server = start_test_server().await;
    let client = Client::new();

    let response = client
        .delete(server.url("/not-a-session"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .delete(server.url(&format!("/{}", uuid::Uuid::new_v4())))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_post_with_wrong_content_type_is_bad_request() {
    let server = start_test_server().await;
    let client = Client::new();

    let response = client
        .post(server.url("/whip/stream1"))
        .header("Content-Type", "text/plain")
        .body("hello")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(server.state.sfu.streams().get("stream1").await.is_err());
}

#[tokio::test]
async fn test_test_pages() {
    let server = start_test_server().await;
    let client = Client::new();

    for path in ["/whip/stream1", "/whep/stream1"] {
        let response = client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/html"));
        assert!(response.text().await.unwrap().contains("RTCPeerConnection"));
    }

    let response = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "OK");
}
