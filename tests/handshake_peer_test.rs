//! End-to-end handshake -> peer integration test: runs the four-message
//! handshake between an in-memory client and server, then drives real
//! Ethernet frames through the promoted peers' transport pipeline.
//! Mirrors the teacher's top-level `tests/peer_integration_test.rs`
//! placement and scenarios 1-4 of the session engine's test plan.

use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;

use govpn_rs::conf::PeerConf;
use govpn_rs::crypto::identity::{PeerId, ID_SIZE};
use govpn_rs::crypto::verifier::Verifier;
use govpn_rs::handshake::Handshake;
use govpn_rs::peer::{Peer, PktOutcome};

fn peer_confs() -> (PeerConf, PeerConf) {
    let id = PeerId([3u8; ID_SIZE]);
    let mut verifier = Verifier::new(1024, 16, 1, id);
    let priv_key = verifier
        .password_apply("does not matter")
        .expect("argon2d derivation must succeed");

    let server_conf = PeerConf {
        id,
        iface: "tap0".to_string(),
        mtu: 1500,
        timeout: Duration::from_secs(60),
        noise: false,
        cpr: 0,
        encless: false,
        time_sync: 0,
        up: None,
        down: None,
        verifier: verifier.clone(),
        dsa_priv: None,
    };
    let client_conf = PeerConf {
        dsa_priv: Some(priv_key),
        ..server_conf.clone()
    };
    (client_conf, server_conf)
}

/// Runs M1-M4 between a fresh client and server handshake, returning the
/// two promoted peers.
async fn handshake(client_conf: &PeerConf, server_conf: &PeerConf) -> (Peer, Peer) {
    let mut rng = OsRng;
    let (mut client_hs, m1) = Handshake::client_m1(client_conf, &mut rng).unwrap();
    let (mut server_hs, m2) = Handshake::server_recv_m1(server_conf, &m1, &mut rng).unwrap();
    let m3 = client_hs.client_recv_m2(&m2, &mut rng).unwrap();
    let (m4, server_peer) = server_hs.server_recv_m3(&m3).unwrap();
    let client_peer = client_hs.client_recv_m4(&m4).unwrap();
    (client_peer, server_peer)
}

#[tokio::test]
async fn handshake_then_symmetric_transport_round_trip() {
    let (client_conf, server_conf) = peer_confs();
    let (client_peer, server_peer) = handshake(&client_conf, &server_conf).await;
    let mut rng = OsRng;

    let mut frame = vec![0u8; 789];
    rng.fill_bytes(&mut frame);

    let wire = client_peer
        .eth_process(&frame, &mut rng)
        .await
        .unwrap()
        .expect("non-empty payload always produces a wire frame");
    match server_peer.pkt_process(&wire, true).await.unwrap() {
        PktOutcome::Payload(received) => assert_eq!(received, frame),
        PktOutcome::Heartbeat => panic!("expected a data frame, not a heartbeat"),
    }
}

#[tokio::test]
async fn handshake_then_replayed_packet_is_rejected_once() {
    let (client_conf, server_conf) = peer_confs();
    let (client_peer, server_peer) = handshake(&client_conf, &server_conf).await;
    let mut rng = OsRng;

    let wire = client_peer
        .eth_process(b"replay me", &mut rng)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(
        server_peer.pkt_process(&wire, true).await.unwrap(),
        PktOutcome::Payload(_)
    ));
    assert!(server_peer.pkt_process(&wire, true).await.is_err());
}

#[tokio::test]
async fn handshake_then_tampered_packet_is_rejected() {
    let (client_conf, server_conf) = peer_confs();
    let (client_peer, server_peer) = handshake(&client_conf, &server_conf).await;
    let mut rng = OsRng;

    let mut wire = client_peer
        .eth_process(b"do not tamper", &mut rng)
        .await
        .unwrap()
        .unwrap();
    wire[0] ^= 0xff;

    assert!(server_peer.pkt_process(&wire, true).await.is_err());
}
