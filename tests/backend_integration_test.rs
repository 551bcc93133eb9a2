//! End-to-end tests for the BasicStation backend.
//!
//! Each test spins up a real backend on `127.0.0.1:0` and drives it with a
//! tokio-tungstenite client, capturing upstream events through mpsc
//! channels registered as callbacks.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use lorabridge::backend::basicstation::Backend;
use lorabridge::backend::{
    DownlinkFrame, DownlinkTiming, DownlinkTxAck, DownlinkTxInfo, GatewayStats, Modulation,
    RawPacketForwarderCommand, RawPacketForwarderEvent, UplinkFrame,
};
use lorabridge::config::{Concentrator, ConcentratorMultiSf, Settings};
use lorabridge::lorawan::Eui64;

const GATEWAY_EUI: &str = "0102030405060708";

const WAIT: Duration = Duration::from_secs(5);

struct Events {
    uplink: mpsc::UnboundedReceiver<UplinkFrame>,
    txack: mpsc::UnboundedReceiver<DownlinkTxAck>,
    stats: mpsc::UnboundedReceiver<GatewayStats>,
    raw: mpsc::UnboundedReceiver<RawPacketForwarderEvent>,
}

fn test_settings(stats_interval: Duration) -> Settings {
    let mut settings = Settings::default();
    let bs = &mut settings.backend.basic_station;
    bs.bind = "127.0.0.1:0".into();
    bs.stats_interval = stats_interval;
    bs.ping_interval = Duration::from_secs(5);
    bs.read_timeout = Duration::from_secs(10);
    bs.write_timeout = Duration::from_secs(1);
    bs.concentrators = vec![Concentrator {
        multi_sf: ConcentratorMultiSf {
            frequencies: vec![
                868_100_000,
                868_300_000,
                868_500_000,
                867_100_000,
                867_300_000,
                867_500_000,
                867_700_000,
                867_900_000,
            ],
        },
        lora_std: Default::default(),
        fsk: Default::default(),
    }];
    settings
}

fn start_backend(settings: Settings) -> (Backend, Events) {
    let backend = Backend::new(&settings).unwrap();

    let (uplink_tx, uplink) = mpsc::unbounded_channel();
    let (txack_tx, txack) = mpsc::unbounded_channel();
    let (stats_tx, stats) = mpsc::unbounded_channel();
    let (raw_tx, raw) = mpsc::unbounded_channel();

    backend.set_uplink_frame_callback(move |frame| {
        let _ = uplink_tx.send(frame);
    });
    backend.set_downlink_txack_callback(move |ack| {
        let _ = txack_tx.send(ack);
    });
    backend.set_gateway_stats_callback(move |stats| {
        let _ = stats_tx.send(stats);
    });
    backend.set_raw_packet_forwarder_event_callback(move |event| {
        let _ = raw_tx.send(event);
    });

    backend.start().unwrap();

    (
        backend,
        Events {
            uplink,
            txack,
            stats,
            raw,
        },
    )
}

async fn connect_gateway(
    backend: &Backend,
    eui: &str,
) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
    let url = format!("ws://{}/gateway/{}", backend.local_addr(), eui);
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

fn updf_frame(f_cnt: u16) -> String {
    format!(
        r#"{{
            "msgtype": "updf",
            "MHdr": 64,
            "DevAddr": 16909060,
            "FCtrl": 128,
            "FCnt": {},
            "FOpts": "",
            "FPort": 10,
            "FRMPayload": "0102aabb",
            "MIC": 1234567,
            "DR": 5,
            "Freq": 868100000,
            "upinfo": {{"rctx": 0, "xtime": 1234, "gpstime": 0, "rssi": -35.0, "snr": 5.5}}
        }}"#,
        f_cnt
    )
}

async fn recv_text(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> serde_json::Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .unwrap();
        match msg {
            WsMessage::Text(text) => return serde_json::from_str(&text).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

// Scenario: version handshake answers with the router-config, and an
// uplink data frame surfaces as exactly one UplinkFrame event.
#[tokio::test]
async fn uplink_happy_path() {
    let (backend, mut events) = start_backend(test_settings(Duration::from_secs(30)));
    let mut ws = connect_gateway(&backend, GATEWAY_EUI).await;

    ws.send(WsMessage::Text(
        r#"{"msgtype":"version","station":"x","firmware":"y","package":"z","model":"m","protocol":2}"#
            .into(),
    ))
    .await
    .unwrap();

    let router_config = recv_text(&mut ws).await;
    assert_eq!(router_config["msgtype"], "router_config");
    assert_eq!(router_config["region"], "EU863");
    assert_eq!(router_config["hwspec"], "sx1301/1");

    ws.send(WsMessage::Text(updf_frame(1))).await.unwrap();

    let frame = timeout(WAIT, events.uplink.recv()).await.unwrap().unwrap();
    assert!(!frame.rx_info.uplink_id.is_nil());
    assert_eq!(
        frame.rx_info.gateway_id.as_bytes(),
        &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]
    );
    assert_eq!(frame.tx_info.frequency, 868_100_000);

    // Exactly one event for one frame.
    assert!(events.uplink.try_recv().is_err());

    backend.stop();
}

// Scenario: a downlink with token 0 gets a fresh token; a dntxed carrying
// that token is correlated back to the original downlink id.
#[tokio::test]
async fn downlink_ack_correlation() {
    let (backend, mut events) = start_backend(test_settings(Duration::from_secs(30)));
    let mut ws = connect_gateway(&backend, GATEWAY_EUI).await;

    let mut id_bytes = [0u8; 16];
    id_bytes[15] = 0x2a;
    let downlink_id = Uuid::from_bytes(id_bytes);

    backend
        .send_downlink_frame(DownlinkFrame {
            gateway_id: GATEWAY_EUI.parse().unwrap(),
            downlink_id,
            token: 0,
            phy_payload: vec![0x60, 0x01, 0x02, 0x03],
            tx_info: DownlinkTxInfo {
                frequency: 868_100_000,
                power: 14,
                modulation: Modulation::Lora {
                    bandwidth: 125_000,
                    spreading_factor: 7,
                    code_rate: "4/5".to_string(),
                    polarization_inversion: true,
                },
                timing: DownlinkTiming::Delay {
                    delay: Duration::from_secs(1),
                },
                context: 555_000i64.to_be_bytes().to_vec(),
            },
        })
        .await
        .unwrap();

    let dnmsg = recv_text(&mut ws).await;
    assert_eq!(dnmsg["msgtype"], "dnmsg");
    assert_eq!(dnmsg["pdu"], "60010203");
    let diid = dnmsg["diid"].as_i64().unwrap();
    assert!((0..=u16::MAX as i64).contains(&diid));

    ws.send(WsMessage::Text(format!(
        r#"{{"msgtype":"dntxed","diid":{},"DevEui":"00-00-00-00-00-00-00-00","rctx":0,"xtime":555000,"txtime":1.5,"gpstime":0}}"#,
        diid
    )))
    .await
    .unwrap();

    let ack = timeout(WAIT, events.txack.recv()).await.unwrap().unwrap();
    assert_eq!(ack.token, diid as u32);
    let recovered = ack.downlink_id.expect("downlink id recovered from cache");
    assert_eq!(recovered.as_bytes()[15], 0x2a);

    backend.stop();
}

// Scenario: a second connection for the same EUI is closed by the server
// without disturbing the incumbent.
#[tokio::test]
async fn duplicate_connect_is_rejected() {
    let (backend, mut events) = start_backend(test_settings(Duration::from_secs(30)));
    let mut first = connect_gateway(&backend, GATEWAY_EUI).await;

    let mut second = connect_gateway(&backend, GATEWAY_EUI).await;
    let closed = timeout(WAIT, async {
        loop {
            match second.next().await {
                None | Some(Ok(WsMessage::Close(_))) => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "second connection should be closed");

    // The first connection keeps receiving uplinks.
    first.send(WsMessage::Text(updf_frame(7))).await.unwrap();
    let frame = timeout(WAIT, events.uplink.recv()).await.unwrap().unwrap();
    assert_eq!(frame.rx_info.gateway_id.to_hex(), GATEWAY_EUI);

    backend.stop();
}

// Scenario: single mode publishes all-zero stats for the configured EUI
// even though no packet forwarder ever connected.
#[tokio::test]
async fn single_mode_emits_stats_without_connection() {
    let mut settings = test_settings(Duration::from_millis(200));
    settings.backend.basic_station.single.enabled = true;
    settings.backend.basic_station.single.gw_id = "aabbccddeeff0011".into();

    let (backend, mut events) = start_backend(settings);

    let stats = timeout(Duration::from_secs(2), events.stats.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.gateway_id.to_string(), "aa:bb:cc:dd:ee:ff:00:11");
    assert!(!stats.stats_id.is_nil());
    assert_eq!(stats.rx_packets_received, 0);
    assert_eq!(stats.rx_packets_received_ok, 0);
    assert_eq!(stats.tx_packets_received, 0);
    assert_eq!(stats.tx_packets_emitted, 0);

    backend.stop();
}

// Scenario: three uplinks inside one interval are reported once, and the
// following interval reports zeros again.
#[tokio::test]
async fn stats_report_and_reset_counters() {
    let (backend, mut events) = start_backend(test_settings(Duration::from_millis(500)));
    let mut ws = connect_gateway(&backend, GATEWAY_EUI).await;

    for i in 0..3 {
        ws.send(WsMessage::Text(updf_frame(i))).await.unwrap();
    }
    for _ in 0..3 {
        timeout(WAIT, events.uplink.recv()).await.unwrap().unwrap();
    }

    // First stats event that saw any traffic must carry all three frames.
    let stats = loop {
        let stats = timeout(WAIT, events.stats.recv()).await.unwrap().unwrap();
        if stats.rx_packets_received > 0 {
            break stats;
        }
    };
    assert_eq!(stats.gateway_id.to_hex(), GATEWAY_EUI);
    assert_eq!(stats.rx_packets_received, 3);
    assert_eq!(stats.rx_packets_received_ok, 3);
    assert_eq!(stats.tx_packets_received, 0);
    assert_eq!(stats.tx_packets_emitted, 0);

    // Counters were drained; the next interval reports zeros.
    let next = timeout(WAIT, events.stats.recv()).await.unwrap().unwrap();
    assert_eq!(next.rx_packets_received, 0);
    assert_eq!(next.rx_packets_received_ok, 0);

    backend.stop();
}

// Scenario: the router-info handshake points the station at its gateway
// endpoint and closes.
#[tokio::test]
async fn router_info_handshake() {
    let (backend, _events) = start_backend(test_settings(Duration::from_secs(30)));

    let url = format!("ws://{}/router-info", backend.local_addr());
    let (mut ws, _) = connect_async(url).await.unwrap();

    ws.send(WsMessage::Text(
        format!(r#"{{"router":"{}"}}"#, GATEWAY_EUI),
    ))
    .await
    .unwrap();

    let resp = recv_text(&mut ws).await;
    assert_eq!(resp["router"], GATEWAY_EUI);
    assert_eq!(resp["muxs"], GATEWAY_EUI);
    let uri = resp["uri"].as_str().unwrap();
    assert!(uri.starts_with("ws://"));
    assert!(uri.ends_with(&format!("/gateway/{}", GATEWAY_EUI)));
    assert!(resp.get("error").is_none());

    backend.stop();
}

// Scenario: timesync answers with the echoed txtime and a current GPS
// timestamp.
#[tokio::test]
async fn timesync_reply() {
    let (backend, _events) = start_backend(test_settings(Duration::from_secs(30)));
    let mut ws = connect_gateway(&backend, GATEWAY_EUI).await;

    ws.send(WsMessage::Text(
        r#"{"msgtype":"timesync","txtime":424242}"#.into(),
    ))
    .await
    .unwrap();

    let resp = recv_text(&mut ws).await;
    assert_eq!(resp["msgtype"], "timesync");
    assert_eq!(resp["txtime"], 424242);
    // GPS time for any current date is far beyond 1.0e15 microseconds.
    assert!(resp["gpstime"].as_i64().unwrap() > 1_000_000_000_000_000);

    backend.stop();
}

// Scenario: binary frames and unknown msgtypes pass through as raw
// events; raw commands pass through in the other direction, with the
// frame type sniffed from the payload.
#[tokio::test]
async fn raw_passthrough_both_directions() {
    let (backend, mut events) = start_backend(test_settings(Duration::from_secs(30)));
    let mut ws = connect_gateway(&backend, GATEWAY_EUI).await;

    ws.send(WsMessage::Binary(vec![0xde, 0xad, 0xbe, 0xef]))
        .await
        .unwrap();
    let event = timeout(WAIT, events.raw.recv()).await.unwrap().unwrap();
    assert_eq!(event.payload, vec![0xde, 0xad, 0xbe, 0xef]);
    assert!(!event.raw_id.is_nil());

    ws.send(WsMessage::Text(r#"{"msgtype":"rmtsh","user":"x"}"#.into()))
        .await
        .unwrap();
    let event = timeout(WAIT, events.raw.recv()).await.unwrap().unwrap();
    assert_eq!(event.payload, br#"{"msgtype":"rmtsh","user":"x"}"#.to_vec());

    backend
        .send_raw_packet_forwarder_command(RawPacketForwarderCommand {
            gateway_id: GATEWAY_EUI.parse().unwrap(),
            raw_id: Uuid::new_v4(),
            payload: br#"{"msgtype":"rmtsh"}"#.to_vec(),
        })
        .await
        .unwrap();
    let msg = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(msg, WsMessage::Text(_)));

    backend
        .send_raw_packet_forwarder_command(RawPacketForwarderCommand {
            gateway_id: GATEWAY_EUI.parse().unwrap(),
            raw_id: Uuid::new_v4(),
            payload: vec![0x01, 0x02],
        })
        .await
        .unwrap();
    let msg = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
    assert!(matches!(msg, WsMessage::Binary(_)));

    backend.stop();
}

// Scenario: after a disconnect the registry entry is gone and downlinks
// fail with a not-found error.
#[tokio::test]
async fn disconnect_cleans_up_registry() {
    let (backend, _events) = start_backend(test_settings(Duration::from_secs(30)));
    let ws = connect_gateway(&backend, GATEWAY_EUI).await;
    drop(ws);

    let gateway_id: Eui64 = GATEWAY_EUI.parse().unwrap();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let result = backend
            .send_raw_packet_forwarder_command(RawPacketForwarderCommand {
                gateway_id,
                raw_id: Uuid::new_v4(),
                payload: vec![0x01],
            })
            .await;
        if result.is_err() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry entry was never cleaned up"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    backend.stop();
}

mod mtls {
    use super::*;

    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
        KeyUsagePurpose,
    };
    use rustls_pki_types::{CertificateDer, PrivatePkcs8KeyDer};
    use tokio_tungstenite::{connect_async_tls_with_config, Connector};

    struct TestCa {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    impl TestCa {
        fn generate() -> TestCa {
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "lorabridge test CA");
            params.distinguished_name = dn;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            let key = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            TestCa { cert, key }
        }

        fn issue(&self, cn: &str) -> (rcgen::Certificate, KeyPair) {
            let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, cn);
            params.distinguished_name = dn;
            params.is_ca = IsCa::NoCa;
            let key = KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
            (cert, key)
        }
    }

    fn tls_backend(ca: &TestCa, stats_interval: Duration) -> (Backend, Events, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let (server_cert, server_key) = ca.issue("server");

        let ca_path = dir.path().join("ca.pem");
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&ca_path, ca.cert.pem()).unwrap();
        std::fs::write(&cert_path, server_cert.pem()).unwrap();
        std::fs::write(&key_path, server_key.serialize_pem()).unwrap();

        let mut settings = test_settings(stats_interval);
        settings.backend.basic_station.ca_cert = Some(ca_path);
        settings.backend.basic_station.tls_cert = Some(cert_path);
        settings.backend.basic_station.tls_key = Some(key_path);

        let (backend, events) = start_backend(settings);
        (backend, events, dir)
    }

    fn client_connector(ca: &TestCa, cert: &rcgen::Certificate, key: &KeyPair) -> Connector {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut roots = rustls::RootCertStore::empty();
        roots
            .add(CertificateDer::from(ca.cert.der().to_vec()))
            .unwrap();

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                vec![CertificateDer::from(cert.der().to_vec())],
                PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
            )
            .unwrap();

        Connector::Rustls(Arc::new(client_config))
    }

    // Scenario: a client certificate whose CN matches the gateway EUI
    // connects and completes the version handshake over wss.
    #[tokio::test]
    async fn matching_common_name_is_accepted() {
        let ca = TestCa::generate();
        let (backend, mut events, _dir) = tls_backend(&ca, Duration::from_secs(30));
        let eui = "1111111111111111";
        let (client_cert, client_key) = ca.issue(eui);

        let url = format!(
            "wss://localhost:{}/gateway/{}",
            backend.local_addr().port(),
            eui
        );
        let (mut ws, _) = connect_async_tls_with_config(
            url,
            None,
            false,
            Some(client_connector(&ca, &client_cert, &client_key)),
        )
        .await
        .unwrap();

        ws.send(WsMessage::Text(updf_frame(1))).await.unwrap();
        let frame = timeout(WAIT, events.uplink.recv()).await.unwrap().unwrap();
        assert_eq!(frame.rx_info.gateway_id.to_hex(), eui);

        backend.stop();
    }

    // Scenario: a client certificate CN that differs from the URL EUI is
    // rejected and no gateway entry is created.
    #[tokio::test]
    async fn mismatched_common_name_is_rejected() {
        let ca = TestCa::generate();
        let (backend, _events, _dir) = tls_backend(&ca, Duration::from_secs(30));
        let (client_cert, client_key) = ca.issue("1111111111111111");

        let url = format!(
            "wss://localhost:{}/gateway/2222222222222222",
            backend.local_addr().port()
        );
        let result = connect_async_tls_with_config(
            url,
            None,
            false,
            Some(client_connector(&ca, &client_cert, &client_key)),
        )
        .await;
        assert!(result.is_err(), "connection should be rejected");

        // No registry entry was created for the rejected EUI.
        let err = backend
            .send_raw_packet_forwarder_command(RawPacketForwarderCommand {
                gateway_id: "2222222222222222".parse().unwrap(),
                raw_id: Uuid::new_v4(),
                payload: vec![0x01],
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        backend.stop();
    }
}
