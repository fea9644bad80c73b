use bytes::Bytes;
use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Instant;

use super::*;
use crate::flash::{FlashMessage, MAIN_FLOW_SIGNATURE, TYPE_INVOCATION};
use crate::handshake::{
    compute_asymmetric_keys, DiffieHellman, Handshake30, Handshake38, Handshake70, Handshake78,
    HANDSHAKE_30, HANDSHAKE_38,
};
use crate::messages::{ChunkReader, FlowData, SessionChunk, MESSAGE_OPTIONS};
use crate::packet_io::{decode, encode, init_packet, RtmfpCipher, MARKER_HANDSHAKE};
use crate::time::RtmfpTimestamp;
use rml_amf0::Amf0Value;

fn server_address() -> SocketAddr {
    "127.0.0.1:1935".parse().unwrap()
}

fn client_address() -> SocketAddr {
    "127.0.0.1:40000".parse().unwrap()
}

fn outbound_packets(results: &[EngineResult]) -> Vec<&crate::sessions::UdpPacket> {
    results
        .iter()
        .filter_map(|result| match result {
            EngineResult::OutboundPacket(packet) => Some(packet),
            _ => None,
        })
        .collect()
}

fn raised_events(results: &[EngineResult]) -> Vec<&EngineEvent> {
    results
        .iter()
        .filter_map(|result| match result {
            EngineResult::RaisedEvent(event) => Some(event),
            _ => None,
        })
        .collect()
}

fn open_handshake(datagram: &[u8]) -> (u32, Vec<(u8, Vec<u8>)>) {
    let decoded = decode(&RtmfpCipher::default_key(), datagram).unwrap();
    assert_eq!(decoded.marker, MARKER_HANDSHAKE, "Expected a handshake marker");

    let mut chunks = Vec::new();
    let mut reader = ChunkReader::new(&decoded.chunks);
    while let Some((type_id, payload)) = reader.next_chunk().unwrap() {
        chunks.push((type_id, payload.to_vec()));
    }

    (decoded.session_id, chunks)
}

fn seal_handshake(chunk_bytes: Vec<u8>, far_id: u32) -> Vec<u8> {
    let mut packet = init_packet(MARKER_HANDSHAKE, RtmfpTimestamp::new(0));
    packet.extend_from_slice(&chunk_bytes);
    encode(&RtmfpCipher::default_key(), far_id, packet).unwrap()
}

/// Plays the server role of a client connect handshake by hand and returns the derived
/// directional keys plus the client session id
struct FakeServer {
    dh: DiffieHellman,
    cookie: Vec<u8>,
    nonce: Vec<u8>,
    session_id: u32,
    client_session_id: u32,
    request_key: [u8; 16],
    response_key: [u8; 16],
}

impl FakeServer {
    fn new() -> FakeServer {
        FakeServer {
            dh: DiffieHellman::new(),
            cookie: vec![0x5A_u8; 64],
            nonce: vec![0x33_u8; 32],
            session_id: 99,
            client_session_id: 0,
            request_key: [0_u8; 16],
            response_key: [0_u8; 16],
        }
    }

    fn answer_handshake_30(&self, datagram: &[u8]) -> (Handshake30, Vec<u8>) {
        let (session_id, chunks) = open_handshake(datagram);
        assert_eq!(session_id, 0, "First round traffic flows under session id zero");
        assert_eq!(chunks[0].0, HANDSHAKE_30, "Expected a first round packet");

        let hs30 = Handshake30::parse(&chunks[0].1).unwrap();
        let reply = Handshake70 {
            tag: hs30.tag,
            cookie: self.cookie.clone(),
            far_key: self.dh.public_key().to_vec(),
        };

        let mut chunk_bytes = Vec::new();
        reply.write(&mut chunk_bytes).unwrap();
        (hs30, seal_handshake(chunk_bytes, 0))
    }

    fn answer_handshake_38(&mut self, datagram: &[u8]) -> (Handshake38, Vec<u8>) {
        let (_, chunks) = open_handshake(datagram);
        assert_eq!(chunks[0].0, HANDSHAKE_38, "Expected a second round packet");

        let hs38 = Handshake38::parse(&chunks[0].1).unwrap();
        assert_eq!(hs38.cookie, self.cookie, "The cookie must be echoed untouched");
        assert_eq!(hs38.public_key.len(), 128, "Expected a 128 byte public key");
        assert_eq!(hs38.nonce.len(), 32, "Expected a 32 byte nonce");
        assert!(!hs38.certificate.is_empty(), "Expected certificate bytes");

        self.client_session_id = hs38.session_id;
        let shared_secret = self.dh.shared_secret(&hs38.public_key);
        let (request_key, response_key) =
            compute_asymmetric_keys(&shared_secret, &hs38.nonce, &self.nonce);
        self.request_key = request_key;
        self.response_key = response_key;

        let reply = Handshake78 {
            session_id: self.session_id,
            public_key: self.dh.public_key().to_vec(),
            nonce: self.nonce.clone(),
        };

        let mut chunk_bytes = Vec::new();
        reply.write(&mut chunk_bytes).unwrap();
        (hs38, seal_handshake(chunk_bytes, self.client_session_id))
    }

    fn open_session_packet(&self, datagram: &[u8]) -> Vec<(u8, Vec<u8>)> {
        // The initiator encrypts with the request key
        let cipher = RtmfpCipher::new(&self.request_key).unwrap();
        let decoded = decode(&cipher, datagram).unwrap();
        assert_eq!(
            decoded.session_id, self.session_id,
            "Session traffic must target the server session id"
        );

        let mut chunks = Vec::new();
        let mut reader = ChunkReader::new(&decoded.chunks);
        while let Some((type_id, payload)) = reader.next_chunk().unwrap() {
            chunks.push((type_id, payload.to_vec()));
        }

        chunks
    }

    fn seal_session_packet(&self, chunks: &[SessionChunk]) -> Vec<u8> {
        let cipher = RtmfpCipher::new(&self.response_key).unwrap();
        let mut packet = init_packet(crate::packet_io::MARKER_AMF, RtmfpTimestamp::new(10));
        for chunk in chunks {
            chunk.write(&mut packet).unwrap();
        }

        encode(&cipher, self.client_session_id, packet).unwrap()
    }
}

fn connect_engine(
    engine: &mut RtmfpEngine,
    server: &mut FakeServer,
    now: Instant,
) -> Vec<EngineResult> {
    let results = engine
        .connect("rtmfp://example/app", vec![server_address()], now)
        .unwrap();
    let packets = outbound_packets(&results);
    assert_eq!(packets.len(), 1, "Expected one first round packet");

    let (hs30, hs70) = server.answer_handshake_30(&packets[0].bytes);
    match hs30.epd {
        crate::handshake::Epd::Url(url) => assert_eq!(url, "rtmfp://example/app"),
        x => panic!("Expected a url discriminator, got {:?}", x),
    }

    let results = engine.handle_datagram(server_address(), &hs70, now).unwrap();
    let packets = outbound_packets(&results);
    assert_eq!(packets.len(), 1, "Expected one second round packet");

    let (_, hs78) = server.answer_handshake_38(&packets[0].bytes);
    engine.handle_datagram(server_address(), &hs78, now).unwrap()
}

#[test]
fn client_connect_derives_keys_and_sends_connect_on_writer_two() {
    let now = Instant::now();
    let mut engine = RtmfpEngine::new(EngineConfig::new(), now);
    let mut server = FakeServer::new();

    let results = connect_engine(&mut engine, &mut server, now);
    assert!(engine.is_connected(), "The session must be connected after round four");

    // The first outbound message of the session is the connect invocation on writer 2
    let packets = outbound_packets(&results);
    assert_eq!(packets.len(), 1, "Expected the connect invocation datagram");

    let chunks = server.open_session_packet(&packets[0].bytes);
    let data = match SessionChunk::parse(chunks[0].0, &chunks[0].1).unwrap() {
        SessionChunk::FlowData(data) => data,
        x => panic!("Expected flow data, got {:?}", x),
    };

    assert_eq!(data.flow_id, 2, "The connect invocation must ride writer id 2");
    assert_eq!(data.stage, 1);
    assert_ne!(data.flags & MESSAGE_OPTIONS, 0, "Stage 1 must open the flow");
    assert_eq!(
        data.signature.as_deref(),
        Some(MAIN_FLOW_SIGNATURE),
        "The main flow signature must open the flow"
    );

    let message = FlashMessage::parse(&data.payload).unwrap();
    assert_eq!(message.type_id, TYPE_INVOCATION);

    let mut cursor = Cursor::new(message.payload.to_vec());
    let values = rml_amf0::deserialize(&mut cursor).unwrap();
    assert_eq!(values[0], Amf0Value::Utf8String("connect".to_string()));

    let properties = match &values[2] {
        Amf0Value::Object(properties) => properties,
        x => panic!("Expected the command object, got {:?}", x),
    };
    assert_eq!(
        properties.get("app"),
        Some(&Amf0Value::Utf8String("app".to_string())),
        "The connect must carry the application name"
    );
}

#[test]
fn server_result_raises_connect_success() {
    let now = Instant::now();
    let mut engine = RtmfpEngine::new(EngineConfig::new(), now);
    let mut server = FakeServer::new();
    connect_engine(&mut engine, &mut server, now);

    // The server acknowledges the connect with a _result on its own flow 2
    let values = vec![
        Amf0Value::Utf8String("_result".to_string()),
        Amf0Value::Number(1.0),
        Amf0Value::Null,
    ];
    let invocation = FlashMessage {
        type_id: TYPE_INVOCATION,
        time: 0,
        payload: Bytes::from(rml_amf0::serialize(&values).unwrap()),
    };

    let datagram = server.seal_session_packet(&[SessionChunk::FlowData(FlowData {
        flags: MESSAGE_OPTIONS,
        flow_id: 2,
        stage: 1,
        delta_ack: 1,
        signature: Some(MAIN_FLOW_SIGNATURE.to_vec()),
        writer_ref: Some(2),
        payload: Bytes::from(invocation.write()),
    })]);

    let results = engine.handle_datagram(server_address(), &datagram, now).unwrap();
    let events = raised_events(&results);
    assert!(
        events.iter().any(|event| matches!(
            event,
            EngineEvent::StatusEvent { code, .. } if code == "NetConnection.Connect.Success"
        )),
        "Expected the connect success status, got {:?}",
        events
    );

    // The flow advanced, so the datagram is acknowledged
    assert!(
        !outbound_packets(&results).is_empty(),
        "The server flow must be acknowledged"
    );
}

#[test]
fn two_engines_establish_a_peer_session() {
    let now = Instant::now();
    let mut engine_a = RtmfpEngine::new(EngineConfig::new(), now);
    let mut engine_b = RtmfpEngine::new(EngineConfig::new(), now);
    let address_a = client_address();
    let address_b: SocketAddr = "127.0.0.1:40001".parse().unwrap();

    let mut in_flight: Vec<(SocketAddr, SocketAddr, Vec<u8>)> = Vec::new();
    let results = engine_a
        .connect_to_peer(
            &engine_b.peer_id_hex(),
            vec![(address_b, crate::messages::AddressType::Public)],
            false,
            now,
        )
        .unwrap();
    for packet in outbound_packets(&results) {
        in_flight.push((address_a, packet.to, packet.bytes.clone()));
    }

    let mut a_connected = false;
    let mut b_connected = false;

    for _ in 0..20 {
        let (_from, to, bytes) = match in_flight.pop() {
            Some(x) => x,
            None => break,
        };

        let receiver = if to == address_a {
            &mut engine_a
        } else {
            &mut engine_b
        };
        let source = if to == address_a { address_b } else { address_a };

        let results = receiver.handle_datagram(source, &bytes, now).unwrap();
        for result in &results {
            match result {
                EngineResult::OutboundPacket(packet) => {
                    in_flight.push((to, packet.to, packet.bytes.clone()));
                }
                EngineResult::RaisedEvent(EngineEvent::PeerConnected { .. }) => {
                    if to == address_a {
                        a_connected = true;
                    } else {
                        b_connected = true;
                    }
                }
                _ => {}
            }
        }

        if a_connected && b_connected {
            break;
        }
    }

    assert!(b_connected, "The responder never reached the connected state");
    assert!(a_connected, "The initiator never reached the connected state");
}

#[test]
fn publish_flows_createstream_then_publish_on_a_stream_writer() {
    let now = Instant::now();
    let mut engine = RtmfpEngine::new(EngineConfig::new(), now);
    let mut server = FakeServer::new();
    connect_engine(&mut engine, &mut server, now);

    let results = engine.publish("mystream", now).unwrap();
    let packets = outbound_packets(&results);
    assert_eq!(packets.len(), 1, "Expected the createStream invocation");

    let chunks = server.open_session_packet(&packets[0].bytes);
    let data = match SessionChunk::parse(chunks[0].0, &chunks[0].1).unwrap() {
        SessionChunk::FlowData(data) => data,
        x => panic!("Expected flow data, got {:?}", x),
    };
    let message = FlashMessage::parse(&data.payload).unwrap();
    let mut cursor = Cursor::new(message.payload.to_vec());
    let values = rml_amf0::deserialize(&mut cursor).unwrap();
    assert_eq!(values[0], Amf0Value::Utf8String("createStream".to_string()));
    let callback = match values[1] {
        Amf0Value::Number(number) => number,
        _ => panic!("Expected the callback number"),
    };

    // The server answers with the created stream id; the publish invocation follows on a
    // fresh stream writer
    let reply_values = vec![
        Amf0Value::Utf8String("_result".to_string()),
        Amf0Value::Number(callback),
        Amf0Value::Null,
        Amf0Value::Number(7.0),
    ];
    let reply = FlashMessage {
        type_id: TYPE_INVOCATION,
        time: 0,
        payload: Bytes::from(rml_amf0::serialize(&reply_values).unwrap()),
    };
    let datagram = server.seal_session_packet(&[SessionChunk::FlowData(FlowData {
        flags: MESSAGE_OPTIONS,
        flow_id: 2,
        stage: 1,
        delta_ack: 1,
        signature: Some(MAIN_FLOW_SIGNATURE.to_vec()),
        writer_ref: Some(2),
        payload: Bytes::from(reply.write()),
    })]);

    let results = engine.handle_datagram(server_address(), &datagram, now).unwrap();
    let packets = outbound_packets(&results);
    assert!(!packets.is_empty(), "Expected the publish invocation and an ack");

    let mut saw_publish = false;
    for packet in packets {
        for (type_id, payload) in server.open_session_packet(&packet.bytes) {
            if type_id != crate::messages::CHUNK_FLOW_DATA {
                continue;
            }
            let data = match SessionChunk::parse(type_id, &payload).unwrap() {
                SessionChunk::FlowData(data) => data,
                _ => continue,
            };
            if data.flow_id == 2 {
                continue;
            }

            let message = FlashMessage::parse(&data.payload).unwrap();
            let mut cursor = Cursor::new(message.payload.to_vec());
            let values = rml_amf0::deserialize(&mut cursor).unwrap();
            if values[0] == Amf0Value::Utf8String("publish".to_string()) {
                assert_ne!(data.flow_id, 2, "publish must ride its own stream writer");
                saw_publish = true;
            }
        }
    }

    assert!(saw_publish, "The publish invocation never shipped");
}

#[test]
fn join_group_announces_the_hashed_id_to_the_server() {
    let now = Instant::now();
    let mut engine = RtmfpEngine::new(EngineConfig::new(), now);
    let mut server = FakeServer::new();
    connect_engine(&mut engine, &mut server, now);

    let results = engine
        .join_group("G:cafebabe", "groupstream", crate::group::GroupConfig::new(), now)
        .unwrap();
    let packets = outbound_packets(&results);
    assert_eq!(packets.len(), 1, "Expected the group announce datagram");

    let chunks = server.open_session_packet(&packets[0].bytes);
    let data = match SessionChunk::parse(chunks[0].0, &chunks[0].1).unwrap() {
        SessionChunk::FlowData(data) => data,
        x => panic!("Expected flow data, got {:?}", x),
    };

    assert!(
        data.signature
            .as_deref()
            .map(|signature| signature.starts_with(&[0x00, 0x47, 0x43]))
            .unwrap_or(false),
        "The group flow must open with the group signature"
    );
    assert_eq!(
        data.payload.as_ref(),
        crate::group::group_id_hex("G:cafebabe").as_bytes(),
        "The announced id must be the double SHA-256 of the group name"
    );
}

#[test]
fn group_publisher_can_inject_a_data_function_call() {
    let now = Instant::now();
    let mut engine = RtmfpEngine::new(EngineConfig::new(), now);
    let mut server = FakeServer::new();
    connect_engine(&mut engine, &mut server, now);

    let mut config = crate::group::GroupConfig::new();
    config.is_publisher = true;
    engine.join_group("G:feed", "groupstream", config, now).unwrap();

    let results = engine
        .call_group_function("setBitrate", &["1200".to_string()], now)
        .unwrap();

    // With no neighbors yet, the fragment only reaches our own group buffer
    assert!(
        results.iter().any(|result| matches!(
            result,
            EngineResult::RaisedEvent(EngineEvent::GroupMediaReceived { .. })
        )),
        "The injected call must enter the ordered stream"
    );
}

#[test]
fn operations_without_a_connection_are_rejected() {
    let now = Instant::now();
    let mut engine = RtmfpEngine::new(EngineConfig::new(), now);

    match engine.publish("stream", now) {
        Err(EngineError::NotConnected) => {}
        Err(x) => panic!("Expected NotConnected error, instead received {}", x),
        Ok(_) => panic!("Expected NotConnected error but the publish succeeded"),
    }

    match engine.push_audio(0, Bytes::new(), now) {
        Err(EngineError::NoPublication) => {}
        Err(x) => panic!("Expected NoPublication error, instead received {}", x),
        Ok(_) => panic!("Expected NoPublication error but the push succeeded"),
    }
}
