mod common;

use common::*;
use nxsession_client::{ChannelState, ProxyTarget, SessionError};
use nxsession_protocol::codes::*;
use nxsession_protocol::{Frame, ResultCode};
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr};

fn target() -> ProxyTarget {
    ProxyTarget::Address {
        address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        port: 22,
    }
}

fn proxy_data(channel: u32, data: &[u8]) -> Frame {
    Frame::binary(CMD_TCP_PROXY_DATA, channel, data.to_vec())
}

#[tokio::test]
async fn test_proxy_roundtrip_and_peer_close() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    let open = {
        let session = session.clone();
        tokio::spawn(async move { session.open_proxy(target()).await })
    };
    let setup = peer.expect(CMD_SETUP_TCP_PROXY).await;
    assert_eq!(setup.get_str(VID_IP_ADDRESS).as_deref(), Some("10.0.0.1"));
    assert_eq!(setup.get_u16(VID_PORT), Some(22));
    let channel_id = setup.get_u32(VID_CHANNEL_ID).unwrap();
    peer.complete(setup.id).await;

    let mut channel = open.await.unwrap().unwrap();
    assert_eq!(channel.id(), channel_id);
    assert_eq!(channel.state(), ChannelState::Open);

    let mut payload = vec![0u8; 70_000];
    rand::thread_rng().fill_bytes(&mut payload);
    channel.write_all(&payload).await.unwrap();
    let mut received = Vec::new();
    while received.len() < payload.len() {
        let frame = peer.expect(CMD_TCP_PROXY_DATA).await;
        assert_eq!(frame.id, channel_id);
        received.extend_from_slice(frame.binary_data());
    }
    assert_eq!(received, payload);

    peer.send(&proxy_data(channel_id, b"SSH-2.0-mock\r\n")).await;
    let mut buf = [0u8; 4];
    assert_eq!(channel.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"SSH-");
    assert_eq!(
        channel.read_chunk().await.unwrap().as_deref(),
        Some(&b"2.0-mock\r\n"[..])
    );

    peer.send(
        &Frame::new(CMD_CLOSE_TCP_PROXY)
            .with_field(VID_CHANNEL_ID, channel_id)
            .with_field(VID_RCC, 0u32),
    )
    .await;
    assert_eq!(channel.read_chunk().await.unwrap(), None);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(channel.write_all(b"late").await.is_err());
    assert_eq!(session.open_proxy_count(), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_peer_assigned_id_with_early_data() {
    let server = MockServer::bind().await;
    let hs = Handshake {
        capabilities: CAP_PEER_ASSIGNED_PROXY_ID | CAP_TWO_PHASE_TCP_PROXY,
        ..Default::default()
    };
    let (session, mut peer) = connect(&server, server.config(), hs).await;

    let open = {
        let session = session.clone();
        tokio::spawn(async move { session.open_proxy(target()).await })
    };
    let setup = peer.expect(CMD_SETUP_TCP_PROXY).await;
    assert!(!setup.contains(VID_CHANNEL_ID));

    // Data for the channel overtakes the reply that names it.
    peer.send(&proxy_data(77, b"banner")).await;
    peer.send(&completion(setup.id).with_field(VID_CHANNEL_ID, 77u32)).await;
    peer.send(&completion(setup.id)).await;

    let mut channel = open.await.unwrap().unwrap();
    assert_eq!(channel.id(), 77);
    assert_eq!(channel.read_chunk().await.unwrap().as_deref(), Some(&b"banner"[..]));

    channel.close().await.unwrap();
    let close = peer.expect(CMD_CLOSE_TCP_PROXY).await;
    assert_eq!(close.get_u32(VID_CHANNEL_ID), Some(77));
    assert_eq!(channel.state(), ChannelState::Closed);

    session.disconnect().await;
}

#[tokio::test]
async fn test_second_phase_failure_aborts_open() {
    let server = MockServer::bind().await;
    let hs = Handshake {
        capabilities: CAP_TWO_PHASE_TCP_PROXY,
        ..Default::default()
    };
    let (session, mut peer) = connect(&server, server.config(), hs).await;

    let open = {
        let session = session.clone();
        tokio::spawn(async move { session.open_proxy(target()).await })
    };
    let setup = peer.expect(CMD_SETUP_TCP_PROXY).await;
    peer.complete(setup.id).await;
    peer.send(&failure(setup.id, ResultCode::ResourceNotAvailable)).await;

    match open.await.unwrap() {
        Err(SessionError::Request { code, .. }) => {
            assert_eq!(code, ResultCode::ResourceNotAvailable)
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(session.open_proxy_count(), 0);

    session.disconnect().await;
}

#[tokio::test]
async fn test_connection_loss_aborts_every_channel() {
    let server = MockServer::bind().await;
    let (session, mut peer) = connect(&server, server.config(), Handshake::default()).await;

    let mut channels = Vec::new();
    for _ in 0..3 {
        let open = {
            let session = session.clone();
            tokio::spawn(async move { session.open_proxy(target()).await })
        };
        let setup = peer.expect(CMD_SETUP_TCP_PROXY).await;
        peer.complete(setup.id).await;
        channels.push(open.await.unwrap().unwrap());
    }
    assert_eq!(session.open_proxy_count(), 3);

    drop(peer);

    for channel in &mut channels {
        let result = tokio::time::timeout(STEP_TIMEOUT, channel.read_chunk())
            .await
            .unwrap();
        assert!(matches!(result, Err(SessionError::ConnectionBroken(_))));
        assert_eq!(channel.state(), ChannelState::Aborted);
        assert!(channel.write_all(b"x").await.is_err());
    }
    assert_eq!(session.open_proxy_count(), 0);
}
