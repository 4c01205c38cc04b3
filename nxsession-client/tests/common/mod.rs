//! In-process mock server speaking the session protocol over loopback TCP.

#![allow(dead_code)]

use nxsession_client::{Credentials, Notification, Session, SessionConfig, SessionListener};
use nxsession_protocol::codes::*;
use nxsession_protocol::{
    Decoder, Encoder, Frame, PeerKeyPair, ResultCode, FRAME_HEADER_SIZE, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound for any single step of a scripted exchange.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub const SERVER_TIMESTAMP: u64 = 1_700_000_000;

pub struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    /// Plain-text session config with short timeouts.
    pub fn config(&self) -> SessionConfig {
        SessionConfig::new("127.0.0.1", self.port())
            .with_encryption(false)
            .with_connect_timeout(Duration::from_secs(5))
            .with_command_timeout(Duration::from_secs(5))
    }

    pub async fn accept(&self) -> Peer {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        Peer::new(stream)
    }
}

/// What the mock server announces and grants during connect.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub capabilities: u64,
    pub encryption: bool,
    /// Token handed out on `CMD_REQUEST_AUTH_TOKEN`; `None` means the
    /// client is not expected to ask.
    pub issue_token: Option<String>,
    pub user_id: u32,
    pub session_id: u32,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            capabilities: 0,
            encryption: false,
            issue_token: None,
            user_id: 1,
            session_id: 42,
        }
    }
}

/// Server side of one connection.
pub struct Peer {
    stream: TcpStream,
    decoder: Decoder,
    encoder: Encoder,
}

impl Peer {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            encoder: Encoder::new(),
        }
    }

    /// Next frame from the client. Panics on timeout or EOF.
    pub async fn recv(&mut self) -> Frame {
        tokio::time::timeout(STEP_TIMEOUT, self.next_frame())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client closed the connection")
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            if let Some(frame) = self.decoder.decode_frame().unwrap() {
                return Some(frame);
            }
            let n = self.stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    pub async fn expect(&mut self, code: u16) -> Frame {
        let frame = self.recv().await;
        assert_eq!(
            frame.code,
            code,
            "expected {}, got {}",
            message_code_name(code),
            message_code_name(frame.code)
        );
        frame
    }

    pub async fn send(&mut self, frame: &Frame) {
        let bytes = self.encoder.encode(frame).unwrap();
        self.stream.write_all(&bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Sends `count` copies of `frame`, each with a broken checksum.
    pub async fn send_corrupted(&mut self, frame: &Frame, count: usize) {
        let mut one = self.encoder.encode(frame).unwrap().to_vec();
        one[FRAME_HEADER_SIZE - 1] ^= 0xFF;
        let bytes = one.repeat(count);
        self.stream.write_all(&bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn complete(&mut self, id: u32) {
        self.send(&completion(id)).await;
    }

    /// Answers server info, encryption, login and the token request.
    /// Returns the login frame.
    pub async fn serve_handshake(&mut self, hs: &Handshake) -> Frame {
        let info = self.expect(CMD_GET_SERVER_INFO).await;
        let reply = completion(info.id)
            .with_field(VID_PROTOCOL_VERSION, u32::from(PROTOCOL_VERSION))
            .with_field(VID_SERVER_VERSION, "mock-5.0")
            .with_field(VID_SERVER_ID, 0x5EEDu64)
            .with_field(VID_SERVER_CAPABILITIES, hs.capabilities)
            .with_field(VID_TIMESTAMP, SERVER_TIMESTAMP)
            .with_field(VID_CHALLENGE, b"mock-challenge".to_vec());
        self.send(&reply).await;

        if hs.encryption {
            self.serve_encryption().await;
        }

        let login = self.expect(CMD_LOGIN).await;
        self.send(
            &Frame::with_id(CMD_LOGIN_RESPONSE, login.id)
                .with_field(VID_RCC, 0u32)
                .with_field(VID_USER_ID, hs.user_id)
                .with_field(VID_SESSION_ID, hs.session_id),
        )
        .await;

        if let Some(token) = &hs.issue_token {
            let request = self.expect(CMD_REQUEST_AUTH_TOKEN).await;
            self.send(&completion(request.id).with_field(VID_AUTH_TOKEN, token.as_str()))
                .await;
        }
        login
    }

    /// Runs the key exchange started by `CMD_REQUEST_ENCRYPTION`.
    pub async fn serve_encryption(&mut self) {
        let request = self.expect(CMD_REQUEST_ENCRYPTION).await;
        let keys = PeerKeyPair::generate();
        self.send(&keys.key_request(0)).await;
        let reply = self.expect(CMD_SESSION_KEY).await;
        let ctx = Arc::new(keys.accept(&reply).unwrap());
        self.encoder.set_encryption(Some(ctx.clone()));
        self.decoder.set_encryption(Some(ctx));
        self.complete(request.id).await;
    }

    /// Reads until the client closes the connection. Returns the frames
    /// seen on the way.
    pub async fn drain_until_closed(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        tokio::time::timeout(STEP_TIMEOUT, async {
            while let Some(frame) = self.next_frame().await {
                frames.push(frame);
            }
        })
        .await
        .expect("client kept the connection open");
        frames
    }
}

pub fn completion(id: u32) -> Frame {
    Frame::with_id(CMD_REQUEST_COMPLETED, id).with_field(VID_RCC, 0u32)
}

pub fn failure(id: u32, rcc: ResultCode) -> Frame {
    Frame::with_id(CMD_REQUEST_COMPLETED, id).with_field(VID_RCC, rcc.as_u32())
}

/// Connects with a password login while `peer` serves the handshake.
pub async fn connect(server: &MockServer, config: SessionConfig, hs: Handshake) -> (Session, Peer) {
    let client = tokio::spawn(Session::connect(
        config,
        Credentials::password("admin", "secret"),
    ));
    let mut peer = server.accept().await;
    peer.serve_handshake(&hs).await;
    let session = client.await.unwrap().unwrap();
    (session, peer)
}

/// Listener recording every notification it sees.
#[derive(Default)]
pub struct Recorder {
    seen: Mutex<Vec<Notification>>,
    changed: tokio::sync::Notify,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn codes(&self) -> Vec<u32> {
        self.seen.lock().iter().map(|n| n.code).collect()
    }

    pub fn count(&self, code: u32) -> usize {
        self.seen.lock().iter().filter(|n| n.code == code).count()
    }

    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    /// Waits until at least `n` notifications with `code` were seen.
    pub async fn wait_for(&self, code: u32, n: usize) {
        tokio::time::timeout(STEP_TIMEOUT, async {
            loop {
                let notified = self.changed.notified();
                if self.count(code) >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("notification {} not seen {} time(s)", code, n));
    }
}

impl SessionListener for Recorder {
    fn on_notification(&self, notification: &Notification) {
        self.seen.lock().push(notification.clone());
        self.changed.notify_waiters();
    }
}
