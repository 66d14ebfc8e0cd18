use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};
use chat_relay::relay::Relay;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);
const SILENCE_WINDOW: Duration = Duration::from_millis(200);

struct TestRelay {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let relay = Relay::new(listener);
        let addr = relay.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = relay.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            server,
        })
    }

    async fn connect(&self) -> Result<TestClient> {
        let stream = TcpStream::connect(self.addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(TestClient {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Connects, registers `name`, and consumes the welcome and roster lines.
    async fn join(&self, name: &str) -> Result<TestClient> {
        let mut client = self.connect().await?;
        client.send(name).await?;
        client.expect(&format!("Welcome {name}!")).await?;
        let roster = client.recv().await?;
        if !roster.starts_with("USERS ") {
            return Err(anyhow!("expected roster after welcome, got '{roster}'"));
        }
        Ok(client)
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.server.await;
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn send(&mut self, line: &str) -> Result<()> {
        self.send_raw(&format!("{line}\n")).await
    }

    async fn send_raw(&mut self, raw: &str) -> Result<()> {
        self.writer.write_all(raw.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let bytes = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .context("timed out waiting for line")??;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    async fn recv(&mut self) -> Result<String> {
        self.read_line()
            .await?
            .ok_or_else(|| anyhow!("connection closed while waiting for line"))
    }

    async fn expect(&mut self, expected: &str) -> Result<()> {
        let line = self.recv().await?;
        if line != expected {
            return Err(anyhow!("expected '{expected}', got '{line}'"));
        }
        Ok(())
    }

    async fn expect_closed(&mut self) -> Result<()> {
        match self.read_line().await? {
            None => Ok(()),
            Some(line) => Err(anyhow!("expected end of stream, got '{line}'")),
        }
    }

    async fn expect_silence(&mut self) -> Result<()> {
        let mut line = String::new();
        let result = timeout(SILENCE_WINDOW, self.reader.read_line(&mut line)).await;
        if result.is_err() {
            return Ok(());
        }
        Err(anyhow!("expected no output, got '{}'", line.trim_end()))
    }
}

#[tokio::test]
async fn duplicate_name_is_rejected_without_disturbing_owner() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.connect().await?;
    alice.send("alice").await?;
    alice.expect("Welcome alice!").await?;
    alice.expect("USERS alice").await?;

    let mut impostor = relay.connect().await?;
    impostor.send("alice").await?;
    impostor.expect("ERR username taken.").await?;
    impostor.expect_closed().await?;

    alice.expect_silence().await?;
    alice.send("/who").await?;
    alice.expect("USERS alice").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn invalid_name_closes_connection() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut client = relay.connect().await?;
    client.send(&"z".repeat(25)).await?;
    client.expect("ERR invalid username (1-24 chars).").await?;
    client.expect_closed().await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn join_announces_to_others_and_refreshes_roster() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.join("alice").await?;

    let mut bob = relay.connect().await?;
    bob.send("bob").await?;
    bob.expect("Welcome bob!").await?;
    bob.expect("USERS alice,bob").await?;
    bob.expect_silence().await?;

    alice.expect("USERS alice,bob").await?;
    alice.expect("bob has joined!").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn room_chat_echoes_to_sender() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    alice.expect("USERS alice,bob").await?;
    alice.expect("bob has joined!").await?;

    alice.send("hello").await?;
    alice.expect("alice: hello").await?;
    bob.expect("alice: hello").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn direct_message_reaches_only_target() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    let mut carol = relay.join("carol").await?;
    for line in ["USERS alice,bob", "bob has joined!", "USERS alice,bob,carol", "carol has joined!"] {
        alice.expect(line).await?;
    }
    bob.expect("USERS alice,bob,carol").await?;
    bob.expect("carol has joined!").await?;

    alice.send("/msg bob hey").await?;
    bob.expect("(DM) alice: hey").await?;
    alice.expect("(DM to bob) hey").await?;
    carol.expect_silence().await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn direct_message_errors_go_to_sender_only() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.join("alice").await?;
    let mut carol = relay.join("carol").await?;
    alice.expect("USERS alice,carol").await?;
    alice.expect("carol has joined!").await?;

    alice.send("/msg bob hi").await?;
    alice.expect("ERR user not found: bob").await?;

    alice.send("/msg alice hi").await?;
    alice.expect("ERR you cannot DM yourself.").await?;

    alice.send("/msg carol").await?;
    alice.expect("ERR usage: /msg <user> <text>").await?;

    carol.expect_silence().await?;

    // The session is still usable after usage errors.
    alice.send("still here").await?;
    alice.expect("alice: still here").await?;
    carol.expect("alice: still here").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn abrupt_disconnect_announces_departure() -> Result<()> {
    let relay = TestRelay::start().await?;

    let alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;

    drop(alice);

    bob.expect("USERS bob").await?;
    bob.expect("alice has left!").await?;
    bob.expect_silence().await?;

    bob.send("/who").await?;
    bob.expect("USERS bob").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn leave_announces_departure_once() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    alice.expect("USERS alice,bob").await?;
    alice.expect("bob has joined!").await?;

    alice.send("/leave").await?;
    alice.expect_closed().await?;

    bob.expect("USERS bob").await?;
    bob.expect("alice has left!").await?;
    bob.expect_silence().await?;

    // The name is free again.
    let mut again = relay.join("alice").await?;
    again.send("/who").await?;
    again.expect("USERS alice,bob").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn fragmented_and_crlf_input_is_reassembled() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.connect().await?;
    alice.send_raw("ali").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.send_raw("ce\r\n").await?;
    alice.expect("Welcome alice!").await?;
    alice.expect("USERS alice").await?;

    alice.send_raw("hel").await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.send_raw("lo\n\r\nsecond\r\n/who\n").await?;
    alice.expect("alice: hello").await?;
    alice.expect("alice: second").await?;
    alice.expect("USERS alice").await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn unterminated_line_is_dropped_on_disconnect() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.join("alice").await?;
    let mut bob = relay.join("bob").await?;
    alice.expect("USERS alice,bob").await?;
    alice.expect("bob has joined!").await?;

    bob.send_raw("never finished").await?;
    drop(bob);

    alice.expect("USERS alice").await?;
    alice.expect("bob has left!").await?;
    alice.expect_silence().await?;

    relay.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_active_sessions() -> Result<()> {
    let relay = TestRelay::start().await?;

    let mut alice = relay.join("alice").await?;
    relay.stop().await;

    alice.expect_closed().await?;
    Ok(())
}
