use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionId},
    registry::Registry,
    router::Router,
    session::Session,
};

/// Accepts TCP clients and runs one session task per connection.
pub struct Relay {
    listener: TcpListener,
    router: Arc<Router>,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            router: Arc::new(Router::new(Arc::new(Registry::new()))),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn router(&self) -> Arc<Router> {
        Arc::clone(&self.router)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            router,
            next_id,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&router).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &router, &next_id);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(router: &Router) {
    let sessions = router.registry().snapshot().await;
    info!(active = sessions.len(), "relay shutting down");
    for (_, conn) in sessions {
        conn.close();
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    router: &Arc<Router>,
    next_id: &AtomicU64,
) {
    match result {
        Ok((stream, peer)) => {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            spawn_session(stream, peer, id, router);
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, id: ConnectionId, router: &Arc<Router>) {
    let router = Arc::clone(router);
    tokio::spawn(async move {
        debug!(peer = %peer, conn = id, "accepted connection");
        let (reader, writer) = stream.into_split();
        let conn = Connection::new(id, Some(peer), writer);
        if let Err(err) = Session::new(conn, Arc::clone(&router)).run(reader).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
        let online = router.registry().len().await;
        debug!(
            peer = %peer,
            conn = id,
            online = online,
            "session ended"
        );
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        sync::oneshot,
        time::{sleep, timeout},
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn online_count_follows_join_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let relay = Relay::new(listener);
        let addr = relay.local_addr().expect("local addr");
        let router = relay.router();

        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(relay.run_until(async move {
            let _ = stopped.await;
        }));

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream.write_all(b"alice\n").await.expect("send name");
        let mut welcome = String::new();
        timeout(WAIT, BufReader::new(&mut stream).read_line(&mut welcome))
            .await
            .expect("welcome within timeout")
            .expect("read welcome");
        assert_eq!(welcome, "Welcome alice!\n");
        assert_eq!(router.registry().len().await, 1);

        drop(stream);
        timeout(WAIT, async {
            while router.registry().len().await > 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session unregistered after disconnect");

        let _ = stop.send(());
        server.await.expect("relay task").expect("relay exits cleanly");
    }
}
