//! TCP server implementation.

use crate::config::Config;
use crate::error::SessionError;
use crate::events::SessionEvent;
use crate::handler::HandlerRegistry;
use crate::session::Session;
use segwire_schema::Schema;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    /// Non-fatal and fatal session errors reported across all sessions.
    pub errors_total: AtomicU64,
}

/// TCP server that runs one server session per accepted connection.
pub struct Server {
    config: Config,
    schema: Arc<Schema>,
    handlers: HandlerRegistry,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: Config, schema: Arc<Schema>, handlers: HandlerRegistry) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            schema,
            handlers,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), SessionError> {
        let listener = TcpListener::bind(self.config.network.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SessionError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "Server listening on {} ({} methods, {} handlers)",
            listener.local_addr()?,
            self.schema.dispatch().len(),
            self.handlers.len()
        );

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.network.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

                            let session = self.accept(tcp_stream, addr);
                            let stats = self.stats.clone();
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                Self::handle_connection(session, addr, &stats, conn_shutdown).await;
                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Session {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] failed to set TCP_NODELAY: {}", addr, e);
        }
        tracing::info!("Client connected: {}", addr);
        Session::server(
            stream,
            self.schema.clone(),
            self.handlers.clone(),
            self.config.session.clone(),
        )
    }

    async fn handle_connection(
        session: Session,
        addr: SocketAddr,
        stats: &ServerStats,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut events = session.subscribe();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(SessionEvent::Error(message)) => {
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("[{}] {}", addr, message);
                    }
                    Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("[{}] dropped {} session events", addr, n);
                    }
                },
                _ = session.closed() => break,
                _ = shutdown.recv() => {
                    session.close();
                    break;
                }
            }
        }
    }

    /// Signals the accept loop and every open session to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_addr", &self.config.network.bind_addr)
            .field("handlers", &self.handlers)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::handler::{CallContext, HandlerResult, Reply};
    use crate::session::MethodCall;
    use segwire_protocol::{FieldArray, Value};
    use std::time::Duration;

    const ACCOUNT: &str = include_str!("../../schemas/account.yaml");

    async fn echo(ctx: CallContext) -> HandlerResult {
        let text = ctx.param("text").cloned().unwrap_or(Value::Str(String::new()));
        Ok(Reply::new(FieldArray::new(vec![text])))
    }

    #[tokio::test]
    async fn test_server_serves_tcp_clients() {
        let schema = Arc::new(Schema::from_yaml(ACCOUNT).unwrap());
        let mut handlers = HandlerRegistry::new();
        handlers.register_named(&schema, "echo", echo).unwrap();

        let server = Arc::new(Server::new(Config::default(), schema.clone(), handlers));
        assert!(!server.is_running());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = Session::client(stream, schema, SessionConfig::default());
        let reply = client
            .invoke(MethodCall::new(
                "echo",
                FieldArray::new(vec![Value::from("over tcp")]),
            ))
            .await
            .unwrap();
        assert_eq!(reply.required, vec![Value::from("over tcp")]);
        assert!(server.is_running());
        assert_eq!(server.stats().connections_total.load(Ordering::Relaxed), 1);

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        serving.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
