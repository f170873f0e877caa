//! HTTP embedding of the dispatch core: channels (bound listening sockets
//! with protocol and TLS configuration), connection lifecycle, and the
//! hyper service glue.

mod body;
pub mod config;
mod errors;
mod service;
mod tls;

pub use config::{
    ChannelConfig, Config, ConnectionConfig, Endpoint, HttpConfig, MetricsConfig, TlsConfig,
};
pub use errors::ServerError;
pub use service::ConnectionService;

use dispatch::DispatchTree;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use service::ConnectionService as Service;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Binds every configured channel and serves until [`Server::shutdown`].
pub async fn run(config: Config, tree: DispatchTree) -> Result<(), ServerError> {
    let server = Server::start(config, tree).await?;
    server.wait().await;
    Ok(())
}

struct Channel {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

/// A running server: the immutable dispatch tree plus its channel set.
///
/// The channel list is touched only under its lock during start and stop;
/// steady-state traffic runs entirely on the per-channel accept tasks.
pub struct Server {
    channels: Mutex<Vec<Channel>>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// Validates the configuration and binds all channels.
    pub async fn start(config: Config, tree: DispatchTree) -> Result<Server, ServerError> {
        config.validate()?;
        let tree = Arc::new(tree);
        let (shutdown, _) = watch::channel(false);

        let mut channels = Vec::with_capacity(config.channels.len());
        for channel_config in &config.channels {
            channels.push(open_channel(channel_config, tree.clone(), shutdown.subscribe()).await?);
        }

        Ok(Server {
            channels: Mutex::new(channels),
            shutdown,
        })
    }

    /// Addresses the server is actually bound to (useful with port 0).
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.channels
            .lock()
            .expect("channel list lock poisoned")
            .iter()
            .map(|channel| channel.addr)
            .collect()
    }

    /// Stops accepting on every channel. In-flight connections finish their
    /// current response.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Waits for every accept task to finish (after [`Self::shutdown`],
    /// or forever otherwise).
    pub async fn wait(&self) {
        let channels: Vec<Channel> = {
            let mut guard = self.channels.lock().expect("channel list lock poisoned");
            guard.drain(..).collect()
        };
        for channel in channels {
            let _ = channel.accept_task.await;
        }
    }
}

async fn open_channel(
    config: &ChannelConfig,
    tree: Arc<DispatchTree>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Channel, ServerError> {
    let listener =
        TcpListener::bind((config.endpoint.address.as_str(), config.endpoint.port)).await?;
    let addr = listener.local_addr()?;

    let acceptor = config
        .http
        .tls()
        .map(|tls_config| tls::build_acceptor(tls_config, config.http.is_h2()))
        .transpose()?;
    let h2 = config.http.is_h2();
    let connection = config.connection.clone();

    info!(%addr, h2, tls = acceptor.is_some(), "channel listening");

    let accept_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let tree = tree.clone();
                            let acceptor = acceptor.clone();
                            let connection = connection.clone();
                            tokio::spawn(async move {
                                serve_connection(stream, peer, acceptor, h2, connection, tree)
                                    .await;
                            });
                        }
                        Err(error) => debug!(%error, %addr, "accept failed"),
                    }
                }
            }
        }
        info!(%addr, "channel closed");
    });

    Ok(Channel { addr, accept_task })
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    h2: bool,
    connection: ConnectionConfig,
    tree: Arc<DispatchTree>,
) {
    let service = Service::new(tree, connection.request_limit, acceptor.is_some());
    match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                drive_connection(TokioIo::new(tls_stream), service, h2, &connection).await
            }
            Err(error) => debug!(%error, %peer, "TLS handshake failed"),
        },
        None => drive_connection(TokioIo::new(stream), service, h2, &connection).await,
    }
}

/// Serves one connection, honoring the idle timeout and the per-connection
/// request limit: once the budget is spent the connection shuts down
/// gracefully after the in-flight response.
async fn drive_connection<I>(io: I, service: Service, h2: bool, connection: &ConnectionConfig)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let exhausted = service.exhausted();
    let idle = connection.idle_timeout();

    if h2 {
        let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .keep_alive_interval(idle)
            .keep_alive_timeout(idle)
            .serve_connection(io, service);
        tokio::pin!(conn);
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(error) = result {
                    debug!(%error, "connection ended with error");
                }
            }
            _ = exhausted.notified() => {
                conn.as_mut().graceful_shutdown();
                if let Err(error) = conn.as_mut().await {
                    debug!(%error, "connection ended with error");
                }
            }
        }
    } else {
        let conn = hyper::server::conn::http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(idle)
            .serve_connection(io, service);
        tokio::pin!(conn);
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(error) = result {
                    debug!(%error, "connection ended with error");
                }
            }
            _ = exhausted.notified() => {
                conn.as_mut().graceful_shutdown();
                if let Err(error) = conn.as_mut().await {
                    debug!(%error, "connection ended with error");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch::{DispatchSpec, ResponseContent, ResponseImpl, SchemaBuilder};

    fn demo_tree() -> DispatchTree {
        let mut builder = SchemaBuilder::new();
        builder.insert(
            ResponseImpl::new(|_| Ok(ResponseContent::text("ok"))),
            &DispatchSpec::new().path("/health"),
        );
        builder.build()
    }

    fn loopback_config() -> Config {
        Config {
            channels: vec![ChannelConfig {
                endpoint: Endpoint {
                    address: "127.0.0.1".into(),
                    port: 0,
                },
                http: HttpConfig::V1 { tls: None },
                connection: ConnectionConfig::default(),
            }],
            metrics: None,
        }
    }

    #[tokio::test]
    async fn test_start_binds_and_shuts_down() {
        let server = Server::start(loopback_config(), demo_tree()).await.unwrap();
        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);

        server.shutdown();
        server.wait().await;
    }

    #[tokio::test]
    async fn test_served_request_roundtrip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let server = Server::start(loopback_config(), demo_tree()).await.unwrap();
        let addr = server.local_addrs()[0];

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200 OK"), "got: {text}");
        assert!(text.ends_with("ok"), "got: {text}");

        server.shutdown();
        server.wait().await;
    }

    #[tokio::test]
    async fn test_start_rejects_empty_config() {
        let config = Config {
            channels: vec![],
            metrics: None,
        };
        assert!(matches!(
            Server::start(config, demo_tree()).await,
            Err(ServerError::Config(_))
        ));
    }
}
