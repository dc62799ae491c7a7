// WebSocket upgrades spliced through a real listener to a raw TCP backend.
#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use kingress::{
        HttpClientAdapter, MemorySessionStore,
        adapters::listener::{bind, serve_http},
        core::{
            backend::{Backend, BackendAddress, BackendContext},
            dispatcher::Dispatcher,
            matcher::{PathType, RequestMatcher},
            plugin::PluginChain,
            routing::{RoutingEntry, RoutingTable, shared_routing_table},
            session::SessionCookie,
        },
        utils::{GracefulShutdown, ShutdownReason},
    };
    use tokio::{
        io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut byte).await.unwrap();
            assert_eq!(n, 1, "connection closed before end of head");
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    /// Accepts one upgrade and echoes everything back.
    async fn echo_backend() -> BackendAddress {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = read_head(&mut socket).await;
            assert!(head.starts_with("GET /chat HTTP/1.1\r\n"), "unexpected head: {head}");
            socket
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
                )
                .await
                .unwrap();

            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                socket.write_all(&buf[..n]).await.unwrap();
            }
        });
        BackendAddress::new(addr.ip(), addr.port())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_websocket_is_spliced_to_backend() {
        let backend = echo_backend().await;
        let dispatcher = Arc::new(Dispatcher::new(
            shared_routing_table(RoutingTable::new(vec![
                RoutingEntry::new(RequestMatcher::new("a.test", "/", PathType::Prefix))
                    .with_backend(Backend::Forward(backend)),
            ])),
            Arc::new(PluginChain::default()),
            Arc::new(MemorySessionStore::new()),
            SessionCookie::default(),
            BackendContext {
                http_client: Arc::new(HttpClientAdapter::new()),
                proxy_timeout: Duration::from_secs(10),
            },
        ));

        let listener = bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();
        let shutdown = GracefulShutdown::new();
        let server = tokio::spawn(serve_http(listener, dispatcher, shutdown.shutdown_token()));

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client
            .write_all(
                b"GET /chat HTTP/1.1\r\nHost: a.test\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
                  Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
            )
            .await
            .unwrap();

        let head = timeout(Duration::from_secs(5), read_head(&mut client)).await.unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "unexpected head: {head}");

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ping");

        shutdown.trigger_shutdown(ShutdownReason::Requested);
        timeout(Duration::from_secs(1), server).await.unwrap().unwrap().unwrap();
    }
}
