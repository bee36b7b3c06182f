//! Loopback end-to-end coverage: a real `Client` against a real `Server`
//! over `smol::net`, not the per-module fakes the unit tests use.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use httpcore::body::BodyKind;
use httpcore::client::Client;
use httpcore::connection::Connection;
use httpcore::error::Result;
use httpcore::headers::Headers;
use httpcore::method::Method;
use httpcore::server::{Handler, Request, ResponseWriter, Server};
use httpcore::stream::AsyncStream;
use httpcore::websocket::Message;
use smol::net::TcpListener;

type HandleFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
type Slot = Option<Connection<Box<dyn AsyncStream>>>;

fn redirect_handler<'a>(
    request: &'a mut Request,
    writer: &'a mut ResponseWriter,
    conn: &'a mut Slot,
    _peer: SocketAddr,
) -> HandleFuture<'a> {
    Box::pin(async move {
        match request.path.as_str() {
            "/old" => writer.redirect(conn, 302, "/new", None).await,
            "/new" => writer.write(conn, b"landed").await,
            _ => writer.write_headers(conn, 404, None).await,
        }
    })
}

#[test]
fn client_follows_redirect_to_final_body() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(Server::new(4));
        let server_task = smol::spawn({
            let server = server.clone();
            async move {
                let handler = Arc::new(redirect_handler);
                server.listen(listener, handler).await.unwrap();
            }
        });

        let client = Client::new();
        let mut response = client.get(&format!("http://{addr}/old")).await.unwrap();
        assert_eq!(response.status_code, 200);
        let body = response.read_to_end().await.unwrap();
        assert_eq!(body, b"landed");

        server.shutdown_handle().initiate();
        server_task.await;
    });
}

#[test]
fn server_keeps_one_connection_alive_across_two_requests() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(Server::new(4));
        let server_task = smol::spawn({
            let server = server.clone();
            async move {
                let handler = Arc::new(redirect_handler);
                server.listen(listener, handler).await.unwrap();
            }
        });

        let client = Client::new();
        let mut conn = client.new_connection(&addr.ip().to_string(), Some(addr.port()), false).await.unwrap();

        for _ in 0..2 {
            let headers = Headers::new();
            let mut writer = conn.new_request(&Method::Get, "/new", &headers, BodyKind::Empty).await.unwrap();
            conn.finish_writer(&mut writer).await.unwrap();
            let (head, mut reader) = conn.read_response(false).await.unwrap();
            assert_eq!(head.status_code, 200);
            let mut body = Vec::new();
            while let Some(chunk) = reader.next_bytes(conn.stream_mut()).await.unwrap() {
                body.extend(chunk);
            }
            assert_eq!(body, b"landed");
            assert!(conn.is_reusable());
        }

        server.shutdown_handle().initiate();
        server_task.await;
    });
}

struct WsEchoHandler(Arc<Server>);

impl Handler for WsEchoHandler {
    fn handle<'a>(
        &'a self,
        request: &'a mut Request,
        _writer: &'a mut ResponseWriter,
        conn: &'a mut Slot,
        _peer: SocketAddr,
    ) -> HandleFuture<'a> {
        Box::pin(async move {
            let owned = conn
                .take()
                .ok_or_else(|| httpcore::error::Error::protocol_error("connection already detached"))?;
            let mut ws = self.0.web_socket(request, owned).await?;
            if let Some(Message::Text(text)) = ws.receive().await? {
                ws.send_text(&text).await?;
            }
            ws.close(1000, "").await?;
            Ok(())
        })
    }
}

#[test]
fn websocket_upgrade_echoes_one_message() {
    smol::block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(Server::new(1));
        let server_task = smol::spawn({
            let server = server.clone();
            async move {
                let handler = Arc::new(WsEchoHandler(server.clone()));
                server.listen(listener, handler).await.unwrap();
            }
        });

        let client = Client::new();
        let mut ws = client.web_socket(&format!("ws://{addr}/ws")).await.unwrap();
        ws.send_text("ping").await.unwrap();
        let reply = ws.receive().await.unwrap();
        assert_eq!(reply, Some(Message::Text("ping".to_string())));

        server.shutdown_handle().initiate();
        let _ = server_task;
    });
}
