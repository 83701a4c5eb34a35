//! Tests for the tokio-tungstenite connector against a real in-process
//! server: subprotocol negotiation, frame events, and close code mapping.

use futures_util::{SinkExt, StreamExt};
use podshell::{CLOSE_ABNORMAL, SocketConnector, SocketEvent, SocketRequest, WebSocketConnector};
use podshell_protocol::attach_subprotocols;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

#[tokio::test]
async fn round_trips_frames_and_carries_the_subprotocols() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut offered = None;
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
             mut response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                offered = request_subprotocols(request);
                response.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    tokio_tungstenite::tungstenite::http::HeaderValue::from_static(
                        "v4.channel.k8s.io",
                    ),
                );
                Ok(response)
            },
        )
        .await
        .unwrap();
        let (mut ws_tx, mut ws_rx) = ws.split();

        let incoming = ws_rx.next().await.unwrap().unwrap();
        assert_eq!(incoming, Message::Binary(vec![0, b'l', b's']));

        ws_tx
            .send(Message::Binary(vec![1, b'o', b'k']))
            .await
            .unwrap();
        ws_tx
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .unwrap();
        offered
    });

    let mut handle = WebSocketConnector
        .connect(SocketRequest {
            url: format!("ws://{addr}"),
            subprotocols: attach_subprotocols("attach-token"),
        })
        .await
        .unwrap();

    handle.sink.send(vec![0, b'l', b's']);

    assert_eq!(
        handle.events.recv().await,
        Some(SocketEvent::Message(vec![1, b'o', b'k']))
    );
    match handle.events.recv().await {
        Some(SocketEvent::Closed(close)) => assert!(close.is_normal(), "code {}", close.code),
        other => panic!("expected close event, got {other:?}"),
    }

    let offered = server.await.unwrap().expect("handshake should carry subprotocols");
    assert_eq!(
        offered,
        "v4.channel.k8s.io, base64url.bearer.authorization.k8s.io.YXR0YWNoLXRva2Vu"
    );
}

#[tokio::test]
async fn text_frames_surface_as_message_events() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut ws_tx, _ws_rx) = ws.split();
        ws_tx
            .send(Message::Text(r#"{"type":"ADDED","object":{}}"#.into()))
            .await
            .unwrap();
    });

    let mut handle = WebSocketConnector
        .connect(SocketRequest {
            url: format!("ws://{addr}"),
            subprotocols: Vec::new(),
        })
        .await
        .unwrap();

    let event = handle.events.recv().await.unwrap();
    let SocketEvent::Message(payload) = event else {
        panic!("expected message event");
    };
    let parsed: podshell_protocol::WatchEvent = serde_json::from_slice(&payload).unwrap();
    assert_eq!(parsed.kind, podshell_protocol::WatchEventKind::Added);

    server.await.unwrap();
}

#[tokio::test]
async fn dropped_connection_reports_an_abnormal_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // drop without a closing handshake
        drop(ws);
    });

    let mut handle = WebSocketConnector
        .connect(SocketRequest {
            url: format!("ws://{addr}"),
            subprotocols: Vec::new(),
        })
        .await
        .unwrap();

    let close = loop {
        match handle.events.recv().await {
            Some(SocketEvent::Closed(close)) => break close,
            Some(SocketEvent::Message(_)) => continue,
            None => panic!("event stream ended without a close event"),
        }
    };
    assert_eq!(close.code, CLOSE_ABNORMAL);

    server.await.unwrap();
}

fn request_subprotocols(
    request: &tokio_tungstenite::tungstenite::handshake::server::Request,
) -> Option<String> {
    request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
