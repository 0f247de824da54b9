//! WebSocket connector for the duplex synthesis service.
//!
//! Each connection runs on a dedicated thread with a current-thread tokio
//! runtime. The thread owns the socket: it drains the outbound channel and
//! pushes every inbound frame to the session's [`FrameHandler`] inline.

use crate::error::{Result, SayshError};
use crate::transport::connection::{ConnectRequest, Connector, FrameHandler, InboundFrame, Link};
use crossbeam_channel::RecvTimeoutError;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{self, HeaderName, HeaderValue};
use tracing::{debug, warn};

enum Outbound {
    Text(String),
    Close,
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        request: &ConnectRequest,
        handler: Arc<dyn FrameHandler>,
        timeout: Duration,
    ) -> Result<Box<dyn Link>> {
        let ws_request = build_request(request)?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        thread::Builder::new()
            .name("saysh-ws".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if ready_tx
                            .send(Err(SayshError::Transport {
                                message: format!("Failed to build connection runtime: {}", e),
                            }))
                            .is_err()
                        {
                            debug!("connect caller went away before runtime failure was reported");
                        }
                        return;
                    }
                };
                runtime.block_on(run_connection(ws_request, out_rx, handler, ready_tx));
            })
            .map_err(|e| SayshError::Transport {
                message: format!("Failed to spawn connection thread: {}", e),
            })?;

        match ready_rx.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(Box::new(WebSocketLink { tx: out_tx })),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Err(SayshError::timeout(
                format!("websocket connect to {}", request.url),
                timeout,
            )),
            Err(RecvTimeoutError::Disconnected) => Err(SayshError::Transport {
                message: "connection thread exited before the handshake completed".to_string(),
            }),
        }
    }
}

fn build_request(request: &ConnectRequest) -> Result<http::Request<()>> {
    let mut ws_request =
        request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SayshError::Transport {
                message: format!("Invalid service URL {}: {}", request.url, e),
            })?;

    for (name, value) in &request.headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| SayshError::Transport {
                message: format!("Invalid header name {}: {}", name, e),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| SayshError::Transport {
            message: format!("Invalid value for header {}: {}", name, e),
        })?;
        ws_request.headers_mut().insert(header_name, header_value);
    }

    Ok(ws_request)
}

async fn run_connection(
    request: http::Request<()>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    handler: Arc<dyn FrameHandler>,
    ready: crossbeam_channel::Sender<Result<()>>,
) {
    let stream = match connect_async(request).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            let err = SayshError::Transport {
                message: format!("websocket connection failed: {}", e),
            };
            if ready.send(Err(err)).is_err() {
                debug!("connect caller gave up before the failure was reported");
            }
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        // Caller timed out; nobody owns this connection.
        debug!("dropping late websocket connection");
        return;
    }

    let (mut writer, mut reader) = stream.split();

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Text(frame)) => {
                    if let Err(e) = writer.send(Message::Text(frame)).await {
                        handler.on_frame(InboundFrame::Error(e.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = writer.close().await {
                        debug!(error = %e, "websocket close handshake failed");
                    }
                    break;
                }
            },
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => handler.on_frame(InboundFrame::Text(text)),
                Some(Ok(Message::Binary(data))) => handler.on_frame(InboundFrame::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| format!("{} {}", f.code, f.reason));
                    handler.on_frame(InboundFrame::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "websocket read failed");
                    handler.on_frame(InboundFrame::Error(e.to_string()));
                    break;
                }
                None => {
                    handler.on_frame(InboundFrame::Closed { reason: None });
                    break;
                }
            }
        }
    }
}

struct WebSocketLink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Link for WebSocketLink {
    fn send_text(&self, frame: String) -> Result<()> {
        self.tx
            .send(Outbound::Text(frame))
            .map_err(|_| SayshError::Transport {
                message: "websocket connection is closed".to_string(),
            })
    }

    fn close(&self) {
        if self.tx.send(Outbound::Close).is_err() {
            debug!("websocket already closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<InboundFrame>>,
    }

    impl FrameHandler for Recorder {
        fn on_frame(&self, frame: InboundFrame) {
            self.frames.lock().unwrap().push(frame);
        }
    }

    impl Recorder {
        fn wait_for(&self, count: usize) -> Vec<InboundFrame> {
            for _ in 0..200 {
                let frames = self.frames.lock().unwrap().clone();
                if frames.len() >= count {
                    return frames;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            self.frames.lock().unwrap().clone()
        }
    }

    #[test]
    fn rejects_invalid_url() {
        let request = ConnectRequest::new("not a url", "k");
        let result = WebSocketConnector::new().connect(
            &request,
            Arc::new(Recorder::default()),
            Duration::from_millis(100),
        );
        assert!(matches!(result, Err(SayshError::Transport { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exchanges_text_and_binary_with_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen_auth = Arc::new(Mutex::new(None::<String>));
        let seen_auth_server = seen_auth.clone();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| {
                let auth = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                *seen_auth_server.lock().unwrap() = auth;
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(tcp, callback)
                .await
                .unwrap();
            // Echo the text frame back, then send audio.
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
                ws.send(Message::Binary(vec![1, 2, 3, 4])).await.unwrap();
            }
            // Wait for the client to close.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let recorder = Arc::new(Recorder::default());
        let handler: Arc<dyn FrameHandler> = recorder.clone();
        let url = format!("ws://{}", addr);
        let link = tokio::task::spawn_blocking(move || {
            let request = ConnectRequest::new(&url, "sk-local");
            WebSocketConnector::new().connect(&request, handler, Duration::from_secs(5))
        })
        .await
        .unwrap()
        .unwrap();

        link.send_text("{\"hello\":1}".to_string()).unwrap();
        let frames = tokio::task::spawn_blocking({
            let recorder = recorder.clone();
            move || recorder.wait_for(2)
        })
        .await
        .unwrap();

        assert_eq!(frames[0], InboundFrame::Text("{\"hello\":1}".to_string()));
        assert_eq!(frames[1], InboundFrame::Binary(vec![1, 2, 3, 4]));
        assert_eq!(seen_auth.lock().unwrap().as_deref(), Some("bearer sk-local"));

        link.close();
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stalled_handshake_times_out() {
        // Accepts TCP but never answers the upgrade.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(tcp);
        });

        let url = format!("ws://{}", addr);
        let result = tokio::task::spawn_blocking(move || {
            let request = ConnectRequest::new(&url, "k");
            WebSocketConnector::new().connect(
                &request,
                Arc::new(Recorder::default()),
                Duration::from_millis(200),
            )
        })
        .await
        .unwrap();

        match result {
            Err(e) => assert!(e.is_timeout(), "expected timeout, got {e:?}"),
            Ok(_) => panic!("handshake should not complete"),
        }
        server.abort();
    }
}
