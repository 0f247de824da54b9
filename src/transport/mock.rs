//! In-process fake of the synthesis service.
//!
//! Each connection gets its own responder thread so replies arrive
//! asynchronously, the way they do from a real socket.

use crate::error::{Result, SayshError};
use crate::transport::connection::{ConnectRequest, Connector, FrameHandler, InboundFrame, Link};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
enum FinishReply {
    Finished,
    Failed { code: String, message: String },
    Silent,
    Drop,
}

#[derive(Debug, Clone)]
struct Script {
    start_event: Option<String>,
    chunks: Vec<usize>,
    chunk_interval: Option<Duration>,
    finish: FinishReply,
    refuse: bool,
    connect_delay: Option<Duration>,
}

/// Scripted connector answering the duplex protocol from memory.
///
/// By default it acknowledges `run-task`, answers every `continue-task` with
/// one `result-generated` event and a single 3200-byte audio chunk, and
/// answers `finish-task` with `task-finished`.
#[derive(Debug, Clone)]
pub struct ScriptedConnector {
    script: Script,
    sent: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self {
            script: Script {
                start_event: Some("task-started".to_string()),
                chunks: vec![3200],
                chunk_interval: None,
                finish: FinishReply::Finished,
                refuse: false,
                connect_delay: None,
            },
            sent: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Audio chunk sizes sent for each `continue-task`.
    pub fn with_chunks(mut self, chunks: Vec<usize>) -> Self {
        self.script.chunks = chunks;
        self
    }

    /// Pause before each audio chunk.
    pub fn with_chunk_interval(mut self, interval: Duration) -> Self {
        self.script.chunk_interval = Some(interval);
        self
    }

    /// Never answer `run-task`.
    pub fn without_start_ack(mut self) -> Self {
        self.script.start_event = None;
        self
    }

    /// Answer `run-task` with an arbitrary event name.
    pub fn replying_to_start_with(mut self, event: &str) -> Self {
        self.script.start_event = Some(event.to_string());
        self
    }

    /// Answer `finish-task` with `task-failed`.
    pub fn failing_with(mut self, code: &str, message: &str) -> Self {
        self.script.finish = FinishReply::Failed {
            code: code.to_string(),
            message: message.to_string(),
        };
        self
    }

    /// Never answer `finish-task`.
    pub fn silent_on_finish(mut self) -> Self {
        self.script.finish = FinishReply::Silent;
        self
    }

    /// Drop the connection on `finish-task`.
    pub fn dropping_on_finish(mut self) -> Self {
        self.script.finish = FinishReply::Drop;
        self
    }

    /// Fail every connection attempt.
    pub fn refusing_connections(mut self) -> Self {
        self.script.refuse = true;
        self
    }

    /// Hold every handshake for `delay` before the link is returned.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.script.connect_delay = Some(delay);
        self
    }

    /// Every frame sent by clients, in order.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `header.action` of every frame sent by clients.
    pub fn sent_actions(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
            .filter_map(|v| v["header"]["action"].as_str().map(str::to_string))
            .collect()
    }

    /// Texts carried by `continue-task` frames, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
            .filter_map(|v| v["payload"]["input"]["text"].as_str().map(str::to_string))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// True once any client closed its link.
    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        _request: &ConnectRequest,
        handler: Arc<dyn FrameHandler>,
        _timeout: Duration,
    ) -> Result<Box<dyn Link>> {
        if self.script.refuse {
            return Err(SayshError::Transport {
                message: "connection refused".to_string(),
            });
        }
        if let Some(delay) = self.script.connect_delay {
            thread::sleep(delay);
        }
        self.connections.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = unbounded();
        let script = self.script.clone();
        thread::Builder::new()
            .name("saysh-mock".to_string())
            .spawn(move || respond(script, rx, handler))
            .map_err(|e| SayshError::Transport {
                message: format!("Failed to spawn mock responder: {}", e),
            })?;

        Ok(Box::new(ScriptedLink {
            tx,
            sent: self.sent.clone(),
            closed: self.closed.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct ScriptedLink {
    tx: Sender<String>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    open: AtomicBool,
}

impl Link for ScriptedLink {
    fn send_text(&self, frame: String) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SayshError::Transport {
                message: "mock connection is closed".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame.clone());
        self.tx.send(frame).map_err(|_| SayshError::Transport {
            message: "mock service went away".to_string(),
        })
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn event(name: &str, task_id: &str) -> InboundFrame {
    InboundFrame::Text(
        json!({
            "header": {"event": name, "task_id": task_id, "attributes": {}},
            "payload": {}
        })
        .to_string(),
    )
}

fn respond(script: Script, rx: Receiver<String>, handler: Arc<dyn FrameHandler>) {
    // Ends when the link is dropped.
    while let Ok(frame) = rx.recv() {
        let Ok(value) = serde_json::from_str::<Value>(&frame) else {
            continue;
        };
        let task_id = value["header"]["task_id"].as_str().unwrap_or_default();
        match value["header"]["action"].as_str() {
            Some("run-task") => {
                if let Some(name) = &script.start_event {
                    handler.on_frame(event(name, task_id));
                }
            }
            Some("continue-task") => {
                handler.on_frame(event("result-generated", task_id));
                for (i, size) in script.chunks.iter().enumerate() {
                    if let Some(interval) = script.chunk_interval {
                        thread::sleep(interval);
                    }
                    handler.on_frame(InboundFrame::Binary(vec![(i % 251) as u8; *size]));
                }
            }
            Some("finish-task") => match &script.finish {
                FinishReply::Finished => handler.on_frame(event("task-finished", task_id)),
                FinishReply::Failed { code, message } => handler.on_frame(InboundFrame::Text(
                    json!({
                        "header": {
                            "event": "task-failed",
                            "task_id": task_id,
                            "error_code": code,
                            "error_message": message
                        },
                        "payload": {}
                    })
                    .to_string(),
                )),
                FinishReply::Silent => {}
                FinishReply::Drop => {
                    handler.on_frame(InboundFrame::Closed {
                        reason: Some("1006 abnormal closure".to_string()),
                    });
                    return;
                }
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sink(Mutex<Vec<InboundFrame>>);

    impl FrameHandler for Sink {
        fn on_frame(&self, frame: InboundFrame) {
            self.0.lock().unwrap().push(frame);
        }
    }

    #[test]
    fn answers_protocol_in_order() {
        let connector = ScriptedConnector::new().with_chunks(vec![4, 2]);
        let sink = Arc::new(Sink::default());
        let link = connector
            .connect(
                &ConnectRequest::new("wss://mock", "k"),
                sink.clone(),
                Duration::from_secs(1),
            )
            .unwrap();

        let header = |action: &str| {
            json!({"header": {"action": action, "task_id": "t1", "streaming": "duplex"}, "payload": {"input": {"text": "hi"}}})
                .to_string()
        };
        link.send_text(header("run-task")).unwrap();
        link.send_text(header("continue-task")).unwrap();
        link.send_text(header("finish-task")).unwrap();

        for _ in 0..100 {
            if sink.0.lock().unwrap().len() >= 5 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let frames = sink.0.lock().unwrap().clone();
        assert_eq!(frames.len(), 5);
        assert!(matches!(&frames[0], InboundFrame::Text(t) if t.contains("task-started")));
        assert!(matches!(&frames[1], InboundFrame::Text(t) if t.contains("result-generated")));
        assert_eq!(frames[2], InboundFrame::Binary(vec![0; 4]));
        assert_eq!(frames[3], InboundFrame::Binary(vec![1; 2]));
        assert!(matches!(&frames[4], InboundFrame::Text(t) if t.contains("task-finished")));
        assert_eq!(
            connector.sent_actions(),
            vec!["run-task", "continue-task", "finish-task"]
        );
        assert_eq!(connector.sent_texts(), vec!["hi", "hi", "hi"]);
    }

    #[test]
    fn closed_link_rejects_sends() {
        let connector = ScriptedConnector::new();
        let link = connector
            .connect(
                &ConnectRequest::new("wss://mock", "k"),
                Arc::new(Sink::default()),
                Duration::from_secs(1),
            )
            .unwrap();
        link.close();
        assert!(link.send_text("{}".to_string()).is_err());
        assert!(connector.was_closed());
    }
}
