//! JSON control frames of the duplex synthesis protocol.
//!
//! Outbound frames carry `header.action` (`run-task`, `continue-task`,
//! `finish-task`), the per-session `task_id` and `streaming = "duplex"`.
//! Inbound text frames carry `header.event`; inbound binary frames are raw
//! audio and never pass through this module.

use crate::error::{Result, SayshError};
use crate::protocol::format::AudioFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Client → service actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    RunTask,
    ContinueTask,
    FinishTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamingMode {
    None,
    In,
    Out,
    Duplex,
}

/// Service → client events.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskEvent {
    TaskStarted,
    ResultGenerated,
    TaskFinished,
    TaskFailed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize)]
struct OutboundHeader<'a> {
    action: Action,
    task_id: &'a str,
    streaming: StreamingMode,
}

#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    header: OutboundHeader<'a>,
    payload: Value,
}

/// Tunable synthesis parameters sent once with `run-task`.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisParameters {
    pub voice: String,
    /// 0-100
    pub volume: u8,
    /// 0.5-2.0
    pub speech_rate: f32,
    /// 0.5-2.0
    pub pitch_rate: f32,
    pub seed: u32,
    pub synthesis_type: u32,
    pub instruction: Option<String>,
    pub language_hints: Option<Vec<String>>,
    /// Merged last; overrides any key above.
    pub additional: Map<String, Value>,
}

impl SynthesisParameters {
    pub fn new(voice: impl Into<String>) -> Self {
        Self {
            voice: voice.into(),
            volume: crate::defaults::VOLUME_PERCENT,
            speech_rate: 1.0,
            pitch_rate: 1.0,
            seed: 0,
            synthesis_type: 0,
            instruction: None,
            language_hints: None,
            additional: Map::new(),
        }
    }
}

/// Frame builder bound to one task id.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    task_id: String,
    model: String,
    format: AudioFormat,
    parameters: SynthesisParameters,
}

impl TaskRequest {
    /// Create a request with a fresh task id.
    ///
    /// A missing or empty model is rejected with `ModelRequired`, a missing
    /// format with `InputRequired`.
    pub fn new(
        model: Option<&str>,
        format: Option<AudioFormat>,
        parameters: SynthesisParameters,
    ) -> Result<Self> {
        let model = match model {
            Some(m) if !m.trim().is_empty() => m.to_string(),
            _ => return Err(SayshError::ModelRequired),
        };
        let format = format.ok_or_else(|| SayshError::InputRequired {
            what: "format".to_string(),
        })?;
        Ok(Self {
            task_id: uuid::Uuid::new_v4().simple().to_string(),
            model,
            format,
            parameters,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn voice(&self) -> &str {
        &self.parameters.voice
    }

    /// `run-task`: model, voice, format and all synthesis parameters.
    pub fn run_task(&self) -> Result<String> {
        let p = &self.parameters;
        let mut parameters = Map::new();
        parameters.insert("voice".into(), Value::from(p.voice.clone()));
        parameters.insert("volume".into(), Value::from(p.volume));
        parameters.insert("text_type".into(), Value::from("PlainText"));
        parameters.insert("sample_rate".into(), Value::from(self.format.sample_rate()));
        parameters.insert("rate".into(), Value::from(p.speech_rate));
        parameters.insert("format".into(), Value::from(self.format.format()));
        parameters.insert("pitch".into(), Value::from(p.pitch_rate));
        parameters.insert("seed".into(), Value::from(p.seed));
        parameters.insert("type".into(), Value::from(p.synthesis_type));
        if self.format.is_opus() {
            parameters.insert("bit_rate".into(), Value::from(self.format.bit_rate()));
        }
        if let Some(ref instruction) = p.instruction {
            parameters.insert("instruction".into(), Value::from(instruction.clone()));
        }
        if let Some(ref hints) = p.language_hints {
            parameters.insert("language_hints".into(), Value::from(hints.clone()));
        }
        for (key, value) in &p.additional {
            parameters.insert(key.clone(), value.clone());
        }

        let mut payload = self.task_payload(Map::new());
        payload.insert("parameters".into(), Value::Object(parameters));
        self.encode(Action::RunTask, Value::Object(payload))
    }

    /// `continue-task`: one chunk of text.
    pub fn continue_task(&self, text: &str) -> Result<String> {
        let mut input = Map::new();
        input.insert("text".into(), Value::from(text));
        let payload = self.task_payload(input);
        self.encode(Action::ContinueTask, Value::Object(payload))
    }

    /// `finish-task`: empty input.
    pub fn finish_task(&self) -> Result<String> {
        let mut payload = Map::new();
        payload.insert("input".into(), Value::Object(Map::new()));
        self.encode(Action::FinishTask, Value::Object(payload))
    }

    fn task_payload(&self, input: Map<String, Value>) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("model".into(), Value::from(self.model.clone()));
        payload.insert("task_group".into(), Value::from("audio"));
        payload.insert("task".into(), Value::from("tts"));
        payload.insert("function".into(), Value::from("SpeechSynthesizer"));
        payload.insert("input".into(), Value::Object(input));
        payload
    }

    fn encode(&self, action: Action, payload: Value) -> Result<String> {
        let frame = OutboundFrame {
            header: OutboundHeader {
                action,
                task_id: &self.task_id,
                streaming: StreamingMode::Duplex,
            },
            payload,
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundHeader {
    pub event: TaskEvent,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// A decoded inbound JSON frame.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub header: InboundHeader,
    /// The whole message as received.
    pub raw: Value,
}

impl InboundMessage {
    /// Decode a text frame. Anything without `header.event` is a protocol fault.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(text).map_err(|e| SayshError::Protocol {
            message: format!("Failed to parse message as JSON: {}", e),
        })?;
        let header = raw
            .get("header")
            .cloned()
            .ok_or_else(|| SayshError::Protocol {
                message: "message has no header".to_string(),
            })?;
        let header: InboundHeader =
            serde_json::from_value(header).map_err(|e| SayshError::Protocol {
                message: format!("Invalid message header: {}", e),
            })?;
        Ok(Self { header, raw })
    }

    pub fn event(&self) -> &TaskEvent {
        &self.header.event
    }

    /// Human-readable failure reason for `task-failed`.
    pub fn failure_reason(&self) -> String {
        match (&self.header.error_code, &self.header.error_message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => self.raw.to_string(),
        }
    }
}
