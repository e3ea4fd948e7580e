//! Gemini Live wire connector.
//!
//! Speaks the JSON-over-WebSocket `BidiGenerateContent` protocol: one `setup`
//! frame, a `setupComplete` acknowledgement, then `realtimeInput` audio and
//! `clientContent` text going up while `serverContent` comes down. Each open
//! link gets a writer task and a reader task; the reader ends its event stream
//! after `turnComplete` or `goAway`, matching how the upstream bounds turns.

use super::{Connection, Connector, LiveError, SessionSetup, UpstreamEvent, UpstreamRequest};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

pub const INPUT_AUDIO_MIME: &str = "audio/pcm;rate=16000";
pub const OUTPUT_AUDIO_MIME: &str = "audio/pcm;rate=24000";

#[derive(Debug, Clone)]
pub struct GeminiConnector {
    api_key: String,
    endpoint: String,
    model: String,
    voice: String,
}

impl GeminiConnector {
    pub fn new(api_key: String, endpoint: String, model: String, voice: String) -> Self {
        Self { api_key, endpoint, model, voice }
    }

    fn setup_frame(&self, setup: &SessionSetup) -> Value {
        let mut resumption = json!({});
        if let Some(handle) = &setup.resumption_handle {
            resumption["handle"] = json!(handle);
        }

        json!({
            "setup": {
                "model": format!("models/{}", self.model.trim_start_matches("models/")),
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": self.voice } }
                    }
                },
                "systemInstruction": { "parts": [{ "text": setup.instructions }] },
                "inputAudioTranscription": {},
                "outputAudioTranscription": {},
                "realtimeInputConfig": { "activityHandling": "START_OF_ACTIVITY_INTERRUPTS" },
                "contextWindowCompression": { "slidingWindow": {} },
                "sessionResumption": resumption,
            }
        })
    }
}

/// Encode an outgoing request, or `None` for [`UpstreamRequest::Close`].
pub fn encode_request(request: &UpstreamRequest) -> Option<Value> {
    match request {
        UpstreamRequest::Audio { data, mime_type } => Some(json!({
            "realtimeInput": { "audio": { "data": B64.encode(data), "mimeType": mime_type } }
        })),
        UpstreamRequest::Text { text, turn_complete } => Some(json!({
            "clientContent": {
                "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                "turnComplete": turn_complete,
            }
        })),
        UpstreamRequest::Close => None,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    session_resumption_update: Option<ResumptionUpdate>,
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    output_transcription: Option<Transcription>,
    input_transcription: Option<Transcription>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumptionUpdate {
    new_handle: Option<String>,
    #[serde(default)]
    resumable: bool,
}

impl ServerFrame {
    pub fn parse(raw: &[u8]) -> Result<Self, LiveError> {
        serde_json::from_slice(raw).map_err(|e| LiveError::Protocol(e.to_string()))
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

/// Flatten one server frame into adapter events; `TurnComplete` always comes last.
pub fn translate(frame: ServerFrame) -> Vec<UpstreamEvent> {
    let mut events = Vec::new();

    if let Some(update) = frame.session_resumption_update {
        if let (true, Some(handle)) = (update.resumable, update.new_handle) {
            events.push(UpstreamEvent::ResumptionHandle(handle));
        }
    }

    if let Some(content) = frame.server_content {
        if content.interrupted {
            events.push(UpstreamEvent::Interrupted);
        }
        for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
            let Some(inline) = part.inline_data else { continue };
            match B64.decode(inline.data.as_bytes()) {
                Ok(data) => events.push(UpstreamEvent::Audio {
                    data,
                    mime_type: inline.mime_type.unwrap_or_else(|| OUTPUT_AUDIO_MIME.to_string()),
                }),
                Err(e) => warn!(error = %e, "Dropping undecodable audio part"),
            }
        }
        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            events.push(UpstreamEvent::OutputTranscript(text));
        }
        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            events.push(UpstreamEvent::InputTranscript(text));
        }
        if content.turn_complete {
            events.push(UpstreamEvent::TurnComplete);
        }
    }

    if frame.go_away.is_some() {
        events.push(UpstreamEvent::GoAway);
    }

    events
}

fn frame_bytes(message: Message) -> Option<Vec<u8>> {
    match message {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        _ => None,
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn open(&self, setup: &SessionSetup) -> Result<Connection, LiveError> {
        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| LiveError::Connect(e.to_string()))?;
        let (mut sink, mut source) = socket.split();

        sink.send(Message::Text(self.setup_frame(setup).to_string()))
            .await
            .map_err(|e| LiveError::Connect(e.to_string()))?;

        loop {
            match source.next().await {
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    return Err(LiveError::Connect(format!("closed during setup: {}", reason)));
                }
                None => return Err(LiveError::Connect("closed during setup".to_string())),
                Some(Ok(message)) => {
                    let Some(raw) = frame_bytes(message) else { continue };
                    if ServerFrame::parse(&raw)?.is_setup_complete() {
                        break;
                    }
                }
                Some(Err(e)) => return Err(LiveError::Connect(e.to_string())),
            }
        }
        debug!(model = %self.model, resumed = setup.resumption_handle.is_some(), "Live setup complete");

        let (requests_tx, mut requests_rx) = mpsc::unbounded_channel::<UpstreamRequest>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<UpstreamEvent>();

        tokio::spawn(async move {
            while let Some(request) = requests_rx.recv().await {
                let Some(frame) = encode_request(&request) else { break };
                if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                    warn!(error = %e, "Live socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let message = match message {
                    Ok(Message::Close(_)) => break,
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Live socket read failed");
                        break;
                    }
                };
                let Some(raw) = frame_bytes(message) else { continue };
                let frame = match ServerFrame::parse(&raw) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed live frame");
                        continue;
                    }
                };

                let mut turn_over = false;
                for event in translate(frame) {
                    turn_over |= matches!(event, UpstreamEvent::TurnComplete | UpstreamEvent::GoAway);
                    if events_tx.send(event).is_err() {
                        return;
                    }
                }
                if turn_over {
                    break;
                }
            }
        });

        Ok(Connection { requests: requests_tx, events: events_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: Value) -> ServerFrame {
        ServerFrame::parse(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_translate_server_content() {
        let events = translate(frame(json!({
            "serverContent": {
                "modelTurn": { "parts": [{ "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAEC" } }] },
                "outputTranscription": { "text": "Hi there" },
                "turnComplete": true
            }
        })));

        assert_eq!(
            events,
            vec![
                UpstreamEvent::Audio { data: vec![0, 1, 2], mime_type: OUTPUT_AUDIO_MIME.to_string() },
                UpstreamEvent::OutputTranscript("Hi there".into()),
                UpstreamEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_translate_control_frames() {
        assert_eq!(
            translate(frame(json!({ "serverContent": { "interrupted": true } }))),
            vec![UpstreamEvent::Interrupted]
        );
        assert_eq!(
            translate(frame(json!({ "sessionResumptionUpdate": { "newHandle": "abc", "resumable": true } }))),
            vec![UpstreamEvent::ResumptionHandle("abc".into())]
        );
        assert!(translate(frame(json!({ "sessionResumptionUpdate": { "newHandle": "abc", "resumable": false } })))
            .is_empty());
        assert_eq!(translate(frame(json!({ "goAway": { "timeLeft": "10s" } }))), vec![UpstreamEvent::GoAway]);
        assert!(frame(json!({ "setupComplete": {} })).is_setup_complete());
    }

    #[test]
    fn test_encode_requests() {
        let audio = encode_request(&UpstreamRequest::Audio {
            data: vec![0, 1, 2],
            mime_type: INPUT_AUDIO_MIME.to_string(),
        })
        .unwrap();
        assert_eq!(audio["realtimeInput"]["audio"]["data"], "AAEC");
        assert_eq!(audio["realtimeInput"]["audio"]["mimeType"], INPUT_AUDIO_MIME);

        let text = encode_request(&UpstreamRequest::Text { text: "hey".into(), turn_complete: false }).unwrap();
        assert_eq!(text["clientContent"]["turns"][0]["parts"][0]["text"], "hey");
        assert_eq!(text["clientContent"]["turnComplete"], false);

        assert!(encode_request(&UpstreamRequest::Close).is_none());
    }

    #[test]
    fn test_setup_frame_carries_resumption_handle() {
        let connector = GeminiConnector::new("k".into(), "wss://x".into(), "gemini-live".into(), "Kore".into());
        let fresh = connector.setup_frame(&SessionSetup { instructions: "hi".into(), resumption_handle: None });
        assert_eq!(fresh["setup"]["model"], "models/gemini-live");
        assert_eq!(fresh["setup"]["sessionResumption"], json!({}));

        let resumed = connector.setup_frame(&SessionSetup {
            instructions: "hi".into(),
            resumption_handle: Some("h-9".into()),
        });
        assert_eq!(resumed["setup"]["sessionResumption"]["handle"], "h-9");
        assert_eq!(
            resumed["setup"]["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
    }
}
