//! The voice client: one conversation with one bot.
//!
//! [`VoiceClient`] ties the channel, the capture pipeline, the VAD monitor and
//! the playback scheduler together and drives the conversation state from
//! the server's control messages.

use crate::audio::output::AudioOutput;
use crate::audio::pipeline::{CapturePipeline, FrameSink, PipelineConfig, PipelineStats, SourceFactory};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::vad::{VadConfig, VadMonitor};
use crate::channel::{
    ChannelConfig, ChannelManager, ConnectionState, Connector, CredentialProvider, DisconnectInfo,
};
use crate::defaults;
use crate::error::{Result, SharedError, VoiceLinkError};
use crate::events::{Registry, Subscription};
use crate::session::protocol::{
    ClientMessage, ServerEvent, Transcript, VoiceSettings, VoiceSettingsUpdate, VoiceStartPayload,
};
use crate::session::state::VoiceState;
use crate::sync::lock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

/// What to talk to and how.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectParams {
    pub bot_id: String,
    /// Existing conversation to continue.
    pub chat_id: Option<String>,
    pub system_prompt: Option<String>,
    pub models: Option<BTreeMap<String, String>>,
    pub capabilities: Option<Vec<String>>,
    pub tool_configs: Option<Map<String, Value>>,
    pub voice_settings: VoiceSettings,
}

impl ConnectParams {
    pub fn new(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            ..Self::default()
        }
    }
}

/// Snapshot of the active conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSession {
    pub bot_id: String,
    /// Set by the caller or assigned by the server in `session_ready`.
    pub chat_id: Option<String>,
    pub session_id: Option<String>,
    pub system_prompt: Option<String>,
    pub models: Option<BTreeMap<String, String>>,
    pub capabilities: Option<Vec<String>>,
    pub tool_configs: Option<Map<String, Value>>,
    pub voice_settings: VoiceSettings,
    pub state: VoiceState,
}

impl VoiceSession {
    fn new(params: ConnectParams) -> Self {
        Self {
            bot_id: params.bot_id,
            chat_id: params.chat_id,
            session_id: None,
            system_prompt: params.system_prompt,
            models: params.models,
            capabilities: params.capabilities,
            tool_configs: params.tool_configs,
            voice_settings: params.voice_settings,
            state: VoiceState::Connecting,
        }
    }

    fn start_payload(&self) -> VoiceStartPayload {
        VoiceStartPayload {
            bot_id: self.bot_id.clone(),
            chat_id: self.chat_id.clone(),
            system_prompt: self.system_prompt.clone(),
            models: self.models.clone(),
            capabilities: self.capabilities.clone(),
            tool_configs: self.tool_configs.clone(),
            voice_settings: Some(self.voice_settings.clone()),
        }
    }
}

/// Configuration for a [`VoiceClient`].
#[derive(Debug, Clone)]
pub struct VoiceClientConfig {
    pub channel: ChannelConfig,
    pub pipeline: PipelineConfig,
    pub vad: VadConfig,
    /// Rate of inbound speech unless `audio_start` declares another.
    pub playback_rate: u32,
    /// Send `end_turn` when the VAD detects the end of an utterance.
    pub auto_end_turn: bool,
}

impl Default for VoiceClientConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            pipeline: PipelineConfig::default(),
            vad: VadConfig::default(),
            playback_rate: defaults::PLAYBACK_SAMPLE_RATE,
            auto_end_turn: true,
        }
    }
}

struct ClientInner {
    playback_rate: u32,
    auto_end_turn: bool,
    channel: ChannelManager<ServerEvent>,
    pipeline: CapturePipeline,
    vad: VadMonitor,
    playback: PlaybackScheduler,
    session: Mutex<Option<VoiceSession>>,
    state: Mutex<VoiceState>,
    on_state_change: Registry<VoiceState>,
    on_event: Registry<ServerEvent>,
    on_transcript: Registry<Transcript>,
    on_audio_level: Registry<f32>,
    on_error: Registry<SharedError>,
    on_disconnect: Registry<DisconnectInfo>,
}

/// A voice conversation client.
///
/// Must be used from within a tokio runtime.
pub struct VoiceClient {
    inner: Arc<ClientInner>,
}

impl VoiceClient {
    pub fn new(
        config: VoiceClientConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        source_factory: SourceFactory,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let channel = ChannelManager::new(config.channel, connector, credentials);
        let sink: Arc<dyn FrameSink> = Arc::new(channel.clone());
        let inner = Arc::new(ClientInner {
            playback_rate: config.playback_rate,
            auto_end_turn: config.auto_end_turn,
            pipeline: CapturePipeline::new(config.pipeline, sink, source_factory),
            vad: VadMonitor::new(config.vad),
            playback: PlaybackScheduler::with_input_rate(output, config.playback_rate),
            channel,
            session: Mutex::new(None),
            state: Mutex::new(VoiceState::Disconnected),
            on_state_change: Registry::new("voice.state"),
            on_event: Registry::new("voice.event"),
            on_transcript: Registry::new("voice.transcript"),
            on_audio_level: Registry::new("voice.audio_level"),
            on_error: Registry::new("voice.error"),
            on_disconnect: Registry::new("voice.disconnect"),
        });
        ClientInner::wire(&inner);
        Self { inner }
    }

    /// Start a conversation and open the channel.
    ///
    /// `voice_start` is sent on every channel open, including reconnects.
    /// A no-op while a conversation is already connecting or open.
    ///
    /// # Errors
    /// - `VoiceLinkError::Authentication` if no credential is available; the
    ///   client returns to `Disconnected`.
    /// - `VoiceLinkError::ChannelConnection` if the handshake fails; the client
    ///   keeps reconnecting in `Connecting` while attempts remain.
    pub async fn connect(&self, params: ConnectParams) -> Result<()> {
        let channel_busy = self.inner.channel.state() != ConnectionState::Closed;
        {
            let mut session = lock(&self.inner.session);
            if session.is_some() && channel_busy {
                tracing::debug!("Voice session already active; ignoring connect");
                return Ok(());
            }
            tracing::info!(bot_id = %params.bot_id, "Starting voice session");
            *session = Some(VoiceSession::new(params));
        }
        self.inner.set_state(VoiceState::Connecting);

        match self.inner.channel.connect().await {
            Ok(()) => Ok(()),
            Err(error) => {
                if error.is_fatal() {
                    self.inner.teardown();
                }
                Err(error)
            }
        }
    }

    /// End the conversation: close the channel, release the microphone and
    /// silence playback. Safe in any state.
    pub fn disconnect(&self) {
        lock(&self.inner.session).take();
        self.inner.channel.disconnect();
        self.inner.teardown();
    }

    /// Open the microphone and start voice activity detection.
    ///
    /// # Errors
    /// Returns `VoiceLinkError::MicrophoneAccess` if the device cannot be
    /// opened; the channel and playback are unaffected.
    pub fn start_mic(&self) -> Result<()> {
        self.inner.pipeline.start_mic()?;
        if let Err(error) = self.inner.vad.start(self.inner.pipeline.tap()) {
            self.inner.pipeline.stop_mic();
            return Err(error);
        }
        Ok(())
    }

    pub fn stop_mic(&self) {
        self.inner.vad.stop();
        self.inner.pipeline.stop_mic();
    }

    /// Mute or unmute the microphone and tell the server if connected.
    pub fn set_muted(&self, muted: bool) {
        self.inner.pipeline.set_muted(muted);
        if self.inner.channel.is_open() {
            let message = if muted {
                ClientMessage::Mute {}
            } else {
                ClientMessage::Unmute {}
            };
            self.inner.send(&message);
        }
    }

    pub fn is_muted(&self) -> bool {
        self.inner.pipeline.is_muted()
    }

    pub fn is_mic_active(&self) -> bool {
        self.inner.pipeline.is_running()
    }

    /// Tell the server the user finished speaking. Returns false if not sent.
    pub fn send_end_turn(&self) -> bool {
        self.inner.send_end_turn()
    }

    /// Cut the bot off: local playback stops at once, then `interrupt` is sent.
    pub fn send_interrupt(&self) -> bool {
        self.inner.playback.stop_playback();
        self.inner.send(&ClientMessage::Interrupt {})
    }

    /// Change voice settings mid-conversation.
    ///
    /// The delta is merged into the session and sent as `config_update`.
    /// Returns false if nothing was sent.
    pub fn update_config(&self, update: VoiceSettingsUpdate) -> bool {
        if update.is_empty() {
            return false;
        }
        if let Some(session) = lock(&self.inner.session).as_mut() {
            update.apply_to(&mut session.voice_settings);
        }
        self.inner.send(&ClientMessage::ConfigUpdate(update))
    }

    pub fn state(&self) -> VoiceState {
        *lock(&self.inner.state)
    }

    /// Copy of the active conversation, if any.
    pub fn session(&self) -> Option<VoiceSession> {
        lock(&self.inner.session).clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.channel.state()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playback.is_playing()
    }

    pub fn capture_stats(&self) -> &PipelineStats {
        self.inner.pipeline.stats()
    }

    pub fn on_state_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&VoiceState) + Send + Sync + 'static,
    {
        self.inner.on_state_change.subscribe(handler)
    }

    /// Every control message from the server, known or not.
    pub fn on_event<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.inner.on_event.subscribe(handler)
    }

    pub fn on_transcript<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Transcript) + Send + Sync + 'static,
    {
        self.inner.on_transcript.subscribe(handler)
    }

    /// Microphone level (RMS) on every VAD tick.
    pub fn on_audio_level<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&f32) + Send + Sync + 'static,
    {
        self.inner.on_audio_level.subscribe(handler)
    }

    pub fn on_error<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SharedError) + Send + Sync + 'static,
    {
        self.inner.on_error.subscribe(handler)
    }

    pub fn on_disconnect<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DisconnectInfo) + Send + Sync + 'static,
    {
        self.inner.on_disconnect.subscribe(handler)
    }
}

impl ClientInner {
    /// Subscribe to the components. Handlers hold weak references so the
    /// client can be dropped while the channel still has tasks in flight.
    fn wire(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        inner.channel.set_reconnect_guard({
            let weak = Weak::clone(&weak);
            move || weak.upgrade().is_some_and(|inner| lock(&inner.session).is_some())
        });

        inner.channel.on_connect({
            let weak = Weak::clone(&weak);
            move || {
                if let Some(inner) = weak.upgrade() {
                    inner.send_voice_start();
                }
            }
        });
        inner.channel.on_message({
            let weak = Weak::clone(&weak);
            move |event: &ServerEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_event(event);
                }
            }
        });
        inner.channel.on_binary({
            let weak = Weak::clone(&weak);
            move |data: &[u8]| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_audio(data);
                }
            }
        });
        inner.channel.on_disconnect({
            let weak = Weak::clone(&weak);
            move |info: &DisconnectInfo| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_disconnect(info);
                }
            }
        });
        inner.channel.on_error({
            let weak = Weak::clone(&weak);
            move |error: &SharedError| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_error.emit(error);
                }
            }
        });
        inner.pipeline.on_error({
            let weak = Weak::clone(&weak);
            move |error: &SharedError| {
                if let Some(inner) = weak.upgrade() {
                    // Capture died mid-session; the detector has nothing left to read.
                    if !inner.pipeline.is_running() {
                        inner.vad.stop();
                    }
                    inner.on_error.emit(error);
                }
            }
        });
        inner.vad.on_level({
            let weak = Weak::clone(&weak);
            move |level: &f32| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_audio_level.emit(level);
                }
            }
        });
        inner.vad.on_end_of_turn(move || {
            if let Some(inner) = weak.upgrade()
                && inner.auto_end_turn
            {
                inner.send_end_turn();
            }
        });
    }

    fn send(&self, message: &ClientMessage) -> bool {
        match self.channel.send_json(message) {
            Ok(sent) => sent,
            Err(e) => {
                tracing::warn!("Failed to encode control message: {}", e);
                false
            }
        }
    }

    fn send_voice_start(&self) {
        let payload = match lock(&self.session).as_ref() {
            Some(session) => session.start_payload(),
            None => return,
        };
        tracing::debug!(bot_id = %payload.bot_id, "Sending voice_start");
        if !self.send(&ClientMessage::VoiceStart(payload)) {
            tracing::warn!("voice_start not sent; channel closed again");
        }
    }

    fn send_end_turn(&self) -> bool {
        let sent = self.send(&ClientMessage::EndTurn {});
        if sent {
            tracing::debug!("End of turn sent");
        }
        sent
    }

    fn handle_event(&self, event: &ServerEvent) {
        tracing::trace!(kind = event.kind(), "Server event");
        match event {
            ServerEvent::SessionReady(ready) => {
                if let Some(session) = lock(&self.session).as_mut() {
                    if ready.session_id.is_some() {
                        session.session_id = ready.session_id.clone();
                    }
                    if ready.chat_id.is_some() {
                        session.chat_id = ready.chat_id.clone();
                    }
                }
            }
            ServerEvent::AudioStart(start) => {
                self.playback
                    .set_input_rate(start.sample_rate.unwrap_or(self.playback_rate));
            }
            ServerEvent::Transcript(transcript) => self.on_transcript.emit(transcript),
            ServerEvent::Error(error) => {
                tracing::warn!(code = ?error.code, "Server error: {}", error.message);
                self.on_error.emit(&Arc::new(VoiceLinkError::Protocol {
                    message: error.message.clone(),
                }));
            }
            _ => {}
        }

        if let Some(next) = VoiceState::after(event) {
            self.set_state(next);
        }
        self.on_event.emit(event);
    }

    fn handle_audio(&self, data: &[u8]) {
        if let Err(error) = self.playback.enqueue(data) {
            tracing::error!("Failed to schedule playback: {}", error);
            self.on_error.emit(&Arc::new(error));
        }
    }

    fn handle_disconnect(&self, info: &DisconnectInfo) {
        if info.will_reconnect {
            self.set_state(VoiceState::Connecting);
        } else {
            lock(&self.session).take();
            self.teardown();
        }
        self.on_disconnect.emit(info);
    }

    /// Release the microphone and playback and settle in `Disconnected`.
    fn teardown(&self) {
        self.vad.stop();
        self.pipeline.stop_mic();
        self.playback.stop_playback();
        lock(&self.session).take();
        self.set_state(VoiceState::Disconnected);
    }

    fn set_state(&self, next: VoiceState) {
        let previous = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut *state, next)
        };
        if let Some(session) = lock(&self.session).as_mut() {
            session.state = next;
        }
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Voice state changed");
            self.on_state_change.emit(&next);
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.channel.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::convert::i16_to_pcm16_le;
    use crate::audio::output::VirtualOutput;
    use crate::audio::recorder::{AudioSource, CaptureConstraints, MockAudioSource};
    use crate::channel::{MockConnector, MockPeer, StaticCredentials};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        client: VoiceClient,
        connector: Arc<MockConnector>,
        output: Arc<VirtualOutput>,
        states: Arc<Mutex<Vec<VoiceState>>>,
    }

    fn harness_with(connector: MockConnector, source: MockAudioSource) -> Harness {
        let factory: SourceFactory = Arc::new(move |_: &CaptureConstraints| {
            Ok(Box::new(source.clone()) as Box<dyn AudioSource>)
        });
        harness_from_factory(connector, factory)
    }

    fn harness_from_factory(connector: MockConnector, factory: SourceFactory) -> Harness {
        let connector = Arc::new(connector);
        let output = Arc::new(VirtualOutput::new(24000));
        let client = VoiceClient::new(
            VoiceClientConfig::default(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(StaticCredentials::new("secret")),
            factory,
            Arc::clone(&output) as Arc<dyn AudioOutput>,
        );
        let states = Arc::new(Mutex::new(Vec::new()));
        {
            let states = Arc::clone(&states);
            client.on_state_change(move |s| states.lock().unwrap().push(*s));
        }
        Harness {
            client,
            connector,
            output,
            states,
        }
    }

    fn harness() -> Harness {
        harness_with(MockConnector::accepting(), MockAudioSource::new())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn connected(h: &Harness) -> MockPeer {
        h.client.connect(ConnectParams::new("bot-1")).await.unwrap();
        h.connector.take_peer().unwrap()
    }

    #[tokio::test]
    async fn test_voice_start_sent_on_open() {
        let h = harness();
        let mut params = ConnectParams::new("bot-1");
        params.chat_id = Some("chat-9".to_string());
        params.system_prompt = Some("Be brief.".to_string());
        h.client.connect(params).await.unwrap();
        let mut peer = h.connector.take_peer().unwrap();

        let sent = peer.drain_json();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "voice_start");
        assert_eq!(sent[0]["payload"]["bot_id"], "bot-1");
        assert_eq!(sent[0]["payload"]["chat_id"], "chat-9");
        assert_eq!(sent[0]["payload"]["system_prompt"], "Be brief.");
        assert_eq!(sent[0]["payload"]["voice_settings"]["voice"], "alloy");
        assert_eq!(h.client.state(), VoiceState::Connecting);
    }

    #[tokio::test]
    async fn test_server_events_drive_state() {
        let h = harness();
        let peer = connected(&h).await;

        for kind in ["session_ready", "transcribing", "thinking", "audio_start", "audio_end", "turn_complete"] {
            peer.send_json(&json!({"type": kind})).unwrap();
        }
        settle().await;

        assert_eq!(
            *h.states.lock().unwrap(),
            vec![
                VoiceState::Connecting,
                VoiceState::Idle,
                VoiceState::Listening,
                VoiceState::Thinking,
                VoiceState::Speaking,
                VoiceState::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_session_ready_records_server_ids() {
        let h = harness();
        let peer = connected(&h).await;
        peer.send_json(&json!({
            "type": "session_ready",
            "payload": {"session_id": "s-1", "chat_id": "c-1"}
        }))
        .unwrap();
        settle().await;

        let session = h.client.session().unwrap();
        assert_eq!(session.session_id.as_deref(), Some("s-1"));
        assert_eq!(session.chat_id.as_deref(), Some("c-1"));
        assert_eq!(session.state, VoiceState::Idle);
    }

    #[tokio::test]
    async fn test_transcripts_and_unknown_events_are_republished() {
        let h = harness();
        let peer = connected(&h).await;
        let transcripts = Arc::new(Mutex::new(Vec::new()));
        let kinds = Arc::new(Mutex::new(Vec::new()));
        {
            let transcripts = Arc::clone(&transcripts);
            h.client
                .on_transcript(move |t| transcripts.lock().unwrap().push(t.text.clone()));
            let kinds = Arc::clone(&kinds);
            h.client
                .on_event(move |e| kinds.lock().unwrap().push(e.kind().to_string()));
        }

        peer.send_json(&json!({"type": "transcript", "payload": {"text": "hi there"}}))
            .unwrap();
        peer.send_json(&json!({"type": "usage", "payload": {"tokens": 12}}))
            .unwrap();
        settle().await;

        assert_eq!(*transcripts.lock().unwrap(), vec!["hi there".to_string()]);
        assert_eq!(*kinds.lock().unwrap(), vec!["transcript", "usage"]);
        assert_eq!(h.client.state(), VoiceState::Thinking);
    }

    #[tokio::test]
    async fn test_server_error_enters_error_state_and_publishes() {
        let h = harness();
        let peer = connected(&h).await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            h.client
                .on_error(move |e| errors.lock().unwrap().push(e.to_string()));
        }

        peer.send_json(&json!({"type": "error", "payload": {"message": "bot offline"}}))
            .unwrap();
        settle().await;

        assert_eq!(h.client.state(), VoiceState::Error);
        assert_eq!(
            *errors.lock().unwrap(),
            vec!["Protocol error: bot offline".to_string()]
        );

        peer.send_json(&json!({"type": "session_ready"})).unwrap();
        settle().await;
        assert_eq!(h.client.state(), VoiceState::Idle);
    }

    #[tokio::test]
    async fn test_inbound_audio_is_scheduled() {
        let h = harness();
        let peer = connected(&h).await;

        peer.send_binary(i16_to_pcm16_le(&vec![1000i16; 2400]));
        peer.send_binary(i16_to_pcm16_le(&vec![1000i16; 2400]));
        settle().await;

        let units = h.output.units();
        assert_eq!(units.len(), 2);
        assert!((units[1].start - units[0].end()).abs() < 1e-9);
        assert!(h.client.is_playing());
    }

    #[tokio::test]
    async fn test_audio_start_declares_input_rate() {
        let h = harness();
        let peer = connected(&h).await;

        peer.send_json(&json!({"type": "audio_start", "payload": {"sample_rate": 16000}}))
            .unwrap();
        peer.send_binary(i16_to_pcm16_le(&vec![1000i16; 1600]));
        settle().await;

        // 16 kHz to 24 kHz; the final interpolation step waits for the next chunk.
        assert_eq!(h.output.units()[0].samples.len(), 2399);
    }

    #[tokio::test]
    async fn test_interrupt_stops_playback_first() {
        let h = harness();
        let mut peer = connected(&h).await;
        peer.send_binary(i16_to_pcm16_le(&vec![1000i16; 24000]));
        settle().await;
        peer.drain();

        assert!(h.client.send_interrupt());
        assert!(!h.client.is_playing());
        assert!(h.output.units().iter().all(|u| u.halted));

        let sent = peer.drain_json();
        assert_eq!(sent, vec![json!({"type": "interrupt", "payload": {}})]);
    }

    #[tokio::test]
    async fn test_update_config_merges_and_sends_delta() {
        let h = harness();
        let mut peer = connected(&h).await;
        peer.drain();

        let update = VoiceSettingsUpdate {
            voice: Some("nova".to_string()),
            ..VoiceSettingsUpdate::default()
        };
        assert!(h.client.update_config(update));
        assert!(!h.client.update_config(VoiceSettingsUpdate::default()));

        assert_eq!(h.client.session().unwrap().voice_settings.voice, "nova");
        assert_eq!(
            peer.drain_json(),
            vec![json!({"type": "config_update", "payload": {"voice": "nova"}})]
        );
    }

    #[tokio::test]
    async fn test_controls_are_dropped_when_disconnected() {
        let h = harness();
        assert!(!h.client.send_end_turn());
        assert!(!h.client.send_interrupt());
        h.client.set_muted(true);
        assert!(h.client.is_muted());
        assert_eq!(h.connector.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_mute_sends_control_message() {
        let h = harness();
        let mut peer = connected(&h).await;
        peer.drain();

        h.client.set_muted(true);
        h.client.set_muted(false);

        let kinds: Vec<_> = peer
            .drain_json()
            .into_iter()
            .map(|m| m["type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(kinds, vec!["mute", "unmute"]);
    }

    #[tokio::test]
    async fn test_disconnect_tears_everything_down() {
        let h = harness();
        let peer = connected(&h).await;
        h.client.start_mic().unwrap();
        peer.send_binary(i16_to_pcm16_le(&vec![1000i16; 24000]));
        settle().await;

        h.client.disconnect();

        assert_eq!(h.client.state(), VoiceState::Disconnected);
        assert!(h.client.session().is_none());
        assert!(!h.client.is_mic_active());
        assert!(!h.client.is_playing());
        assert!(peer.is_closed_by_client());

        // Idempotent.
        h.client.disconnect();
        assert_eq!(h.client.state(), VoiceState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_close_reconnects_and_resends_voice_start() {
        let h = harness();
        let peer = connected(&h).await;
        peer.send_json(&json!({"type": "session_ready", "payload": {"chat_id": "c-7"}}))
            .unwrap();
        settle().await;

        peer.close(1006, "network lost");
        settle().await;
        assert_eq!(h.client.state(), VoiceState::Connecting);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let mut second = h.connector.take_peer().unwrap();
        let sent = second.drain_json();
        assert_eq!(sent[0]["type"], "voice_start");
        assert_eq!(sent[0]["payload"]["chat_id"], "c-7");
    }

    #[tokio::test]
    async fn test_missing_credentials_return_to_disconnected() {
        let connector = Arc::new(MockConnector::accepting());
        let client = VoiceClient::new(
            VoiceClientConfig::default(),
            Arc::clone(&connector) as Arc<dyn Connector>,
            Arc::new(StaticCredentials::anonymous()),
            Arc::new(|_: &CaptureConstraints| {
                Ok(Box::new(MockAudioSource::new()) as Box<dyn AudioSource>)
            }),
            Arc::new(VirtualOutput::new(24000)),
        );

        let result = client.connect(ConnectParams::new("bot-1")).await;

        assert!(matches!(result, Err(VoiceLinkError::Authentication { .. })));
        assert_eq!(client.state(), VoiceState::Disconnected);
        assert!(client.session().is_none());
        assert_eq!(connector.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_mic_failure_leaves_session_intact() {
        let h = harness_with(
            MockConnector::accepting(),
            MockAudioSource::new().with_start_failure(),
        );
        let _peer = connected(&h).await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            h.client
                .on_error(move |e| errors.lock().unwrap().push(e.to_string()));
        }

        let result = h.client.start_mic();

        assert!(matches!(result, Err(VoiceLinkError::MicrophoneAccess { .. })));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert_eq!(h.client.connection_state(), ConnectionState::Open);
        assert!(!h.client.is_mic_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_capture_failure_mid_session_allows_restart() {
        let opened = Arc::new(AtomicUsize::new(0));
        let factory: SourceFactory = {
            let opened = Arc::clone(&opened);
            Arc::new(move |_: &CaptureConstraints| {
                let source = MockAudioSource::new().with_samples(vec![500i16; 1600]);
                let source = if opened.fetch_add(1, Ordering::SeqCst) == 0 {
                    source.with_read_failure_after(2)
                } else {
                    source
                };
                Ok(Box::new(source) as Box<dyn AudioSource>)
            })
        };
        let h = harness_from_factory(MockConnector::accepting(), factory);
        let _peer = connected(&h).await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            h.client
                .on_error(move |e| errors.lock().unwrap().push(e.to_string()));
        }

        h.client.start_mic().unwrap();
        assert!(h.client.is_mic_active());
        for _ in 0..400 {
            if !errors.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(!h.client.is_mic_active());
        assert!(!h.client.inner.vad.is_running());
        assert_eq!(h.client.connection_state(), ConnectionState::Open);

        h.client.start_mic().unwrap();
        assert!(h.client.is_mic_active());
        assert!(h.client.inner.vad.is_running());
        assert_eq!(opened.load(Ordering::SeqCst), 2);
        h.client.stop_mic();
        assert!(!h.client.is_mic_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mic_frames_reach_the_server() {
        let h = harness_with(
            MockConnector::accepting(),
            MockAudioSource::new().with_samples(vec![3000i16; 1600]),
        );
        let mut peer = connected(&h).await;
        h.client.start_mic().unwrap();

        let mut binary = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while binary < 2 && tokio::time::Instant::now() < deadline {
            if let Ok(Some(frame)) =
                tokio::time::timeout(Duration::from_millis(200), peer.recv()).await
                && matches!(frame, crate::channel::Frame::Binary(_))
            {
                binary += 1;
            }
        }
        h.client.stop_mic();

        assert!(binary >= 2);
        assert!(h.client.capture_stats().sent() >= 2);
    }
}
