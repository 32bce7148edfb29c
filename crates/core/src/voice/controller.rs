//! The voice session state machine.
//!
//! `VoiceController` owns the speech input and output providers and reacts to
//! one [`VoiceEvent`] at a time. Provider callbacks, user toggles and inbound
//! replies are all posted to the same channel, so every transition sees the
//! state left by the previous one and no locking is needed around it.

use super::{
    EventReceiver, EventSender, SessionEvent, VoiceError, VoiceEvent, VoiceSettings, VoiceState,
    input::{InputSignal, SpeechInput},
    output::{OutputEvent, SpeechOutput, Utterance, select_voice},
    speech_text::sanitize_for_speech,
};
use crate::{
    chat::MessageSink,
    connection::ConnectionManager,
    message::{ChatMessage, MessageKind},
    observer::Observers,
};
use std::sync::Arc;
use tokio::{
    sync::watch,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

pub struct VoiceController {
    settings: VoiceSettings,
    input: Box<dyn SpeechInput>,
    output: Box<dyn SpeechOutput>,
    sink: Arc<dyn MessageSink>,
    state: VoiceState,
    /// The user wants the microphone on.
    active: bool,
    capability_reported: bool,
    /// Utterance currently being spoken.
    speaking: Option<u64>,
    next_utterance: u64,
    resume_at: Option<Instant>,
    observers: Observers<SessionEvent>,
    state_tx: watch::Sender<VoiceState>,
}

impl VoiceController {
    pub fn new(
        settings: VoiceSettings,
        input: Box<dyn SpeechInput>,
        output: Box<dyn SpeechOutput>,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(VoiceState::Idle);
        Self {
            settings,
            input,
            output,
            sink,
            state: VoiceState::Idle,
            active: false,
            capability_reported: false,
            speaking: None,
            next_utterance: 0,
            resume_at: None,
            observers: Observers::new(),
            state_tx,
        }
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(handler);
    }

    /// A receiver that always holds the latest state.
    pub fn subscribe_state(&self) -> watch::Receiver<VoiceState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> VoiceState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// When the controller will try listening again, if it is waiting to.
    pub fn resume_deadline(&self) -> Option<Instant> {
        self.resume_at
    }

    /// Reports a missing speech input engine, once per session.
    pub fn check_capabilities(&mut self) -> bool {
        if self.input.is_available() {
            return true;
        }
        if !self.capability_reported {
            self.capability_reported = true;
            warn!("Speech input is not available; listening is disabled.");
            self.emit(SessionEvent::Error(VoiceError::CapabilityMissing));
        }
        false
    }

    /// Processes events until every sender is gone, then releases the
    /// providers.
    pub async fn run(mut self, mut events: EventReceiver) {
        self.check_capabilities();
        loop {
            let resume_at = self.resume_at;
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sleep_until(resume_at.unwrap_or_else(Instant::now)), if resume_at.is_some() => {
                    self.resume_at = None;
                    self.handle(VoiceEvent::ResumeListening);
                }
            }
        }
        self.shutdown();
        info!("Voice session finished.");
    }

    pub fn handle(&mut self, event: VoiceEvent) {
        match event {
            VoiceEvent::MicOn => self.mic_on(),
            VoiceEvent::MicOff => self.mic_off(),
            VoiceEvent::ToggleMic if self.active => self.mic_off(),
            VoiceEvent::ToggleMic => self.mic_on(),
            VoiceEvent::Input(event) => {
                if let Some(signal) = self.input.handle(event, Instant::now()) {
                    self.on_input(signal);
                }
            }
            VoiceEvent::Output(event) => self.on_output(event),
            VoiceEvent::Reply(message) => self.on_reply(&message),
            VoiceEvent::ResumeListening => {
                if self.active && self.state == VoiceState::Idle {
                    self.begin_capture();
                }
            }
        }
    }

    fn mic_on(&mut self) {
        if !self.check_capabilities() {
            return;
        }
        if self.active {
            return;
        }
        info!("Microphone on.");
        self.active = true;
        if self.state == VoiceState::Idle {
            self.begin_capture();
        }
    }

    /// Stops capture and abandons any utterance immediately. Observers see
    /// only the move to idle.
    fn mic_off(&mut self) {
        info!("Microphone off.");
        self.active = false;
        self.resume_at = None;
        self.input.stop();
        if self.speaking.take().is_some() {
            self.output.cancel();
        }
        self.set_state(VoiceState::Idle);
    }

    fn begin_capture(&mut self) {
        self.resume_at = None;
        match self.input.start() {
            Ok(()) => self.set_state(VoiceState::Listening),
            Err(e) => {
                warn!(error = %e, "Could not start listening.");
                self.active = false;
                self.emit(SessionEvent::Error(e));
                self.set_state(VoiceState::Idle);
            }
        }
    }

    fn on_input(&mut self, signal: InputSignal) {
        match signal {
            InputSignal::SpeechDetected => match self.state {
                VoiceState::Speaking if self.active => {
                    info!("Barge-in, cancelling speech output.");
                    self.interrupt_output();
                    self.begin_capture();
                }
                VoiceState::Listening => self.emit(SessionEvent::SpeechDetected),
                _ => {}
            },
            InputSignal::Recognized(text) => self.on_recognized(text.trim()),
            InputSignal::Uploading => {
                if self.state == VoiceState::Listening {
                    self.set_state(VoiceState::Uploading);
                }
            }
            InputSignal::Transient(reason) => {
                debug!(reason, "Transient input error.");
                self.keep_listening();
            }
            InputSignal::Ended => self.keep_listening(),
            InputSignal::Failed(error) => {
                warn!(%error, state = %self.state, "Speech input failed.");
                let permanent = matches!(
                    error,
                    VoiceError::CapabilityMissing
                        | VoiceError::Capture(_)
                        | VoiceError::Recognition(_)
                );
                if permanent {
                    self.active = false;
                    self.input.stop();
                }
                self.emit(SessionEvent::Error(error));
                if matches!(self.state, VoiceState::Listening | VoiceState::Uploading) {
                    self.set_state(VoiceState::Idle);
                }
            }
        }
    }

    /// The engine stopping is not the user stopping.
    fn keep_listening(&mut self) {
        if !self.active || self.state != VoiceState::Listening {
            return;
        }
        debug!("Restarting capture.");
        if let Err(e) = self.input.start() {
            warn!(error = %e, "Could not restart listening.");
            self.active = false;
            self.emit(SessionEvent::Error(e));
            self.set_state(VoiceState::Idle);
        }
    }

    fn on_recognized(&mut self, text: &str) {
        if text.is_empty() {
            // An upload that came back blank still ends the turn.
            if self.state == VoiceState::Uploading {
                warn!("Transcription came back empty.");
                self.emit(SessionEvent::Error(VoiceError::Transcription(
                    "empty transcript".to_string(),
                )));
                self.set_state(VoiceState::Idle);
            }
            return;
        }
        match self.state {
            VoiceState::Listening | VoiceState::Uploading => {
                if self.state == VoiceState::Listening {
                    self.input.stop();
                }
                self.forward(text);
                self.set_state(VoiceState::Idle);
            }
            VoiceState::Speaking => {
                info!("Barge-in, cancelling speech output.");
                self.interrupt_output();
                self.forward(text);
                if self.active {
                    self.begin_capture();
                } else {
                    self.set_state(VoiceState::Idle);
                }
            }
            VoiceState::Idle if self.active => {
                self.forward(text);
                self.set_state(VoiceState::Idle);
            }
            VoiceState::Idle => debug!("Ignoring speech while the microphone is off."),
        }
    }

    fn forward(&mut self, text: &str) {
        match self.sink.send_user_text(text) {
            Ok(()) => {
                info!(text, "Sent recognised speech.");
                self.emit(SessionEvent::UserSpeech(text.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "Could not send recognised speech.");
                self.emit(SessionEvent::Error(e.into()));
            }
        }
    }

    fn on_reply(&mut self, message: &ChatMessage) {
        if message.kind() == MessageKind::Error {
            self.emit(SessionEvent::Error(VoiceError::Server(
                message.content().to_string(),
            )));
            return;
        }
        if !message.is_ai_reply() || !self.settings.speak_replies {
            return;
        }
        if self.state == VoiceState::Uploading {
            debug!("Reply arrived during upload, not speaking it.");
            return;
        }
        let text = sanitize_for_speech(message.content());
        if text.is_empty() {
            return;
        }
        match self.state {
            VoiceState::Listening => self.input.stop(),
            VoiceState::Speaking => self.interrupt_output(),
            _ => {}
        }
        self.speak(text);
    }

    fn speak(&mut self, text: String) {
        self.next_utterance += 1;
        let id = self.next_utterance;
        let voice = select_voice(
            &self.output.voices(),
            &self.settings.lang,
            self.settings.gender,
        );
        debug!(id, voice = ?voice.as_ref().map(|v| &v.name), "Speaking reply.");
        let utterance = Utterance {
            id,
            text,
            lang: self.settings.lang.clone(),
            rate: self.settings.rate,
            pitch: self.settings.pitch,
            volume: self.settings.volume,
            voice,
        };
        match self.output.speak(utterance) {
            Ok(()) => {
                self.speaking = Some(id);
                self.set_state(VoiceState::Speaking);
            }
            Err(e) => {
                warn!(error = %e, "Speech output failed.");
                self.emit(SessionEvent::Error(VoiceError::Output(e.to_string())));
                self.set_state(VoiceState::Idle);
            }
        }
    }

    fn interrupt_output(&mut self) {
        if self.speaking.take().is_some() {
            self.output.cancel();
            self.emit(SessionEvent::OutputEnded { interrupted: true });
        }
    }

    fn on_output(&mut self, event: OutputEvent) {
        match event {
            OutputEvent::Started { id } => debug!(id, "Speech output started."),
            OutputEvent::Finished { id } if self.speaking == Some(id) => {
                self.speaking = None;
                self.emit(SessionEvent::OutputEnded { interrupted: false });
                self.set_state(VoiceState::Idle);
            }
            OutputEvent::Failed { id, reason } if self.speaking == Some(id) => {
                self.speaking = None;
                self.emit(SessionEvent::Error(VoiceError::Output(reason)));
                self.set_state(VoiceState::Idle);
            }
            OutputEvent::Finished { id } | OutputEvent::Failed { id, .. } => {
                debug!(id, "Ignoring event for an abandoned utterance.");
            }
        }
    }

    /// Entering idle with the microphone on arms the resume timer.
    fn set_state(&mut self, state: VoiceState) {
        self.resume_at = (state == VoiceState::Idle && self.active)
            .then(|| Instant::now() + self.settings.restart_delay);
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Voice state changed.");
        self.state = state;
        self.state_tx.send_replace(state);
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        self.observers.notify(&event);
    }

    fn shutdown(&mut self) {
        self.active = false;
        self.input.stop();
        if self.speaking.take().is_some() {
            self.output.cancel();
        }
    }
}

/// Posts every inbound chat message to the voice session.
pub fn forward_replies(connection: &ConnectionManager, events: EventSender) {
    connection.on_message(move |message| {
        let _ = events.send(VoiceEvent::Reply(message.clone()));
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chat::{MockMessageSink, SendError},
        message::Sender,
        transcribe::{MockTranscriber, Recording, TranscribeError},
        voice::{
            VoiceGender,
            input::{InputEvent, RecognitionError},
            output::{OutputError, VoiceInfo},
            recording::{MockMediaCapture, RecordingInput},
            vad::VadSettings,
        },
    };
    use std::{sync::Mutex, time::Duration};

    type Calls = Arc<Mutex<Vec<&'static str>>>;

    /// Passes engine events straight through as signals and logs calls.
    struct FakeInput {
        available: bool,
        fail_start: bool,
        calls: Calls,
    }

    impl SpeechInput for FakeInput {
        fn is_available(&self) -> bool {
            self.available
        }

        fn start(&mut self) -> Result<(), VoiceError> {
            self.calls.lock().unwrap().push("start");
            if self.fail_start {
                return Err(VoiceError::Capture("device busy".into()));
            }
            Ok(())
        }

        fn stop(&mut self) {
            self.calls.lock().unwrap().push("stop");
        }

        fn handle(&mut self, event: InputEvent, _now: Instant) -> Option<InputSignal> {
            match event {
                InputEvent::SpeechStarted => Some(InputSignal::SpeechDetected),
                InputEvent::Recognized(text) => Some(InputSignal::Recognized(text)),
                InputEvent::RecognitionEnded => Some(InputSignal::Ended),
                InputEvent::RecognitionFailed(RecognitionError::NoSpeech) => {
                    Some(InputSignal::Transient("no speech".into()))
                }
                InputEvent::RecognitionFailed(e) => {
                    Some(InputSignal::Failed(VoiceError::Recognition(e.to_string())))
                }
                InputEvent::CaptureStopped(_) => Some(InputSignal::Uploading),
                InputEvent::Transcribed { result, .. } => Some(match result {
                    Ok(text) => InputSignal::Recognized(text),
                    Err(e) => InputSignal::Failed(VoiceError::Transcription(e.to_string())),
                }),
                _ => None,
            }
        }
    }

    #[derive(Default)]
    struct OutputLog {
        spoken: Vec<Utterance>,
        cancels: usize,
    }

    struct FakeOutput {
        log: Arc<Mutex<OutputLog>>,
        broken: bool,
    }

    impl SpeechOutput for FakeOutput {
        fn voices(&self) -> Vec<VoiceInfo> {
            vec![
                VoiceInfo::new("Microsoft David", "en-US"),
                VoiceInfo::new("Samantha", "en-US"),
            ]
        }

        fn speak(&mut self, utterance: Utterance) -> Result<(), OutputError> {
            if self.broken {
                return Err(OutputError::Unavailable);
            }
            self.log.lock().unwrap().spoken.push(utterance);
            Ok(())
        }

        fn cancel(&mut self) {
            self.log.lock().unwrap().cancels += 1;
        }
    }

    struct Harness {
        controller: VoiceController,
        calls: Calls,
        output: Arc<Mutex<OutputLog>>,
        events: Arc<Mutex<Vec<SessionEvent>>>,
    }

    impl Harness {
        fn new(sink: MockMessageSink) -> Self {
            Self::build(sink, true, false, false)
        }

        fn build(sink: MockMessageSink, available: bool, fail_start: bool, broken: bool) -> Self {
            let calls = Calls::default();
            let output = Arc::new(Mutex::new(OutputLog::default()));
            let controller = VoiceController::new(
                VoiceSettings::default(),
                Box::new(FakeInput {
                    available,
                    fail_start,
                    calls: calls.clone(),
                }),
                Box::new(FakeOutput {
                    log: output.clone(),
                    broken,
                }),
                Arc::new(sink),
            );
            let events = Arc::new(Mutex::new(Vec::new()));
            let log = events.clone();
            controller.subscribe(move |e| log.lock().unwrap().push(e.clone()));
            Self {
                controller,
                calls,
                output,
                events,
            }
        }

        fn send(&mut self, event: VoiceEvent) {
            self.controller.handle(event);
        }

        fn input(&mut self, event: InputEvent) {
            self.controller.handle(VoiceEvent::Input(event));
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn take_events(&self) -> Vec<SessionEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn last_utterance(&self) -> Utterance {
            self.output.lock().unwrap().spoken.last().cloned().unwrap()
        }
    }

    fn accepting_sink() -> MockMessageSink {
        let mut sink = MockMessageSink::new();
        sink.expect_send_user_text().returning(|_| Ok(()));
        sink
    }

    fn ai(text: &str) -> VoiceEvent {
        VoiceEvent::Reply(ChatMessage::new(MessageKind::Text, text, Sender::Ai).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_from_speech_to_reply_and_back() {
        let mut sink = MockMessageSink::new();
        sink.expect_send_user_text()
            .withf(|text| text == "hello")
            .times(1)
            .returning(|_| Ok(()));
        let mut h = Harness::new(sink);

        h.send(VoiceEvent::ToggleMic);
        assert_eq!(h.controller.state(), VoiceState::Listening);

        h.input(InputEvent::Recognized(" hello ".into()));
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert_eq!(h.calls(), vec!["start", "stop"]);

        h.send(ai("hi there"));
        assert_eq!(h.controller.state(), VoiceState::Speaking);
        let utterance = h.last_utterance();
        assert_eq!(utterance.text, "hi there");
        assert_eq!(utterance.lang, "en-US");
        assert_eq!(utterance.voice.unwrap().name, "Samantha");

        h.send(VoiceEvent::Output(OutputEvent::Finished { id: utterance.id }));
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert_eq!(
            h.take_events(),
            vec![
                SessionEvent::StateChanged(VoiceState::Listening),
                SessionEvent::UserSpeech("hello".into()),
                SessionEvent::StateChanged(VoiceState::Idle),
                SessionEvent::StateChanged(VoiceState::Speaking),
                SessionEvent::OutputEnded { interrupted: false },
                SessionEvent::StateChanged(VoiceState::Idle),
            ]
        );
        assert_eq!(
            h.controller.resume_deadline(),
            Some(Instant::now() + Duration::from_millis(500))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognized_speech_barges_in_on_output() {
        let mut h = Harness::new(accepting_sink());
        h.send(VoiceEvent::MicOn);
        h.send(ai("let me tell you a long story"));
        assert_eq!(h.controller.state(), VoiceState::Speaking);
        h.take_events();

        h.input(InputEvent::Recognized("wait".into()));
        assert_eq!(h.controller.state(), VoiceState::Listening);
        assert_eq!(h.output.lock().unwrap().cancels, 1);
        assert_eq!(
            h.take_events(),
            vec![
                SessionEvent::OutputEnded { interrupted: true },
                SessionEvent::UserSpeech("wait".into()),
                SessionEvent::StateChanged(VoiceState::Listening),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_onset_barges_in_on_output() {
        let mut h = Harness::new(accepting_sink());
        h.send(VoiceEvent::MicOn);
        h.send(ai("story time"));
        let first = h.last_utterance().id;

        h.input(InputEvent::SpeechStarted);
        assert_eq!(h.controller.state(), VoiceState::Listening);
        assert_eq!(h.calls(), vec!["start", "stop", "start"]);

        // The cancelled utterance's completion is stale.
        h.take_events();
        h.send(VoiceEvent::Output(OutputEvent::Finished { id: first }));
        assert_eq!(h.controller.state(), VoiceState::Listening);
        assert!(h.take_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mic_off_cancels_output_without_end_notice() {
        let mut h = Harness::new(accepting_sink());
        h.send(VoiceEvent::MicOn);
        h.send(ai("hi there"));
        h.take_events();

        h.send(VoiceEvent::ToggleMic);
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert!(!h.controller.is_active());
        assert_eq!(h.output.lock().unwrap().cancels, 1);
        assert_eq!(h.calls().last(), Some(&"stop"));
        assert_eq!(
            h.take_events(),
            vec![SessionEvent::StateChanged(VoiceState::Idle)]
        );
        assert_eq!(h.controller.resume_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_end_restarts_only_while_active() {
        let mut h = Harness::new(accepting_sink());
        h.send(VoiceEvent::MicOn);
        h.input(InputEvent::RecognitionEnded);
        h.input(InputEvent::RecognitionFailed(RecognitionError::NoSpeech));
        assert_eq!(h.calls(), vec!["start", "start", "start"]);
        assert_eq!(h.controller.state(), VoiceState::Listening);

        h.send(VoiceEvent::MicOff);
        h.input(InputEvent::RecognitionEnded);
        assert_eq!(h.calls(), vec!["start", "start", "start", "stop"]);
        assert_eq!(h.controller.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_capability_is_reported_once() {
        let mut h = Harness::build(accepting_sink(), false, false, false);
        assert!(!h.controller.check_capabilities());
        h.send(VoiceEvent::MicOn);
        h.send(VoiceEvent::ToggleMic);

        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert!(h.calls().is_empty());
        assert_eq!(
            h.take_events(),
            vec![SessionEvent::Error(VoiceError::CapabilityMissing)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_failure_turns_the_mic_off() {
        let mut h = Harness::build(accepting_sink(), true, true, false);
        h.send(VoiceEvent::MicOn);

        assert!(!h.controller.is_active());
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert_eq!(
            h.take_events(),
            vec![SessionEvent::Error(VoiceError::Capture("device busy".into()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_turn_success_and_failure() {
        let mut sink = MockMessageSink::new();
        sink.expect_send_user_text()
            .withf(|text| text == "transcribed words")
            .times(1)
            .returning(|_| Ok(()));
        let mut h = Harness::new(sink);
        h.send(VoiceEvent::MicOn);

        h.input(InputEvent::CaptureStopped(Recording::wav(vec![1u8])));
        assert_eq!(h.controller.state(), VoiceState::Uploading);

        // The user's turn is in flight, so replies are not spoken now.
        h.send(ai("an earlier reply"));
        assert!(h.output.lock().unwrap().spoken.is_empty());

        h.input(InputEvent::Transcribed {
            turn: 1,
            result: Ok("transcribed words".into()),
        });
        assert_eq!(h.controller.state(), VoiceState::Idle);

        h.send(VoiceEvent::ResumeListening);
        h.input(InputEvent::CaptureStopped(Recording::wav(vec![1u8])));
        h.take_events();
        h.input(InputEvent::Transcribed {
            turn: 2,
            result: Err(TranscribeError::Rejected("Transcription failed".into())),
        });
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert!(h.controller.is_active(), "a failed turn keeps the mic on");
        assert_eq!(
            h.take_events(),
            vec![
                SessionEvent::Error(VoiceError::Transcription("Transcription failed".into())),
                SessionEvent::StateChanged(VoiceState::Idle),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_upload_returns_to_idle() {
        let mut sink = MockMessageSink::new();
        sink.expect_send_user_text().never();
        let mut h = Harness::new(sink);
        h.send(VoiceEvent::MicOn);
        h.input(InputEvent::CaptureStopped(Recording::wav(vec![1u8])));
        assert_eq!(h.controller.state(), VoiceState::Uploading);
        h.take_events();

        h.input(InputEvent::Transcribed {
            turn: 1,
            result: Ok("   ".into()),
        });
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert!(h.controller.is_active());
        assert_eq!(
            h.take_events(),
            vec![
                SessionEvent::Error(VoiceError::Transcription("empty transcript".into())),
                SessionEvent::StateChanged(VoiceState::Idle),
            ]
        );
        assert_eq!(
            h.controller.resume_deadline(),
            Some(Instant::now() + Duration::from_millis(500))
        );
    }

    fn recording_controller(
        capture: MockMediaCapture,
        transcriber: MockTranscriber,
        sink: MockMessageSink,
        events: crate::voice::EventSender,
    ) -> VoiceController {
        VoiceController::new(
            VoiceSettings::default(),
            Box::new(RecordingInput::new(
                Box::new(capture),
                Arc::new(transcriber),
                events,
                VadSettings::default(),
            )),
            Box::new(FakeOutput {
                log: Arc::default(),
                broken: false,
            }),
            Arc::new(sink),
        )
    }

    fn level(controller: &mut VoiceController, db: f32) {
        controller.handle(VoiceEvent::Input(InputEvent::Level(db)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mic_off_during_upload_drops_the_transcription() {
        let mut capture = MockMediaCapture::new();
        capture.expect_is_available().return_const(true);
        capture.expect_start().times(1).returning(|| Ok(()));
        capture.expect_stop().return_const(());
        let mut transcriber = MockTranscriber::new();
        transcriber
            .expect_transcribe()
            .times(1)
            .returning(|_| Ok("too late".to_string()));
        let mut sink = MockMessageSink::new();
        sink.expect_send_user_text().never();
        let (tx, mut rx) = crate::voice::event_channel();
        let mut controller = recording_controller(capture, transcriber, sink, tx);

        controller.handle(VoiceEvent::MicOn);
        assert_eq!(controller.state(), VoiceState::Listening);
        level(&mut controller, -20.0);
        tokio::time::advance(Duration::from_millis(200)).await;
        level(&mut controller, -70.0);
        tokio::time::advance(Duration::from_millis(3000)).await;
        level(&mut controller, -70.0);
        assert_eq!(controller.state(), VoiceState::Uploading);

        controller.handle(VoiceEvent::Input(InputEvent::CaptureStopped(
            Recording::wav(vec![1u8, 2, 3, 4]),
        )));
        controller.handle(VoiceEvent::MicOff);
        assert_eq!(controller.state(), VoiceState::Idle);

        let Some(late) = rx.recv().await else {
            panic!("expected the upload result");
        };
        controller.handle(late);
        assert_eq!(controller.state(), VoiceState::Idle);
        assert!(!controller.is_active());
        assert_eq!(controller.resume_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_that_ended_its_turn_is_restarted() {
        let mut capture = MockMediaCapture::new();
        capture.expect_is_available().return_const(true);
        capture.expect_start().times(2).returning(|| Ok(()));
        capture.expect_stop().return_const(());
        let mut transcriber = MockTranscriber::new();
        transcriber.expect_transcribe().never();
        let (tx, _rx) = crate::voice::event_channel();
        let mut controller =
            recording_controller(capture, transcriber, MockMessageSink::new(), tx);
        let events = Arc::new(Mutex::new(Vec::new()));
        let log = events.clone();
        controller.subscribe(move |e| log.lock().unwrap().push(e.clone()));

        controller.handle(VoiceEvent::MicOn);
        level(&mut controller, -90.0);
        controller.handle(VoiceEvent::Input(InputEvent::CaptureStopped(
            Recording::wav(vec![0u8; 8]),
        )));
        assert_eq!(controller.state(), VoiceState::Listening);
        assert!(controller.is_active());

        // The restarted turn hears speech again.
        level(&mut controller, -20.0);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                SessionEvent::StateChanged(VoiceState::Listening),
                SessionEvent::SpeechDetected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognition_failure_is_permanent() {
        let mut h = Harness::new(accepting_sink());
        h.send(VoiceEvent::MicOn);
        h.input(InputEvent::RecognitionFailed(RecognitionError::NotAllowed));

        assert!(!h.controller.is_active());
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert_eq!(h.controller.resume_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_that_are_not_spoken() {
        let mut h = Harness::new(accepting_sink());

        h.send(VoiceEvent::Reply(
            ChatMessage::new(MessageKind::Error, "model unavailable", Sender::System).unwrap(),
        ));
        h.send(VoiceEvent::Reply(
            ChatMessage::new(MessageKind::Text, "Stopped listening", Sender::System).unwrap(),
        ));
        h.send(ai("<br/> ** "));

        assert!(h.output.lock().unwrap().spoken.is_empty());
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert_eq!(
            h.take_events(),
            vec![SessionEvent::Error(VoiceError::Server("model unavailable".into()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_reply_replaces_current_one() {
        let mut h = Harness::new(accepting_sink());
        h.send(ai("first"));
        let first = h.last_utterance().id;
        h.send(ai("**second**"));
        let second = h.last_utterance();
        assert_eq!(second.text, "second");
        assert_ne!(second.id, first);
        assert_eq!(h.output.lock().unwrap().cancels, 1);

        h.send(VoiceEvent::Output(OutputEvent::Finished { id: first }));
        assert_eq!(h.controller.state(), VoiceState::Speaking);
        h.send(VoiceEvent::Output(OutputEvent::Failed {
            id: second.id,
            reason: "audio device lost".into(),
        }));
        assert_eq!(h.controller.state(), VoiceState::Idle);
        assert!(h.take_events().contains(&SessionEvent::Error(VoiceError::Output(
            "audio device lost".into()
        ))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_failure_and_send_failure_are_reported() {
        let mut sink = MockMessageSink::new();
        sink.expect_send_user_text()
            .returning(|_| Err(SendError::NotConnected));
        let mut h = Harness::build(sink, true, false, true);

        h.send(VoiceEvent::MicOn);
        h.input(InputEvent::Recognized("anyone there?".into()));
        h.send(ai("hi"));
        let events = h.take_events();
        assert!(events.contains(&SessionEvent::Error(VoiceError::Send(
            SendError::NotConnected
        ))));
        assert!(events.contains(&SessionEvent::Error(VoiceError::Output(
            "speech synthesis is not available".into()
        ))));
        assert_eq!(h.controller.state(), VoiceState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_resumes_listening_after_delay() {
        let h = Harness::new(accepting_sink());
        let calls = h.calls.clone();
        let mut states = h.controller.subscribe_state();
        let (tx, rx) = crate::voice::event_channel();
        let session = tokio::spawn(h.controller.run(rx));

        tx.send(VoiceEvent::MicOn).unwrap();
        tx.send(VoiceEvent::Input(InputEvent::Recognized("hello".into())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*states.borrow_and_update(), VoiceState::Idle);

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(*states.borrow_and_update(), VoiceState::Listening);
        assert_eq!(*calls.lock().unwrap(), vec!["start", "stop", "start"]);

        drop(tx);
        session.await.unwrap();
        assert_eq!(calls.lock().unwrap().last(), Some(&"stop"));
    }

    /// Opens in-memory transports and keeps the server ends for the test.
    #[derive(Default)]
    struct Loopback {
        ends: Mutex<
            Vec<(
                tokio::sync::mpsc::UnboundedReceiver<String>,
                tokio::sync::mpsc::UnboundedSender<crate::connection::TransportEvent>,
            )>,
        >,
    }

    #[async_trait::async_trait]
    impl crate::connection::Connector for Loopback {
        async fn open(
            &self,
            _url: &str,
        ) -> Result<crate::connection::Transport, crate::connection::TransportError> {
            let (sender, frames) = tokio::sync::mpsc::unbounded_channel();
            let (events_tx, events) = tokio::sync::mpsc::unbounded_channel();
            self.ends.lock().unwrap().push((frames, events_tx));
            Ok(crate::connection::Transport { sender, events })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_voice_turn_over_chat_session() {
        use crate::{
            chat::ChatSession,
            connection::{ConnectionSettings, TransportEvent},
            pipeline::OutboundPipeline,
        };

        let loopback = Arc::new(Loopback::default());
        let connection = ConnectionManager::new(ConnectionSettings::default(), loopback.clone());
        let chat = Arc::new(ChatSession::new(connection, OutboundPipeline::new()));
        chat.connection().connect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let calls = Calls::default();
        let output = Arc::new(Mutex::new(OutputLog::default()));
        let controller = VoiceController::new(
            VoiceSettings::default(),
            Box::new(FakeInput {
                available: true,
                fail_start: false,
                calls: calls.clone(),
            }),
            Box::new(FakeOutput {
                log: output.clone(),
                broken: false,
            }),
            chat.clone(),
        );
        let mut states = controller.subscribe_state();
        let (tx, rx) = crate::voice::event_channel();
        forward_replies(chat.connection(), tx.clone());
        let session = tokio::spawn(controller.run(rx));

        tx.send(VoiceEvent::ToggleMic).unwrap();
        tx.send(VoiceEvent::Input(InputEvent::Recognized("hello".into())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let frame = loopback.ends.lock().unwrap()[0].0.try_recv().unwrap();
        let sent: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(sent["type"], "message");
        assert_eq!(sent["content"], "hello");
        assert_eq!(sent["sender"], "user");

        loopback.ends.lock().unwrap()[0]
            .1
            .send(TransportEvent::Text(
                r#"{"type":"message","content":"hi **there**","sender":"ai"}"#.into(),
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*states.borrow_and_update(), VoiceState::Speaking);
        let spoken = output.lock().unwrap().spoken[0].clone();
        assert_eq!(spoken.text, "hi there");

        tx.send(VoiceEvent::Output(OutputEvent::Finished { id: spoken.id }))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*states.borrow_and_update(), VoiceState::Idle);

        let texts: Vec<String> = chat
            .transcript()
            .entries()
            .iter()
            .map(|e| e.text.clone())
            .collect();
        assert_eq!(texts, vec!["hello", "hi **there**"]);

        session.abort();
    }

    #[test]
    fn test_default_voice_preference_is_female() {
        assert_eq!(VoiceSettings::default().gender, Some(VoiceGender::Female));
    }
}
