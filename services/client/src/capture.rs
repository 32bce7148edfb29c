//! Microphone capture through an external recorder process.

use crate::audio_utils::{CAPTURE_CHANNELS, CAPTURE_SAMPLE_RATE, block_level_db, encode_wav};
use bytes::{Bytes, BytesMut};
use std::{io::ErrorKind, path::Path, process::Stdio};
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdout, Command},
    sync::oneshot,
};
use tracing::{Instrument, debug, info, info_span, warn};
use voicechat_core::{
    transcribe::Recording,
    voice::{CaptureError, EventSender, InputEvent, MediaCapture, VoiceEvent},
};

/// 100 ms of 16 kHz mono PCM16.
const BLOCK_BYTES: usize = 3200;

/// Runs a recorder command that writes raw 16 kHz mono PCM16 to stdout.
/// Stopping kills the process, which releases the microphone, and posts the
/// turn as a WAV recording.
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
    events: EventSender,
    stop: Option<oneshot::Sender<()>>,
}

impl CommandCapture {
    pub fn new(command: &[String], events: EventSender) -> Self {
        let (program, args) = match command.split_first() {
            Some((program, args)) => (program.clone(), args.to_vec()),
            None => (String::new(), Vec::new()),
        };
        Self {
            program,
            args,
            events,
            stop: None,
        }
    }
}

fn on_path(program: &str) -> bool {
    if program.is_empty() {
        return false;
    }
    if program.contains('/') {
        return Path::new(program).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

impl MediaCapture for CommandCapture {
    fn is_available(&self) -> bool {
        on_path(&self.program)
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        // A recorder that exited by itself closed its end of the channel.
        if self.stop.as_ref().is_some_and(|stop| !stop.is_closed()) {
            return Ok(());
        }
        self.stop = None;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => CaptureError::Unavailable,
                _ => CaptureError::Start(e.to_string()),
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Start("recorder has no stdout".to_string()))?;
        info!(program = %self.program, "Recording started.");

        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop = Some(stop_tx);
        tokio::spawn(
            record(child, stdout, stop_rx, self.events.clone())
                .instrument(info_span!("capture", program = %self.program)),
        );
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn record(
    mut child: Child,
    mut stdout: ChildStdout,
    mut stop: oneshot::Receiver<()>,
    events: EventSender,
) {
    let post = |event: InputEvent| {
        let _ = events.send(VoiceEvent::Input(event));
    };
    let mut pcm = BytesMut::new();
    let mut block = vec![0u8; BLOCK_BYTES];
    loop {
        tokio::select! {
            // Fires on an explicit stop and when the capture handle is dropped.
            _ = &mut stop => break,
            read = stdout.read(&mut block) => match read {
                Ok(0) => {
                    debug!("Recorder closed its output.");
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&block[..n]);
                    pcm.extend_from_slice(&data);
                    post(InputEvent::Level(block_level_db(&data)));
                    post(InputEvent::Chunk(data));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read from recorder.");
                    drop(stop);
                    let _ = child.kill().await;
                    post(InputEvent::CaptureFailed(e.to_string()));
                    return;
                }
            }
        }
    }
    // Marks the capture as finished before the turn is reported.
    drop(stop);
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Recorder already exited.");
    }
    info!(bytes = pcm.len(), "Recording stopped.");

    if pcm.is_empty() {
        post(InputEvent::CaptureStopped(Recording::wav(Bytes::new())));
        return;
    }
    match encode_wav(&pcm, CAPTURE_SAMPLE_RATE, CAPTURE_CHANNELS) {
        Ok(wav) => post(InputEvent::CaptureStopped(Recording::wav(wav))),
        Err(e) => post(InputEvent::CaptureFailed(e.to_string())),
    }
}
