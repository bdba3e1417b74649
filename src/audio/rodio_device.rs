use rodio::{source::Zero, Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{self, RecvTimeoutError, Sender},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc as async_mpsc;

use crate::{error::PlaybackError, synthesis::AudioRef};

use super::{PlaybackDevice, PlaybackEvent};

const END_POLL_INTERVAL: Duration = Duration::from_millis(50);
const UNLOCK_CLIP: Duration = Duration::from_millis(50);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

enum DeviceCommand {
    Unlock(Sender<Result<(), PlaybackError>>),
    Load {
        audio: AudioRef,
        events: async_mpsc::UnboundedSender<PlaybackEvent>,
    },
    Play,
    Pause,
    Resume,
    Stop,
}

struct Output {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

fn open_output(output: &mut Option<Output>) -> Result<&OutputStreamHandle, PlaybackError> {
    if output.is_none() {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| PlaybackError::Device(format!("Failed to open audio output: {}", e)))?;
        *output = Some(Output {
            _stream: stream,
            handle,
        });
    }
    output
        .as_ref()
        .map(|out| &out.handle)
        .ok_or_else(|| PlaybackError::Device("audio output unavailable".into()))
}

struct Current {
    sink: Sink,
    events: async_mpsc::UnboundedSender<PlaybackEvent>,
    playing: bool,
    last_progress: Instant,
}

/// Speaker output through rodio.
///
/// rodio's output stream is not `Send`, so it lives on a dedicated thread that
/// owns the sink and receives commands over a channel.
pub struct RodioDevice {
    tx: Arc<Mutex<Option<Sender<DeviceCommand>>>>,
    has_buffer: Arc<AtomicBool>,
    /// Decoded length of the current clip in millis, 0 when unknown.
    clip_ms: Arc<AtomicU64>,
}

impl Default for RodioDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl RodioDevice {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
            has_buffer: Arc::new(AtomicBool::new(false)),
            clip_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    fn ensure_thread(&self) -> Result<Sender<DeviceCommand>, PlaybackError> {
        let mut guard = self
            .tx
            .lock()
            .map_err(|e| PlaybackError::Device(e.to_string()))?;
        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<DeviceCommand>();
        let has_buffer = Arc::clone(&self.has_buffer);
        let clip_ms = Arc::clone(&self.clip_ms);

        thread::Builder::new()
            .name("narration-audio".to_string())
            .spawn(move || {
                let mut output: Option<Output> = None;
                let mut current: Option<Current> = None;

                fn release(current: &mut Option<Current>, has_buffer: &AtomicBool) {
                    if let Some(old) = current.take() {
                        old.sink.stop();
                    }
                    has_buffer.store(false, Ordering::SeqCst);
                }

                loop {
                    let cmd = match rx.recv_timeout(END_POLL_INTERVAL) {
                        Ok(cmd) => cmd,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Some(cur) = current.as_mut() {
                                if cur.playing && cur.sink.empty() {
                                    cur.playing = false;
                                    let _ = cur.events.send(PlaybackEvent::Ended);
                                } else if cur.playing
                                    && !cur.sink.is_paused()
                                    && cur.last_progress.elapsed() >= PROGRESS_INTERVAL
                                {
                                    cur.last_progress = Instant::now();
                                    let _ = cur.events.send(PlaybackEvent::Progress);
                                }
                            }
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    };

                    match cmd {
                        DeviceCommand::Unlock(ack) => {
                            let result = open_output(&mut output).and_then(|handle| {
                                let sink = Sink::try_new(handle).map_err(|e| {
                                    PlaybackError::Device(format!("Failed to create audio sink: {}", e))
                                })?;
                                sink.append(Zero::<f32>::new(1, 44_100).take_duration(UNLOCK_CLIP));
                                sink.detach();
                                Ok(())
                            });
                            let _ = ack.send(result);
                        }
                        DeviceCommand::Load { audio, events } => {
                            release(&mut current, &has_buffer);
                            clip_ms.store(0, Ordering::SeqCst);

                            let handle = match open_output(&mut output) {
                                Ok(handle) => handle,
                                Err(err) => {
                                    let _ = events.send(PlaybackEvent::Failed(err));
                                    continue;
                                }
                            };
                            let sink = match Sink::try_new(handle) {
                                Ok(sink) => sink,
                                Err(e) => {
                                    let _ = events.send(PlaybackEvent::Failed(
                                        PlaybackError::Device(format!("Failed to create audio sink: {}", e)),
                                    ));
                                    continue;
                                }
                            };
                            let source = match Decoder::new(Cursor::new(audio.data.to_vec())) {
                                Ok(source) => source,
                                Err(e) => {
                                    let _ = events.send(PlaybackEvent::Failed(PlaybackError::Load(
                                        format!("could not decode {}: {}", audio.label, e),
                                    )));
                                    continue;
                                }
                            };

                            let length = source
                                .total_duration()
                                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
                                .unwrap_or(0);
                            clip_ms.store(length, Ordering::SeqCst);

                            sink.pause();
                            sink.append(source);
                            has_buffer.store(true, Ordering::SeqCst);
                            let _ = events.send(PlaybackEvent::Ready);
                            current = Some(Current {
                                sink,
                                events,
                                playing: false,
                                last_progress: Instant::now(),
                            });
                        }
                        DeviceCommand::Play | DeviceCommand::Resume => {
                            if let Some(cur) = current.as_mut() {
                                cur.sink.play();
                                cur.last_progress = Instant::now();
                                if !cur.playing {
                                    cur.playing = true;
                                    let _ = cur.events.send(PlaybackEvent::Started);
                                }
                            }
                        }
                        DeviceCommand::Pause => {
                            if let Some(cur) = current.as_ref() {
                                cur.sink.pause();
                            }
                        }
                        DeviceCommand::Stop => {
                            release(&mut current, &has_buffer);
                        }
                    }
                }
            })
            .map_err(|e| PlaybackError::Device(e.to_string()))?;

        *guard = Some(tx.clone());
        Ok(tx)
    }

    fn send(&self, cmd: DeviceCommand) -> Result<(), PlaybackError> {
        let tx = self.ensure_thread()?;
        tx.send(cmd)
            .map_err(|e| PlaybackError::Device(e.to_string()))
    }
}

impl PlaybackDevice for RodioDevice {
    fn unlock(&self) -> Result<(), PlaybackError> {
        let (ack_tx, ack_rx) = mpsc::channel();
        self.send(DeviceCommand::Unlock(ack_tx))?;
        ack_rx
            .recv()
            .map_err(|e| PlaybackError::Device(e.to_string()))?
    }

    fn load(
        &self,
        audio: AudioRef,
    ) -> Result<async_mpsc::UnboundedReceiver<PlaybackEvent>, PlaybackError> {
        let (events, rx) = async_mpsc::unbounded_channel();
        self.has_buffer.store(false, Ordering::SeqCst);
        self.clip_ms.store(0, Ordering::SeqCst);
        self.send(DeviceCommand::Load { audio, events })?;
        Ok(rx)
    }

    fn play(&self) -> Result<(), PlaybackError> {
        self.send(DeviceCommand::Play)
    }

    fn pause(&self) {
        let _ = self.send(DeviceCommand::Pause);
    }

    fn resume(&self) {
        let _ = self.send(DeviceCommand::Resume);
    }

    fn stop(&self) {
        if let Ok(Some(tx)) = self.tx.lock().map(|g| g.clone()) {
            let _ = tx.send(DeviceCommand::Stop);
        }
        self.has_buffer.store(false, Ordering::SeqCst);
    }

    fn clip_duration(&self) -> Option<Duration> {
        match self.clip_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn has_buffered_data(&self) -> bool {
        self.has_buffer.load(Ordering::SeqCst)
    }
}
