use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard, Weak},
    time::Duration,
};

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant},
};
use uuid::Uuid;

use crate::{
    audio::PlaybackDevice,
    history::HistoryStore,
    models::{SessionPhase, SessionState, Story},
    narration::{NarrationEvent, NarrationQueue},
    settings::{PlaybackMode, PlaybackSettings, SessionConfig},
    synthesis::SynthesisClient,
    telemetry::TelemetrySink,
    timer::{CountdownTimer, TimerEvent},
};

use super::visibility::VisibilityTracker;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

pub const BACKGROUND_PAUSE_NOTICE: &str =
    "Paused because the app was in the background. Tap Play to continue.";

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionServices {
    pub synthesis: Arc<dyn SynthesisClient>,
    pub device: Arc<dyn PlaybackDevice>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub history: Arc<dyn HistoryStore>,
}

#[derive(Debug)]
enum ControllerEvent {
    Timer(TimerEvent),
    Narration(NarrationEvent),
    IntroMinElapsed(String),
    IntroMaxElapsed(String),
    IntroNarrationDone(String),
    BackgroundTimeout { session_id: String, epoch: u64 },
}

struct Inner {
    story: Story,
    config: SessionConfig,
    playback: PlaybackSettings,
    state: Mutex<SessionState>,
    visibility: StdMutex<VisibilityTracker>,
    timer: CountdownTimer,
    narration: NarrationQueue,
    services: SessionServices,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    snapshot_tx: watch::Sender<SessionState>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Phase state machine for one story: Waiting, Intro, Brushing, Complete.
///
/// Owns the countdown and the narration queue. Timer ticks, narration
/// completions and internal deadlines all arrive on one event pump, so
/// handlers never run concurrently with each other.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Builds the controller and starts its event pump. Must be called inside
    /// a tokio runtime. A story that fails validation is replaced by a
    /// placeholder here, never later.
    pub fn new(
        story: Story,
        config: SessionConfig,
        playback: PlaybackSettings,
        services: SessionServices,
    ) -> Result<Self> {
        config.validate()?;
        let story = story.or_placeholder();

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let timer = CountdownTimer::new(config.total_duration_ms, config.tick_interval(), timer_tx);
        let narration = NarrationQueue::new(
            services.synthesis.clone(),
            services.device.clone(),
            &config.narration,
        );
        let narration_rx = narration.subscribe();
        let initial = SessionState::new(config.total_duration_ms);
        let (snapshot_tx, _) = watch::channel(initial.clone());

        services.history.add_to_history(&story);

        let inner = Arc::new(Inner {
            story,
            config,
            playback,
            state: Mutex::new(initial),
            visibility: StdMutex::new(VisibilityTracker::default()),
            timer,
            narration,
            services,
            events_tx,
            snapshot_tx,
            tasks: StdMutex::new(Vec::new()),
            pump: StdMutex::new(None),
        });

        let pump = tokio::spawn(run_pump(
            Arc::downgrade(&inner),
            timer_rx,
            events_rx,
            narration_rx,
        ));
        *lock(&inner.pump) = Some(pump);

        Ok(Self { inner })
    }

    pub fn story(&self) -> &Story {
        &self.inner.story
    }

    pub fn narration(&self) -> &NarrationQueue {
        &self.inner.narration
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// The explicit user start. Unlocks the playback device, issues a new
    /// session id and enters the intro. Accepted from Waiting or Complete.
    pub async fn start_session(&self) -> Result<String> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if !matches!(state.phase, SessionPhase::Waiting | SessionPhase::Complete) {
            bail!("session already in progress ({})", state.phase.as_str());
        }

        self.cancel_tasks();
        inner.narration.stop();
        inner.timer.cancel().await;

        let session_id = Uuid::new_v4().to_string();
        let narration_enabled = inner.playback.narration_enabled();
        state.begin(
            session_id.clone(),
            inner.config.total_duration_ms,
            narration_enabled,
        );
        log_info!("session {} started", session_id);

        if narration_enabled {
            if let Err(err) = inner.services.device.unlock() {
                log_warn!("audio unlock failed: {}", err);
            }
            let tx = inner.events_tx.clone();
            let sid = session_id.clone();
            inner.narration.enqueue_with_callback(
                inner.story.intro.clone(),
                inner.playback.voice_id.clone(),
                move |_outcome| {
                    let _ = tx.send(ControllerEvent::IntroNarrationDone(sid));
                },
            );
        }

        self.schedule(
            Duration::from_millis(inner.config.intro_min_ms),
            ControllerEvent::IntroMinElapsed(session_id.clone()),
        );
        self.schedule(
            Duration::from_millis(inner.config.intro_max_ms),
            ControllerEvent::IntroMaxElapsed(session_id.clone()),
        );

        self.track("session_start", &state, None);
        self.publish(&state);
        Ok(session_id)
    }

    /// Resumes a paused session, resumes paused narration, or speaks the
    /// current phase's text right away when nothing is queued.
    pub async fn play(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.phase == SessionPhase::Waiting {
            return;
        }

        if state.is_paused {
            state.is_paused = false;
            state.notice = None;
            if state.phase == SessionPhase::Brushing {
                inner.timer.resume().await;
            }
            inner.narration.resume();
            log_info!("session {} resumed", state.session_id);
            self.track("session_resume", &state, None);
            self.publish(&state);
            return;
        }

        if inner.narration.is_paused() {
            inner.narration.resume();
            return;
        }
        if inner.narration.is_active() || inner.playback.mode == PlaybackMode::Text {
            return;
        }

        let text = self.phase_text(&state);
        if inner
            .narration
            .speak_now(text, inner.playback.voice_id.clone())
            .is_some()
        {
            log_debug!("speaking {} text on request", state.phase.as_str());
        }
    }

    /// Pauses narration and the countdown together.
    pub async fn pause(&self) {
        let mut state = self.inner.state.lock().await;
        if state.phase == SessionPhase::Waiting || state.is_paused {
            return;
        }
        self.pause_locked(&mut state, None).await;
    }

    /// Clears all narration and silences the device. The countdown is held
    /// until the next play.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.phase == SessionPhase::Waiting {
            return;
        }

        inner.narration.stop();
        inner.timer.pause().await;
        state.is_paused = true;
        state.notice = None;
        log_info!("session {} stopped", state.session_id);
        self.track("session_stop", &state, None);

        // The intro callback was discarded with the queue.
        if state.phase == SessionPhase::Intro {
            state.intro_narration_done = true;
            if state.intro_ready() {
                self.begin_brushing(&mut state).await;
            }
        }
        self.publish(&state);
    }

    pub fn toggle_favorite(&self) -> bool {
        self.inner
            .services
            .history
            .toggle_favorite(&self.inner.story.id)
    }

    pub fn is_favorite(&self) -> bool {
        self.inner.services.history.is_favorite(&self.inner.story.id)
    }

    /// Reports app visibility. Hidden for `backgroundPauseMs` during brushing
    /// pauses the session; showing the app again never resumes it.
    pub async fn set_app_hidden(&self, hidden: bool) {
        let inner = &self.inner;
        let now = Instant::now();
        let threshold = Duration::from_millis(inner.config.background_pause_ms);

        if hidden {
            let epoch = lock(&inner.visibility).hide(now);
            if let Some(epoch) = epoch {
                let session_id = inner.state.lock().await.session_id.clone();
                log_debug!("app hidden (epoch {})", epoch);
                self.schedule(
                    threshold,
                    ControllerEvent::BackgroundTimeout { session_id, epoch },
                );
            }
            return;
        }

        let hidden_for = lock(&inner.visibility).show(now);
        if let Some(hidden_for) = hidden_for {
            log_debug!("app visible after {}ms", hidden_for.as_millis());
            if hidden_for >= threshold {
                let mut state = inner.state.lock().await;
                self.background_pause(&mut state).await;
            }
        }
    }

    pub async fn dismiss_notice(&self) {
        let mut state = self.inner.state.lock().await;
        if state.notice.take().is_some() {
            self.publish(&state);
        }
    }

    pub async fn dismiss_narration_error(&self) {
        let mut state = self.inner.state.lock().await;
        if state.narration_error.take().is_some() {
            self.publish(&state);
        }
    }

    /// Stops narration, the countdown and every pending deadline.
    pub async fn shutdown(&self) {
        self.cancel_tasks();
        self.inner.narration.stop();
        self.inner.timer.cancel().await;
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }
    }

    async fn handle(&self, event: ControllerEvent) {
        let mut state = self.inner.state.lock().await;
        match event {
            ControllerEvent::Timer(TimerEvent::Tick(snapshot)) => {
                state.timer = snapshot;
            }
            ControllerEvent::Timer(TimerEvent::SegmentChanged(index)) => {
                self.on_segment_change(&mut state, index);
            }
            ControllerEvent::Timer(TimerEvent::Completed) => {
                self.on_timer_complete(&mut state).await;
            }
            ControllerEvent::IntroMinElapsed(sid) => {
                if sid != state.session_id || state.phase != SessionPhase::Intro {
                    return;
                }
                state.intro_min_elapsed = true;
                if state.intro_ready() {
                    self.begin_brushing(&mut state).await;
                }
            }
            ControllerEvent::IntroNarrationDone(sid) => {
                if sid != state.session_id || state.phase != SessionPhase::Intro {
                    return;
                }
                state.intro_narration_done = true;
                if state.intro_ready() {
                    self.begin_brushing(&mut state).await;
                }
            }
            ControllerEvent::IntroMaxElapsed(sid) => {
                if sid != state.session_id || state.phase != SessionPhase::Intro {
                    return;
                }
                log_warn!(
                    "intro narration unfinished after {}ms, starting brushing",
                    self.inner.config.intro_max_ms
                );
                self.begin_brushing(&mut state).await;
            }
            ControllerEvent::BackgroundTimeout { session_id, epoch } => {
                let still_hidden = lock(&self.inner.visibility).is_hidden_for(epoch);
                if session_id != state.session_id || !still_hidden {
                    return;
                }
                self.background_pause(&mut state).await;
                return;
            }
            ControllerEvent::Narration(NarrationEvent::Dropped { error, .. }) => {
                state.narration_error = Some(format!("Audio unavailable: {error}"));
            }
            ControllerEvent::Narration(NarrationEvent::Speaking { .. }) => {
                if state.narration_error.is_none() {
                    return;
                }
                state.narration_error = None;
            }
            ControllerEvent::Narration(_) => return,
        }
        self.publish(&state);
    }

    async fn begin_brushing(&self, state: &mut SessionState) {
        let inner = &self.inner;
        state.phase = SessionPhase::Brushing;
        state.current_segment_index = 0;
        log_info!("session {} brushing", state.session_id);

        inner.timer.cancel().await;
        match inner.timer.start(inner.config.total_duration_ms).await {
            Ok(snapshot) => state.timer = snapshot,
            Err(err) => log_warn!("countdown did not start: {:#}", err),
        }
        if state.is_paused {
            inner.timer.pause().await;
            state.timer = inner.timer.snapshot().await;
        }
    }

    fn on_segment_change(&self, state: &mut SessionState, index: usize) {
        if state.phase != SessionPhase::Brushing || index < state.current_segment_index {
            return;
        }
        state.current_segment_index = index;
        if !state.spoken_segments.insert(index) {
            return;
        }

        log_info!("session {} segment {}", state.session_id, index + 1);
        let inner = &self.inner;
        if inner.playback.narration_enabled() {
            let voice = &inner.playback.voice_id;
            inner
                .narration
                .enqueue(inner.story.brushing_prompts[index].clone(), voice.clone());
            inner
                .narration
                .enqueue(inner.story.segments[index].clone(), voice.clone());
        }
    }

    async fn on_timer_complete(&self, state: &mut SessionState) {
        if state.phase != SessionPhase::Brushing {
            return;
        }
        let inner = &self.inner;
        state.phase = SessionPhase::Complete;
        state.is_paused = false;
        state.timer = inner.timer.snapshot().await;
        log_info!("session {} complete", state.session_id);
        self.track("session_complete", state, None);

        if inner.playback.narration_enabled() {
            inner.narration.enqueue(
                inner.story.conclusion.clone(),
                inner.playback.voice_id.clone(),
            );
        }
    }

    async fn pause_locked(&self, state: &mut SessionState, reason: Option<&str>) {
        let inner = &self.inner;
        state.is_paused = true;
        state.notice = None;
        inner.timer.pause().await;
        inner.narration.pause();
        if state.phase == SessionPhase::Brushing {
            state.timer = inner.timer.snapshot().await;
        }
        log_info!(
            "session {} paused{}",
            state.session_id,
            reason.map(|r| format!(" ({r})")).unwrap_or_default()
        );
        self.track("session_pause", state, reason);
        self.publish(state);
    }

    async fn background_pause(&self, state: &mut SessionState) {
        if state.phase != SessionPhase::Brushing || state.is_paused {
            return;
        }
        log_warn!(
            "app hidden for {}ms, pausing session {}",
            self.inner.config.background_pause_ms,
            state.session_id
        );
        self.pause_locked(state, Some("background_timeout")).await;
        state.notice = Some(BACKGROUND_PAUSE_NOTICE.to_string());
        self.publish(state);
    }

    fn phase_text(&self, state: &SessionState) -> String {
        let story = &self.inner.story;
        match state.phase {
            SessionPhase::Waiting | SessionPhase::Intro => story.intro.clone(),
            SessionPhase::Brushing => story.segments[state.current_segment_index].clone(),
            SessionPhase::Complete => story.conclusion.clone(),
        }
    }

    fn schedule(&self, after: Duration, event: ControllerEvent) {
        let tx = self.inner.events_tx.clone();
        let task = tokio::spawn(async move {
            time::sleep(after).await;
            let _ = tx.send(event);
        });
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    fn cancel_tasks(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
    }

    fn track(&self, name: &str, state: &SessionState, reason: Option<&str>) {
        let playback = &self.inner.playback;
        let mut payload = Map::new();
        payload.insert("sessionId".into(), json!(state.session_id));
        payload.insert("phase".into(), json!(state.phase.as_str()));
        payload.insert("currentSegment".into(), json!(state.current_segment_index));
        payload.insert("autoPlay".into(), json!(playback.auto_play));
        payload.insert("playbackMode".into(), json!(playback.mode.as_str()));
        payload.insert("voiceId".into(), json!(playback.voice_id));
        if let Some(reason) = reason {
            payload.insert("reason".into(), Value::from(reason));
        }
        self.inner.services.telemetry.track_event(name, payload);
    }

    fn publish(&self, state: &SessionState) {
        self.inner.snapshot_tx.send_replace(state.clone());
    }
}

async fn run_pump(
    inner: Weak<Inner>,
    mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    mut events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    mut narration_rx: broadcast::Receiver<NarrationEvent>,
) {
    loop {
        let event = tokio::select! {
            Some(event) = timer_rx.recv() => ControllerEvent::Timer(event),
            Some(event) = events_rx.recv() => event,
            received = narration_rx.recv() => match received {
                Ok(event) => ControllerEvent::Narration(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log_warn!("session missed {} narration events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            else => break,
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        SessionController { inner }.handle(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{ClipLength, SimulatedDevice},
        error::SynthesisError,
        history::InMemoryHistory,
        test_support::{RecordingTelemetry, ScriptedSynthesis, Step},
        timer::TimerStatus,
    };

    struct Harness {
        controller: SessionController,
        device: Arc<SimulatedDevice>,
        synth: Arc<ScriptedSynthesis>,
        telemetry: Arc<RecordingTelemetry>,
        history: Arc<InMemoryHistory>,
    }

    fn story() -> Story {
        Story::placeholder("Arlo and Luna", "explore a volcano")
    }

    fn harness_with(
        story: Story,
        config: SessionConfig,
        playback: PlaybackSettings,
        synth: ScriptedSynthesis,
    ) -> Harness {
        let device = Arc::new(SimulatedDevice::new(ClipLength::Fixed(Duration::from_secs(1))));
        let synth = Arc::new(synth);
        let telemetry = Arc::new(RecordingTelemetry::default());
        let history = Arc::new(InMemoryHistory::new());
        let controller = SessionController::new(
            story,
            config,
            playback,
            SessionServices {
                synthesis: synth.clone(),
                device: device.clone(),
                telemetry: telemetry.clone(),
                history: history.clone(),
            },
        )
        .unwrap();
        Harness {
            controller,
            device,
            synth,
            telemetry,
            history,
        }
    }

    fn harness(synth: ScriptedSynthesis) -> Harness {
        harness_with(
            story(),
            SessionConfig::default(),
            PlaybackSettings::default(),
            synth,
        )
    }

    fn silent() -> PlaybackSettings {
        PlaybackSettings {
            auto_play: false,
            ..PlaybackSettings::default()
        }
    }

    async fn advance(ms: u64) {
        time::sleep(Duration::from_millis(ms)).await;
    }

    fn labels(device: &SimulatedDevice) -> Vec<String> {
        device.records().into_iter().map(|r| r.label).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn full_session_narrates_each_segment_once() {
        let h = harness(ScriptedSynthesis::succeeding());
        h.controller.start_session().await.unwrap();
        assert!(h.device.was_unlocked());
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Intro);

        advance(130_000).await;

        let state = h.controller.snapshot();
        assert_eq!(state.phase, SessionPhase::Complete);
        assert_eq!(state.current_segment_index, 3);
        assert_eq!(state.spoken_segments.len(), 4);
        assert_eq!(state.timer.remaining_ms, 0);

        let story = h.controller.story();
        let mut expected = vec![story.intro.clone()];
        for index in 0..4 {
            expected.push(story.brushing_prompts[index].clone());
            expected.push(story.segments[index].clone());
        }
        expected.push(story.conclusion.clone());
        assert_eq!(labels(&h.device), expected);

        let names = h.telemetry.names();
        assert_eq!(names.first().map(String::as_str), Some("session_start"));
        assert!(names.contains(&"session_complete".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn intro_waits_for_both_minimum_and_narration() {
        let h = harness(
            ScriptedSynthesis::succeeding().with_latency(Duration::from_secs(8)),
        );
        h.controller.start_session().await.unwrap();

        advance(6_000).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Intro);

        // Intro audio plays from 8s to 9s.
        advance(3_500).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Brushing);
    }

    #[tokio::test(start_paused = true)]
    async fn quick_intro_still_waits_for_minimum() {
        let h = harness(ScriptedSynthesis::succeeding());
        h.controller.start_session().await.unwrap();

        advance(4_900).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Intro);
        advance(200).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Brushing);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_synthesis_cannot_wedge_the_intro() {
        let h = harness(ScriptedSynthesis::always(Step::Hang));
        h.controller.start_session().await.unwrap();

        advance(24_900).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Intro);
        advance(200).await;
        let state = h.controller.snapshot();
        assert_eq!(state.phase, SessionPhase::Brushing);
        assert_eq!(state.timer.status, TimerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_narration_moves_on_at_minimum() {
        let h = harness_with(
            story(),
            SessionConfig::default(),
            silent(),
            ScriptedSynthesis::succeeding(),
        );
        h.controller.start_session().await.unwrap();
        assert!(!h.device.was_unlocked());

        advance(5_100).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Brushing);
        advance(40_000).await;
        assert!(h.synth.calls().is_empty());
        assert_eq!(h.controller.snapshot().current_segment_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_narration_sets_dismissible_error_without_blocking() {
        let h = harness(ScriptedSynthesis::always(Step::Fail(SynthesisError::Provider(
            "quota exceeded".into(),
        ))));
        h.controller.start_session().await.unwrap();

        advance(3_000).await;
        let state = h.controller.snapshot();
        assert_eq!(state.phase, SessionPhase::Intro);
        assert!(state
            .narration_error
            .as_deref()
            .is_some_and(|error| error.starts_with("Audio unavailable")));

        advance(2_100).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Brushing);

        h.controller.dismiss_narration_error().await;
        assert_eq!(h.controller.snapshot().narration_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_countdown_until_play() {
        let h = harness_with(
            story(),
            SessionConfig::default(),
            silent(),
            ScriptedSynthesis::succeeding(),
        );
        h.controller.start_session().await.unwrap();
        advance(20_000).await;

        h.controller.pause().await;
        let frozen = h.controller.snapshot().timer.remaining_ms;
        assert!(h.controller.snapshot().is_paused);

        advance(60_000).await;
        let state = h.controller.snapshot();
        assert_eq!(state.timer.remaining_ms, frozen);
        assert_eq!(state.timer.status, TimerStatus::Paused);

        h.controller.play().await;
        advance(1_000).await;
        let state = h.controller.snapshot();
        assert!(!state.is_paused);
        assert!(state.timer.remaining_ms < frozen);

        let names = h.telemetry.names();
        assert!(names.contains(&"session_pause".to_string()));
        assert!(names.contains(&"session_resume".to_string()));
        let pause = h.telemetry.last("session_pause").unwrap();
        assert_eq!(pause["phase"], "brushing");
        assert_eq!(pause["playbackMode"], "both");
        assert_eq!(pause["autoPlay"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_silences_and_play_speaks_current_segment() {
        let h = harness(ScriptedSynthesis::succeeding());
        h.controller.start_session().await.unwrap();

        // Brushing begins at 5s; the first prompt plays right after.
        advance(5_500).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Brushing);
        assert!(h.device.is_playing());

        h.controller.stop().await;
        assert!(!h.device.is_playing());
        assert!(!h.controller.narration().is_active());
        assert!(h.controller.snapshot().is_paused);
        assert_eq!(h.telemetry.names().last().map(String::as_str), Some("session_stop"));

        advance(10_000).await;
        let played = h.device.records().len();

        h.controller.play().await;
        assert!(!h.controller.snapshot().is_paused);
        advance(100).await;
        assert_eq!(h.device.records().len(), played);

        h.controller.play().await;
        advance(2_000).await;
        let records = labels(&h.device);
        assert_eq!(records.len(), played + 1);
        assert_eq!(records.last(), Some(&h.controller.story().segments[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_six_seconds_auto_pauses_with_notice() {
        let h = harness_with(
            story(),
            SessionConfig::default(),
            silent(),
            ScriptedSynthesis::succeeding(),
        );
        h.controller.start_session().await.unwrap();
        advance(10_000).await;

        h.controller.set_app_hidden(true).await;
        advance(6_000).await;

        let state = h.controller.snapshot();
        assert!(state.is_paused);
        assert_eq!(state.notice.as_deref(), Some(BACKGROUND_PAUSE_NOTICE));
        let pause = h.telemetry.last("session_pause").unwrap();
        assert_eq!(pause["reason"], "background_timeout");

        h.controller.set_app_hidden(false).await;
        advance(5_000).await;
        let state = h.controller.snapshot();
        assert!(state.is_paused);
        assert_eq!(state.timer.status, TimerStatus::Paused);

        h.controller.dismiss_notice().await;
        assert_eq!(h.controller.snapshot().notice, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_background_notice() {
        let h = harness_with(
            story(),
            SessionConfig::default(),
            silent(),
            ScriptedSynthesis::succeeding(),
        );
        h.controller.start_session().await.unwrap();
        advance(10_000).await;
        h.controller.set_app_hidden(true).await;
        advance(6_000).await;
        h.controller.set_app_hidden(false).await;
        assert!(h.controller.snapshot().notice.is_some());

        h.controller.stop().await;

        let state = h.controller.snapshot();
        assert!(state.is_paused);
        assert_eq!(state.notice, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_three_seconds_changes_nothing() {
        let h = harness_with(
            story(),
            SessionConfig::default(),
            silent(),
            ScriptedSynthesis::succeeding(),
        );
        h.controller.start_session().await.unwrap();
        advance(10_000).await;

        h.controller.set_app_hidden(true).await;
        advance(3_000).await;
        h.controller.set_app_hidden(false).await;
        advance(5_000).await;

        let state = h.controller.snapshot();
        assert!(!state.is_paused);
        assert_eq!(state.notice, None);
        assert_eq!(state.timer.status, TimerStatus::Running);
        assert!(h.telemetry.last("session_pause").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_during_intro_is_ignored() {
        // Slow synthesis keeps the session in the intro for about 21s.
        let h = harness(
            ScriptedSynthesis::succeeding().with_latency(Duration::from_secs(20)),
        );
        h.controller.start_session().await.unwrap();

        h.controller.set_app_hidden(true).await;
        advance(8_000).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Intro);
        h.controller.set_app_hidden(false).await;

        let state = h.controller.snapshot();
        assert!(!state.is_paused);
        assert_eq!(state.notice, None);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_is_only_allowed_when_idle_or_complete() {
        let config = SessionConfig {
            total_duration_ms: 4_000,
            intro_min_ms: 1_000,
            intro_max_ms: 2_000,
            ..SessionConfig::default()
        };
        let h = harness_with(story(), config, silent(), ScriptedSynthesis::succeeding());

        let first = h.controller.start_session().await.unwrap();
        assert!(h.controller.start_session().await.is_err());

        advance(6_000).await;
        assert_eq!(h.controller.snapshot().phase, SessionPhase::Complete);

        let second = h.controller.start_session().await.unwrap();
        assert_ne!(first, second);
        let state = h.controller.snapshot();
        assert_eq!(state.phase, SessionPhase::Intro);
        assert!(state.spoken_segments.is_empty());
        assert_eq!(state.timer.remaining_ms, 4_000);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_story_is_replaced_at_construction() {
        let mut broken = story();
        broken.segments[1] = String::new();
        let h = harness_with(
            broken,
            SessionConfig::default(),
            PlaybackSettings::default(),
            ScriptedSynthesis::succeeding(),
        );

        assert!(h.controller.story().is_fallback);
        assert!(h.controller.story().validate().is_ok());
        assert_eq!(h.history.stories()[0].id, h.controller.story().id);
    }

    #[tokio::test(start_paused = true)]
    async fn favorites_delegate_to_history() {
        let h = harness(ScriptedSynthesis::succeeding());
        assert!(!h.controller.is_favorite());
        assert!(h.controller.toggle_favorite());
        assert!(h.history.is_favorite(&h.controller.story().id));
        assert!(!h.controller.toggle_favorite());
    }
}
