use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{
    audio::{drive_playback, PlaybackDevice, PlaybackTiming},
    error::{NarrationError, PlaybackError, SynthesisError},
    settings::NarrationConfig,
    synthesis::{AudioRef, SynthesisClient, SynthesisRequest},
};

use super::retry::{RetryPolicy, VoicePlan};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub type ItemId = u64;

/// Invoked once when an item is spoken or dropped. Never invoked for items
/// discarded by [`NarrationQueue::stop`], and never after `stop` returns.
///
/// Runs while the queue's lock is held, so it must not call back into the
/// queue.
pub type CompletionCallback = Box<dyn FnOnce(NarrationOutcome) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarrationOutcome {
    Spoken,
    /// Retries ran out. Carries the last failure.
    Dropped(NarrationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NarrationEvent {
    Synthesizing { id: ItemId, attempt: u32 },
    Speaking { id: ItemId },
    Finished { id: ItemId },
    Dropped { id: ItemId, error: NarrationError },
}

/// The spoken part of an item. Kept apart from the callback so attempts can
/// borrow it across awaits.
struct Utterance {
    id: ItemId,
    text: String,
    voice_id: String,
    attempt_limit: u32,
}

struct QueueItem {
    utterance: Utterance,
    on_complete: Option<CompletionCallback>,
}

struct ActiveItem {
    id: ItemId,
    on_complete: Option<CompletionCallback>,
}

struct QueueState {
    pending: VecDeque<QueueItem>,
    next_id: ItemId,
    cancel: CancellationToken,
    running: bool,
    active: Option<ActiveItem>,
}

struct Inner {
    state: Mutex<QueueState>,
    synth: Arc<dyn SynthesisClient>,
    device: Arc<dyn PlaybackDevice>,
    policy: RetryPolicy,
    timing: PlaybackTiming,
    gap: Duration,
    paused: watch::Sender<bool>,
    events: broadcast::Sender<NarrationEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: NarrationEvent) {
        let _ = self.events.send(event);
    }
}

/// Serializes narration: one item is synthesized and played at a time, in
/// enqueue order.
///
/// Synthesis and playback failures are retried per [`RetryPolicy`] and then
/// dropped; they never escape the queue except as a [`NarrationOutcome`].
/// [`stop`](Self::stop) is the only cancellation primitive.
#[derive(Clone)]
pub struct NarrationQueue {
    inner: Arc<Inner>,
}

impl NarrationQueue {
    pub fn new(
        synth: Arc<dyn SynthesisClient>,
        device: Arc<dyn PlaybackDevice>,
        config: &NarrationConfig,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    next_id: 1,
                    cancel: CancellationToken::new(),
                    running: false,
                    active: None,
                }),
                synth,
                device,
                policy: RetryPolicy::from(config),
                timing: PlaybackTiming {
                    ready_timeout: Duration::from_millis(config.ready_timeout_ms),
                    stall_timeout: Duration::from_millis(config.stall_timeout_ms),
                },
                gap: Duration::from_millis(config.inter_item_gap_ms),
                paused,
                events,
            }),
        }
    }

    /// Appends to the pending list and returns immediately.
    pub fn enqueue(&self, text: impl Into<String>, voice_id: impl Into<String>) -> ItemId {
        self.push(text.into(), voice_id.into(), None, self.inner.policy.max_attempts, false)
    }

    pub fn enqueue_with_callback(
        &self,
        text: impl Into<String>,
        voice_id: impl Into<String>,
        on_complete: impl FnOnce(NarrationOutcome) + Send + 'static,
    ) -> ItemId {
        self.push(
            text.into(),
            voice_id.into(),
            Some(Box::new(on_complete)),
            self.inner.policy.max_attempts,
            false,
        )
    }

    /// Speaks `text` right away with a single attempt, but only when nothing
    /// is pending or in flight. Returns `None` if the queue was busy.
    pub fn speak_now(&self, text: impl Into<String>, voice_id: impl Into<String>) -> Option<ItemId> {
        {
            let state = self.inner.lock();
            if state.running || !state.pending.is_empty() {
                return None;
            }
        }
        Some(self.push(text.into(), voice_id.into(), None, 1, true))
    }

    fn push(
        &self,
        text: String,
        voice_id: String,
        on_complete: Option<CompletionCallback>,
        attempt_limit: u32,
        front: bool,
    ) -> ItemId {
        let id = {
            let mut state = self.inner.lock();
            let id = state.next_id;
            state.next_id += 1;
            let item = QueueItem {
                utterance: Utterance {
                    id,
                    text,
                    voice_id,
                    attempt_limit,
                },
                on_complete,
            };
            if front {
                state.pending.push_front(item);
            } else {
                state.pending.push_back(item);
            }
            id
        };
        log_debug!("narration item {} queued", id);
        self.kick();
        id
    }

    fn kick(&self) {
        match Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                handle.spawn(async move { queue.process_queue().await });
            }
            Err(_) => log_error!("narration queued outside a tokio runtime; not processing"),
        }
    }

    /// Drains the pending list. A second concurrent call returns at once.
    pub async fn process_queue(&self) {
        let token = {
            let mut state = self.inner.lock();
            if state.running {
                return;
            }
            state.running = true;
            state.cancel.clone()
        };

        loop {
            let utterance = {
                let mut state = self.inner.lock();
                if token.is_cancelled() {
                    return;
                }
                match state.pending.pop_front() {
                    Some(item) => {
                        state.active = Some(ActiveItem {
                            id: item.utterance.id,
                            on_complete: item.on_complete,
                        });
                        item.utterance
                    }
                    None => {
                        state.running = false;
                        state.active = None;
                        return;
                    }
                }
            };
            let id = utterance.id;

            let Some(outcome) = self.run_item(&utterance, &token).await else {
                log_debug!("narration item {} cancelled", id);
                return;
            };

            match &outcome {
                NarrationOutcome::Spoken => log_debug!("narration item {} finished", id),
                NarrationOutcome::Dropped(error) => {
                    log_warn!("dropping narration item {}: {}", id, error)
                }
            }

            {
                // `stop` takes the same lock, so once it returns this
                // epoch's callback can no longer run.
                let mut state = self.inner.lock();
                if token.is_cancelled() {
                    return;
                }
                let callback = state
                    .active
                    .take()
                    .filter(|active| active.id == id)
                    .and_then(|active| active.on_complete);
                if let Some(callback) = callback {
                    callback(outcome.clone());
                }
            }

            self.inner.emit(match outcome {
                NarrationOutcome::Spoken => NarrationEvent::Finished { id },
                NarrationOutcome::Dropped(error) => NarrationEvent::Dropped { id, error },
            });

            let more = !self.inner.lock().pending.is_empty();
            if more {
                tokio::select! {
                    _ = time::sleep(self.inner.gap) => {}
                    _ = token.cancelled() => return,
                }
            }
        }
    }

    /// Runs all attempts for one item. `None` means the queue was stopped.
    async fn run_item(
        &self,
        utterance: &Utterance,
        token: &CancellationToken,
    ) -> Option<NarrationOutcome> {
        let policy = &self.inner.policy;
        let mut plan = VoicePlan::new(&utterance.voice_id, policy.fallback_voice.as_deref());
        let mut audio: Option<AudioRef> = None;
        let mut last_error = None;
        let mut attempts = 0;

        while attempts < utterance.attempt_limit {
            if attempts > 0 {
                let delay = policy.backoff(attempts);
                tokio::select! {
                    _ = time::sleep(delay) => {}
                    _ = token.cancelled() => return None,
                }
            }

            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return None,
                result = self.attempt(utterance, &plan, &mut audio, attempts, token) => result,
            };

            let err = match result {
                Ok(()) => return Some(NarrationOutcome::Spoken),
                Err(err) => err,
            };
            log_warn!(
                "narration item {} attempt {}/{} failed: {}",
                utterance.id,
                attempts,
                utterance.attempt_limit,
                err
            );
            if !err.is_retryable() {
                return Some(NarrationOutcome::Dropped(err));
            }
            if let NarrationError::Synthesis(synth_err) = &err {
                if !synth_err.is_timeout() && plan.advance() {
                    log_info!(
                        "narration item {} falling back to voice {}",
                        utterance.id,
                        plan.current().voice_id
                    );
                }
            }
            last_error = Some(err);
        }

        Some(NarrationOutcome::Dropped(last_error.unwrap_or_else(|| {
            SynthesisError::Provider("no attempts allowed".into()).into()
        })))
    }

    async fn attempt(
        &self,
        utterance: &Utterance,
        plan: &VoicePlan,
        cached: &mut Option<AudioRef>,
        attempt: u32,
        token: &CancellationToken,
    ) -> Result<(), NarrationError> {
        let inner = &self.inner;

        let clip = match cached.clone() {
            Some(clip) => {
                log_debug!("replaying synthesized audio for item {}", utterance.id);
                clip
            }
            None => {
                let candidate = plan.current();
                inner.emit(NarrationEvent::Synthesizing {
                    id: utterance.id,
                    attempt,
                });
                let request = SynthesisRequest {
                    text: utterance.text.clone(),
                    voice_id: candidate.voice_id.clone(),
                    engine: candidate.engine,
                    timeout: inner.policy.synthesis_timeout,
                };
                let clip = match time::timeout(
                    inner.policy.synthesis_timeout,
                    inner.synth.synthesize(&request),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(SynthesisError::Timeout {
                            after_ms: inner.policy.synthesis_timeout.as_millis() as u64,
                        }
                        .into())
                    }
                };
                if clip.is_empty() {
                    return Err(SynthesisError::EmptyResponse.into());
                }
                *cached = Some(clip.clone());
                clip
            }
        };

        let events = {
            let _state = inner.lock();
            if token.is_cancelled() {
                return Err(PlaybackError::Device("narration stopped".into()).into());
            }
            inner.device.load(clip)?
        };
        inner.emit(NarrationEvent::Speaking { id: utterance.id });

        drive_playback(
            inner.device.as_ref(),
            events,
            inner.timing,
            inner.paused.subscribe(),
        )
        .await?;
        Ok(())
    }

    /// Clears the pending list, silences the device and discards the active
    /// item's callback. Safe to call in any state.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        state.cancel.cancel();
        state.cancel = CancellationToken::new();
        let discarded = state.pending.len() + usize::from(state.active.is_some());
        state.pending.clear();
        state.active = None;
        state.running = false;
        self.inner.paused.send_replace(false);
        self.inner.device.stop();
        drop(state);

        if discarded > 0 {
            log_info!("narration stopped, {} item(s) discarded", discarded);
        }
    }

    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
        self.inner.device.pause();
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
        self.inner.device.resume();
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    /// Whether anything is pending or in flight.
    pub fn is_active(&self) -> bool {
        let state = self.inner.lock();
        state.running || !state.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NarrationEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{ClipLength, SimulatedDevice},
        synthesis::VoiceEngine,
        test_support::{ScriptedSynthesis, Step},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    const CLIP: Duration = Duration::from_secs(1);

    fn queue_with(synth: Arc<ScriptedSynthesis>) -> (NarrationQueue, Arc<SimulatedDevice>) {
        let device = Arc::new(SimulatedDevice::new(ClipLength::Fixed(CLIP)));
        let queue = NarrationQueue::new(synth, device.clone(), &NarrationConfig::default());
        (queue, device)
    }

    async fn wait_idle(queue: &NarrationQueue) {
        while queue.is_active() {
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn labels(device: &SimulatedDevice) -> Vec<String> {
        device.records().into_iter().map(|r| r.label).collect()
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(NarrationOutcome) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = {
            let count = count.clone();
            move |_outcome: NarrationOutcome| {
                count.fetch_add(1, Ordering::SeqCst);
            }
        };
        (count, hook)
    }

    #[tokio::test(start_paused = true)]
    async fn items_play_in_enqueue_order() {
        let (queue, device) = queue_with(Arc::new(ScriptedSynthesis::succeeding()));

        queue.enqueue("A", "Joanna");
        queue.enqueue("B", "Joanna");
        wait_idle(&queue).await;

        assert_eq!(labels(&device), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn playback_intervals_never_overlap() {
        let synth = Arc::new(
            ScriptedSynthesis::succeeding().with_latency(Duration::from_millis(250)),
        );
        let (queue, device) = queue_with(synth);

        for index in 0..6 {
            queue.enqueue(format!("line {index}"), "Joanna");
            if index % 2 == 0 {
                time::sleep(Duration::from_millis(700)).await;
            }
        }
        // A second runner must not start a parallel pass.
        queue.process_queue().await;
        wait_idle(&queue).await;

        let records = device.records();
        assert_eq!(records.len(), 6);
        for pair in records.windows(2) {
            let ended = pair[0].ended_at.unwrap();
            assert!(ended <= pair[1].started_at, "{:?} overlaps {:?}", pair[0], pair[1]);
            assert!(pair[1].started_at - ended >= Duration::from_millis(300));
        }
        assert!(records.iter().all(|r| !r.interrupted));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_playback_discards_everything() {
        let (queue, device) = queue_with(Arc::new(ScriptedSynthesis::succeeding()));
        let (first_calls, first_hook) = counter();
        let (second_calls, second_hook) = counter();

        queue.enqueue_with_callback("first", "Joanna", first_hook);
        queue.enqueue_with_callback("second", "Joanna", second_hook);
        queue.enqueue("third", "Joanna");

        time::sleep(Duration::from_millis(500)).await;
        assert!(device.is_playing());
        queue.stop();

        assert_eq!(queue.pending_len(), 0);
        assert!(!queue.is_active());
        assert!(!device.is_playing());

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        let records = device.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_is_usable_after_stop() {
        let (queue, device) = queue_with(Arc::new(ScriptedSynthesis::succeeding()));
        queue.enqueue("old", "Joanna");
        time::sleep(Duration::from_millis(200)).await;
        queue.stop();

        queue.enqueue("new", "Joanna");
        wait_idle(&queue).await;
        assert_eq!(labels(&device), vec!["old", "new"]);
        assert!(!device.records()[1].interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_timeouts_drop_item_and_fire_callback_once() {
        let synth = Arc::new(ScriptedSynthesis::new(vec![Step::Hang, Step::Hang, Step::Hang]));
        let (queue, device) = queue_with(synth.clone());
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let mut events = queue.subscribe();

        let started = Instant::now();
        let id = {
            let outcomes = outcomes.clone();
            queue.enqueue_with_callback("intro", "Joanna", move |outcome| {
                outcomes.lock().unwrap().push(outcome);
            })
        };
        queue.enqueue("after", "Joanna");
        wait_idle(&queue).await;

        let outcomes = outcomes.lock().unwrap().clone();
        assert_eq!(
            outcomes,
            vec![NarrationOutcome::Dropped(NarrationError::Synthesis(
                SynthesisError::Timeout { after_ms: 12_000 }
            ))]
        );
        // Three 12s attempts with 500ms and 1s backoff in between.
        let intro_calls: Vec<_> = synth.calls().into_iter().filter(|c| c.text == "intro").collect();
        assert_eq!(intro_calls.len(), 3);
        assert!(intro_calls.iter().all(|c| c.voice_id == "Joanna"));
        assert_eq!(labels(&device), vec!["after"]);
        assert!(device.records()[0].started_at - started >= Duration::from_millis(37_500));

        let mut dropped = 0;
        while let Ok(event) = events.try_recv() {
            if event == (NarrationEvent::Dropped { id, error: SynthesisError::Timeout { after_ms: 12_000 }.into() }) {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_errors_walk_the_voice_plan() {
        let synth = Arc::new(ScriptedSynthesis::new(vec![
            Step::Fail(SynthesisError::Provider("generative unavailable".into())),
            Step::Fail(SynthesisError::EmptyResponse),
            Step::Succeed,
        ]));
        let (queue, device) = queue_with(synth.clone());

        queue.enqueue("hello", "Olivia");
        wait_idle(&queue).await;

        let tried: Vec<(String, Option<VoiceEngine>)> = synth
            .calls()
            .into_iter()
            .map(|c| (c.voice_id, c.engine))
            .collect();
        assert_eq!(
            tried,
            vec![
                ("Olivia".into(), Some(VoiceEngine::Generative)),
                ("Olivia".into(), Some(VoiceEngine::Neural)),
                ("Joanna".into(), Some(VoiceEngine::Neural)),
            ]
        );
        assert_eq!(labels(&device), vec!["hello"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_the_same_voice() {
        let synth = Arc::new(ScriptedSynthesis::new(vec![Step::Hang, Step::Succeed]));
        let (queue, _device) = queue_with(synth.clone());

        queue.enqueue("hello", "Olivia");
        wait_idle(&queue).await;

        let engines: Vec<_> = synth.calls().into_iter().map(|c| c.engine).collect();
        assert_eq!(
            engines,
            vec![Some(VoiceEngine::Generative), Some(VoiceEngine::Generative)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn playback_failure_replays_without_resynthesis() {
        let synth = Arc::new(ScriptedSynthesis::succeeding());
        let (queue, device) = queue_with(synth.clone());
        device.fail_next_loads(1);

        let (calls, hook) = counter();
        queue.enqueue_with_callback("retry me", "Joanna", hook);
        wait_idle(&queue).await;

        assert_eq!(synth.calls().len(), 1);
        assert_eq!(device.load_count(), 2);
        assert_eq!(labels(&device), vec!["retry me"]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn speak_now_only_when_idle() {
        let (queue, device) = queue_with(Arc::new(ScriptedSynthesis::succeeding()));

        queue.enqueue("queued", "Joanna");
        assert!(queue.speak_now("immediate", "Joanna").is_none());
        wait_idle(&queue).await;

        assert!(queue.speak_now("immediate", "Joanna").is_some());
        wait_idle(&queue).await;
        assert_eq!(labels(&device), vec!["queued", "immediate"]);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_queue_holds_playback_until_resumed() {
        let (queue, device) = queue_with(Arc::new(ScriptedSynthesis::succeeding()));
        queue.pause();
        queue.enqueue("held", "Joanna");

        time::sleep(Duration::from_secs(20)).await;
        assert!(device.records().is_empty());
        assert!(queue.is_active());

        queue.resume();
        wait_idle(&queue).await;
        assert_eq!(labels(&device), vec!["held"]);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_mid_item_resumes_where_it_left_off() {
        let (queue, device) = queue_with(Arc::new(ScriptedSynthesis::succeeding()));
        queue.enqueue("long", "Joanna");

        time::sleep(Duration::from_millis(400)).await;
        queue.pause();
        assert!(device.is_paused());
        time::sleep(Duration::from_secs(60)).await;
        assert!(queue.is_active());

        queue.resume();
        wait_idle(&queue).await;
        let record = &device.records()[0];
        assert!(!record.interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn long_narration_plays_once_to_the_end() {
        let synth = Arc::new(ScriptedSynthesis::succeeding());
        let device = Arc::new(SimulatedDevice::new(ClipLength::Fixed(Duration::from_secs(35))));
        let queue = NarrationQueue::new(synth.clone(), device.clone(), &NarrationConfig::default());
        let outcomes = Arc::new(Mutex::new(Vec::new()));

        {
            let outcomes = outcomes.clone();
            queue.enqueue_with_callback("a very long segment", "Joanna", move |outcome| {
                outcomes.lock().unwrap().push(outcome);
            });
        }
        wait_idle(&queue).await;

        assert_eq!(*outcomes.lock().unwrap(), vec![NarrationOutcome::Spoken]);
        assert_eq!(synth.calls().len(), 1);
        let records = device.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn callback_never_runs_once_stop_returns() {
        let (queue, _device) = queue_with(Arc::new(ScriptedSynthesis::succeeding()));
        let (calls, hook) = counter();

        queue.enqueue_with_callback("edge", "Joanna", hook);
        // Stop right as the clip ends, racing the completion.
        time::sleep(CLIP).await;
        queue.stop();
        let seen = calls.load(Ordering::SeqCst);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn processing_future_can_move_between_threads() {
        fn assert_send<T: Send>(_: &T) {}
        let (queue, _device) = queue_with(Arc::new(ScriptedSynthesis::succeeding()));
        let future = queue.process_queue();
        assert_send(&future);
    }
}
