//! Queued, interruptible text-to-speech playback.
//!
//! Narrative lines are appended to a strict-FIFO queue and drained by a
//! single consumer task: one item in flight at a time, synthesized and
//! then played to completion before the next item starts. Overlapping
//! speech is incoherent to a listener, so the queue is never parallelized
//! or reordered. `stop()` aborts in-flight synthesis/playback, clears the
//! queue and the caption; a failed item never stalls the ones behind it.
//!
//! Synthesis and audio output sit behind traits so the pipeline can be
//! tested without a network or a sound card.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ClientError, Result};
use crate::voices::VoiceMappingCache;

/// Synthesized audio in a container format the output can decode.
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
}

/// Turns (voice, text) into playable audio. May suspend on the network.
pub trait Synthesizer: Send + Sync + 'static {
    fn synthesize(&self, voice: &str, text: &str) -> BoxFuture<'static, Result<AudioClip>>;
}

/// Plays one clip at a time. `play` resolves when the clip finishes or is
/// stopped; `stop` halts the in-flight clip immediately.
pub trait AudioOutput: Send + Sync + 'static {
    /// One-time unlock of the audio device. Idempotent at the player
    /// level; implementations may assume it is called at most once
    /// successfully.
    fn initialize(&self) -> BoxFuture<'static, Result<()>>;
    fn play(&self, clip: AudioClip) -> BoxFuture<'static, Result<()>>;
    fn set_volume(&self, volume: f32);
    fn set_muted(&self, muted: bool);
    fn stop(&self);
}

/// A pending playback unit. Consumed exactly once; never re-enters the
/// queue after it finishes or fails.
#[derive(Debug)]
pub struct TtsItem {
    pub speaker: String,
    pub text: String,
    /// Resolved at synthesis time (not enqueue time) when absent, since
    /// the voice mapping may change while the item waits.
    pub voice: Option<String>,
}

/// What is currently being spoken, for UI captioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caption {
    pub speaker: String,
    pub text: String,
}

struct PlayerShared {
    synth: Arc<dyn Synthesizer>,
    output: Arc<dyn AudioOutput>,
    voices: Arc<VoiceMappingCache>,
    queue: Mutex<VecDeque<TtsItem>>,
    wakeup: Notify,
    enabled: AtomicBool,
    initialized: AtomicBool,
    muted: AtomicBool,
    volume: Mutex<f32>,
    caption_tx: watch::Sender<Option<Caption>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the playback pipeline. Cheap to clone; all clones share the
/// same queue and configuration.
#[derive(Clone)]
pub struct TtsPlayer {
    shared: Arc<PlayerShared>,
}

impl TtsPlayer {
    pub fn new(
        synth: Arc<dyn Synthesizer>,
        output: Arc<dyn AudioOutput>,
        voices: Arc<VoiceMappingCache>,
        enabled: bool,
        volume: f32,
    ) -> Self {
        let (caption_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(PlayerShared {
                synth,
                output,
                voices,
                queue: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                enabled: AtomicBool::new(enabled),
                initialized: AtomicBool::new(false),
                muted: AtomicBool::new(false),
                volume: Mutex::new(volume.clamp(0.0, 1.0)),
                caption_tx,
                worker: Mutex::new(None),
            }),
        }
    }

    /// Append a speech item. Accepted even while the consumer is stopped
    /// or audio is not yet unlocked; such items wait in order.
    pub fn enqueue(&self, speaker: impl Into<String>, text: impl Into<String>, voice: Option<String>) {
        let item = TtsItem {
            speaker: speaker.into(),
            text: text.into(),
            voice,
        };
        debug!("🎙️ Enqueued line from {:?}", item.speaker);
        self.shared
            .queue
            .lock()
            .expect("tts queue lock poisoned")
            .push_back(item);
        self.shared.wakeup.notify_one();
    }

    /// Start the consumer loop. No-op if it is already running.
    pub fn start(&self) {
        let mut worker = self.shared.worker.lock().expect("tts worker lock poisoned");
        if let Some(handle) = worker.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        info!("▶️ TTS consumer started");
        let shared = self.shared.clone();
        *worker = Some(tokio::spawn(run_consumer(shared)));
    }

    /// Halt playback immediately: abort the in-flight item, clear the
    /// queue and the caption. Stopped items are never resumed.
    pub fn stop(&self) {
        if let Some(handle) = self
            .shared
            .worker
            .lock()
            .expect("tts worker lock poisoned")
            .take()
        {
            handle.abort();
        }
        self.shared.output.stop();
        let dropped = {
            let mut queue = self.shared.queue.lock().expect("tts queue lock poisoned");
            let n = queue.len();
            queue.clear();
            n
        };
        self.shared.caption_tx.send_replace(None);
        info!("⏹️ TTS stopped ({} queued items dropped)", dropped);
    }

    /// One-time audio unlock. Must be driven from a user interaction on
    /// platforms that gate audio output; idempotent after success.
    /// Failure leaves audio locked but the queue keeps accepting items,
    /// so the game stays playable without narration.
    pub async fn initialize_audio(&self) -> Result<()> {
        if self.shared.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.shared.output.initialize().await {
            Ok(()) => {
                self.shared.initialized.store(true, Ordering::SeqCst);
                self.shared.wakeup.notify_one();
                info!("🔊 Audio output unlocked");
                Ok(())
            }
            Err(e) => {
                warn!("Audio unlock failed, narration disabled: {}", e);
                Err(e)
            }
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    /// Applies to the currently playing item immediately.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::SeqCst);
        self.shared.output.set_muted(muted);
    }

    /// Applies to the currently playing item immediately.
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        *self.shared.volume.lock().expect("tts volume lock poisoned") = volume;
        self.shared.output.set_volume(volume);
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().expect("tts queue lock poisoned").len()
    }

    /// Watch the current caption (speaker/text of the playing item).
    pub fn caption_watch(&self) -> watch::Receiver<Option<Caption>> {
        self.shared.caption_tx.subscribe()
    }
}

/// Single-consumer drain loop: one item in flight at a time, strict FIFO.
async fn run_consumer(shared: Arc<PlayerShared>) {
    loop {
        let item = {
            loop {
                // Register interest before checking, so a concurrent
                // enqueue/unlock cannot be missed
                let notified = shared.wakeup.notified();
                if shared.initialized.load(Ordering::SeqCst) {
                    let popped = shared
                        .queue
                        .lock()
                        .expect("tts queue lock poisoned")
                        .pop_front();
                    if let Some(item) = popped {
                        break item;
                    }
                }
                notified.await;
            }
        };

        let voice = match item.voice.clone() {
            Some(voice) => voice,
            None => shared.voices.resolve(&item.speaker),
        };
        debug!("🎙️ Synthesizing line from {:?} with voice {:?}", item.speaker, voice);

        match shared.synth.synthesize(&voice, &item.text).await {
            Ok(clip) => {
                shared.caption_tx.send_replace(Some(Caption {
                    speaker: item.speaker.clone(),
                    text: item.text.clone(),
                }));
                // Honor the configuration at the moment playback starts;
                // later changes reach the output directly via
                // set_volume/set_muted
                let volume = *shared.volume.lock().expect("tts volume lock poisoned");
                shared.output.set_volume(volume);
                shared
                    .output
                    .set_muted(shared.muted.load(Ordering::SeqCst));

                match shared.output.play(clip).await {
                    Ok(()) => debug!("✅ Finished line from {:?}", item.speaker),
                    Err(e) => error!("Playback failed for {:?}: {}", item.speaker, e),
                }
            }
            Err(e) => {
                // Non-fatal: a single bad line must not stall the rest
                error!("Synthesis failed for {:?}: {}", item.speaker, e);
            }
        }

        // Clear the caption only when nothing is about to follow, to
        // avoid flicker between back-to-back lines. Failed items reach
        // this too, so a caption never outlives the last spoken line
        let empty = shared
            .queue
            .lock()
            .expect("tts queue lock poisoned")
            .is_empty();
        if empty {
            shared.caption_tx.send_replace(None);
        }
    }
}

/// HTTP synthesizer hitting the backend's speech endpoint.
pub struct HttpSynthesizer {
    http: reqwest::Client,
    url: String,
}

impl HttpSynthesizer {
    pub fn new(http: reqwest::Client, api_url: &str) -> Self {
        Self {
            http,
            url: format!("{}/tts", api_url),
        }
    }
}

impl Synthesizer for HttpSynthesizer {
    fn synthesize(&self, voice: &str, text: &str) -> BoxFuture<'static, Result<AudioClip>> {
        let http = self.http.clone();
        let url = self.url.clone();
        let body = serde_json::json!({ "voice": voice, "text": text });
        async move {
            let response = http.post(&url).json(&body).send().await?;
            let response = response
                .error_for_status()
                .map_err(|e| ClientError::Synthesis(e.to_string()))?;
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                return Err(ClientError::Synthesis("empty audio payload".to_string()));
            }
            Ok(AudioClip {
                bytes: bytes.to_vec(),
            })
        }
        .boxed()
    }
}

enum OutputCommand {
    Play(AudioClip, oneshot::Sender<Result<()>>),
    SetVolume(f32),
    SetMuted(bool),
    Stop,
}

/// Rodio-backed output. The `OutputStream` is not `Send`, so the sink
/// lives on a dedicated OS thread fed by a command channel, the same
/// shape as a dedicated audio-capture thread behind an async facade.
pub struct RodioOutput {
    tx: Mutex<Option<std::sync::mpsc::Sender<OutputCommand>>>,
}

impl RodioOutput {
    pub fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    fn send(&self, cmd: OutputCommand) {
        let tx = self.tx.lock().expect("rodio command lock poisoned");
        if let Some(tx) = tx.as_ref() {
            if tx.send(cmd).is_err() {
                error!("Audio thread is gone; command dropped");
            }
        }
    }
}

impl Default for RodioOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioOutput for RodioOutput {
    fn initialize(&self) -> BoxFuture<'static, Result<()>> {
        let (tx, rx) = std::sync::mpsc::channel::<OutputCommand>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        std::thread::spawn(move || run_audio_thread(rx, ready_tx));

        let slot = self.tx.lock().expect("rodio command lock poisoned").replace(tx);
        drop(slot);

        async move {
            match ready_rx.await {
                Ok(result) => result,
                Err(_) => Err(ClientError::AudioUnavailable(
                    "audio thread exited during startup".to_string(),
                )),
            }
        }
        .boxed()
    }

    fn play(&self, clip: AudioClip) -> BoxFuture<'static, Result<()>> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(OutputCommand::Play(clip, done_tx));
        async move {
            match done_rx.await {
                Ok(result) => result,
                // Sender dropped by Stop: the clip was halted, not failed
                Err(_) => Ok(()),
            }
        }
        .boxed()
    }

    fn set_volume(&self, volume: f32) {
        self.send(OutputCommand::SetVolume(volume));
    }

    fn set_muted(&self, muted: bool) {
        self.send(OutputCommand::SetMuted(muted));
    }

    fn stop(&self) {
        self.send(OutputCommand::Stop);
    }
}

/// Dedicated audio thread: owns the rodio stream and sink, polls for
/// commands while watching for end-of-clip.
fn run_audio_thread(
    rx: std::sync::mpsc::Receiver<OutputCommand>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let stream = match rodio::OutputStream::try_default() {
        Ok((stream, handle)) => {
            let sink = match rodio::Sink::try_new(&handle) {
                Ok(sink) => sink,
                Err(e) => {
                    let _ = ready_tx.send(Err(ClientError::AudioUnavailable(e.to_string())));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            Some((stream, sink))
        }
        Err(e) => {
            let _ = ready_tx.send(Err(ClientError::AudioUnavailable(e.to_string())));
            return;
        }
    };
    let Some((_stream, sink)) = stream else { return };

    let mut volume: f32 = 1.0;
    let mut muted = false;
    let mut pending_done: Option<oneshot::Sender<Result<()>>> = None;

    loop {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(OutputCommand::Play(clip, done_tx)) => {
                match rodio::Decoder::new(Cursor::new(clip.bytes)) {
                    Ok(source) => {
                        sink.set_volume(if muted { 0.0 } else { volume });
                        sink.append(source);
                        sink.play();
                        pending_done = Some(done_tx);
                    }
                    Err(e) => {
                        let _ = done_tx.send(Err(ClientError::AudioUnavailable(format!(
                            "undecodable clip: {}",
                            e
                        ))));
                    }
                }
            }
            Ok(OutputCommand::SetVolume(v)) => {
                volume = v;
                sink.set_volume(if muted { 0.0 } else { volume });
            }
            Ok(OutputCommand::SetMuted(m)) => {
                muted = m;
                sink.set_volume(if muted { 0.0 } else { volume });
            }
            Ok(OutputCommand::Stop) => {
                sink.stop();
                // Dropping the sender tells play() the clip was halted
                pending_done = None;
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                sink.stop();
                break;
            }
        }

        if sink.empty() {
            if let Some(done_tx) = pending_done.take() {
                let _ = done_tx.send(Ok(()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{sleep, timeout};

    /// Synthesizer that fails for texts containing a marker and otherwise
    /// returns a tiny clip after a short delay.
    struct FakeSynth {
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeSynth {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl Synthesizer for FakeSynth {
        fn synthesize(&self, voice: &str, text: &str) -> BoxFuture<'static, Result<AudioClip>> {
            self.calls
                .lock()
                .unwrap()
                .push((voice.to_string(), text.to_string()));
            let fail = text.contains("FAIL");
            let bytes = text.as_bytes().to_vec();
            async move {
                sleep(Duration::from_millis(5)).await;
                if fail {
                    Err(ClientError::Synthesis("injected".to_string()))
                } else {
                    Ok(AudioClip { bytes })
                }
            }
            .boxed()
        }
    }

    /// Output that records what played and simulates playback duration.
    struct FakeOutput {
        played: Mutex<Vec<String>>,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: AtomicUsize,
        stopped: AtomicBool,
        init_ok: bool,
        play_ms: u64,
    }

    impl FakeOutput {
        fn with_init(play_ms: u64, init_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                played: Mutex::new(Vec::new()),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                init_ok,
                play_ms,
            })
        }

        fn new(play_ms: u64) -> Arc<Self> {
            Self::with_init(play_ms, true)
        }

        fn failing_init() -> Arc<Self> {
            Self::with_init(1, false)
        }
    }

    impl AudioOutput for FakeOutput {
        fn initialize(&self) -> BoxFuture<'static, Result<()>> {
            let ok = self.init_ok;
            async move {
                if ok {
                    Ok(())
                } else {
                    Err(ClientError::AudioUnavailable("no user gesture".to_string()))
                }
            }
            .boxed()
        }

        fn play(&self, clip: AudioClip) -> BoxFuture<'static, Result<()>> {
            let text = String::from_utf8(clip.bytes).unwrap();
            let n = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(n, Ordering::SeqCst);
            self.played.lock().unwrap().push(text);
            let ms = self.play_ms;
            let in_flight = self.in_flight.clone();
            async move {
                sleep(Duration::from_millis(ms)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }

        fn set_volume(&self, _volume: f32) {}
        fn set_muted(&self, _muted: bool) {}

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn voices() -> Arc<VoiceMappingCache> {
        let cache = VoiceMappingCache::new(reqwest::Client::new(), "http://unused", "narrator");
        cache.replace(std::collections::HashMap::from([(
            "张三".to_string(),
            "voice-a".to_string(),
        )]));
        Arc::new(cache)
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        timeout(Duration::from_secs(2), async {
            while !cond() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn plays_in_strict_fifo_order() {
        let synth = FakeSynth::new();
        let output = FakeOutput::new(10);
        let player = TtsPlayer::new(synth.clone(), output.clone(), voices(), true, 1.0);

        // Enqueued while stopped; nothing plays yet
        player.enqueue("张三", "你好", None);
        player.enqueue("李四", "在吗", None);
        assert_eq!(player.queue_len(), 2);

        player.initialize_audio().await.unwrap();
        player.start();

        wait_until(|| output.played.lock().unwrap().len() == 2).await;
        assert_eq!(
            *output.played.lock().unwrap(),
            vec!["你好".to_string(), "在吗".to_string()]
        );
        // Never two clips in flight at once
        assert_eq!(output.max_in_flight.load(Ordering::SeqCst), 1);

        // Voice resolved at synthesis time via the mapping, with default
        // fallback for the unmapped speaker
        let calls = synth.calls.lock().unwrap();
        assert_eq!(calls[0].0, "voice-a");
        assert_eq!(calls[1].0, "narrator");
    }

    #[tokio::test]
    async fn caption_tracks_current_speaker_then_clears() {
        let synth = FakeSynth::new();
        let output = FakeOutput::new(50);
        let player = TtsPlayer::new(synth, output.clone(), voices(), true, 1.0);
        let mut captions = player.caption_watch();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_writer = seen.clone();
        let collector = tokio::spawn(async move {
            while captions.changed().await.is_ok() {
                let value = captions.borrow().clone();
                let done = value.is_none();
                seen_writer.lock().unwrap().push(value.map(|c| c.speaker));
                if done {
                    break;
                }
            }
        });

        player.initialize_audio().await.unwrap();
        player.start();
        player.enqueue("张三", "你好", None);
        player.enqueue("李四", "在吗", None);

        timeout(Duration::from_secs(2), collector).await.unwrap().unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                Some("张三".to_string()),
                Some("李四".to_string()),
                None
            ]
        );
    }

    #[tokio::test]
    async fn failed_synthesis_does_not_block_next_item() {
        let synth = FakeSynth::new();
        let output = FakeOutput::new(1);
        let player = TtsPlayer::new(synth, output.clone(), voices(), true, 1.0);
        player.initialize_audio().await.unwrap();
        player.start();

        player.enqueue("张三", "FAIL 这句坏了", None);
        player.enqueue("李四", "这句没问题", None);

        wait_until(|| !output.played.lock().unwrap().is_empty()).await;
        assert_eq!(*output.played.lock().unwrap(), vec!["这句没问题".to_string()]);
    }

    #[tokio::test]
    async fn caption_clears_when_the_last_item_fails() {
        let synth = FakeSynth::new();
        let output = FakeOutput::new(1);
        let player = TtsPlayer::new(synth, output.clone(), voices(), true, 1.0);
        player.initialize_audio().await.unwrap();
        player.start();

        player.enqueue("张三", "你好", None);
        player.enqueue("李四", "FAIL 坏掉的一句", None);

        wait_until(|| output.played.lock().unwrap().len() == 1).await;
        // The trailing failure must not leave 张三 published as the
        // current speaker while nothing is playing
        wait_until(|| player.caption_watch().borrow().is_none()).await;
        assert_eq!(player.queue_len(), 0);
    }

    #[tokio::test]
    async fn stop_aborts_in_flight_item_and_clears_queue() {
        let synth = FakeSynth::new();
        let output = FakeOutput::new(10_000); // effectively never finishes
        let player = TtsPlayer::new(synth, output.clone(), voices(), true, 1.0);
        player.initialize_audio().await.unwrap();
        player.start();

        player.enqueue("张三", "很长的一段话", None);
        player.enqueue("李四", "永远轮不到", None);
        wait_until(|| output.played.lock().unwrap().len() == 1).await;

        player.stop();
        assert!(output.stopped.load(Ordering::SeqCst));
        assert_eq!(player.queue_len(), 0);
        assert!(player.caption_watch().borrow().is_none());

        // Nothing resumes afterward
        sleep(Duration::from_millis(50)).await;
        assert_eq!(output.played.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn items_wait_while_audio_is_locked() {
        let synth = FakeSynth::new();
        let output = FakeOutput::new(1);
        let player = TtsPlayer::new(synth, output.clone(), voices(), true, 1.0);
        player.start();

        player.enqueue("张三", "先等着", None);
        sleep(Duration::from_millis(30)).await;
        // Not initialized: the item queues pending future unlock
        assert_eq!(player.queue_len(), 1);
        assert!(output.played.lock().unwrap().is_empty());

        player.initialize_audio().await.unwrap();
        wait_until(|| output.played.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn failed_unlock_keeps_game_playable() {
        let synth = FakeSynth::new();
        let output = FakeOutput::failing_init();
        let player = TtsPlayer::new(synth, output, voices(), true, 1.0);
        player.start();

        assert!(player.initialize_audio().await.is_err());
        assert!(player.is_enabled());
        assert!(!player.is_initialized());

        // Enqueue still accepts items without panicking
        player.enqueue("张三", "排队等解锁", None);
        assert_eq!(player.queue_len(), 1);
    }

    #[tokio::test]
    async fn restart_after_stop_plays_fresh_items() {
        let synth = FakeSynth::new();
        let output = FakeOutput::new(1);
        let player = TtsPlayer::new(synth, output.clone(), voices(), true, 1.0);
        player.initialize_audio().await.unwrap();
        player.start();
        player.stop();

        player.enqueue("李四", "新的一句", None);
        player.start();
        wait_until(|| output.played.lock().unwrap().len() == 1).await;
        assert_eq!(*output.played.lock().unwrap(), vec!["新的一句".to_string()]);
    }
}
