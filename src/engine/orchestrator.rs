//! Engine orchestrator.
//!
//! Owns the tier workers: fans audio out to each of them, routes draft
//! tokens down the cascade, folds tier outputs into the transcript, and
//! restarts a crashed worker once with its original configuration. A single
//! pump thread consumes all worker events, so transcript mutations and sink
//! notifications are serialized and every sink callback sees a consistent
//! snapshot.

use crate::asr::AsrModelFactory;
use crate::audio::AudioSource;
use crate::config::{CascadePolicy, EngineConfig, TierConfig, TierMode};
use crate::defaults;
use crate::engine::merge::{Segment, Transcript};
use crate::engine::messages::{Hypothesis, TierCommand, TierEvent, TimingStats};
use crate::engine::sink::{TranscriptSink, TranscriptUpdate};
use crate::error::{EngineError, Result};
use crate::tier::worker::{self, WorkerOptions};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type CommandMap = Arc<Mutex<BTreeMap<u8, Sender<TierCommand>>>>;

/// Messages consumed by the pump thread.
enum PumpMsg {
    Tier(TierEvent),
    WorkerExited { level: u8, panicked: bool },
    Commit,
    Stop,
}

/// Multi-tier transcription engine, configured but not yet running.
pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Starts one worker per enabled tier and waits until every tier has
    /// either reported ready or refused to serve.
    ///
    /// Fails without side effects on configuration errors, and fails with
    /// [`EngineError::NoServingTier`] when no tier survives model loading.
    pub fn start(
        self,
        factory: Arc<dyn AsrModelFactory>,
        sink: Box<dyn TranscriptSink>,
    ) -> Result<EngineHandle> {
        let tiers = self.config.resolve_tiers()?;
        let options = WorkerOptions {
            language: self.config.language.clone(),
            max_new_tokens: self.config.max_new_tokens,
        };

        let running = Arc::new(AtomicBool::new(true));
        let commands: CommandMap = Arc::new(Mutex::new(BTreeMap::new()));
        let (pump_tx, pump_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let (result_tx, result_rx) = bounded(1);

        for tier in &tiers {
            let sender = spawn_tier(tier.clone(), options.clone(), factory.clone(), pump_tx.clone());
            commands.lock().unwrap().insert(tier.level, sender);
        }

        let pump = Pump {
            tiers: tiers.iter().map(|t| (t.level, t.clone())).collect(),
            downstream_of: adjacent_pairs(&tiers),
            cascade: self.config.cascade,
            options,
            factory,
            running: running.clone(),
            commands: commands.clone(),
            pump_tx: pump_tx.clone(),
            sink,
            transcript: Transcript::new(),
            hypothesis: None,
            timing: BTreeMap::new(),
            restarts: BTreeMap::new(),
            live: tiers.iter().map(|t| t.level).collect(),
            pending_ready: tiers.iter().map(|t| t.level).collect(),
            ready_count: 0,
            ready_tx: Some(ready_tx),
            result_tx: Some(result_tx),
            stopping: false,
        };
        let pump_thread = thread::spawn(move || pump.run(pump_rx));

        let handle = EngineHandle {
            running,
            commands,
            pump_tx,
            pump_thread: Some(pump_thread),
            result_rx,
        };

        match ready_rx.recv() {
            Ok(ready) if ready > 0 => Ok(handle),
            _ => {
                handle.stop();
                Err(EngineError::NoServingTier)
            }
        }
    }
}

/// Spawns a worker plus its companion thread, returning the worker's
/// command queue.
///
/// The companion forwards every worker event into the pump and only then
/// joins the worker thread to report its exit, so `WorkerExited` always
/// arrives after the worker's last event. The worker drops its event sender
/// when it ends (panics included), which is what ends the forwarding loop.
fn spawn_tier(
    tier: TierConfig,
    options: WorkerOptions,
    factory: Arc<dyn AsrModelFactory>,
    pump_tx: Sender<PumpMsg>,
) -> Sender<TierCommand> {
    let level = tier.level;
    let (events_tx, events_rx) = unbounded();
    let runtime = worker::spawn(tier, options, factory, events_tx);

    let worker_thread = runtime.thread;
    thread::spawn(move || {
        while let Ok(event) = events_rx.recv() {
            if pump_tx.send(PumpMsg::Tier(event)).is_err() {
                break;
            }
        }
        let panicked = worker_thread.join().is_err();
        let _ = pump_tx.send(PumpMsg::WorkerExited { level, panicked });
    });

    runtime.commands
}

/// Downstream neighbor for every enabled tier, in level order.
fn adjacent_pairs(tiers: &[TierConfig]) -> BTreeMap<u8, u8> {
    tiers
        .windows(2)
        .map(|pair| (pair[0].level, pair[1].level))
        .collect()
}

/// Handle to a running engine.
pub struct EngineHandle {
    running: Arc<AtomicBool>,
    commands: CommandMap,
    pump_tx: Sender<PumpMsg>,
    pump_thread: Option<JoinHandle<()>>,
    result_rx: Receiver<Vec<Segment>>,
}

impl EngineHandle {
    /// Broadcasts samples to every active tier.
    ///
    /// Per-tier queues are FIFO, so two pushes are observed by every tier
    /// in call order. An empty push is a no-op.
    pub fn push_audio(&self, samples: &[f32]) -> Result<()> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        if samples.is_empty() {
            return Ok(());
        }
        let commands = self.commands.lock().unwrap();
        for sender in commands.values() {
            // A tier mid-restart misses this buffer; the dominance rule
            // absorbs the gap once it is back.
            let _ = sender.send(TierCommand::Audio(samples.to_vec()));
        }
        Ok(())
    }

    /// Flushes every tier's buffers and appends a separator to the
    /// transcript at its current tail.
    pub fn commit(&self) -> Result<()> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let commands = self.commands.lock().unwrap();
        for sender in commands.values() {
            let _ = sender.send(TierCommand::Commit);
        }
        drop(commands);
        let _ = self.pump_tx.send(PumpMsg::Commit);
        Ok(())
    }

    /// Drains an audio source into the engine until it reports exhaustion.
    pub fn feed_from(&self, source: &mut dyn AudioSource) -> Result<()> {
        source.start()?;
        loop {
            let samples = source.read_samples()?;
            if samples.is_empty() {
                break;
            }
            self.push_audio(&samples)?;
        }
        source.stop()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops all tiers cooperatively and returns the final transcript.
    ///
    /// Each worker finishes the commands already queued (including any
    /// in-flight inference) before terminating.
    pub fn stop(mut self) -> Vec<Segment> {
        self.running.store(false, Ordering::SeqCst);
        {
            let commands = self.commands.lock().unwrap();
            for sender in commands.values() {
                let _ = sender.send(TierCommand::Stop);
            }
        }
        let _ = self.pump_tx.send(PumpMsg::Stop);
        let segments = self.result_rx.recv().unwrap_or_default();
        if let Some(handle) = self.pump_thread.take() {
            let _ = handle.join();
        }
        segments
    }
}

/// State owned by the pump thread.
struct Pump {
    tiers: BTreeMap<u8, TierConfig>,
    downstream_of: BTreeMap<u8, u8>,
    cascade: CascadePolicy,
    options: WorkerOptions,
    factory: Arc<dyn AsrModelFactory>,
    running: Arc<AtomicBool>,
    commands: CommandMap,
    pump_tx: Sender<PumpMsg>,
    sink: Box<dyn TranscriptSink>,
    transcript: Transcript,
    hypothesis: Option<Hypothesis>,
    timing: BTreeMap<u8, TimingStats>,
    restarts: BTreeMap<u8, u32>,
    /// Levels whose worker thread is currently alive.
    live: BTreeSet<u8>,
    /// Levels that have not yet reported ready or load failure.
    pending_ready: BTreeSet<u8>,
    ready_count: usize,
    ready_tx: Option<Sender<usize>>,
    result_tx: Option<Sender<Vec<Segment>>>,
    stopping: bool,
}

impl Pump {
    fn run(mut self, pump_rx: Receiver<PumpMsg>) {
        while let Ok(message) = pump_rx.recv() {
            match message {
                PumpMsg::Tier(event) => self.handle_tier_event(event),
                PumpMsg::WorkerExited { level, panicked } => {
                    self.handle_worker_exited(level, panicked)
                }
                PumpMsg::Commit => {
                    self.transcript.append_separator();
                    self.notify_sink();
                }
                PumpMsg::Stop => {
                    self.stopping = true;
                }
            }
            if self.stopping && self.live.is_empty() {
                break;
            }
        }
        if let Some(result_tx) = self.result_tx.take() {
            let _ = result_tx.send(self.transcript.snapshot());
        }
    }

    fn handle_tier_event(&mut self, event: TierEvent) {
        match event {
            TierEvent::LoadProgress {
                level,
                progress,
                file,
            } => {
                self.sink.on_load_progress(level, progress, file.as_deref());
            }
            TierEvent::Ready { level } => {
                if self.pending_ready.remove(&level) {
                    self.ready_count += 1;
                    self.resolve_ready_if_complete();
                } else {
                    // A restarted worker coming back up.
                    self.sink
                        .on_status(Some(level), "tier worker ready after restart");
                }
            }
            TierEvent::LoadFailed { level, message } => {
                self.sink.on_status(Some(level), &message);
                self.commands.lock().unwrap().remove(&level);
                self.pending_ready.remove(&level);
                self.resolve_ready_if_complete();
            }
            TierEvent::Status { level, text } => {
                self.sink.on_status(Some(level), &text);
            }
            TierEvent::Reset { .. } => {
                // Commit acknowledgement; the separator is appended when the
                // commit itself is processed.
            }
            TierEvent::Partial {
                level,
                text,
                tokens,
                inference_ms,
            } => {
                self.timing
                    .entry(level)
                    .or_default()
                    .record(inference_ms, None);
                self.route_draft(level, &tokens);
                self.hypothesis = Some(Hypothesis { level, text });
                self.notify_sink();
            }
            TierEvent::Segment(output) => {
                self.timing
                    .entry(output.level)
                    .or_default()
                    .record(output.inference_ms, output.spec);
                self.route_draft(output.level, &output.tokens);
                let segment =
                    Segment::new(output.level, output.start_s, output.end_s, output.text)
                        .with_tokens(output.tokens);
                self.transcript.insert(segment);
                self.notify_sink();
            }
        }
    }

    fn resolve_ready_if_complete(&mut self) {
        if self.pending_ready.is_empty() {
            if let Some(ready_tx) = self.ready_tx.take() {
                let _ = ready_tx.send(self.ready_count);
            }
        }
    }

    /// Forwards tokens from tier `upstream` to its downstream neighbor.
    ///
    /// Continuous upstreams replace the downstream draft; chunk upstreams
    /// append. Only chunk tiers above level 1 ever consume drafts, so other
    /// neighbors are skipped at the routing layer.
    fn route_draft(&self, upstream: u8, tokens: &[u32]) {
        if self.cascade == CascadePolicy::Disabled || tokens.is_empty() {
            return;
        }
        let Some(&downstream) = self.downstream_of.get(&upstream) else {
            return;
        };
        let Some(downstream_tier) = self.tiers.get(&downstream) else {
            return;
        };
        if downstream_tier.mode != TierMode::Chunk || downstream_tier.level <= 1 {
            return;
        }
        let upstream_mode = match self.tiers.get(&upstream) {
            Some(tier) => tier.mode,
            None => return,
        };
        let command = match upstream_mode {
            TierMode::Continuous => TierCommand::DraftReplace(tokens.to_vec()),
            TierMode::Chunk => TierCommand::DraftAppend(tokens.to_vec()),
        };
        if let Some(sender) = self.commands.lock().unwrap().get(&downstream) {
            let _ = sender.send(command);
        }
    }

    fn handle_worker_exited(&mut self, level: u8, panicked: bool) {
        self.live.remove(&level);
        let stopping = self.stopping || !self.running.load(Ordering::SeqCst);
        if stopping {
            return;
        }
        if !panicked {
            // Clean exit outside of stop: load failure already reported, or
            // the worker's queue was torn down.
            self.commands.lock().unwrap().remove(&level);
            self.pending_ready.remove(&level);
            self.resolve_ready_if_complete();
            return;
        }

        let used = self.restarts.entry(level).or_insert(0);
        if *used < defaults::WORKER_RESTART_BUDGET {
            *used += 1;
            let tier = match self.tiers.get(&level) {
                Some(tier) => tier.clone(),
                None => return,
            };
            let sender = spawn_tier(
                tier,
                self.options.clone(),
                self.factory.clone(),
                self.pump_tx.clone(),
            );
            self.commands.lock().unwrap().insert(level, sender);
            self.live.insert(level);
            // The replacement is registered before the status goes out, so
            // audio pushed in reaction to the status reaches it.
            self.sink
                .on_status(Some(level), "tier worker crashed; restarting");
        } else {
            self.sink.on_status(
                Some(level),
                "tier worker crashed again; tier disabled for this session",
            );
            self.commands.lock().unwrap().remove(&level);
            self.pending_ready.remove(&level);
            self.resolve_ready_if_complete();
        }
    }

    fn notify_sink(&mut self) {
        let update = TranscriptUpdate {
            segments: self.transcript.snapshot(),
            partial: self.hypothesis.clone(),
            timing: self.timing.clone(),
        };
        self.sink.on_transcript(&update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::MockModelFactory;
    use crate::config::ComputeDtype;
    use crate::config::DeviceKind;
    use crate::engine::sink::CollectorSink;

    fn config(tiers: &[u8]) -> EngineConfig {
        EngineConfig {
            enabled_tiers: tiers.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn test_adjacent_pairs_wiring() {
        let tiers: Vec<TierConfig> = [1u8, 2, 4]
            .iter()
            .map(|&l| TierConfig::default_for_level(l).unwrap())
            .collect();
        let pairs = adjacent_pairs(&tiers);
        assert_eq!(pairs.get(&1), Some(&2));
        assert_eq!(pairs.get(&2), Some(&4));
        assert_eq!(pairs.get(&4), None);
    }

    #[test]
    fn test_start_rejects_bad_config_before_spawning() {
        let factory = Arc::new(MockModelFactory::new());
        let engine = Engine::new(config(&[1, 9]));
        let result = engine.start(factory.clone(), Box::new(CollectorSink::new()));
        assert!(matches!(result, Err(EngineError::UnknownTier { level: 9 })));
        // Nothing was partially initialized.
        assert_eq!(factory.load_count(1), 0);
    }

    #[test]
    fn test_start_rejects_unsupported_quantization() {
        let engine = Engine::new(EngineConfig {
            device: DeviceKind::Cuda,
            dtype: ComputeDtype::Q4,
            ..config(&[2])
        });
        let result = engine.start(
            Arc::new(MockModelFactory::new()),
            Box::new(CollectorSink::new()),
        );
        assert!(matches!(
            result,
            Err(EngineError::UnsupportedQuantization { .. })
        ));
    }

    #[test]
    fn test_start_fails_when_no_tier_serves() {
        let factory = MockModelFactory::new().with_load_failure(2);
        let engine = Engine::new(config(&[2]));
        let result = engine.start(Arc::new(factory), Box::new(CollectorSink::new()));
        assert!(matches!(result, Err(EngineError::NoServingTier)));
    }

    #[test]
    fn test_start_serves_with_partial_tier_failures() {
        let factory = MockModelFactory::new().with_load_failure(3);
        let sink = CollectorSink::new();
        let output = sink.output();
        let engine = Engine::new(config(&[2, 3]));

        let handle = engine.start(Arc::new(factory), Box::new(sink)).unwrap();
        assert!(handle.is_running());
        handle.stop();

        let collected = output.lock().unwrap();
        assert!(collected
            .statuses
            .iter()
            .any(|(level, text)| *level == Some(3) && text.contains("load failure")));
    }

    #[test]
    fn test_handle_reports_running_until_stop() {
        let engine = Engine::new(config(&[2]));
        let handle = engine
            .start(
                Arc::new(MockModelFactory::new()),
                Box::new(CollectorSink::new()),
            )
            .unwrap();
        assert!(handle.is_running());
        handle.stop();
    }

    #[test]
    fn test_stop_returns_final_transcript() {
        let engine = Engine::new(config(&[2]));
        let handle = engine
            .start(
                Arc::new(MockModelFactory::new()),
                Box::new(CollectorSink::new()),
            )
            .unwrap();

        handle
            .push_audio(&vec![0.1; defaults::samples_for_secs(5.0)])
            .unwrap();
        let segments = handle.stop();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].level, 2);
        assert_eq!(segments[0].start_s, 0.0);
        assert_eq!(segments[0].end_s, 5.0);
    }

    #[test]
    fn test_empty_push_is_noop() {
        let engine = Engine::new(config(&[2]));
        let handle = engine
            .start(
                Arc::new(MockModelFactory::new()),
                Box::new(CollectorSink::new()),
            )
            .unwrap();
        handle.push_audio(&[]).unwrap();
        let segments = handle.stop();
        assert!(segments.is_empty());
    }
}
