// =============================================================================
// Notification Pipeline — priority queue, dedup, rate budgets, cooldowns
// =============================================================================
//
// The budget tracking here generalizes `binance::rate_limit::RateLimitTracker`
// from a single global counter reset on a timer to a trailing-1-second window
// per budget (global, and one per chat), since the cap that matters is "no
// more than 28 in any trailing second" rather than "no more than 28 since the
// last reset". Everything else — atomics for lock-free reads, a `snapshot`
// for observability — keeps the same atomics-plus-snapshot shape.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::registry::ChatSink;
use crate::types::{Signal, Trigger};

const GLOBAL_BUDGET_PER_SECOND: usize = 28;
const PER_CHAT_BUDGET_PER_SECOND: usize = 28;
const MAX_QUEUE_DEPTH: usize = 1000;
const DEDUP_WINDOW_MS: i64 = 5_000;
const MAX_SEND_RETRIES: u8 = 3;
const COOLDOWN_PURGE_AGE_MS: i64 = 24 * 60 * 60 * 1000;

// =============================================================================
// Priority
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Derived from `|signal.oiChangePercent|`: HIGH >= 10, NORMAL in
    /// [5, 10), LOW < 5. Messages with no signal default to LOW.
    pub fn from_oi_change_percent(oi_change_percent: Option<f64>) -> Self {
        match oi_change_percent.map(f64::abs) {
            Some(v) if v >= 10.0 => Priority::High,
            Some(v) if v >= 5.0 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

// =============================================================================
// Cooldown policy (fixed is the active default; backoff exists but is not
// wired in)
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub enum CooldownPolicy {
    Fixed,
    Backoff,
}

struct CooldownState {
    last_fire_ms: i64,
    consecutive: u32,
}

// =============================================================================
// Queued message
// =============================================================================

struct QueuedMessage {
    chat_id: String,
    text: String,
    priority: Priority,
    dedup_key: Option<(String, String, i64)>,
    retries: u8,
}

#[derive(Default)]
struct Queues {
    high: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
    low: VecDeque<QueuedMessage>,
}

impl Queues {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn queue_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedMessage> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }
}

// =============================================================================
// Sliding-window budget
// =============================================================================

/// Trailing-window message counter: `allow` records a send at `now_ms` and
/// trims anything older than one second every time it's consulted.
struct TrailingBudget {
    timestamps: Mutex<VecDeque<i64>>,
    cap: usize,
}

impl TrailingBudget {
    fn new(cap: usize) -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::new()),
            cap,
        }
    }

    fn trim(timestamps: &mut VecDeque<i64>, now_ms: i64) {
        while let Some(&front) = timestamps.front() {
            if now_ms - front >= 1_000 {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_room(&self, now_ms: i64) -> bool {
        let mut timestamps = self.timestamps.lock();
        Self::trim(&mut timestamps, now_ms);
        timestamps.len() < self.cap
    }

    fn record(&self, now_ms: i64) {
        let mut timestamps = self.timestamps.lock();
        Self::trim(&mut timestamps, now_ms);
        timestamps.push_back(now_ms);
    }
}

// =============================================================================
// Stats
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct NotifierStats {
    pub queued_high: usize,
    pub queued_normal: usize,
    pub queued_low: usize,
    pub sent_total: u64,
    pub deduplicated_total: u64,
    pub dropped_backpressure_total: u64,
    pub dropped_after_retries_total: u64,
}

// =============================================================================
// NotificationPipeline
// =============================================================================

pub struct NotificationPipeline {
    sink: Arc<dyn ChatSink>,
    cooldown_policy: CooldownPolicy,

    queues: Mutex<Queues>,
    dedup_last_seen: Mutex<HashMap<(String, String, i64), i64>>,
    cooldowns: Mutex<HashMap<(String, String), CooldownState>>,

    global_budget: TrailingBudget,
    chat_budgets: Mutex<HashMap<String, Arc<TrailingBudget>>>,

    sent_total: AtomicU64,
    deduplicated_total: AtomicU64,
    dropped_backpressure_total: AtomicU64,
    dropped_after_retries_total: AtomicU64,
}

impl NotificationPipeline {
    pub fn new(sink: Arc<dyn ChatSink>) -> Self {
        Self::with_policy(sink, CooldownPolicy::Fixed)
    }

    pub fn with_policy(sink: Arc<dyn ChatSink>, cooldown_policy: CooldownPolicy) -> Self {
        Self {
            sink,
            cooldown_policy,
            queues: Mutex::new(Queues::default()),
            dedup_last_seen: Mutex::new(HashMap::new()),
            cooldowns: Mutex::new(HashMap::new()),
            global_budget: TrailingBudget::new(GLOBAL_BUDGET_PER_SECOND),
            chat_budgets: Mutex::new(HashMap::new()),
            sent_total: AtomicU64::new(0),
            deduplicated_total: AtomicU64::new(0),
            dropped_backpressure_total: AtomicU64::new(0),
            dropped_after_retries_total: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------
    // Cooldown (consulted by the evaluator at the evaluation boundary)
    // -------------------------------------------------------------------

    /// `true` if a fire for `(trigger.userId, symbol)` is allowed right now.
    pub fn cooldown_ok(&self, trigger: &Trigger, symbol: &str, now_ms: i64) -> bool {
        let key = (trigger.user_id.clone(), symbol.to_string());
        let cooldowns = self.cooldowns.lock();
        match cooldowns.get(&key) {
            None => true,
            Some(state) => {
                let required_ms = match self.cooldown_policy {
                    CooldownPolicy::Fixed => trigger.notification_limit_seconds as i64 * 1_000,
                    CooldownPolicy::Backoff => {
                        let multiplier = 1.5f64.powi(state.consecutive as i32).min(8.0);
                        (trigger.notification_limit_seconds as f64 * 1_000.0 * multiplier) as i64
                    }
                };
                now_ms - state.last_fire_ms >= required_ms
            }
        }
    }

    /// Record that a fire happened for `(trigger.userId, symbol)` at `now_ms`.
    pub fn record_fire(&self, trigger: &Trigger, symbol: &str, now_ms: i64) {
        let key = (trigger.user_id.clone(), symbol.to_string());
        let mut cooldowns = self.cooldowns.lock();
        cooldowns
            .entry(key)
            .and_modify(|s| {
                s.consecutive += 1;
                s.last_fire_ms = now_ms;
            })
            .or_insert(CooldownState {
                last_fire_ms: now_ms,
                consecutive: 0,
            });
    }

    /// Purge cooldown entries untouched for more than 24 h. Called from the
    /// evaluator's periodic housekeeping sweep.
    pub fn purge_stale_cooldowns(&self, now_ms: i64) {
        self.cooldowns
            .lock()
            .retain(|_, state| now_ms - state.last_fire_ms <= COOLDOWN_PURGE_AGE_MS);
    }

    // -------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------

    /// Queue `rendered_message` for delivery to `chat_id`. Returns `false`
    /// if the message was dropped (dedup or backpressure), `true` if queued.
    pub fn enqueue(
        &self,
        chat_id: &str,
        rendered_message: &str,
        signal: Option<&Signal>,
        now_ms: i64,
    ) -> bool {
        let priority = Priority::from_oi_change_percent(signal.map(|s| s.oi_change_percent));

        let dedup_key = signal.map(|s| {
            let rounded = crate::types::round_to(s.oi_change_percent, 1);
            (chat_id.to_string(), s.symbol.clone(), (rounded * 10.0).round() as i64)
        });

        if let Some(key) = &dedup_key {
            let mut last_seen = self.dedup_last_seen.lock();
            if let Some(&prev_ms) = last_seen.get(key) {
                if now_ms - prev_ms < DEDUP_WINDOW_MS {
                    self.deduplicated_total.fetch_add(1, Ordering::Relaxed);
                    debug!(chat_id, "notification deduplicated");
                    return false;
                }
            }
            last_seen.insert(key.clone(), now_ms);
        }

        let message = QueuedMessage {
            chat_id: chat_id.to_string(),
            text: rendered_message.to_string(),
            priority,
            dedup_key,
            retries: 0,
        };

        let mut queues = self.queues.lock();
        if queues.len() >= MAX_QUEUE_DEPTH {
            let evicted = queues.low.pop_front().is_some() || queues.normal.pop_front().is_some();
            if !evicted {
                self.dropped_backpressure_total.fetch_add(1, Ordering::Relaxed);
                warn!("notification queue at capacity, dropping incoming message");
                return false;
            }
            self.dropped_backpressure_total.fetch_add(1, Ordering::Relaxed);
        }
        queues.queue_mut(priority).push_back(message);
        true
    }

    // -------------------------------------------------------------------
    // Processing loop (every 50 ms)
    // -------------------------------------------------------------------

    fn chat_budget(&self, chat_id: &str) -> Arc<TrailingBudget> {
        self.chat_budgets
            .lock()
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(TrailingBudget::new(PER_CHAT_BUDGET_PER_SECOND)))
            .clone()
    }

    /// Drain queued messages in priority order, honoring the global and
    /// per-chat trailing-1s budgets. Called every 50 ms by [`Self::run`].
    pub async fn process_tick(&self, now_ms: i64) {
        for priority in [Priority::High, Priority::Normal, Priority::Low] {
            loop {
                if !self.global_budget.has_room(now_ms) {
                    return;
                }

                let take = {
                    let queues = self.queues.lock();
                    queues_ref(&queues, priority).len()
                };
                if take == 0 {
                    break;
                }

                let mut sent_any = false;
                for _ in 0..take {
                    if !self.global_budget.has_room(now_ms) {
                        return;
                    }
                    let Some(message) = ({
                        let mut queues = self.queues.lock();
                        queues.queue_mut(priority).pop_front()
                    }) else {
                        break;
                    };

                    let budget = self.chat_budget(&message.chat_id);
                    if !budget.has_room(now_ms) {
                        self.queues.lock().queue_mut(priority).push_back(message);
                        continue;
                    }

                    let ok = self.sink.send_message(&message.chat_id, &message.text).await;
                    if ok {
                        self.global_budget.record(now_ms);
                        budget.record(now_ms);
                        self.sent_total.fetch_add(1, Ordering::Relaxed);
                        sent_any = true;
                    } else if message.retries + 1 >= MAX_SEND_RETRIES {
                        self.dropped_after_retries_total.fetch_add(1, Ordering::Relaxed);
                        warn!(chat_id = %message.chat_id, "notification dropped after max retries");
                        if let Some(key) = message.dedup_key {
                            self.dedup_last_seen.lock().remove(&key);
                        }
                    } else {
                        let mut retried = message;
                        retried.retries += 1;
                        self.queues.lock().queue_mut(priority).push_front(retried);
                    }
                }
                if !sent_any {
                    break;
                }
            }
        }
    }

    /// Spawn the 50 ms processing loop. Returns a handle the caller can
    /// abort on shutdown.
    pub fn run(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(50));
            loop {
                ticker.tick().await;
                self.process_tick(now_ms()).await;
            }
        })
    }

    pub fn stats(&self) -> NotifierStats {
        let queues = self.queues.lock();
        NotifierStats {
            queued_high: queues.high.len(),
            queued_normal: queues.normal.len(),
            queued_low: queues.low.len(),
            sent_total: self.sent_total.load(Ordering::Relaxed),
            deduplicated_total: self.deduplicated_total.load(Ordering::Relaxed),
            dropped_backpressure_total: self.dropped_backpressure_total.load(Ordering::Relaxed),
            dropped_after_retries_total: self.dropped_after_retries_total.load(Ordering::Relaxed),
        }
    }
}

fn queues_ref(queues: &Queues, priority: Priority) -> &VecDeque<QueuedMessage> {
    match priority {
        Priority::High => &queues.high,
        Priority::Normal => &queues.normal,
        Priority::Low => &queues.low,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RecordingChatSink;
    use crate::types::Direction;

    fn sample_trigger() -> Trigger {
        Trigger {
            id: "t1".into(),
            user_id: "u1".into(),
            direction: Direction::Up,
            oi_change_percent: 5.0,
            time_interval_minutes: 1,
            notification_limit_seconds: 60,
            is_active: true,
        }
    }

    fn sample_signal(oi: f64) -> Signal {
        Signal {
            trigger_id: "t1".into(),
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
            signal_number: 1,
            oi_change_percent: oi,
            price_change_percent: None,
            current_price: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn priority_thresholds() {
        assert_eq!(Priority::from_oi_change_percent(Some(12.0)), Priority::High);
        assert_eq!(Priority::from_oi_change_percent(Some(7.0)), Priority::Normal);
        assert_eq!(Priority::from_oi_change_percent(Some(2.0)), Priority::Low);
        assert_eq!(Priority::from_oi_change_percent(Some(-11.0)), Priority::High);
    }

    #[test]
    fn dedup_drops_repeat_within_window() {
        let sink = Arc::new(RecordingChatSink::new());
        let pipeline = NotificationPipeline::new(sink);
        let signal = sample_signal(6.0);

        assert!(pipeline.enqueue("chat1", "first", Some(&signal), 0));
        assert!(!pipeline.enqueue("chat1", "second", Some(&signal), 1_000));
        assert!(pipeline.enqueue("chat1", "third", Some(&signal), 6_000));

        assert_eq!(pipeline.stats().deduplicated_total, 1);
    }

    #[tokio::test]
    async fn processes_queued_message_through_sink() {
        let sink = Arc::new(RecordingChatSink::new());
        let pipeline = NotificationPipeline::new(sink.clone());
        let signal = sample_signal(12.0);
        pipeline.enqueue("chat1", "hello", Some(&signal), 0);

        pipeline.process_tick(0).await;

        assert_eq!(pipeline.stats().sent_total, 1);
        assert_eq!(sink.sent.read().len(), 1);
    }

    #[tokio::test]
    async fn global_budget_limits_sends_per_tick() {
        let sink = Arc::new(RecordingChatSink::new());
        let pipeline = NotificationPipeline::new(sink.clone());
        for i in 0..40 {
            let mut signal = sample_signal(12.0);
            signal.symbol = format!("SYM{i}USDT");
            pipeline.enqueue("chat1", "msg", Some(&signal), i as i64);
        }

        pipeline.process_tick(0).await;

        assert_eq!(pipeline.stats().sent_total, GLOBAL_BUDGET_PER_SECOND as u64);
    }

    #[test]
    fn cooldown_blocks_until_elapsed() {
        let sink = Arc::new(RecordingChatSink::new());
        let pipeline = NotificationPipeline::new(sink);
        let trigger = sample_trigger();

        assert!(pipeline.cooldown_ok(&trigger, "BTCUSDT", 0));
        pipeline.record_fire(&trigger, "BTCUSDT", 0);
        assert!(!pipeline.cooldown_ok(&trigger, "BTCUSDT", 30_000));
        assert!(pipeline.cooldown_ok(&trigger, "BTCUSDT", 60_000));
    }
}
