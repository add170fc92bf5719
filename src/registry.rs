// =============================================================================
// Trigger Registry — in-memory cache of active triggers over an external store
// =============================================================================
//
// Generalizes the `AppState` cache pattern (`RwLock<HashMap<...>>` populated
// at startup, shallow-read by the hot path) to the trigger domain.
// The registry never talks to the external store directly; it is handed a
// `TriggerRepository` at construction and treats it as the source of truth,
// refreshing its cache on `init` and on every `save`/`remove`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::{Signal, Trigger, TriggerSpec};

// =============================================================================
// External store contracts
// =============================================================================

/// Persistence for user-configured triggers. Implementations own their own
/// storage; the core only requires these five operations.
#[async_trait]
pub trait TriggerRepository: Send + Sync {
    async fn init(&self) -> anyhow::Result<()>;
    async fn get_all_active(&self) -> anyhow::Result<Vec<Trigger>>;
    async fn find_by_user(&self, user_id: &str) -> anyhow::Result<Vec<Trigger>>;
    async fn save(&self, spec: TriggerSpec) -> anyhow::Result<Trigger>;
    async fn remove(&self, id: &str, user_id: &str) -> anyhow::Result<bool>;
}

/// Persistence for fired signals, including the `signalNumber` sequencing
/// queries the evaluator needs before stamping a new one.
#[async_trait]
pub trait SignalRepository: Send + Sync {
    async fn save(&self, signal: &Signal) -> anyhow::Result<()>;
    async fn count24h(&self, trigger_id: &str, symbol: &str) -> anyhow::Result<u32>;
    async fn count24h_by_user_symbol(&self, user_id: &str, symbol: &str) -> anyhow::Result<u32>;
    async fn recent_by_symbol(&self, symbol: &str, hours: u32) -> anyhow::Result<Vec<Signal>>;
}

/// The outbound chat transport. Message rendering and command handling are
/// consumers of the signal stream and live outside the core.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_message(&self, chat_id: &str, rendered_text: &str) -> bool;
}

// =============================================================================
// TriggerRegistry
// =============================================================================

/// In-memory cache of active triggers, refreshed from `repository` at
/// startup and on every externally-initiated create/remove. `get_all_active`
/// returns a shallow clone so the evaluator's read-once-per-flush contract
/// never blocks on, or is blocked by, a concurrent `save`/`remove`.
pub struct TriggerRegistry {
    repository: Arc<dyn TriggerRepository>,
    cache: RwLock<HashMap<String, Trigger>>,
}

impl TriggerRegistry {
    pub fn new(repository: Arc<dyn TriggerRepository>) -> Self {
        Self {
            repository,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Load the full active set from the backing store. Call once at
    /// startup before the evaluator begins flushing.
    pub async fn init(&self) -> anyhow::Result<()> {
        self.repository.init().await?;
        let active = self.repository.get_all_active().await?;
        let mut cache = self.cache.write();
        cache.clear();
        for trigger in active {
            cache.insert(trigger.id.clone(), trigger);
        }
        Ok(())
    }

    /// Shallow snapshot of every currently-active trigger, read once per
    /// evaluator flush.
    pub fn get_all_active(&self) -> Vec<Trigger> {
        self.cache.read().values().cloned().collect()
    }

    pub async fn save(&self, spec: TriggerSpec) -> anyhow::Result<Trigger> {
        let trigger = self.repository.save(spec).await?;
        self.cache.write().insert(trigger.id.clone(), trigger.clone());
        Ok(trigger)
    }

    pub async fn remove(&self, id: &str, user_id: &str) -> anyhow::Result<bool> {
        let removed = self.repository.remove(id, user_id).await?;
        if removed {
            self.cache.write().remove(id);
        }
        Ok(removed)
    }
}

// =============================================================================
// In-memory reference implementations (used by tests and as a fallback store)
// =============================================================================

/// A process-local `TriggerRepository`. Not durable across restarts; useful
/// for tests and as the default when no external store is wired in.
#[derive(Default)]
pub struct InMemoryTriggerRepository {
    triggers: RwLock<HashMap<String, Trigger>>,
}

impl InMemoryTriggerRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a trigger with a caller-chosen id, bypassing id generation.
    /// Intended for tests that need to predict the id up front.
    pub fn seed(&self, trigger: Trigger) {
        self.triggers.write().insert(trigger.id.clone(), trigger);
    }
}

#[async_trait]
impl TriggerRepository for InMemoryTriggerRepository {
    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_all_active(&self) -> anyhow::Result<Vec<Trigger>> {
        Ok(self
            .triggers
            .read()
            .values()
            .filter(|t| t.is_active)
            .cloned()
            .collect())
    }

    async fn find_by_user(&self, user_id: &str) -> anyhow::Result<Vec<Trigger>> {
        Ok(self
            .triggers
            .read()
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn save(&self, spec: TriggerSpec) -> anyhow::Result<Trigger> {
        let id = format!("trg-{}", Uuid::new_v4());
        let trigger = Trigger {
            id: id.clone(),
            user_id: spec.user_id,
            direction: spec.direction,
            oi_change_percent: spec.oi_change_percent,
            time_interval_minutes: spec.time_interval_minutes,
            notification_limit_seconds: spec.notification_limit_seconds,
            is_active: true,
        };
        self.triggers.write().insert(id, trigger.clone());
        Ok(trigger)
    }

    async fn remove(&self, id: &str, user_id: &str) -> anyhow::Result<bool> {
        let mut triggers = self.triggers.write();
        if let Some(t) = triggers.get(id) {
            if t.user_id == user_id {
                triggers.remove(id);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// A process-local `SignalRepository`, ordered oldest-first per symbol.
#[derive(Default)]
pub struct InMemorySignalRepository {
    signals: RwLock<Vec<Signal>>,
}

impl InMemorySignalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalRepository for InMemorySignalRepository {
    async fn save(&self, signal: &Signal) -> anyhow::Result<()> {
        self.signals.write().push(signal.clone());
        Ok(())
    }

    async fn count24h(&self, trigger_id: &str, symbol: &str) -> anyhow::Result<u32> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(24);
        Ok(self
            .signals
            .read()
            .iter()
            .filter(|s| s.trigger_id == trigger_id && s.symbol == symbol && s.created_at >= cutoff)
            .count() as u32)
    }

    async fn count24h_by_user_symbol(&self, user_id: &str, symbol: &str) -> anyhow::Result<u32> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(24);
        Ok(self
            .signals
            .read()
            .iter()
            .filter(|s| s.user_id == user_id && s.symbol == symbol && s.created_at >= cutoff)
            .count() as u32)
    }

    async fn recent_by_symbol(&self, symbol: &str, hours: u32) -> anyhow::Result<Vec<Signal>> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(i64::from(hours));
        Ok(self
            .signals
            .read()
            .iter()
            .filter(|s| s.symbol == symbol && s.created_at >= cutoff)
            .cloned()
            .collect())
    }
}

/// A `ChatSink` that records every message instead of sending it. Used by
/// tests and by any deployment that hasn't wired a real transport yet.
#[derive(Default)]
pub struct RecordingChatSink {
    pub sent: RwLock<Vec<(String, String)>>,
}

impl RecordingChatSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatSink for RecordingChatSink {
    async fn send_message(&self, chat_id: &str, rendered_text: &str) -> bool {
        self.sent
            .write()
            .push((chat_id.to_string(), rendered_text.to_string()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    #[tokio::test]
    async fn registry_init_loads_active_triggers() {
        let repo = Arc::new(InMemoryTriggerRepository::new());
        repo.seed(Trigger {
            id: "t1".into(),
            user_id: "u1".into(),
            direction: Direction::Up,
            oi_change_percent: 5.0,
            time_interval_minutes: 1,
            notification_limit_seconds: 60,
            is_active: true,
        });
        let registry = TriggerRegistry::new(repo);
        registry.init().await.unwrap();
        assert_eq!(registry.get_all_active().len(), 1);
    }

    #[tokio::test]
    async fn save_and_remove_update_cache() {
        let repo = Arc::new(InMemoryTriggerRepository::new());
        let registry = TriggerRegistry::new(repo);
        registry.init().await.unwrap();

        let trigger = registry
            .save(TriggerSpec {
                user_id: "u1".into(),
                direction: Direction::Down,
                oi_change_percent: 8.0,
                time_interval_minutes: 5,
                notification_limit_seconds: 120,
            })
            .await
            .unwrap();
        assert_eq!(registry.get_all_active().len(), 1);

        let removed = registry.remove(&trigger.id, "u1").await.unwrap();
        assert!(removed);
        assert_eq!(registry.get_all_active().len(), 0);
    }

    #[tokio::test]
    async fn signal_repository_counts_within_24h() {
        let repo = InMemorySignalRepository::new();
        let signal = Signal {
            trigger_id: "t1".into(),
            user_id: "u1".into(),
            symbol: "BTCUSDT".into(),
            signal_number: 1,
            oi_change_percent: 6.0,
            price_change_percent: None,
            current_price: None,
            created_at: chrono::Utc::now(),
        };
        repo.save(&signal).await.unwrap();
        assert_eq!(repo.count24h("t1", "BTCUSDT").await.unwrap(), 1);
        assert_eq!(repo.count24h("t1", "ETHUSDT").await.unwrap(), 0);
    }
}
