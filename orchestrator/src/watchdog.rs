//! Agent heartbeat watchdog.
//!
//! Tracks the last heartbeat of each registered agent on a background
//! ticker. When an agent's heartbeat age exceeds its timeout, the registered
//! callback fires with `(agent, age)` and the entry is dropped; the agent is
//! monitored again once something resets its timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Invoked when an agent misses its heartbeat window.
pub type TimeoutCallback = Arc<dyn Fn(&str, Duration) + Send + Sync>;

/// Watchdog timing configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Heartbeat age at which an agent is flagged (default 90 s, three
    /// missed 30 s heartbeats)
    pub default_timeout: Duration,
    /// Ticker interval
    pub tick: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(90),
            tick: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AgentEntry {
    last_heartbeat: Instant,
    timeout: Duration,
}

/// Per-agent health snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentHealth {
    pub elapsed: Duration,
    pub timeout: Duration,
    pub healthy: bool,
}

/// Watchdog status snapshot.
#[derive(Debug, Clone, Default)]
pub struct WatchdogStatus {
    pub monitoring: bool,
    pub agents: HashMap<String, AgentHealth>,
}

struct WatchdogInner {
    config: WatchdogConfig,
    agents: Mutex<HashMap<String, AgentEntry>>,
    callbacks: Mutex<HashMap<String, TimeoutCallback>>,
    running: AtomicBool,
    ticker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Heartbeat monitor for agents. Cheap to clone.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                config,
                agents: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                ticker: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Start the background ticker. Idempotent.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *self.inner.ticker.lock().await = Some(tokio::spawn(monitor_loop(inner)));
        tracing::info!("Watchdog started");
    }

    /// Stop the ticker.
    pub async fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.inner.ticker.lock().await.take() {
            handle.abort();
        }
        tracing::info!("Watchdog stopped");
    }

    /// Record a heartbeat for an agent, registering it if unknown.
    pub fn reset_timeout(&self, agent: &str) {
        let mut agents = self.inner.agents.lock().expect("watchdog agents poisoned");
        let entry = agents.entry(agent.to_string()).or_insert(AgentEntry {
            last_heartbeat: Instant::now(),
            timeout: self.inner.config.default_timeout,
        });
        entry.last_heartbeat = Instant::now();
        tracing::debug!(agent, "Heartbeat reset");
    }

    /// Set a per-agent timeout, registering the agent if unknown.
    pub fn set_timeout(&self, agent: &str, timeout: Duration) {
        let mut agents = self.inner.agents.lock().expect("watchdog agents poisoned");
        let entry = agents.entry(agent.to_string()).or_insert(AgentEntry {
            last_heartbeat: Instant::now(),
            timeout,
        });
        entry.timeout = timeout;
        tracing::info!(agent, timeout_secs = timeout.as_secs(), "Timeout configured");
    }

    /// Register the callback invoked when `agent` misses its window.
    pub fn register_callback(&self, agent: &str, callback: TimeoutCallback) {
        self.inner
            .callbacks
            .lock()
            .expect("watchdog callbacks poisoned")
            .insert(agent.to_string(), callback);
    }

    /// Whether the agent is registered and within its heartbeat window.
    pub fn is_agent_healthy(&self, agent: &str) -> bool {
        self.inner
            .agents
            .lock()
            .expect("watchdog agents poisoned")
            .get(agent)
            .map(|e| e.last_heartbeat.elapsed() < e.timeout)
            .unwrap_or(false)
    }

    /// Snapshot of all monitored agents.
    pub fn status(&self) -> WatchdogStatus {
        let agents = self
            .inner
            .agents
            .lock()
            .expect("watchdog agents poisoned")
            .iter()
            .map(|(agent, entry)| {
                let elapsed = entry.last_heartbeat.elapsed();
                (
                    agent.clone(),
                    AgentHealth {
                        elapsed,
                        timeout: entry.timeout,
                        healthy: elapsed < entry.timeout,
                    },
                )
            })
            .collect();
        WatchdogStatus {
            monitoring: self.inner.running.load(Ordering::SeqCst),
            agents,
        }
    }
}

async fn monitor_loop(inner: Arc<WatchdogInner>) {
    let mut ticker = tokio::time::interval(inner.config.tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }

        // Collect expirations under the lock, fire callbacks outside it
        let expired: Vec<(String, Duration)> = {
            let mut agents = inner.agents.lock().expect("watchdog agents poisoned");
            let expired: Vec<(String, Duration)> = agents
                .iter()
                .filter(|(_, e)| e.last_heartbeat.elapsed() > e.timeout)
                .map(|(agent, e)| (agent.clone(), e.last_heartbeat.elapsed()))
                .collect();
            for (agent, _) in &expired {
                agents.remove(agent);
            }
            expired
        };

        for (agent, age) in expired {
            tracing::warn!(
                agent = %agent,
                age_secs = age.as_secs_f64(),
                "Agent missed heartbeat window"
            );
            let callback = inner
                .callbacks
                .lock()
                .expect("watchdog callbacks poisoned")
                .get(&agent)
                .cloned();
            if let Some(callback) = callback {
                callback(&agent, age);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_watchdog() -> Watchdog {
        Watchdog::new(WatchdogConfig {
            default_timeout: Duration::from_millis(50),
            tick: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn test_healthy_agent_not_flagged() {
        let watchdog = fast_watchdog();
        watchdog.start().await;

        let fired = Arc::new(Mutex::new(Vec::<String>::new()));
        let seen = fired.clone();
        watchdog.register_callback(
            "supervisor",
            Arc::new(move |agent, _| seen.lock().unwrap().push(agent.to_string())),
        );

        // keep the heartbeat fresh for a while
        for _ in 0..5 {
            watchdog.reset_timeout("supervisor");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(fired.lock().unwrap().is_empty());
        assert!(watchdog.is_agent_healthy("supervisor"));
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_expired_agent_fires_callback_and_is_dropped() {
        let watchdog = fast_watchdog();
        watchdog.start().await;

        let fired = Arc::new(Mutex::new(Vec::<(String, Duration)>::new()));
        let seen = fired.clone();
        watchdog.register_callback(
            "supervisor",
            Arc::new(move |agent, age| seen.lock().unwrap().push((agent.to_string(), age))),
        );

        watchdog.reset_timeout("supervisor");
        tokio::time::sleep(Duration::from_millis(150)).await;

        let fired = fired.lock().unwrap();
        assert_eq!(fired.len(), 1, "callback fires exactly once");
        assert_eq!(fired[0].0, "supervisor");
        assert!(fired[0].1 >= Duration::from_millis(50));

        // the entry was dropped after firing
        assert!(!watchdog.is_agent_healthy("supervisor"));
        assert!(watchdog.status().agents.is_empty());
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_per_agent_timeout_override() {
        let watchdog = fast_watchdog();
        watchdog.start().await;

        watchdog.reset_timeout("patient");
        watchdog.set_timeout("patient", Duration::from_secs(60));
        watchdog.reset_timeout("hasty");

        tokio::time::sleep(Duration::from_millis(120)).await;

        // the long-timeout agent survives, the default-timeout one expired
        assert!(watchdog.is_agent_healthy("patient"));
        assert!(!watchdog.is_agent_healthy("hasty"));
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let watchdog = fast_watchdog();
        watchdog.reset_timeout("supervisor");

        let status = watchdog.status();
        assert!(!status.monitoring);
        let health = &status.agents["supervisor"];
        assert!(health.healthy);
        assert_eq!(health.timeout, Duration::from_millis(50));

        watchdog.start().await;
        assert!(watchdog.status().monitoring);
        watchdog.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_agent_is_unhealthy() {
        let watchdog = fast_watchdog();
        assert!(!watchdog.is_agent_healthy("ghost"));
    }
}
