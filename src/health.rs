// src/health.rs - Rolling-window network health classification

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub window_size: usize,
    pub degraded_error_rate: f32,
    pub poor_error_rate: f32,
    pub degraded_latency_ms: u64,
    pub poor_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            degraded_error_rate: 0.2,
            poor_error_rate: 0.5,
            degraded_latency_ms: 1500,
            poor_latency_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkHealth {
    Good,
    Degraded,
    Poor,
}

/// One observed fetch attempt, reported by the loader after the attempt
/// finishes. The monitor performs no network calls of its own.
#[derive(Debug, Clone, Copy)]
pub struct FetchOutcome {
    pub latency: Duration,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub avg_latency_ms: f64,
    pub error_rate: f32,
    pub samples: usize,
    pub classification: NetworkHealth,
}

/// Keeps the most recent fetch outcomes and derives a coarse health
/// classification from them. The classification is a hint for strategy
/// selection; it never blocks a request.
pub struct NetworkHealthMonitor {
    config: HealthConfig,
    window: RwLock<VecDeque<FetchOutcome>>,
}

impl NetworkHealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let capacity = config.window_size;
        Self {
            config,
            window: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub async fn record_outcome(&self, outcome: FetchOutcome) {
        let mut window = self.window.write().await;
        if window.len() == self.config.window_size {
            window.pop_front();
        }
        window.push_back(outcome);
        debug!(
            latency_ms = outcome.latency.as_millis() as u64,
            success = outcome.success,
            samples = window.len(),
            "recorded fetch outcome"
        );
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        let window = self.window.read().await;

        if window.is_empty() {
            return HealthSnapshot {
                avg_latency_ms: 0.0,
                error_rate: 0.0,
                samples: 0,
                classification: NetworkHealth::Good,
            };
        }

        let total_latency_ms: f64 = window
            .iter()
            .map(|o| o.latency.as_millis() as f64)
            .sum();
        let avg_latency_ms = total_latency_ms / window.len() as f64;
        let failures = window.iter().filter(|o| !o.success).count();
        let error_rate = failures as f32 / window.len() as f32;

        let classification = if error_rate >= self.config.poor_error_rate
            || avg_latency_ms >= self.config.poor_latency_ms as f64
        {
            NetworkHealth::Poor
        } else if error_rate >= self.config.degraded_error_rate
            || avg_latency_ms >= self.config.degraded_latency_ms as f64
        {
            NetworkHealth::Degraded
        } else {
            NetworkHealth::Good
        };

        HealthSnapshot {
            avg_latency_ms,
            error_rate,
            samples: window.len(),
            classification,
        }
    }

    pub async fn classification(&self) -> NetworkHealth {
        self.snapshot().await.classification
    }

    pub async fn reset(&self) {
        self.window.write().await.clear();
    }
}
