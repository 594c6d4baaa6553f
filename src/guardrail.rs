//! Budget gate for AI calls.
//!
//! [`UsageGuardrail`] is an explicitly constructed, cheaply cloneable handle around shared
//! counters. Every reservation runs its limit checks and the counter update inside one
//! critical section, so concurrent callers can never both pass a check that only one of
//! them fits under.

use crate::config::{AiConfig, GuardrailConfig};
use crate::error::{NormalizationError, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const COST_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Reservation,
    Reconciliation,
}

impl UsageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageKind::Reservation => "reservation",
            UsageKind::Reconciliation => "reconciliation",
        }
    }
}

/// Entry of the append-only usage log. Token and cost fields are signed deltas, so
/// summing every record gives the cumulative totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub reservation_id: Uuid,
    pub kind: UsageKind,
    pub tokens_consumed: i64,
    pub estimated_cost: f64,
    pub model: String,
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReservationRequest {
    pub estimated_tokens: u64,
    pub estimated_cost: f64,
    pub model: String,
    pub document_id: Option<String>,
}

/// Durable home of the usage log. Appends happen outside the caller's control flow
/// (a dropped reservation), so implementations report their own failures.
pub trait UsageSink: Send + Sync {
    fn append(&self, record: UsageRecord);
}

/// Proof of a successful reservation. Consumed by [`UsageGuardrail::record_actual`],
/// so each reservation is reconciled at most once. A reservation dropped without being
/// reconciled releases itself and hands the release record to the guardrail's sink.
pub struct Reservation {
    id: Uuid,
    estimated_tokens: u64,
    estimated_cost: f64,
    model: String,
    document_id: Option<String>,
    record: UsageRecord,
    guardrail: Option<UsageGuardrail>,
}

impl Reservation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }

    /// The record appended when the reservation was made.
    pub fn record(&self) -> &UsageRecord {
        &self.record
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("estimated_tokens", &self.estimated_tokens)
            .field("estimated_cost", &self.estimated_cost)
            .field("document_id", &self.document_id)
            .field("settled", &self.guardrail.is_none())
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(guardrail) = self.guardrail.take() else {
            return;
        };
        let record = guardrail.settle(self, 0, 0.0);
        warn!(
            "Reservation {} abandoned before reconciliation; released ${:.4}",
            self.id, self.estimated_cost
        );
        if let Some(sink) = &guardrail.sink {
            sink.append(record);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub cumulative_tokens: u64,
    pub cumulative_cost: f64,
    pub cap_remaining: f64,
    pub calls: u64,
    pub warning: Option<String>,
}

/// Per-1K token prices used for pre-flight estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl ModelPricing {
    pub fn from_config(ai: &AiConfig) -> Self {
        Self {
            input_per_1k: ai.input_cost_per_1k,
            output_per_1k: ai.output_cost_per_1k,
        }
    }

    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self::from_config(&AiConfig::default())
    }
}

#[derive(Debug, Default)]
struct UsageState {
    cumulative_tokens: u64,
    cumulative_cost: f64,
    calls: u64,
    calls_by_document: HashMap<String, u32>,
    recent_calls: VecDeque<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct UsageGuardrail {
    config: Arc<GuardrailConfig>,
    state: Arc<Mutex<UsageState>>,
    sink: Option<Arc<dyn UsageSink>>,
}

impl UsageGuardrail {
    pub fn new(config: GuardrailConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(UsageState::default())),
            sink: None,
        }
    }

    /// Where releases of abandoned reservations are written.
    pub fn with_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Reserves `estimated_cost` with no per-document or token bookkeeping.
    pub fn check_and_reserve(&self, estimated_cost: f64) -> Result<Reservation> {
        self.reserve(ReservationRequest {
            estimated_cost,
            ..Default::default()
        })
    }

    pub fn reserve(&self, request: ReservationRequest) -> Result<Reservation> {
        if !request.estimated_cost.is_finite() || request.estimated_cost < 0.0 {
            return Err(NormalizationError::ValidationError(format!(
                "estimated cost must be a non-negative number, got {}",
                request.estimated_cost
            )));
        }

        let now = Utc::now();
        let mut state = self.state.lock();

        if state.cumulative_cost + request.estimated_cost > self.config.hard_cap_usd + COST_EPSILON {
            return Err(NormalizationError::QuotaExceeded(format!(
                "estimated cost ${:.4} would exceed the ${:.2} budget (${:.4} used)",
                request.estimated_cost, self.config.hard_cap_usd, state.cumulative_cost
            )));
        }

        if request.estimated_tokens > self.config.max_tokens_per_request {
            return Err(NormalizationError::QuotaExceeded(format!(
                "request needs ~{} tokens, limit is {} per request",
                request.estimated_tokens, self.config.max_tokens_per_request
            )));
        }

        if let (Some(limit), Some(doc)) = (self.config.max_calls_per_document, &request.document_id) {
            let used = state.calls_by_document.get(doc).copied().unwrap_or(0);
            if used >= limit {
                return Err(NormalizationError::QuotaExceeded(format!(
                    "document {} reached its limit of {} AI calls",
                    doc, limit
                )));
            }
        }

        if let Some(limit) = self.config.max_calls_per_hour {
            let window_start = now - Duration::hours(1);
            while state
                .recent_calls
                .front()
                .is_some_and(|t| *t < window_start)
            {
                state.recent_calls.pop_front();
            }
            if state.recent_calls.len() >= limit as usize {
                return Err(NormalizationError::QuotaExceeded(format!(
                    "hourly limit of {} AI calls reached",
                    limit
                )));
            }
        }

        let id = Uuid::new_v4();
        state.cumulative_tokens += request.estimated_tokens;
        state.cumulative_cost += request.estimated_cost;
        state.calls += 1;
        state.recent_calls.push_back(now);
        if let Some(doc) = &request.document_id {
            *state.calls_by_document.entry(doc.clone()).or_insert(0) += 1;
        }

        let record = UsageRecord {
            timestamp: now,
            reservation_id: id,
            kind: UsageKind::Reservation,
            tokens_consumed: request.estimated_tokens as i64,
            estimated_cost: request.estimated_cost,
            model: request.model.clone(),
            document_id: request.document_id.clone(),
        };

        debug!(
            "Reserved ${:.4} (~{} tokens), cumulative ${:.4}",
            request.estimated_cost, request.estimated_tokens, state.cumulative_cost
        );

        Ok(Reservation {
            id,
            estimated_tokens: request.estimated_tokens,
            estimated_cost: request.estimated_cost,
            model: request.model,
            document_id: request.document_id,
            record,
            guardrail: Some(self.clone()),
        })
    }

    /// Replaces the reserved estimate with the actual usage. Pass zeros to release a
    /// reservation whose call failed. Cumulative totals never drop below zero.
    pub fn record_actual(
        &self,
        mut reservation: Reservation,
        actual_tokens: u64,
        actual_cost: f64,
    ) -> UsageRecord {
        // Disarm the drop release; this handle settles it.
        reservation.guardrail = None;
        self.settle(&mut reservation, actual_tokens, actual_cost)
    }

    fn settle(&self, reservation: &mut Reservation, actual_tokens: u64, actual_cost: f64) -> UsageRecord {
        let actual_cost = if actual_cost.is_finite() {
            actual_cost.max(0.0)
        } else {
            reservation.estimated_cost
        };

        let mut state = self.state.lock();

        let wanted_tokens = actual_tokens as i64 - reservation.estimated_tokens as i64;
        let token_delta = wanted_tokens.max(-(state.cumulative_tokens as i64));
        state.cumulative_tokens = (state.cumulative_tokens as i64 + token_delta) as u64;

        let wanted_cost = actual_cost - reservation.estimated_cost;
        let cost_delta = wanted_cost.max(-state.cumulative_cost);
        state.cumulative_cost += cost_delta;
        if state.cumulative_cost < COST_EPSILON {
            state.cumulative_cost = 0.0;
        }

        debug!(
            "Reconciled reservation {}: actual ${:.4}, cumulative ${:.4}",
            reservation.id, actual_cost, state.cumulative_cost
        );

        UsageRecord {
            timestamp: Utc::now(),
            reservation_id: reservation.id,
            kind: UsageKind::Reconciliation,
            tokens_consumed: token_delta,
            estimated_cost: cost_delta,
            model: std::mem::take(&mut reservation.model),
            document_id: reservation.document_id.take(),
        }
    }

    pub fn usage_stats(&self) -> UsageStats {
        let state = self.state.lock();
        let warning = if state.cumulative_cost + COST_EPSILON >= self.config.advisory_limit_usd {
            let message = format!(
                "AI spend ${:.2} has reached the ${:.2} advisory limit",
                state.cumulative_cost, self.config.advisory_limit_usd
            );
            warn!("{}", message);
            Some(message)
        } else {
            None
        };

        UsageStats {
            cumulative_tokens: state.cumulative_tokens,
            cumulative_cost: state.cumulative_cost,
            cap_remaining: (self.config.hard_cap_usd - state.cumulative_cost).max(0.0),
            calls: state.calls,
            warning,
        }
    }

    /// Loads a previously persisted log, replacing current state. Reservations from the
    /// last hour count against the hourly limit again.
    pub fn restore(&self, records: &[UsageRecord]) {
        let window_start = Utc::now() - Duration::hours(1);
        let mut recent: Vec<DateTime<Utc>> = records
            .iter()
            .filter(|r| r.kind == UsageKind::Reservation && r.timestamp >= window_start)
            .map(|r| r.timestamp)
            .collect();
        recent.sort();

        let mut state = self.state.lock();
        *state = UsageState::default();
        state.recent_calls = recent.into();
        for record in records {
            state.cumulative_tokens =
                (state.cumulative_tokens as i64 + record.tokens_consumed).max(0) as u64;
            state.cumulative_cost = (state.cumulative_cost + record.estimated_cost).max(0.0);
            if record.kind == UsageKind::Reservation {
                state.calls += 1;
                if let Some(doc) = &record.document_id {
                    *state.calls_by_document.entry(doc.clone()).or_insert(0) += 1;
                }
            }
        }
        info!(
            "Restored {} usage records, cumulative ${:.4}",
            records.len(),
            state.cumulative_cost
        );
    }

    pub fn reset(&self) {
        *self.state.lock() = UsageState::default();
    }
}
