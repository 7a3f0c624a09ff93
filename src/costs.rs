//! LLM cost accounting.
//!
//! Records one row per provider call in `llm_calls`, maintains the
//! `cost_daily` aggregate, and derives alert levels from the configured
//! daily spend limit (80 / 95 / 100 percent).

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::db::Database;
use crate::types::{now_ms, rfc3339_ms, Result};

/// Alert level derived from the share of the daily limit spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostAlertLevel {
    None,
    Warn80,
    Warn95,
    LimitReached,
}

/// Per-model pricing in USD per million tokens.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// One recorded provider call.
#[derive(Debug, Clone)]
pub struct LlmCall {
    pub job_id: Option<String>,
    pub component: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub duration_ms: u64,
}

/// Tracker over the `llm_calls` and `cost_daily` tables.
#[derive(Debug)]
pub struct CostTracker {
    db: Database,
    daily_limit_usd: f64,
    pricing: HashMap<String, ModelPricing>,
    fallback: ModelPricing,
}

impl CostTracker {
    pub fn new(db: Database, daily_limit_usd: f64) -> Self {
        Self {
            db,
            daily_limit_usd,
            pricing: HashMap::new(),
            fallback: ModelPricing {
                input_per_mtok: 3.0,
                output_per_mtok: 15.0,
            },
        }
    }

    /// Register pricing for a model; unknown models use the fallback.
    pub fn with_pricing(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.pricing.insert(model.into(), pricing);
        self
    }

    /// Record a call and roll it into the daily aggregate. Returns the
    /// call's cost in USD.
    pub fn record_call(&self, call: &LlmCall) -> Result<f64> {
        let pricing = self.pricing.get(&call.model).copied().unwrap_or(self.fallback);
        let cost_usd = (call.input_tokens as f64 / 1_000_000.0) * pricing.input_per_mtok
            + (call.output_tokens as f64 / 1_000_000.0) * pricing.output_per_mtok;

        let day = Utc::now().format("%Y-%m-%d").to_string();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO llm_calls
                     (job_id, component, provider, model, input_tokens, output_tokens,
                      cached_tokens, cost_usd, duration_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    call.job_id,
                    call.component,
                    call.provider,
                    call.model,
                    call.input_tokens,
                    call.output_tokens,
                    call.cached_tokens,
                    cost_usd,
                    call.duration_ms,
                    rfc3339_ms(&now_ms()),
                ],
            )?;
            conn.execute(
                "INSERT INTO cost_daily (day, total_usd, call_count) VALUES (?1, ?2, 1)
                 ON CONFLICT(day) DO UPDATE SET
                     total_usd = total_usd + excluded.total_usd,
                     call_count = call_count + 1",
                params![day, cost_usd],
            )
        })?;

        let level = self.get_alert_level()?;
        if level != CostAlertLevel::None {
            warn!(?level, cost_usd, "daily cost alert");
        }
        Ok(cost_usd)
    }

    /// Today's spend in USD.
    pub fn spent_today(&self) -> Result<f64> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let total: Option<f64> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT total_usd FROM cost_daily WHERE day = ?1",
                params![day],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        Ok(total.unwrap_or(0.0))
    }

    pub fn get_alert_level(&self) -> Result<CostAlertLevel> {
        let spent = self.spent_today()?;
        let share = spent / self.daily_limit_usd;
        Ok(if share >= 1.0 {
            CostAlertLevel::LimitReached
        } else if share >= 0.95 {
            CostAlertLevel::Warn95
        } else if share >= 0.80 {
            CostAlertLevel::Warn80
        } else {
            CostAlertLevel::None
        })
    }

    pub fn is_limit_reached(&self) -> Result<bool> {
        Ok(self.get_alert_level()? == CostAlertLevel::LimitReached)
    }
}
