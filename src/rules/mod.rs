//! Standing-rule engine.
//!
//! Persisted glob-pattern decisions that auto-approve or auto-deny
//! matching actions. Patterns are single-segment globs: an exact
//! `<category>:<action>` or a category wildcard `<category>:*`. Matching
//! queries newest-first and the first match wins; expired rules are
//! excluded by the query and never surfaced again.

use chrono::{DateTime, Utc};
use globset::Glob;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::db::Database;
use crate::types::{now_ms, rfc3339_ms, Error, Result, RuleId};

/// Rule scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Global,
    Conversation,
}

impl RuleScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleScope::Global => "global",
            RuleScope::Conversation => "conversation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "global" => Some(RuleScope::Global),
            "conversation" => Some(RuleScope::Conversation),
            _ => None,
        }
    }
}

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleVerdict {
    Approve,
    Deny,
}

impl RuleVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleVerdict::Approve => "approve",
            RuleVerdict::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(RuleVerdict::Approve),
            "deny" => Some(RuleVerdict::Deny),
            _ => None,
        }
    }
}

/// A persisted standing rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandingRule {
    pub id: RuleId,
    pub action_pattern: String,
    pub scope: RuleScope,
    pub verdict: RuleVerdict,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub approval_count: u32,
}

/// Creation parameters. Defaults: scope global, verdict approve, no
/// expiry, zero approval count.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub action_pattern: String,
    pub scope: RuleScope,
    pub verdict: RuleVerdict,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl RuleSpec {
    pub fn approve(action_pattern: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            action_pattern: action_pattern.into(),
            scope: RuleScope::Global,
            verdict: RuleVerdict::Approve,
            expires_at: None,
            created_by: created_by.into(),
        }
    }
}

/// Engine over the `standing_rules` table plus in-memory suggestion
/// counters, partitioned by category so only same-category calls contend.
#[derive(Debug)]
pub struct StandingRuleEngine {
    db: Database,
    suggestion_threshold: u32,
    counters: Mutex<HashMap<String, u32>>,
}

impl StandingRuleEngine {
    pub fn new(db: Database, suggestion_threshold: u32) -> Self {
        Self {
            db,
            suggestion_threshold: suggestion_threshold.max(1),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a new rule after validating its pattern.
    pub fn create_rule(&self, spec: RuleSpec) -> Result<StandingRule> {
        validate_pattern(&spec.action_pattern)?;
        let rule = StandingRule {
            id: RuleId::new(),
            action_pattern: spec.action_pattern,
            scope: spec.scope,
            verdict: spec.verdict,
            created_at: now_ms(),
            expires_at: spec.expires_at,
            created_by: spec.created_by,
            approval_count: 0,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO standing_rules
                     (id, action_pattern, scope, verdict, created_at, expires_at,
                      created_by, approval_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    rule.id.as_str(),
                    rule.action_pattern,
                    rule.scope.as_str(),
                    rule.verdict.as_str(),
                    rfc3339_ms(&rule.created_at),
                    rule.expires_at.as_ref().map(rfc3339_ms),
                    rule.created_by,
                ],
            )
        })?;
        info!(rule_id = %rule.id, pattern = %rule.action_pattern, "standing rule created");
        Ok(rule)
    }

    /// All non-expired rules, newest first.
    pub fn list_rules(&self) -> Result<Vec<StandingRule>> {
        let now = rfc3339_ms(&now_ms());
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM standing_rules
                 WHERE expires_at IS NULL OR expires_at > ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt.query_map(params![now], rule_from_row)?;
            rows.collect()
        })
    }

    pub fn delete_rule(&self, id: &RuleId) -> Result<()> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM standing_rules WHERE id = ?1",
                params![id.as_str()],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found(format!("standing rule {} not found", id)));
        }
        Ok(())
    }

    /// First matching non-expired rule, newest first. Increments the
    /// match's approval count as a side effect.
    pub fn match_rule(&self, action: &str) -> Result<Option<StandingRule>> {
        for rule in self.list_rules()? {
            let matches = Glob::new(&rule.action_pattern)
                .map(|g| g.compile_matcher().is_match(action))
                .unwrap_or(false);
            if matches {
                self.db.with_conn(|conn| {
                    conn.execute(
                        "UPDATE standing_rules SET approval_count = approval_count + 1
                         WHERE id = ?1",
                        params![rule.id.as_str()],
                    )
                })?;
                debug!(rule_id = %rule.id, action, "standing rule matched");
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    /// Count a use of this action's category; returns `true` exactly when
    /// the per-category counter reaches the suggestion threshold, then
    /// resets it.
    pub fn suggest_rule(&self, action_pattern: &str) -> Result<bool> {
        let category = action_pattern
            .split_once(':')
            .map(|(category, _)| category)
            .unwrap_or(action_pattern)
            .to_string();

        let mut counters = self
            .counters
            .lock()
            .map_err(|_| Error::internal("suggestion counter lock poisoned"))?;
        let count = counters.entry(category).or_insert(0);
        *count += 1;
        if *count >= self.suggestion_threshold {
            *count = 0;
            return Ok(true);
        }
        Ok(false)
    }
}

/// A pattern is either `<category>:<action>` or `<category>:*`. The
/// category is always literal; wildcards cover the whole action segment
/// only.
fn validate_pattern(pattern: &str) -> Result<()> {
    let Some((category, action)) = pattern.split_once(':') else {
        return Err(Error::validation(format!(
            "action pattern {:?} must be <category>:<action> or <category>:*",
            pattern
        )));
    };
    if category.is_empty() || category.contains('*') || category.contains(':') {
        return Err(Error::validation(format!(
            "invalid category in pattern {:?}",
            pattern
        )));
    }
    if action.is_empty() || (action.contains('*') && action != "*") {
        return Err(Error::validation(format!(
            "invalid action in pattern {:?}: wildcard must cover the whole segment",
            pattern
        )));
    }
    if action.contains(':') {
        return Err(Error::validation(format!(
            "pattern {:?} has more than one segment separator",
            pattern
        )));
    }
    Ok(())
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<StandingRule> {
    let parse_time = |value: String| {
        DateTime::parse_from_rfc3339(&value)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    };
    let id: String = row.get("id")?;
    let scope: String = row.get("scope")?;
    let verdict: String = row.get("verdict")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;

    Ok(StandingRule {
        id: RuleId::must(&id),
        action_pattern: row.get("action_pattern")?,
        scope: RuleScope::parse(&scope).unwrap_or(RuleScope::Global),
        verdict: RuleVerdict::parse(&verdict).unwrap_or(RuleVerdict::Approve),
        created_at: parse_time(created_at),
        expires_at: expires_at.map(parse_time),
        created_by: row.get("created_by")?,
        approval_count: row.get("approval_count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn engine() -> StandingRuleEngine {
        StandingRuleEngine::new(Database::open_in_memory().unwrap(), 5)
    }

    #[test]
    fn test_create_and_list() {
        let engine = engine();
        let rule = engine
            .create_rule(RuleSpec::approve("file-manager:read", "user"))
            .unwrap();
        assert_eq!(rule.verdict, RuleVerdict::Approve);
        assert_eq!(rule.scope, RuleScope::Global);
        assert_eq!(rule.approval_count, 0);
        assert!(rule.expires_at.is_none());

        let rules = engine.list_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, rule.id);
    }

    #[test]
    fn test_pattern_validation() {
        let engine = engine();
        assert!(engine
            .create_rule(RuleSpec::approve("file-manager:read", "user"))
            .is_ok());
        assert!(engine
            .create_rule(RuleSpec::approve("file-manager:*", "user"))
            .is_ok());

        for bad in ["no-colon", "a:b:c", "*:read", ":read", "cat:", "cat:re*d"] {
            assert!(
                engine.create_rule(RuleSpec::approve(bad, "user")).is_err(),
                "pattern {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_exact_match() {
        let engine = engine();
        engine
            .create_rule(RuleSpec::approve("file-manager:read", "user"))
            .unwrap();

        let matched = engine.match_rule("file-manager:read").unwrap();
        assert!(matched.is_some());
        assert!(engine.match_rule("file-manager:write").unwrap().is_none());
    }

    #[test]
    fn test_category_wildcard() {
        let engine = engine();
        engine
            .create_rule(RuleSpec::approve("file-manager:*", "user"))
            .unwrap();

        assert!(engine.match_rule("file-manager:read").unwrap().is_some());
        assert!(engine.match_rule("file-manager:write").unwrap().is_some());
        assert!(engine.match_rule("payment:charge").unwrap().is_none());
    }

    #[test]
    fn test_newest_rule_wins() {
        let engine = engine();
        engine
            .create_rule(RuleSpec::approve("file-manager:*", "user"))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut deny = RuleSpec::approve("file-manager:read", "admin");
        deny.verdict = RuleVerdict::Deny;
        engine.create_rule(deny).unwrap();

        let matched = engine.match_rule("file-manager:read").unwrap().unwrap();
        assert_eq!(matched.verdict, RuleVerdict::Deny);
    }

    #[test]
    fn test_expired_rules_excluded() {
        let engine = engine();
        let mut spec = RuleSpec::approve("file-manager:read", "user");
        spec.expires_at = Some(now_ms() - Duration::hours(1));
        engine.create_rule(spec).unwrap();

        assert!(engine.list_rules().unwrap().is_empty());
        assert!(engine.match_rule("file-manager:read").unwrap().is_none());
    }

    #[test]
    fn test_match_increments_approval_count() {
        let engine = engine();
        engine
            .create_rule(RuleSpec::approve("file-manager:read", "user"))
            .unwrap();
        engine.match_rule("file-manager:read").unwrap();
        engine.match_rule("file-manager:read").unwrap();

        let rules = engine.list_rules().unwrap();
        assert_eq!(rules[0].approval_count, 2);
    }

    #[test]
    fn test_delete_rule() {
        let engine = engine();
        let rule = engine
            .create_rule(RuleSpec::approve("file-manager:read", "user"))
            .unwrap();
        engine.delete_rule(&rule.id).unwrap();
        assert!(engine.list_rules().unwrap().is_empty());
        assert!(engine.delete_rule(&rule.id).is_err());
    }

    #[test]
    fn test_suggestion_counter_fifth_call() {
        let engine = engine();
        for _ in 0..4 {
            assert!(!engine.suggest_rule("file-manager:read").unwrap());
        }
        assert!(engine.suggest_rule("file-manager:read").unwrap());
        // Counter reset: the next call starts over.
        assert!(!engine.suggest_rule("file-manager:read").unwrap());
    }

    #[test]
    fn test_suggestion_counters_per_category() {
        let engine = engine();
        for _ in 0..4 {
            assert!(!engine.suggest_rule("file-manager:read").unwrap());
        }
        // Different category, independent counter.
        assert!(!engine.suggest_rule("payment:charge").unwrap());
        // file-manager still completes on its fifth call; note different
        // actions share the category counter.
        assert!(engine.suggest_rule("file-manager:write").unwrap());
    }

    #[test]
    fn test_suggestion_category_without_colon() {
        let engine = engine();
        for _ in 0..4 {
            assert!(!engine.suggest_rule("shell").unwrap());
        }
        assert!(engine.suggest_rule("shell").unwrap());
    }
}
