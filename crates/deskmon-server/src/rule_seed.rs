use deskmon_alert::rule::build_rule;
use deskmon_alert::MonitoringEngine;
use deskmon_common::types::{AlertRule, AlertRuleDraft};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Rule seed file: `{ "rules": [ { ...draft... }, ... ] }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesSeedFile {
    #[serde(default)]
    pub rules: Vec<AlertRuleDraft>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub added: usize,
    pub skipped: usize,
}

pub fn parse_seed(content: &str) -> anyhow::Result<RulesSeedFile> {
    Ok(serde_json::from_str(content)?)
}

pub fn load_seed(path: &str) -> anyhow::Result<RulesSeedFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read seed file '{}': {}", path, e))?;
    parse_seed(&content).map_err(|e| anyhow::anyhow!("Failed to parse seed file '{}': {}", path, e))
}

fn describe(index: usize, draft: &AlertRuleDraft) -> String {
    match (&draft.id, draft.name.trim()) {
        (Some(id), _) => format!("rule #{} (id {})", index + 1, id),
        (None, "") => format!("rule #{}", index + 1),
        (None, name) => format!("rule #{} ({})", index + 1, name),
    }
}

/// Validates every draft in the seed, stopping at the first invalid one.
/// Explicit ids must be unique within the file.
pub fn check_rules(seed: &RulesSeedFile) -> anyhow::Result<Vec<AlertRule>> {
    let mut seen = HashSet::new();
    let mut rules = Vec::with_capacity(seed.rules.len());
    for (index, draft) in seed.rules.iter().enumerate() {
        if let Some(id) = &draft.id {
            if !seen.insert(id.clone()) {
                anyhow::bail!("{}: duplicate rule id", describe(index, draft));
            }
        }
        let rule = build_rule(draft.clone())
            .map_err(|e| anyhow::anyhow!("{}: {}", describe(index, draft), e))?;
        rules.push(rule);
    }
    Ok(rules)
}

/// Adds the seed's rules to the engine. Invalid or duplicate rules are
/// logged and skipped.
pub async fn seed_rules(engine: &MonitoringEngine, seed: RulesSeedFile) -> SeedSummary {
    let mut summary = SeedSummary::default();
    for (index, draft) in seed.rules.into_iter().enumerate() {
        let label = describe(index, &draft);
        match engine.add_alert_rule(draft).await {
            Ok(rule) => {
                tracing::debug!(rule_id = %rule.id, name = %rule.name, "Seeded alert rule");
                summary.added += 1;
            }
            Err(e) => {
                tracing::warn!(rule = %label, error = %e, "Skipping invalid seed rule");
                summary.skipped += 1;
            }
        }
    }
    tracing::info!(
        added = summary.added,
        skipped = summary.skipped,
        "Alert rules seeded"
    );
    summary
}
