//! Compliance summary reporting.
//!
//! Aggregates the audit log and approval queue over a look-back window:
//! allow/deny totals and rates, approval outcomes, the ten most active
//! agents, the ten most-blocked actions, and a per-day breakdown capped at
//! fourteen days. Team-scoped admins see only their team's agents.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

use crate::ledger::AuditLedger;
use crate::proto::{
    AgentActivity, AuditEntry, DailyActivity, DeniedActionCount, ReportApprovals, ReportOverview,
    SummaryReport,
};
use crate::store::{Store, StoreError};

/// Days shown in the daily breakdown regardless of the report window.
const CHART_DAYS_CAP: u32 = 14;

pub struct Reports {
    store: Arc<Store>,
    ledger: Arc<AuditLedger>,
}

impl Reports {
    pub fn new(store: Arc<Store>, ledger: Arc<AuditLedger>) -> Self {
        Self { store, ledger }
    }

    pub fn summary(
        &self,
        team: Option<&str>,
        days: u32,
        now: DateTime<Utc>,
    ) -> Result<SummaryReport, StoreError> {
        let cutoff = now - Duration::days(days as i64);

        let scope: Option<HashSet<String>> = match team {
            Some(team) => Some(self.store.team_agent_ids(team)?),
            None => None,
        };
        let in_scope = |entry: &AuditEntry| {
            scope
                .as_ref()
                .map_or(true, |ids| ids.contains(&entry.agent_id))
        };

        let entries: Vec<AuditEntry> = self
            .ledger
            .entries_since(cutoff)
            .into_iter()
            .filter(|e| in_scope(e))
            .collect();

        let total_actions = entries.len();
        let allowed = entries.iter().filter(|e| e.allowed).count();
        let denied = total_actions - allowed;

        let stats = self.store.approval_stats(team, cutoff)?;
        let decided = stats.approved + stats.denied;

        Ok(SummaryReport {
            period_days: days,
            generated_at: now,
            overview: ReportOverview {
                total_actions,
                allowed,
                denied,
                allow_rate: rate(allowed, total_actions),
                deny_rate: rate(denied, total_actions),
            },
            approvals: ReportApprovals {
                total: stats.total,
                pending: stats.pending,
                approved: stats.approved,
                denied: stats.denied,
                approval_rate: rate(stats.approved, decided),
            },
            top_agents: self.top_agents(&entries)?,
            top_denied_actions: top_denied_actions(&entries),
            daily_breakdown: daily_breakdown(&entries, days, now),
        })
    }

    fn top_agents(&self, entries: &[AuditEntry]) -> Result<Vec<AgentActivity>, StoreError> {
        let mut per_agent: HashMap<&str, (usize, usize)> = HashMap::new();
        for entry in entries {
            let counts = per_agent.entry(entry.agent_id.as_str()).or_default();
            counts.0 += 1;
            if entry.allowed {
                counts.1 += 1;
            }
        }

        let mut ranked: Vec<(&str, (usize, usize))> = per_agent.into_iter().collect();
        ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.0.cmp(b.0)));

        let mut top = Vec::with_capacity(10);
        for (agent_id, (total, allowed)) in ranked.into_iter().take(10) {
            let agent_name = self
                .store
                .get_agent(agent_id)?
                .map(|a| a.display_name)
                .unwrap_or_else(|| "Unknown".to_string());
            top.push(AgentActivity {
                agent_id: agent_id.to_string(),
                agent_name,
                total_actions: total,
                allowed,
                denied: total - allowed,
            });
        }
        Ok(top)
    }
}

fn top_denied_actions(entries: &[AuditEntry]) -> Vec<DeniedActionCount> {
    let mut per_action: HashMap<&str, usize> = HashMap::new();
    for entry in entries.iter().filter(|e| !e.allowed) {
        *per_action.entry(entry.action.as_str()).or_default() += 1;
    }

    let mut ranked: Vec<(&str, usize)> = per_action.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(10)
        .map(|(action, count)| DeniedActionCount {
            action: action.to_string(),
            count,
        })
        .collect()
}

fn daily_breakdown(entries: &[AuditEntry], days: u32, now: DateTime<Utc>) -> Vec<DailyActivity> {
    let chart_days = days.min(CHART_DAYS_CAP);
    let today_start = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));

    let mut breakdown = Vec::with_capacity(chart_days as usize);
    for i in (0..chart_days as i64).rev() {
        let day_start = today_start - Duration::days(i);
        let day_end = day_start + Duration::days(1);

        let day_entries = entries
            .iter()
            .filter(|e| e.timestamp >= day_start && e.timestamp < day_end);
        let (total, allowed) = day_entries.fold((0usize, 0usize), |(total, allowed), e| {
            (total + 1, allowed + usize::from(e.allowed))
        });

        breakdown.push(DailyActivity {
            date: day_start.format("%Y-%m-%d").to_string(),
            total,
            allowed,
            denied: total - allowed,
        });
    }
    breakdown
}

fn rate(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64 * 1000.0).round() / 10.0
}
