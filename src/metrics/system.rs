// System metrics collector - configuration, groups, feedback and tables
//
// Table statistics come from the PostgreSQL catalogue, so the set of
// `table` label values follows whatever tables exist in the public schema.

use async_trait::async_trait;
use prometheus::{Gauge, Registry};
use serde_json::Value as Json;
use tracing::warn;

use super::instruments::{register_gauge, LabeledGauge, LabeledValues};
use super::{fetch_count, fetch_grouped, fetch_rows, CollectError, MetricCollector};
use crate::db::{Query, Row, Store, StoreError};

/// Collector for instance-wide state
pub struct SystemCollector {
    config_version: Gauge,
    config_last_update: Gauge,
    groups: Gauge,
    users_in_groups: LabeledGauge,
    feedback: Gauge,
    feedback_by_type: LabeledGauge,
    table_rows: LabeledGauge,
    table_size: LabeledGauge,
}

/// Latest configuration row
#[derive(Debug, Clone, Copy, PartialEq)]
struct ConfigState {
    version: Option<f64>,
    updated_at: Option<f64>,
}

#[derive(Debug, Default, PartialEq)]
struct TableStats {
    rows: LabeledValues,
    size: LabeledValues,
}

struct SystemSnapshot {
    /// `None` when the configuration table is empty
    config: Option<ConfigState>,
    groups: f64,
    users_in_groups: LabeledValues,
    feedback: f64,
    feedback_by_type: LabeledValues,
    /// `None` when the catalogue could not be read this cycle
    tables: Option<TableStats>,
}

/// Member count for one group row, or `None` if its member list is unusable
fn group_members(row: &Row) -> Result<Option<(Vec<String>, f64)>, StoreError> {
    let labels = vec![
        row.text(0)?.to_string(),
        row.label(1, "")?,
        row.label(2, "unknown")?,
        row.label(3, "unknown")?,
    ];

    let members = match row.json(4) {
        Ok(Some(Json::Array(members))) => members.len(),
        Ok(other) => {
            warn!("Group {} has no member list: {:?}", labels[0], other);
            return Ok(None);
        }
        Err(e) => {
            warn!("Skipping members of group {}: {}", labels[0], e);
            return Ok(None);
        }
    };

    Ok(Some((labels, members as f64)))
}

impl SystemCollector {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let per_table = |name: &str, help: &str| LabeledGauge::register(registry, name, help, &["table"]);

        Ok(SystemCollector {
            config_version: register_gauge(registry, "openwebui_config_version", "Current config version")?,
            config_last_update: register_gauge(
                registry,
                "openwebui_config_last_update",
                "Timestamp of last config update",
            )?,
            groups: register_gauge(registry, "openwebui_groups_total", "Total number of groups")?,
            users_in_groups: LabeledGauge::register(
                registry,
                "openwebui_users_in_groups",
                "Number of users in each group",
                &["group_id", "group_name", "owner_id", "owner_name"],
            )?,
            feedback: register_gauge(registry, "openwebui_feedback_total", "Total number of feedback entries")?,
            feedback_by_type: LabeledGauge::register(
                registry,
                "openwebui_feedback_by_type",
                "Number of feedback entries by type",
                &["type", "user_id", "user_name"],
            )?,
            table_rows: per_table("openwebui_table_rows", "Estimated number of live rows per table")?,
            table_size: per_table(
                "openwebui_table_size_bytes",
                "Total on-disk size of each table including indexes",
            )?,
        })
    }

    async fn table_stats(&self, store: &mut dyn Store) -> Result<TableStats, CollectError> {
        let tables = fetch_rows(store, Query::TableStats, |row| {
            Ok((row.text(0)?.to_string(), row.float(1)?, row.float(2)?))
        })
        .await?;

        let mut stats = TableStats::default();
        for (table, rows, size) in tables {
            stats.rows.push((vec![table.clone()], rows));
            stats.size.push((vec![table], size));
        }
        Ok(stats)
    }

    async fn snapshot(&self, store: &mut dyn Store) -> Result<SystemSnapshot, CollectError> {
        let config = fetch_rows(store, Query::LatestConfig, |row| {
            Ok(ConfigState {
                version: row.opt_float(0)?,
                updated_at: row.opt_float(1)?,
            })
        })
        .await?
        .into_iter()
        .next();

        let groups = fetch_count(store, Query::TotalGroups).await?;
        let users_in_groups = fetch_rows(store, Query::GroupMembers, group_members)
            .await?
            .into_iter()
            .flatten()
            .collect();
        let feedback = fetch_count(store, Query::TotalFeedback).await?;
        let feedback_by_type = fetch_grouped(store, Query::FeedbackByType, "anonymous").await?;

        // Runs last so a catalogue failure cannot affect the queries above
        let tables = match self.table_stats(store).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Skipping table statistics: {}", e);
                None
            }
        };

        Ok(SystemSnapshot {
            config,
            groups,
            users_in_groups,
            feedback,
            feedback_by_type,
            tables,
        })
    }

    fn publish(&self, snapshot: SystemSnapshot) {
        if let Some(config) = snapshot.config {
            if let Some(version) = config.version {
                self.config_version.set(version);
            }
            if let Some(updated_at) = config.updated_at {
                self.config_last_update.set(updated_at);
            }
        }
        self.groups.set(snapshot.groups);
        self.users_in_groups.replace(snapshot.users_in_groups);
        self.feedback.set(snapshot.feedback);
        self.feedback_by_type.replace(snapshot.feedback_by_type);
        if let Some(tables) = snapshot.tables {
            self.table_rows.replace(tables.rows);
            self.table_size.replace(tables.size);
        }
    }
}

#[async_trait]
impl MetricCollector for SystemCollector {
    fn name(&self) -> &'static str {
        "system"
    }

    async fn refresh(&self, store: &mut dyn Store) -> Result<(), CollectError> {
        let snapshot = self.snapshot(store).await?;
        self.publish(snapshot);
        Ok(())
    }
}
