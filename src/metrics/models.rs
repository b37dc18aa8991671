// Model metrics collector - models, assistants, tools and functions
//
// A model row with a base model reference is an assistant built on top
// of another model; one without is a base model. The two counts partition
// the model table.
//
// Unique users per model are measured from chat history (who actually
// talked to the model), not from who owns the model row.

use async_trait::async_trait;
use prometheus::{Gauge, Registry};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use super::conversation;
use super::instruments::{register_gauge, LabeledGauge, LabeledValues};
use super::{fetch_count, fetch_grouped, fetch_rows, CollectError, MetricCollector};
use crate::db::{Query, Store};

/// Collector for models and the extensions attached to them
pub struct ModelCollector {
    models: Gauge,
    assistants: Gauge,
    active: Gauge,
    by_user: LabeledGauge,
    by_base: LabeledGauge,
    unique_users: LabeledGauge,
    tools: Gauge,
    tools_by_user: LabeledGauge,
    functions: Gauge,
    functions_active: Gauge,
    functions_global: Gauge,
    functions_by_type: LabeledGauge,
    functions_by_user: LabeledGauge,
}

/// Model table split into base models and assistants
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct ModelCounts {
    base: f64,
    assistants: f64,
    active: f64,
}

impl ModelCounts {
    fn tally(records: &[(bool, bool)]) -> Self {
        records
            .iter()
            .fold(ModelCounts::default(), |mut counts, &(has_base, active)| {
                if has_base {
                    counts.assistants += 1.0;
                } else {
                    counts.base += 1.0;
                }
                if active {
                    counts.active += 1.0;
                }
                counts
            })
    }
}

/// Number of distinct users whose chats contain turns from each model
fn unique_users(chats: Vec<(Option<String>, conversation::ConversationSummary)>) -> LabeledValues {
    let mut users: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (user, summary) in chats {
        let Some(user) = user else { continue };
        for model in summary.model_names() {
            users
                .entry(model.to_string())
                .or_default()
                .insert(user.clone());
        }
    }
    users
        .into_iter()
        .map(|(model, users)| (vec![model], users.len() as f64))
        .collect()
}

struct ModelSnapshot {
    counts: ModelCounts,
    by_user: LabeledValues,
    by_base: LabeledValues,
    unique_users: LabeledValues,
    tools: f64,
    tools_by_user: LabeledValues,
    functions: f64,
    functions_active: f64,
    functions_global: f64,
    functions_by_type: LabeledValues,
    functions_by_user: LabeledValues,
}

impl ModelCollector {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(ModelCollector {
            models: register_gauge(
                registry,
                "openwebui_models_total",
                "Total number of base models (no base model reference)",
            )?,
            assistants: register_gauge(
                registry,
                "openwebui_assistants_total",
                "Total number of assistants derived from a base model",
            )?,
            active: register_gauge(registry, "openwebui_models_active", "Number of active models")?,
            by_user: LabeledGauge::register(
                registry,
                "openwebui_models_by_user",
                "Number of models per user",
                &["user_id", "user_name"],
            )?,
            by_base: LabeledGauge::register(
                registry,
                "openwebui_models_by_base",
                "Number of models per base model",
                &["base_model_id", "model_name"],
            )?,
            unique_users: LabeledGauge::register(
                registry,
                "openwebui_model_unique_users",
                "Number of distinct users that chatted with each model",
                &["model"],
            )?,
            tools: register_gauge(registry, "openwebui_tools_total", "Total number of tools")?,
            tools_by_user: LabeledGauge::register(
                registry,
                "openwebui_tools_by_user",
                "Number of tools per user",
                &["user_id", "user_name", "tool_name"],
            )?,
            functions: register_gauge(registry, "openwebui_functions_total", "Total number of functions")?,
            functions_active: register_gauge(
                registry,
                "openwebui_functions_active",
                "Number of active functions",
            )?,
            functions_global: register_gauge(
                registry,
                "openwebui_functions_global",
                "Number of global functions",
            )?,
            functions_by_type: LabeledGauge::register(
                registry,
                "openwebui_functions_by_type",
                "Number of functions by type",
                &["type", "function_name"],
            )?,
            functions_by_user: LabeledGauge::register(
                registry,
                "openwebui_functions_by_user",
                "Number of functions per user",
                &["user_id", "user_name", "function_name"],
            )?,
        })
    }

    async fn snapshot(&self, store: &mut dyn Store) -> Result<ModelSnapshot, CollectError> {
        let records = fetch_rows(store, Query::ModelRecords, |row| {
            Ok((row.opt_text(1)?.is_some(), row.flag(2)?))
        })
        .await?;
        let by_user = fetch_grouped(store, Query::ModelsByUser, "unknown").await?;
        let by_base = fetch_grouped(store, Query::ModelsByBase, "unknown").await?;

        let chats = fetch_rows(store, Query::ChatModelUsage, |row| {
            let summary = match row.json(1) {
                Ok(Some(payload)) => conversation::summarize(&payload),
                Ok(None) => Default::default(),
                Err(e) => {
                    warn!("Skipping chat payload for model usage: {}", e);
                    Default::default()
                }
            };
            Ok((row.opt_text(0)?.map(str::to_string), summary))
        })
        .await?;

        let tools = fetch_count(store, Query::TotalTools).await?;
        let tools_by_user = fetch_grouped(store, Query::ToolsByUser, "unknown").await?;
        let functions = fetch_count(store, Query::TotalFunctions).await?;
        let functions_active = fetch_count(store, Query::ActiveFunctions).await?;
        let functions_global = fetch_count(store, Query::GlobalFunctions).await?;
        let functions_by_type = fetch_grouped(store, Query::FunctionsByType, "unknown").await?;
        let functions_by_user = fetch_grouped(store, Query::FunctionsByUser, "unknown").await?;

        Ok(ModelSnapshot {
            counts: ModelCounts::tally(&records),
            by_user,
            by_base,
            unique_users: unique_users(chats),
            tools,
            tools_by_user,
            functions,
            functions_active,
            functions_global,
            functions_by_type,
            functions_by_user,
        })
    }

    fn publish(&self, snapshot: ModelSnapshot) {
        self.models.set(snapshot.counts.base);
        self.assistants.set(snapshot.counts.assistants);
        self.active.set(snapshot.counts.active);
        self.by_user.replace(snapshot.by_user);
        self.by_base.replace(snapshot.by_base);
        self.unique_users.replace(snapshot.unique_users);
        self.tools.set(snapshot.tools);
        self.tools_by_user.replace(snapshot.tools_by_user);
        self.functions.set(snapshot.functions);
        self.functions_active.set(snapshot.functions_active);
        self.functions_global.set(snapshot.functions_global);
        self.functions_by_type.replace(snapshot.functions_by_type);
        self.functions_by_user.replace(snapshot.functions_by_user);
    }
}

#[async_trait]
impl MetricCollector for ModelCollector {
    fn name(&self) -> &'static str {
        "models"
    }

    async fn refresh(&self, store: &mut dyn Store) -> Result<(), CollectError> {
        let snapshot = self.snapshot(store).await?;
        self.publish(snapshot);
        Ok(())
    }
}
