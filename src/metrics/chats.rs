// Chat metrics collector - chats, folders, messages and model usage
//
// Simple counts come straight from SQL. Message and per-model figures are
// computed here from each chat's stored conversation, which may use either
// payload shape (see `conversation`).

use async_trait::async_trait;
use prometheus::{Gauge, Registry};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use super::conversation;
use super::instruments::{register_gauge, LabeledGauge, LabeledValues, SnapshotHistogram, AGE_BUCKETS};
use super::{fetch_count, fetch_grouped, fetch_rows, system_clock, Clock, CollectError, MetricCollector};
use crate::db::{Query, Store};

/// Collector for chats and their conversations
pub struct ChatCollector {
    total: Gauge,
    active: Gauge,
    archived: Gauge,
    pinned: Gauge,
    shared: Gauge,
    by_user: LabeledGauge,
    folders: Gauge,
    in_folders: LabeledGauge,
    messages: Gauge,
    by_model: LabeledGauge,
    archived_by_model: LabeledGauge,
    pinned_by_model: LabeledGauge,
    messages_by_model: LabeledGauge,
    age: SnapshotHistogram,
    clock: Clock,
}

/// One chat row as the collector needs it
struct ChatRecord {
    archived: bool,
    pinned: bool,
    created_at: Option<f64>,
    summary: conversation::ConversationSummary,
}

/// Aggregates over all chat conversations
#[derive(Debug, Default, PartialEq)]
struct ModelUsage {
    messages: f64,
    chats: BTreeMap<String, f64>,
    archived: BTreeMap<String, f64>,
    pinned: BTreeMap<String, f64>,
    messages_by_model: BTreeMap<String, f64>,
}

impl ModelUsage {
    fn from_records(records: &[ChatRecord]) -> Self {
        let mut usage = ModelUsage::default();
        for record in records {
            usage.messages += record.summary.turns as f64;
            for (model, turns) in &record.summary.models {
                // A chat counts once per model however many turns it used
                *usage.chats.entry(model.clone()).or_default() += 1.0;
                if record.archived {
                    *usage.archived.entry(model.clone()).or_default() += 1.0;
                }
                if record.pinned {
                    *usage.pinned.entry(model.clone()).or_default() += 1.0;
                }
                *usage.messages_by_model.entry(model.clone()).or_default() += *turns as f64;
            }
        }
        usage
    }
}

fn by_model(counts: BTreeMap<String, f64>) -> LabeledValues {
    counts
        .into_iter()
        .map(|(model, value)| (vec![model], value))
        .collect()
}

struct ChatSnapshot {
    total: f64,
    active: f64,
    archived: f64,
    pinned: f64,
    shared: f64,
    by_user: LabeledValues,
    folders: f64,
    in_folders: LabeledValues,
    usage: ModelUsage,
    ages: Vec<f64>,
}

impl ChatCollector {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Self::with_clock(registry, system_clock)
    }

    /// Builds the collector with a custom time source for chat ages
    pub fn with_clock(registry: &Registry, clock: Clock) -> Result<Self, prometheus::Error> {
        let per_model = |name: &str, help: &str| LabeledGauge::register(registry, name, help, &["model"]);

        Ok(ChatCollector {
            total: register_gauge(registry, "openwebui_chats_total", "Total number of chats")?,
            active: register_gauge(registry, "openwebui_chats_active", "Number of non-archived chats")?,
            archived: register_gauge(registry, "openwebui_chats_archived", "Number of archived chats")?,
            pinned: register_gauge(registry, "openwebui_chats_pinned", "Number of pinned chats")?,
            shared: register_gauge(registry, "openwebui_chats_shared", "Number of shared chats")?,
            by_user: LabeledGauge::register(
                registry,
                "openwebui_chats_by_user",
                "Number of chats per user",
                &["user_id", "user_name"],
            )?,
            folders: register_gauge(registry, "openwebui_folders_total", "Total number of chat folders")?,
            in_folders: LabeledGauge::register(
                registry,
                "openwebui_chats_in_folders",
                "Number of chats in folder",
                &["folder_id", "folder_name", "user_id", "user_name"],
            )?,
            messages: register_gauge(
                registry,
                "openwebui_chat_messages_total",
                "Total number of chat messages",
            )?,
            by_model: per_model("openwebui_chats_by_model", "Number of chats using each model")?,
            archived_by_model: per_model(
                "openwebui_chats_archived_by_model",
                "Number of archived chats using each model",
            )?,
            pinned_by_model: per_model(
                "openwebui_chats_pinned_by_model",
                "Number of pinned chats using each model",
            )?,
            messages_by_model: per_model(
                "openwebui_chat_messages_by_model",
                "Number of chat messages produced by each model",
            )?,
            age: SnapshotHistogram::register(
                registry,
                "openwebui_chat_age_seconds",
                "Age of chats in seconds",
                &AGE_BUCKETS,
            )?,
            clock,
        })
    }

    async fn snapshot(&self, store: &mut dyn Store) -> Result<ChatSnapshot, CollectError> {
        let total = fetch_count(store, Query::TotalChats).await?;
        let active = fetch_count(store, Query::ActiveChats).await?;
        let archived = fetch_count(store, Query::ArchivedChats).await?;
        let pinned = fetch_count(store, Query::PinnedChats).await?;
        let shared = fetch_count(store, Query::SharedChats).await?;
        let by_user = fetch_grouped(store, Query::ChatsByUser, "unknown").await?;
        let folders = fetch_count(store, Query::TotalFolders).await?;
        let in_folders = fetch_grouped(store, Query::ChatsInFolders, "unknown").await?;

        let records = fetch_rows(store, Query::ChatRecords, |row| {
            // An unreadable payload only loses that chat's conversation
            let summary = match row.json(4) {
                Ok(Some(payload)) => conversation::summarize(&payload),
                Ok(None) => Default::default(),
                Err(e) => {
                    warn!("Skipping conversation of chat {:?}: {}", row.opt_text(0).ok().flatten(), e);
                    Default::default()
                }
            };
            Ok(ChatRecord {
                archived: row.flag(1)?,
                pinned: row.flag(2)?,
                created_at: row.opt_float(3)?,
                summary,
            })
        })
        .await?;

        let now = (self.clock)() as f64;
        let ages = records
            .iter()
            .filter_map(|record| record.created_at)
            .map(|created| (now - created).max(0.0))
            .collect();
        let usage = ModelUsage::from_records(&records);

        debug!(
            "Read {} chats with {} messages across {} models",
            records.len(),
            usage.messages,
            usage.chats.len()
        );

        Ok(ChatSnapshot {
            total,
            active,
            archived,
            pinned,
            shared,
            by_user,
            folders,
            in_folders,
            usage,
            ages,
        })
    }

    fn publish(&self, snapshot: ChatSnapshot) -> Result<(), CollectError> {
        self.age.replace(snapshot.ages)?;
        self.total.set(snapshot.total);
        self.active.set(snapshot.active);
        self.archived.set(snapshot.archived);
        self.pinned.set(snapshot.pinned);
        self.shared.set(snapshot.shared);
        self.by_user.replace(snapshot.by_user);
        self.folders.set(snapshot.folders);
        self.in_folders.replace(snapshot.in_folders);

        let usage = snapshot.usage;
        self.messages.set(usage.messages);
        self.by_model.replace(by_model(usage.chats));
        self.archived_by_model.replace(by_model(usage.archived));
        self.pinned_by_model.replace(by_model(usage.pinned));
        self.messages_by_model.replace(by_model(usage.messages_by_model));
        Ok(())
    }
}

#[async_trait]
impl MetricCollector for ChatCollector {
    fn name(&self) -> &'static str {
        "chats"
    }

    async fn refresh(&self, store: &mut dyn Store) -> Result<(), CollectError> {
        let snapshot = self.snapshot(store).await?;
        self.publish(snapshot)
    }
}
