// Document metrics collector - documents, files, knowledge bases, memories
//
// Files are tied to knowledge bases only through their metadata: a file
// belongs to the knowledge base whose id equals the file's
// `collection_name`. Files without a match count toward the total only.

use async_trait::async_trait;
use prometheus::{Gauge, Registry};
use std::collections::HashMap;
use tracing::warn;

use super::instruments::{register_gauge, LabeledGauge, LabeledValues, SnapshotHistogram, AGE_BUCKETS};
use super::{fetch_count, fetch_grouped, fetch_rows, system_clock, Clock, CollectError, MetricCollector};
use crate::db::{Query, Store};

/// Collector for uploaded content
pub struct DocumentCollector {
    documents: Gauge,
    documents_by_collection: LabeledGauge,
    documents_by_user: LabeledGauge,
    files: Gauge,
    files_by_user: LabeledGauge,
    files_by_knowledge_base: LabeledGauge,
    knowledge_bases: Gauge,
    knowledge_bases_by_user: LabeledGauge,
    memories: Gauge,
    memories_by_user: LabeledGauge,
    age: SnapshotHistogram,
    clock: Clock,
}

struct DocumentSnapshot {
    documents: f64,
    documents_by_collection: LabeledValues,
    documents_by_user: LabeledValues,
    files: f64,
    files_by_user: LabeledValues,
    knowledge_bases: f64,
    knowledge_bases_by_user: LabeledValues,
    memories: f64,
    memories_by_user: LabeledValues,
    ages: Vec<f64>,
    /// `None` when attribution could not be computed this cycle
    files_by_knowledge_base: Option<LabeledValues>,
}

/// Counts files per knowledge base by matching collection names to ids
///
/// Every knowledge base is reported, including those without files.
fn attribute_files(
    knowledge_bases: &[(String, String)],
    collections: &[Option<String>],
) -> LabeledValues {
    let mut per_base: HashMap<&str, usize> = HashMap::new();
    for collection in collections.iter().flatten() {
        *per_base.entry(collection.as_str()).or_insert(0) += 1;
    }

    knowledge_bases
        .iter()
        .map(|(id, name)| {
            let files = per_base.get(id.as_str()).copied().unwrap_or(0);
            (vec![id.clone(), name.clone()], files as f64)
        })
        .collect()
}

impl DocumentCollector {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Self::with_clock(registry, system_clock)
    }

    /// Builds the collector with a custom time source for document ages
    pub fn with_clock(registry: &Registry, clock: Clock) -> Result<Self, prometheus::Error> {
        let per_user = |name: &str, help: &str| LabeledGauge::register(registry, name, help, &["user_id"]);

        Ok(DocumentCollector {
            documents: register_gauge(registry, "openwebui_documents_total", "Total number of documents")?,
            documents_by_collection: LabeledGauge::register(
                registry,
                "openwebui_documents_by_collection",
                "Number of documents per collection",
                &["collection_name"],
            )?,
            documents_by_user: per_user("openwebui_documents_by_user", "Number of documents per user")?,
            files: register_gauge(registry, "openwebui_files_total", "Total number of files")?,
            files_by_user: per_user("openwebui_files_by_user", "Number of files per user")?,
            files_by_knowledge_base: LabeledGauge::register(
                registry,
                "openwebui_files_by_knowledge_base",
                "Number of files attributed to each knowledge base",
                &["knowledge_id", "knowledge_name"],
            )?,
            knowledge_bases: register_gauge(
                registry,
                "openwebui_knowledge_bases_total",
                "Total number of knowledge bases",
            )?,
            knowledge_bases_by_user: per_user(
                "openwebui_knowledge_bases_by_user",
                "Number of knowledge bases per user",
            )?,
            memories: register_gauge(registry, "openwebui_memories_total", "Total number of memories")?,
            memories_by_user: per_user("openwebui_memories_by_user", "Number of memories per user")?,
            age: SnapshotHistogram::register(
                registry,
                "openwebui_document_age_seconds",
                "Age of documents in seconds",
                &AGE_BUCKETS,
            )?,
            clock,
        })
    }

    /// Reads knowledge bases and file collection names and joins them
    async fn knowledge_attribution(&self, store: &mut dyn Store) -> Result<LabeledValues, CollectError> {
        let knowledge_bases = fetch_rows(store, Query::KnowledgeBases, |row| {
            Ok((row.text(0)?.to_string(), row.label(1, "")?))
        })
        .await?;
        let collections = fetch_rows(store, Query::FileCollections, |row| {
            Ok(row.opt_text(0)?.map(str::to_string))
        })
        .await?;
        Ok(attribute_files(&knowledge_bases, &collections))
    }

    async fn snapshot(&self, store: &mut dyn Store) -> Result<DocumentSnapshot, CollectError> {
        let documents = fetch_count(store, Query::TotalDocuments).await?;
        let documents_by_collection = fetch_grouped(store, Query::DocumentsByCollection, "unknown").await?;
        let documents_by_user = fetch_grouped(store, Query::DocumentsByUser, "unknown").await?;
        let files = fetch_count(store, Query::TotalFiles).await?;
        let files_by_user = fetch_grouped(store, Query::FilesByUser, "unknown").await?;
        let knowledge_bases = fetch_count(store, Query::TotalKnowledgeBases).await?;
        let knowledge_bases_by_user = fetch_grouped(store, Query::KnowledgeBasesByUser, "unknown").await?;
        let memories = fetch_count(store, Query::TotalMemories).await?;
        let memories_by_user = fetch_grouped(store, Query::MemoriesByUser, "unknown").await?;

        let timestamps = fetch_rows(store, Query::DocumentTimestamps, |row| row.opt_float(0)).await?;
        let now = (self.clock)() as f64;
        let ages = timestamps
            .into_iter()
            .flatten()
            .map(|created| (now - created).max(0.0))
            .collect();

        // Runs last: file metadata varies between deployments, and on
        // PostgreSQL a failed statement poisons the rest of the transaction
        // until the manager rolls back to this collector's savepoint.
        let files_by_knowledge_base = match self.knowledge_attribution(store).await {
            Ok(values) => Some(values),
            Err(e) => {
                warn!("Skipping file to knowledge base attribution: {}", e);
                None
            }
        };

        Ok(DocumentSnapshot {
            documents,
            documents_by_collection,
            documents_by_user,
            files,
            files_by_user,
            knowledge_bases,
            knowledge_bases_by_user,
            memories,
            memories_by_user,
            ages,
            files_by_knowledge_base,
        })
    }

    fn publish(&self, snapshot: DocumentSnapshot) -> Result<(), CollectError> {
        self.age.replace(snapshot.ages)?;
        self.documents.set(snapshot.documents);
        self.documents_by_collection.replace(snapshot.documents_by_collection);
        self.documents_by_user.replace(snapshot.documents_by_user);
        self.files.set(snapshot.files);
        self.files_by_user.replace(snapshot.files_by_user);
        self.knowledge_bases.set(snapshot.knowledge_bases);
        self.knowledge_bases_by_user.replace(snapshot.knowledge_bases_by_user);
        self.memories.set(snapshot.memories);
        self.memories_by_user.replace(snapshot.memories_by_user);
        if let Some(values) = snapshot.files_by_knowledge_base {
            self.files_by_knowledge_base.replace(values);
        }
        Ok(())
    }
}

#[async_trait]
impl MetricCollector for DocumentCollector {
    fn name(&self) -> &'static str {
        "documents"
    }

    async fn refresh(&self, store: &mut dyn Store) -> Result<(), CollectError> {
        let snapshot = self.snapshot(store).await?;
        self.publish(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDatabase;

    const NOW: i64 = 1_700_000_000;

    fn fixed_clock() -> i64 {
        NOW
    }

    fn seed_knowledge(db: &FakeDatabase) {
        db.set_rows(
            Query::KnowledgeBases,
            vec![row!("kb-1", "Handbook"), row!("kb-2", "Empty")],
        );
        db.set_rows(
            Query::FileCollections,
            vec![
                row!("kb-1"),
                row!("kb-1"),
                row!("stray-collection"),
                row!(None::<&str>),
            ],
        );
    }

    #[test]
    fn test_attribute_files_by_collection_name() {
        let knowledge = vec![("kb".to_string(), "KB".to_string())];
        let collections = vec![Some("kb".to_string()), Some("other".to_string()), None];
        assert_eq!(
            attribute_files(&knowledge, &collections),
            vec![(vec!["kb".to_string(), "KB".to_string()], 1.0)]
        );
    }

    #[tokio::test]
    async fn test_refresh_publishes_document_metrics() {
        let registry = Registry::new();
        let collector = DocumentCollector::with_clock(&registry, fixed_clock).unwrap();
        let db = FakeDatabase::new();
        db.set_count(Query::TotalDocuments, 2);
        db.set_rows(Query::DocumentsByCollection, vec![row!("docs", 2i64)]);
        db.set_count(Query::TotalFiles, 4);
        db.set_rows(Query::FilesByUser, vec![row!("u1", 4i64)]);
        db.set_count(Query::TotalMemories, 5);
        db.set_rows(
            Query::DocumentTimestamps,
            vec![row!(NOW - 100), row!(NOW - 200_000)],
        );
        seed_knowledge(&db);

        collector.refresh(&mut db.store()).await.unwrap();

        assert_eq!(collector.documents.get(), 2.0);
        assert_eq!(collector.documents_by_collection.get(&["docs"]), Some(2.0));
        assert_eq!(collector.files.get(), 4.0);
        assert_eq!(collector.files_by_user.get(&["u1"]), Some(4.0));
        assert_eq!(collector.memories.get(), 5.0);
        assert_eq!(collector.age.sample_count(), 2);
        assert_eq!(
            collector.files_by_knowledge_base.get(&["kb-1", "Handbook"]),
            Some(2.0)
        );
        assert_eq!(
            collector.files_by_knowledge_base.get(&["kb-2", "Empty"]),
            Some(0.0)
        );
        assert_eq!(collector.files_by_knowledge_base.len(), 2);
    }

    #[tokio::test]
    async fn test_null_collection_merges_with_unknown() {
        let registry = Registry::new();
        let collector = DocumentCollector::with_clock(&registry, fixed_clock).unwrap();
        let db = FakeDatabase::new();
        db.set_rows(
            Query::DocumentsByCollection,
            vec![row!(None::<&str>, 2i64), row!("unknown", 3i64)],
        );

        collector.refresh(&mut db.store()).await.unwrap();

        assert_eq!(collector.documents_by_collection.get(&["unknown"]), Some(5.0));
        assert_eq!(collector.documents_by_collection.len(), 1);
    }

    #[tokio::test]
    async fn test_attribution_failure_keeps_previous_attribution() {
        let registry = Registry::new();
        let collector = DocumentCollector::with_clock(&registry, fixed_clock).unwrap();
        let db = FakeDatabase::new();
        seed_knowledge(&db);
        collector.refresh(&mut db.store()).await.unwrap();

        db.set_count(Query::TotalFiles, 9);
        db.fail(Query::FileCollections);
        collector.refresh(&mut db.store()).await.unwrap();

        assert_eq!(collector.files.get(), 9.0);
        assert_eq!(
            collector.files_by_knowledge_base.get(&["kb-1", "Handbook"]),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_core_query_failure_fails_refresh() {
        let registry = Registry::new();
        let collector = DocumentCollector::new(&registry).unwrap();
        let db = FakeDatabase::new();
        db.fail(Query::TotalMemories);

        let err = collector.refresh(&mut db.store()).await.unwrap_err();
        assert!(matches!(err, CollectError::Query { query: "total_memories", .. }));
    }
}
