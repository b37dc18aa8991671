// Metrics module - defines the extensible architecture for metric collection
//
// This module provides the core trait that all domain collectors implement,
// so the collector manager can drive every domain the same way without
// knowing what each one measures.

use async_trait::async_trait;
use chrono::Utc;
use prometheus::Registry;
use thiserror::Error;

use crate::db::{Query, Row, Store, StoreError};

pub mod chats;
pub mod conversation;
pub mod documents;
pub mod instruments;
pub mod models;
pub mod system;
pub mod users;

/// Errors a collector can report from `refresh`
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("query '{query}' failed: {source}")]
    Query {
        query: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("failed to update instrument: {0}")]
    Instrument(#[from] prometheus::Error),
}

impl CollectError {
    fn query(query: &Query, source: StoreError) -> Self {
        CollectError::Query {
            query: query.name(),
            source,
        }
    }
}

/// Source of the current Unix time in seconds, used for age histograms
pub type Clock = fn() -> i64;

pub(crate) fn system_clock() -> i64 {
    Utc::now().timestamp()
}

/// Core trait that all domain collectors must implement.
///
/// A collector owns a fixed set of instruments, registered when it is
/// constructed, and overwrites them from the database on every `refresh`.
///
/// # Contract
/// - **Snapshot first**: every query of a refresh runs before any instrument
///   is touched, so a failed refresh leaves the previous values visible
/// - **Errors are returned, not logged**: the collector manager decides how
///   failures are reported and isolated
#[async_trait]
pub trait MetricCollector: Send + Sync {
    /// Short domain name used in logs and as the savepoint name
    ///
    /// # Example
    /// ```
    /// "users", "chats", "documents", "models", "system"
    /// ```
    fn name(&self) -> &'static str;

    /// Re-reads the domain from `store` and publishes the new values
    ///
    /// # Returns
    /// * `Ok(())` - Every instrument now reflects the current database state
    /// * `Err(CollectError)` - A query failed; instruments keep their
    ///   previous values
    async fn refresh(&self, store: &mut dyn Store) -> Result<(), CollectError>;
}

/// Helper function to create all domain collectors.
///
/// Registers every collector's instruments in `registry` and returns the
/// collectors in their fixed refresh order: users, chats, documents,
/// models, system.
///
/// # Returns
/// * `Ok(Vec<Box<dyn MetricCollector>>)` - One collector per domain
/// * `Err(prometheus::Error)` - An instrument name clashed or was invalid
pub fn create_all_collectors(
    registry: &Registry,
) -> Result<Vec<Box<dyn MetricCollector>>, prometheus::Error> {
    Ok(vec![
        // Registered users, roles, activity
        Box::new(users::UserCollector::new(registry)?),

        // Chats, folders, messages and per-model usage
        Box::new(chats::ChatCollector::new(registry)?),

        // Documents, files, knowledge bases, memories
        Box::new(documents::DocumentCollector::new(registry)?),

        // Models, assistants, tools, functions
        Box::new(models::ModelCollector::new(registry)?),

        // Config, groups, feedback, table statistics
        Box::new(system::SystemCollector::new(registry)?),
    ])
}

/// Runs a single-value query and returns it as a gauge value
pub(crate) async fn fetch_count(store: &mut dyn Store, query: Query) -> Result<f64, CollectError> {
    store
        .fetch_count(&query)
        .await
        .map(|count| count as f64)
        .map_err(|e| CollectError::query(&query, e))
}

/// Runs `query` and decodes every row with `decode`
///
/// Decoding failures are reported against the query that produced the row.
pub(crate) async fn fetch_rows<T, F>(
    store: &mut dyn Store,
    query: Query,
    decode: F,
) -> Result<Vec<T>, CollectError>
where
    F: FnMut(&Row) -> Result<T, StoreError> + Send,
    T: Send,
{
    let rows = store
        .fetch(&query)
        .await
        .map_err(|e| CollectError::query(&query, e))?;

    rows.iter()
        .map(decode)
        .collect::<Result<Vec<T>, StoreError>>()
        .map_err(|e| CollectError::query(&query, e))
}

/// Runs a `label..., count` grouping query into labeled gauge values
///
/// The last column is the value; every column before it is a label, with
/// NULL rendered as `fallback`.
pub(crate) async fn fetch_grouped(
    store: &mut dyn Store,
    query: Query,
    fallback: &'static str,
) -> Result<instruments::LabeledValues, CollectError> {
    fetch_rows(store, query, |row| {
        let value_column = row.len().saturating_sub(1);
        let labels = (0..value_column)
            .map(|column| row.label(column, fallback))
            .collect::<Result<Vec<String>, StoreError>>()?;
        Ok((labels, row.float(value_column)?))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDatabase;

    #[test]
    fn test_collectors_in_fixed_order() {
        let registry = Registry::new();
        let collectors = create_all_collectors(&registry).unwrap();
        let names: Vec<&str> = collectors.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["users", "chats", "documents", "models", "system"]);
    }

    #[test]
    fn test_collectors_cannot_register_twice() {
        let registry = Registry::new();
        create_all_collectors(&registry).unwrap();
        assert!(create_all_collectors(&registry).is_err());
    }

    #[tokio::test]
    async fn test_fetch_grouped_uses_fallback_for_null_labels() {
        let db = FakeDatabase::new();
        db.set_rows(
            Query::FeedbackByType,
            vec![row!("thumbs", None::<&str>, None::<&str>, 3i64)],
        );
        let mut store = db.store();

        let values = fetch_grouped(&mut store, Query::FeedbackByType, "anonymous")
            .await
            .unwrap();
        assert_eq!(
            values,
            vec![(
                vec![
                    "thumbs".to_string(),
                    "anonymous".to_string(),
                    "anonymous".to_string()
                ],
                3.0
            )]
        );
    }

    #[tokio::test]
    async fn test_decode_error_names_query() {
        let db = FakeDatabase::new();
        db.set_rows(Query::UsersByRole, vec![row!("admin", "many")]);
        let mut store = db.store();

        let err = fetch_grouped(&mut store, Query::UsersByRole, "unknown")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CollectError::Query {
                query: "users_by_role",
                ..
            }
        ));
    }
}
