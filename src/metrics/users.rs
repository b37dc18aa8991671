// User metrics collector - registered users, roles and activity
//
// Reads the `user` and `auth` tables:
// - Totals, active users in the trailing day, OAuth-linked accounts
// - Users per role
// - Last activity timestamp per user

use async_trait::async_trait;
use prometheus::{Gauge, Registry};

use super::instruments::{register_gauge, LabeledGauge, LabeledValues};
use super::{fetch_count, fetch_grouped, fetch_rows, CollectError, MetricCollector};
use crate::db::{Query, Store};

/// Users count as active when seen within this many seconds
const ACTIVE_WINDOW_SECS: i64 = 86_400;

/// Collector for user accounts
pub struct UserCollector {
    total: Gauge,
    active: Gauge,
    by_role: LabeledGauge,
    auth_active: Gauge,
    oauth: Gauge,
    last_active: LabeledGauge,
}

/// Everything one refresh read, published only once complete
struct UserSnapshot {
    total: f64,
    active: f64,
    by_role: LabeledValues,
    auth_active: f64,
    oauth: f64,
    last_active: LabeledValues,
}

impl UserCollector {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(UserCollector {
            total: register_gauge(registry, "openwebui_users_total", "Total number of registered users")?,
            active: register_gauge(
                registry,
                "openwebui_users_active",
                "Number of users active in the last 24 hours",
            )?,
            by_role: LabeledGauge::register(
                registry,
                "openwebui_users_by_role",
                "Number of users by role",
                &["role"],
            )?,
            auth_active: register_gauge(registry, "openwebui_auth_active", "Number of active auth entries")?,
            oauth: register_gauge(registry, "openwebui_oauth_users", "Number of users using OAuth")?,
            last_active: LabeledGauge::register(
                registry,
                "openwebui_user_last_active_seconds",
                "Timestamp of last user activity",
                &["user_id", "user_name"],
            )?,
        })
    }

    async fn snapshot(&self, store: &mut dyn Store) -> Result<UserSnapshot, CollectError> {
        let total = fetch_count(store, Query::TotalUsers).await?;
        let active = fetch_count(
            store,
            Query::ActiveUsers {
                window_secs: ACTIVE_WINDOW_SECS,
            },
        )
        .await?;
        let by_role = fetch_grouped(store, Query::UsersByRole, "unknown").await?;
        let auth_active = fetch_count(store, Query::ActiveAuth).await?;
        let oauth = fetch_count(store, Query::OauthUsers).await?;

        // Users that never logged in have no timestamp and are left out
        let last_active = fetch_rows(store, Query::UserLastActive, |row| match row.opt_float(2)? {
            Some(seen) => Ok(Some((
                vec![row.text(0)?.to_string(), row.label(1, "")?],
                seen,
            ))),
            None => Ok(None),
        })
        .await?;

        Ok(UserSnapshot {
            total,
            active,
            by_role,
            auth_active,
            oauth,
            last_active: last_active.into_iter().flatten().collect(),
        })
    }

    fn publish(&self, snapshot: UserSnapshot) {
        self.total.set(snapshot.total);
        self.active.set(snapshot.active);
        self.by_role.replace(snapshot.by_role);
        self.auth_active.set(snapshot.auth_active);
        self.oauth.set(snapshot.oauth);
        self.last_active.replace(snapshot.last_active);
    }
}

#[async_trait]
impl MetricCollector for UserCollector {
    fn name(&self) -> &'static str {
        "users"
    }

    async fn refresh(&self, store: &mut dyn Store) -> Result<(), CollectError> {
        let snapshot = self.snapshot(store).await?;
        self.publish(snapshot);
        Ok(())
    }
}
