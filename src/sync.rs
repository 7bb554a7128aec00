//! Reconciliation of stored proxy configs into Caddy
//!
//! The database is the source of truth. A reconcile reads every enabled
//! record, computes the managed route list, and writes it to Caddy in a
//! single request so Caddy never sees a half-applied set. Routes that the
//! console does not own are kept in place.

use crate::caddy::{build_route, is_managed_route, CaddyClient, CaddyError};
use crate::db::{now_timestamp, Database, ProxyConfigRecord};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Caddy(#[from] CaddyError),

    #[error("database error: {0}")]
    Database(anyhow::Error),

    #[error("sync with Caddy is disabled")]
    Disabled,
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Database(err)
    }
}

/// Outcome of one reconcile
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Whether Caddy's config was written (false when already up to date)
    pub applied: bool,
    /// Routes owned by the console after the reconcile
    pub managed_routes: usize,
    /// Routes configured outside the console, left untouched
    pub foreign_routes: usize,
    /// Enabled records whose target could not be turned into a route
    pub skipped: Vec<String>,
    /// Server block had to be created with a full config load
    pub created_server: bool,
}

/// Path prefix length used for ordering; root routes sort last
fn path_specificity(config: &ProxyConfigRecord) -> usize {
    config
        .path
        .as_deref()
        .map(|p| p.trim_end_matches('*').trim_end_matches('/').len())
        .unwrap_or(0)
}

/// Routes for the enabled records, most specific path first so a
/// `/api` route on a host wins over that host's root route.
///
/// Returns the routes and the ids of enabled records that could not be mapped.
pub fn desired_routes(configs: &[ProxyConfigRecord]) -> (Vec<Value>, Vec<String>) {
    let mut enabled: Vec<&ProxyConfigRecord> = configs.iter().filter(|c| c.enabled).collect();
    enabled.sort_by(|a, b| {
        path_specificity(b)
            .cmp(&path_specificity(a))
            .then_with(|| a.domain.cmp(&b.domain))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut routes = Vec::with_capacity(enabled.len());
    let mut skipped = Vec::new();
    for config in enabled {
        match build_route(config) {
            Some(route) => routes.push(route),
            None => skipped.push(config.id.clone()),
        }
    }

    (routes, skipped)
}

/// Replace every managed route in `live` with `desired`, keeping foreign
/// routes in their original order ahead of the managed ones.
pub fn merge_routes(live: &[Value], desired: Vec<Value>) -> Vec<Value> {
    let mut merged: Vec<Value> = live.iter().filter(|r| !is_managed_route(r)).cloned().collect();
    merged.extend(desired);
    merged
}

/// Return `config` with `apps.http.servers.<server>` present, creating
/// intermediate objects as needed. Existing values are preserved.
pub fn ensure_server(config: &Value, server: &str, listen: &[String]) -> Value {
    let mut root = match config {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let apps = object_entry(&mut root, "apps");
    let http = object_entry(apps, "http");
    let servers = object_entry(http, "servers");
    let srv = object_entry(servers, server);
    srv.entry("listen").or_insert_with(|| json!(listen));
    srv.entry("routes").or_insert_with(|| json!([]));

    Value::Object(root)
}

fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> &'a mut Map<String, Value> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    match entry {
        Value::Object(inner) => inner,
        _ => unreachable!("entry was just made an object"),
    }
}

fn server_routes<'a>(config: &'a Value, server: &str) -> Option<&'a Value> {
    config
        .get("apps")?
        .get("http")?
        .get("servers")?
        .get(server)
}

pub struct Reconciler {
    db: Arc<Database>,
    caddy: CaddyClient,
    listen: Vec<String>,
    enabled: bool,
    lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(db: Arc<Database>, caddy: CaddyClient, listen: Vec<String>, enabled: bool) -> Self {
        Self {
            db,
            caddy,
            listen,
            enabled,
            lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn caddy(&self) -> &CaddyClient {
        &self.caddy
    }

    /// Make Caddy's managed routes match the enabled records
    pub async fn reconcile(&self) -> Result<ReconcileReport, SyncError> {
        if !self.enabled {
            return Err(SyncError::Disabled);
        }

        let _guard = self.lock.lock().await;

        let configs = self.db.list_proxy_configs()?;
        let (desired, skipped) = desired_routes(&configs);
        for id in &skipped {
            warn!(config_id = %id, "Skipping config with unusable target");
        }
        let managed_routes = desired.len();

        let live_config = self.caddy.get_caddy_config().await?;
        let server = self.caddy.server_name().to_string();

        let (applied, foreign_routes, created_server) = match server_routes(&live_config, &server) {
            Some(server_block) => {
                let live_routes = server_block
                    .get("routes")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let merged = merge_routes(&live_routes, desired);
                let foreign = merged.len() - managed_routes;

                if merged == live_routes {
                    debug!("Caddy routes already up to date");
                    (false, foreign, false)
                } else {
                    if server_block.get("routes").is_some() {
                        self.caddy
                            .update_caddy_config(&self.caddy.routes_path(), &Value::Array(merged))
                            .await?;
                    } else {
                        // PATCH needs an existing value; swap the whole server block
                        let mut block = server_block.clone();
                        block["routes"] = Value::Array(merged);
                        self.caddy
                            .update_caddy_config(&format!("apps/http/servers/{}", server), &block)
                            .await?;
                    }
                    (true, foreign, false)
                }
            }
            None => {
                info!(server = %server, "Caddy server block missing, loading full config");
                let mut full = ensure_server(&live_config, &server, &self.listen);
                full["apps"]["http"]["servers"][&server]["routes"] = Value::Array(desired);
                self.caddy.replace_caddy_config(&full).await?;
                (true, 0, true)
            }
        };

        let marked = self.db.mark_synced(&configs, &now_timestamp())?;
        for id in &skipped {
            self.db.mark_sync_failed(id, "target URL has no usable dial address")?;
        }
        debug!(marked, skipped = skipped.len(), "Updated config sync status");

        let report = ReconcileReport {
            applied,
            managed_routes,
            foreign_routes,
            skipped,
            created_server,
        };

        if applied {
            info!(
                managed = report.managed_routes,
                foreign = report.foreign_routes,
                "Caddy routes reconciled"
            );
        }

        Ok(report)
    }

    /// Reconcile after a change to one record. A failure is recorded on that
    /// record (if it still exists) and returned to the caller.
    pub async fn sync_after_change(&self, config_id: &str) -> Result<Option<ReconcileReport>, SyncError> {
        if !self.enabled {
            return Ok(None);
        }

        match self.reconcile().await {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                warn!(config_id, error = %e, "Caddy sync failed after change");
                if let Err(db_err) = self.db.mark_sync_failed(config_id, &e.to_string()) {
                    error!(config_id, error = %db_err, "Failed to record sync failure");
                }
                Err(e)
            }
        }
    }
}

/// Periodically reconcile until shutdown; converges after failed pushes
/// and after routes of deleted records were left behind.
pub async fn reconcile_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if !reconciler.is_enabled() {
        return;
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = reconciler.reconcile().await {
                    warn!(error = %e, "Background reconcile failed");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caddy::route_id;
    use crate::db::{ProxyConfigUpdate, SyncStatus, UserRecord};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(id: &str, domain: &str, path: Option<&str>, enabled: bool) -> ProxyConfigRecord {
        ProxyConfigRecord::with_id(
            id.to_string(),
            ProxyConfigUpdate {
                name: id.to_string(),
                domain: domain.to_string(),
                target_url: "http://localhost:3000".to_string(),
                path: path.map(str::to_string),
                enabled,
            },
            "owner",
        )
    }

    fn ids(routes: &[Value]) -> Vec<&str> {
        routes.iter().filter_map(|r| r["@id"].as_str()).collect()
    }

    fn setup_db(configs: &[ProxyConfigRecord]) -> Arc<Database> {
        let db = Database::open_in_memory().unwrap();
        let mut owner = UserRecord::new(None, "owner@example.com", "hash".to_string(), true);
        owner.id = "owner".to_string();
        db.create_user(&owner).unwrap();
        for c in configs {
            db.create_proxy_config(c).unwrap();
        }
        Arc::new(db)
    }

    fn reconciler(db: Arc<Database>, server: &MockServer) -> Reconciler {
        let caddy = CaddyClient::new(&server.uri(), "srv0", Duration::from_secs(2)).unwrap();
        Reconciler::new(db, caddy, vec![":80".to_string()], true)
    }

    #[test]
    fn test_desired_routes_only_enabled_and_ordered() {
        let configs = vec![
            config("root", "a.com", None, true),
            config("api", "a.com", Some("/api"), true),
            config("off", "b.com", None, false),
            config("deep", "a.com", Some("/api/v2"), true),
        ];

        let (routes, skipped) = desired_routes(&configs);
        assert!(skipped.is_empty());
        assert_eq!(ids(&routes), vec!["caddy-ui-deep", "caddy-ui-api", "caddy-ui-root"]);
    }

    #[test]
    fn test_desired_routes_skips_bad_targets() {
        let mut bad = config("bad", "a.com", None, true);
        bad.target_url = "nonsense".to_string();

        let (routes, skipped) = desired_routes(&[bad, config("ok", "b.com", None, true)]);
        assert_eq!(routes.len(), 1);
        assert_eq!(ids(&routes), vec!["caddy-ui-ok"]);
        assert_eq!(skipped, vec!["bad".to_string()]);
    }

    #[test]
    fn test_merge_replaces_managed_and_keeps_foreign() {
        let live = vec![
            json!({ "@id": "caddy-ui-stale" }),
            json!({ "match": [{ "host": ["manual.com"] }] }),
            json!({ "@id": "caddy-ui-keep" }),
            json!({ "@id": "someone-else" }),
        ];
        let desired = vec![json!({ "@id": "caddy-ui-keep", "v": 2 }), json!({ "@id": "caddy-ui-new" })];

        let merged = merge_routes(&live, desired);
        assert_eq!(merged.len(), 4);
        assert_eq!(merged[0], json!({ "match": [{ "host": ["manual.com"] }] }));
        assert_eq!(merged[1], json!({ "@id": "someone-else" }));
        assert_eq!(ids(&merged[2..]), vec!["caddy-ui-keep", "caddy-ui-new"]);
        assert_eq!(merged[2]["v"], 2);
    }

    #[test]
    fn test_merge_exactly_one_route_per_record() {
        let live = vec![json!({ "@id": "caddy-ui-a" }), json!({ "@id": "caddy-ui-a" })];
        let (desired, _) = desired_routes(&[config("a", "a.com", None, true)]);

        let merged = merge_routes(&live, desired);
        assert_eq!(ids(&merged), vec!["caddy-ui-a"]);
    }

    #[test]
    fn test_ensure_server_creates_path() {
        let config = ensure_server(&Value::Null, "srv0", &[":443".to_string()]);
        assert_eq!(config["apps"]["http"]["servers"]["srv0"]["listen"], json!([":443"]));
        assert_eq!(config["apps"]["http"]["servers"]["srv0"]["routes"], json!([]));
    }

    #[test]
    fn test_ensure_server_preserves_existing() {
        let existing = json!({
            "admin": { "listen": "localhost:2019" },
            "apps": { "http": { "servers": { "other": { "listen": [":8080"] } } }, "tls": {} }
        });
        let config = ensure_server(&existing, "srv0", &[":80".to_string()]);

        assert_eq!(config["admin"]["listen"], "localhost:2019");
        assert_eq!(config["apps"]["tls"], json!({}));
        assert_eq!(config["apps"]["http"]["servers"]["other"]["listen"], json!([":8080"]));
        assert_eq!(config["apps"]["http"]["servers"]["srv0"]["listen"], json!([":80"]));
    }

    #[tokio::test]
    async fn test_reconcile_patches_routes() {
        let server = MockServer::start().await;
        let a = config("a", "a.com", None, true);
        let db = setup_db(&[a.clone(), config("b", "b.com", None, false)]);

        let foreign = json!({ "match": [{ "host": ["manual.com"] }] });
        Mock::given(method("GET"))
            .and(path("/config/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apps": { "http": { "servers": { "srv0": {
                    "listen": [":443"],
                    "routes": [foreign.clone(), { "@id": route_id("b") }]
                } } } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/config/apps/http/servers/srv0/routes"))
            .and(body_json(json!([foreign, build_route(&a).unwrap()])))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let report = reconciler(Arc::clone(&db), &server).reconcile().await.unwrap();
        assert!(report.applied);
        assert_eq!(report.managed_routes, 1);
        assert_eq!(report.foreign_routes, 1);
        assert!(!report.created_server);

        let stored = db.get_proxy_config("a").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(stored.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_reconcile_noop_when_up_to_date() {
        let server = MockServer::start().await;
        let a = config("a", "a.com", None, true);
        let db = setup_db(&[a.clone()]);

        Mock::given(method("GET"))
            .and(path("/config/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apps": { "http": { "servers": { "srv0": { "routes": [build_route(&a).unwrap()] } } } }
            })))
            .mount(&server)
            .await;

        let report = reconciler(db, &server).reconcile().await.unwrap();
        assert!(!report.applied);
        assert_eq!(report.managed_routes, 1);
    }

    #[tokio::test]
    async fn test_reconcile_loads_config_when_server_missing() {
        let server = MockServer::start().await;
        let a = config("a", "a.com", Some("/app"), true);
        let db = setup_db(&[a.clone()]);

        Mock::given(method("GET"))
            .and(path("/config/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/load"))
            .and(body_json(json!({
                "apps": { "http": { "servers": { "srv0": {
                    "listen": [":80"],
                    "routes": [build_route(&a).unwrap()]
                } } } }
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let report = reconciler(db, &server).reconcile().await.unwrap();
        assert!(report.created_server);
        assert!(report.applied);
    }

    #[tokio::test]
    async fn test_sync_after_change_marks_failure() {
        let server = MockServer::start().await;
        let a = config("a", "a.com", None, true);
        let db = setup_db(&[a]);

        Mock::given(method("GET"))
            .and(path("/config/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = reconciler(Arc::clone(&db), &server).sync_after_change("a").await.unwrap_err();
        assert!(matches!(err, SyncError::Caddy(CaddyError::Status { .. })));

        let stored = db.get_proxy_config("a").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert!(stored.sync_error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_disabled_reconciler_makes_no_calls() {
        let server = MockServer::start().await;
        let db = setup_db(&[config("a", "a.com", None, true)]);
        let caddy = CaddyClient::new(&server.uri(), "srv0", Duration::from_secs(2)).unwrap();
        let reconciler = Reconciler::new(Arc::clone(&db), caddy, vec![], false);

        assert!(matches!(reconciler.reconcile().await, Err(SyncError::Disabled)));
        assert!(reconciler.sync_after_change("a").await.unwrap().is_none());
        assert!(server.received_requests().await.unwrap().is_empty());
        assert_eq!(db.get_proxy_config("a").unwrap().unwrap().sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_reconcile_loop_retries_failed_config() {
        let server = MockServer::start().await;
        let a = config("a", "a.com", None, true);
        let db = setup_db(&[a.clone()]);
        db.mark_sync_failed("a", "connection refused").unwrap();

        // First tick still fails, a later one succeeds
        Mock::given(method("GET"))
            .and(path("/config/"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/config/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apps": { "http": { "servers": { "srv0": { "routes": [] } } } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/config/apps/http/servers/srv0/routes"))
            .and(body_json(json!([build_route(&a).unwrap()])))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let reconciler = Arc::new(reconciler(Arc::clone(&db), &server));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reconcile_loop(reconciler, Duration::from_millis(50), rx));

        let mut status = SyncStatus::Failed;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = db.get_proxy_config("a").unwrap().unwrap().sync_status;
            if status == SyncStatus::Synced {
                break;
            }
        }
        assert_eq!(status, SyncStatus::Synced);
        assert!(db.get_proxy_config("a").unwrap().unwrap().sync_error.is_none());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_loop_stops_on_shutdown() {
        let server = MockServer::start().await;
        let db = setup_db(&[]);
        let reconciler = Arc::new(reconciler(db, &server));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(reconcile_loop(reconciler, Duration::from_secs(3600), rx));
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
