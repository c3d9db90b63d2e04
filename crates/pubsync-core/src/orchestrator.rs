//! Drives one synchronization run.
//!
//! A run walks `Idle → ConfigResolved → Fetching → ProcessingRecords →
//! Reconciling → Reported`. Configuration problems, a held partition lock and
//! fetch failures short-circuit to `Reported` before anything is written.
//! Everything that goes wrong with a single record is contained to that record.

use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::attachment::AttachmentPolicy;
use crate::config::{keys, SourceConnection, SourcesConfig, SyncConfiguration};
use crate::contract::{ObjectStore, PageFetcher, RecordTransformer, RecordValidator, RunLock};
use crate::error::SyncError;
use crate::identity::{IdentityIndex, ObjectDraft, UpsertResult};
use crate::mapping::MappingCatalog;
use crate::models::{Organization, Partition, SourceRecord};
use crate::pager::SourcePager;
use crate::reconcile::ReconciliationSweeper;
use crate::schema::{Operation, SchemaCatalog};
use crate::sync::{RunState, SyncOutcome, SyncRunReport, SyncRunResult};

/// Key under which run constants are merged into every raw record.
pub const RUN_CONSTANTS_KEY: &str = "_run";

/// Everything a run needs, resolved from a [`SyncConfiguration`] before any I/O.
#[derive(Debug, Clone)]
struct RunPlan {
    partition: Partition,
    connection: SourceConnection,
    endpoint: String,
    query: Vec<(String, String)>,
    mapping: String,
    constants: Value,
    organization: Organization,
    portal_url: Option<String>,
    auto_publish: bool,
    attachments: AttachmentPolicy,
}

/// Mutable bookkeeping of a run in progress.
struct RunTracker {
    started: Instant,
    partition: String,
    trail: Vec<RunState>,
    result: SyncRunResult,
    error: Option<String>,
}

impl RunTracker {
    fn new(partition: String) -> Self {
        Self {
            started: Instant::now(),
            partition,
            trail: vec![RunState::Idle],
            result: SyncRunResult::default(),
            error: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        debug!(partition = %self.partition, state = %state, "Run state");
        self.trail.push(state);
    }

    fn fail(&mut self, state: RunState, err: &SyncError) {
        self.enter(state);
        self.error = Some(err.to_string());
    }

    fn finish(mut self) -> SyncRunReport {
        self.enter(RunState::Reported);
        let failed_state = self.trail.iter().any(|s| s.is_failure());
        let nothing_succeeded = self.result.fetched > 0 && self.result.stats.successful() == 0;
        SyncRunReport {
            partition: self.partition,
            success: !failed_state && !nothing_succeeded,
            trail: self.trail,
            elapsed: self.started.elapsed(),
            result: self.result,
            error: self.error,
        }
    }
}

/// Runs synchronizations against injected collaborators.
///
/// # Examples
///
/// ```no_run
/// use pubsync_core::{MemoryRunLock, MemoryStore, PageFetcher, SyncRunOrchestrator};
/// use pubsync_core::config::load_sources_config;
/// use std::sync::Arc;
///
/// # async fn demo(fetcher: Arc<dyn PageFetcher>) -> Result<(), Box<dyn std::error::Error>> {
/// let sources = load_sources_config(None)?;
/// let orchestrator = SyncRunOrchestrator::from_sources_config(
///     &sources,
///     fetcher,
///     Arc::new(MemoryStore::new()),
///     Arc::new(MemoryRunLock::new()),
/// );
/// for source in sources.enabled_sources() {
///     let report = orchestrator.run(&source.to_configuration()).await;
///     println!("{}: {}", report.partition, report.success);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SyncRunOrchestrator {
    connections: BTreeMap<String, SourceConnection>,
    file_endpoints: BTreeMap<String, String>,
    pager: SourcePager,
    transformer: Arc<dyn RecordTransformer>,
    validator: Arc<dyn RecordValidator>,
    index: IdentityIndex,
    sweeper: ReconciliationSweeper,
    store: Arc<dyn ObjectStore>,
    lock: Arc<dyn RunLock>,
}

impl SyncRunOrchestrator {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        transformer: Arc<dyn RecordTransformer>,
        validator: Arc<dyn RecordValidator>,
        store: Arc<dyn ObjectStore>,
        lock: Arc<dyn RunLock>,
    ) -> Self {
        Self {
            connections: BTreeMap::new(),
            file_endpoints: BTreeMap::new(),
            pager: SourcePager::new(fetcher),
            transformer,
            validator,
            index: IdentityIndex::new(store.clone()),
            sweeper: ReconciliationSweeper::new(store.clone()),
            store,
            lock,
        }
    }

    /// Builds an orchestrator whose sources, schemas, mappings and file
    /// endpoints all come from one sources file.
    pub fn from_sources_config(
        config: &SourcesConfig,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn ObjectStore>,
        lock: Arc<dyn RunLock>,
    ) -> Self {
        Self::new(
            fetcher,
            Arc::new(MappingCatalog::new(config.mappings.clone())),
            Arc::new(SchemaCatalog::new(config.schemas.clone())),
            store,
            lock,
        )
        .with_connections(config.connections())
        .with_file_endpoints(config.endpoints.clone())
    }

    pub fn with_connections(mut self, connections: BTreeMap<String, SourceConnection>) -> Self {
        self.connections = connections;
        self
    }

    pub fn with_file_endpoints(mut self, endpoints: BTreeMap<String, String>) -> Self {
        self.file_endpoints = endpoints;
        self
    }

    /// Executes one run and reports what happened. Never panics on record
    /// level failures and never returns an error: failures are part of the report.
    pub async fn run(&self, config: &SyncConfiguration) -> SyncRunReport {
        let label = Partition::new(
            config.get(keys::SOURCE).unwrap_or("<unset>"),
            config.get(keys::SCHEMA).unwrap_or("<unset>"),
        )
        .with_category(config.get(keys::CATEGORY).map(str::to_string))
        .key();
        let mut run = RunTracker::new(label);

        let plan = match self.resolve(config) {
            Ok(plan) => plan,
            Err(e) => {
                error!(partition = %run.partition, error = %e, "Invalid run configuration");
                run.fail(RunState::ConfigInvalid, &e);
                return run.finish();
            }
        };
        run.enter(RunState::ConfigResolved);

        match self.lock.try_acquire(&plan.partition).await {
            Ok(true) => {}
            Ok(false) => {
                let e = SyncError::PartitionLocked(plan.partition.key());
                warn!(partition = %plan.partition, "Partition is locked by another run");
                run.fail(RunState::LockUnavailable, &e);
                return run.finish();
            }
            Err(e) => {
                error!(partition = %plan.partition, error = %e, "Failed to acquire partition lock");
                run.fail(RunState::LockUnavailable, &e);
                return run.finish();
            }
        }

        self.run_locked(&plan, &mut run).await;

        if let Err(e) = self.lock.release(&plan.partition).await {
            warn!(partition = %plan.partition, error = %e, "Failed to release partition lock");
        }

        let report = run.finish();
        let stats = &report.result.stats;
        info!(
            partition = %report.partition,
            success = report.success,
            fetched = report.result.fetched,
            created = stats.created,
            updated = stats.updated,
            unchanged = stats.unchanged,
            skipped = stats.skipped,
            failed = stats.failed,
            deleted = stats.deleted,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Run finished"
        );
        report
    }

    /// Resolves every reference of `config`. Performs no I/O.
    fn resolve(&self, config: &SyncConfiguration) -> Result<RunPlan, SyncError> {
        config.check_required()?;

        let source = config.require(keys::SOURCE)?;
        let schema = config.require(keys::SCHEMA)?;
        let mapping = config.require(keys::MAPPING)?;
        let oin = config.require(keys::OIN)?;
        let category = config.get(keys::CATEGORY).map(str::to_string);

        let connection = self
            .connections
            .get(source)
            .cloned()
            .ok_or_else(|| SyncError::UnresolvedReference {
                kind: "source",
                name: source.to_string(),
            })?;
        url::Url::parse(&connection.base_url)
            .map_err(|e| SyncError::InvalidUrl(format!("{}: {}", connection.base_url, e)))?;
        connection.pagination.check()?;

        if !self.validator.has_schema(schema) {
            return Err(SyncError::UnresolvedReference {
                kind: "schema",
                name: schema.to_string(),
            });
        }
        if !self.transformer.has_mapping(mapping) {
            return Err(SyncError::UnresolvedReference {
                kind: "mapping",
                name: mapping.to_string(),
            });
        }

        let file_endpoint = match config.get(keys::FILE_ENDPOINT_REFERENCE) {
            Some(name) => Some(self.file_endpoints.get(name).cloned().ok_or_else(|| {
                SyncError::UnresolvedReference {
                    kind: "file endpoint",
                    name: name.to_string(),
                }
            })?),
            None => None,
        };

        let portal_url = match config.get(keys::PORTAL_URL) {
            Some(portal) => {
                url::Url::parse(portal)
                    .map_err(|e| SyncError::InvalidUrl(format!("{}: {}", portal, e)))?;
                Some(portal.to_string())
            }
            None => None,
        };

        let organization = Organization {
            id: oin.to_string(),
            name: config.get(keys::ORGANISATIE).map(str::to_string),
        };
        let auto_publish = config.flag(keys::AUTO_PUBLISH);

        let mut constants = Map::new();
        constants.insert(keys::OIN.into(), Value::from(oin));
        if let Some(name) = &organization.name {
            constants.insert(keys::ORGANISATIE.into(), Value::from(name.as_str()));
        }
        if let Some(category) = &category {
            constants.insert(keys::CATEGORY.into(), Value::from(category.as_str()));
        }
        constants.insert(keys::AUTO_PUBLISH.into(), Value::Bool(auto_publish));

        Ok(RunPlan {
            partition: Partition::new(source, schema).with_category(category.clone()),
            endpoint: config.endpoint()?.to_string(),
            query: config.extra_query(),
            mapping: mapping.to_string(),
            constants: Value::Object(constants),
            portal_url,
            auto_publish,
            attachments: AttachmentPolicy {
                file_endpoint,
                pdf_only: config.flag(keys::ALLOW_PDF_ONLY),
                extract_text: config.flag(keys::EXTRACT_TEXT),
            },
            organization,
            connection,
        })
    }

    async fn run_locked(&self, plan: &RunPlan, run: &mut RunTracker) {
        run.enter(RunState::Fetching);
        let records = match self
            .pager
            .fetch_all(&plan.connection, &plan.endpoint, &plan.query)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!(partition = %plan.partition, error = %e, "Fetch failed, nothing was written");
                run.fail(RunState::FetchFailed, &e);
                return;
            }
        };
        run.result.fetched = records.len();

        if !self.hold_lease(plan, run).await {
            return;
        }

        run.enter(RunState::ProcessingRecords);
        let mut seen = HashSet::new();

        for (position, record) in records.iter().enumerate() {
            let label = record
                .external_id
                .clone()
                .unwrap_or_else(|| format!("#{}", position + 1));

            let processed = AssertUnwindSafe(self.process_record(plan, record))
                .catch_unwind()
                .await;

            match processed {
                Ok(Ok((external_id, upserted))) => {
                    debug!(
                        partition = %plan.partition,
                        external_id = %external_id,
                        outcome = ?upserted.outcome,
                        "Record synchronized"
                    );
                    let stats = &mut run.result.stats;
                    stats.record(upserted.outcome);
                    stats.attachments_stored += upserted.attachments_stored;
                    stats.attachments_reused += upserted.attachments_reused;
                    stats.attachments_failed += upserted.attachments_failed;
                    run.result.synced_ids.push(external_id.clone());
                    run.result.objects.push(upserted.object);
                    seen.insert(external_id);
                }
                Ok(Err(SyncError::Validation(violations))) => {
                    let details: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                    warn!(
                        partition = %plan.partition,
                        external_id = %label,
                        violations = ?details,
                        "Record failed validation, skipped"
                    );
                    run.result.stats.record(SyncOutcome::Skipped);
                }
                Ok(Err(e)) => {
                    error!(
                        partition = %plan.partition,
                        external_id = %label,
                        class = ?e.class(),
                        error = %e,
                        "Record failed"
                    );
                    run.result.stats.record(SyncOutcome::Failed);
                }
                Err(panic) => {
                    error!(
                        partition = %plan.partition,
                        external_id = %label,
                        panic = %panic_message(panic.as_ref()),
                        "Record processing panicked"
                    );
                    run.result.stats.record(SyncOutcome::Failed);
                }
            }
        }

        self.flush(plan).await;

        // Sweeping without the lease could race another run's writes.
        if !self.hold_lease(plan, run).await {
            return;
        }

        run.enter(RunState::Reconciling);
        match self.sweeper.sweep(&plan.partition, &seen).await {
            Ok(sweep) => {
                run.result.stats.deleted = sweep.deleted;
                run.result.stats.delete_failed = sweep.failed;
            }
            Err(e) => {
                error!(partition = %plan.partition, error = %e, "Reconciliation failed");
                run.error = Some(format!("reconciliation failed: {}", e));
            }
        }

        self.flush(plan).await;
    }

    /// Renews the partition lease, failing the run with `LockLost` if it lapsed.
    async fn hold_lease(&self, plan: &RunPlan, run: &mut RunTracker) -> bool {
        match self.lock.renew(&plan.partition).await {
            Ok(true) => true,
            Ok(false) => {
                let e = SyncError::PartitionLocked(plan.partition.key());
                warn!(partition = %plan.partition, "Partition lease lapsed, stopping without reconciliation");
                run.fail(RunState::LockLost, &e);
                false
            }
            Err(e) => {
                error!(partition = %plan.partition, error = %e, "Failed to renew partition lease");
                run.fail(RunState::LockLost, &e);
                false
            }
        }
    }

    /// Transforms, validates and upserts one record.
    async fn process_record(
        &self,
        plan: &RunPlan,
        record: &SourceRecord,
    ) -> Result<(String, UpsertResult), SyncError> {
        let external_id = record.external_id.clone().ok_or_else(|| {
            SyncError::Unexpected(format!(
                "record has no identifier at `{}`",
                plan.connection.pagination.id_path
            ))
        })?;

        let raw = merge_constants(&record.body, &plan.constants);
        let mut fields = self.transformer.transform(&raw, &plan.mapping)?;

        let key = plan.partition.sync_key(external_id.as_str());
        let operation = match self.index.lookup(&key).await? {
            Some(_) => Operation::Update,
            None => Operation::Create,
        };

        let violations = self
            .validator
            .validate(&fields, &plan.partition.schema, operation);
        if !violations.is_empty() {
            return Err(SyncError::Validation(violations));
        }

        let attachments = plan.attachments.extract(&mut fields);
        let draft = ObjectDraft {
            schema: plan.partition.schema.clone(),
            organization: plan.organization.clone(),
            category: plan.partition.category.clone(),
            fields,
            attachments,
            portal_url: plan.portal_url.clone(),
            auto_publish: plan.auto_publish,
            extract_text: plan.attachments.extract_text,
        };

        let upserted = self.index.upsert(&key, draft).await?;
        Ok((external_id, upserted))
    }

    async fn flush(&self, plan: &RunPlan) {
        if let Err(e) = self.store.flush().await {
            warn!(partition = %plan.partition, error = %e, "Store flush failed");
        }
    }
}

/// Returns a copy of `body` with the run constants under [`RUN_CONSTANTS_KEY`].
///
/// Non-object bodies are wrapped as `{"value": body}`.
fn merge_constants(body: &Value, constants: &Value) -> Value {
    let mut merged = match body {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other.clone());
            map
        }
    };
    merged.insert(RUN_CONSTANTS_KEY.into(), constants.clone());
    Value::Object(merged)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::MockPageFetcher;
    use crate::lock::MemoryRunLock;
    use crate::mapping::FieldMapping;
    use crate::pager::{MoreSignal, PaginationDescriptor, PaginationStyle};
    use crate::schema::SchemaDefinition;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn orchestrator(fetcher: MockPageFetcher) -> (SyncRunOrchestrator, Arc<MemoryStore>) {
        orchestrator_with(
            fetcher,
            PaginationDescriptor {
                records_path: Some("results".into()),
                ..Default::default()
            },
        )
    }

    fn orchestrator_with(
        fetcher: MockPageFetcher,
        pagination: PaginationDescriptor,
    ) -> (SyncRunOrchestrator, Arc<MemoryStore>) {
        let mapping: FieldMapping = toml::from_str(
            r#"
            [fields]
            title = "name"
            oin = "_run.oin"
            "#,
        )
        .unwrap();
        let schema: SchemaDefinition = toml::from_str(r#"required = ["title"]"#).unwrap();

        let mut connection = SourceConnection::new("src", "https://source.example.org/");
        connection.pagination = pagination;

        let store = Arc::new(MemoryStore::new());
        let orchestrator = SyncRunOrchestrator::new(
            Arc::new(fetcher),
            Arc::new(MappingCatalog::new(BTreeMap::from([("m".to_string(), mapping)]))),
            Arc::new(SchemaCatalog::new(BTreeMap::from([(
                "publication".to_string(),
                schema,
            )]))),
            store.clone(),
            Arc::new(MemoryRunLock::new()),
        )
        .with_connections(BTreeMap::from([("src".to_string(), connection)]));
        (orchestrator, store)
    }

    fn config() -> SyncConfiguration {
        SyncConfiguration::from_pairs([
            ("source", "src"),
            ("schema", "publication"),
            ("mapping", "m"),
            ("sourceEndpoint", "items"),
            ("oin", "0001"),
        ])
    }

    #[test]
    fn test_merge_constants() {
        let merged = merge_constants(&json!({"id": 1}), &json!({"oin": "x"}));
        assert_eq!(merged, json!({"id": 1, "_run": {"oin": "x"}}));

        let wrapped = merge_constants(&json!("raw"), &json!({}));
        assert_eq!(wrapped, json!({"value": "raw", "_run": {}}));
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn test_happy_path_trail_and_constants() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(1)
            .returning(|_, _, _| Ok(json!({"results": [{"id": "a", "name": "A"}], "next": null})));
        let (orchestrator, store) = orchestrator(fetcher);

        let report = orchestrator.run(&config()).await;

        assert!(report.success);
        assert_eq!(
            report.trail,
            vec![
                RunState::Idle,
                RunState::ConfigResolved,
                RunState::Fetching,
                RunState::ProcessingRecords,
                RunState::Reconciling,
                RunState::Reported,
            ]
        );
        assert_eq!(report.result.synced_ids, vec!["a"]);
        assert_eq!(report.result.objects[0].fields["oin"], "0001");
        assert_eq!(store.counters().flushes, 2);
    }

    #[tokio::test]
    async fn test_missing_setting_is_config_invalid_without_fetch() {
        let mut fetcher = MockPageFetcher::new();
        fetcher.expect_fetch_page().never();
        let (orchestrator, _store) = orchestrator(fetcher);

        let mut settings: BTreeMap<String, String> = config()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        settings.remove("oin");
        let report = orchestrator.run(&SyncConfiguration::new(settings)).await;

        assert!(!report.success);
        assert_eq!(report.failure_state(), Some(RunState::ConfigInvalid));
        assert!(report.error.unwrap().contains("oin"));
    }

    #[tokio::test]
    async fn test_unknown_references_are_config_invalid() {
        for (key, value) in [
            ("source", "nope"),
            ("schema", "nope"),
            ("mapping", "nope"),
            ("fileEndpointReference", "nope"),
            ("portalUrl", "not a url"),
        ] {
            let mut fetcher = MockPageFetcher::new();
            fetcher.expect_fetch_page().never();
            let (orchestrator, _store) = orchestrator(fetcher);

            let mut settings: BTreeMap<String, String> = config()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            settings.insert(key.to_string(), value.to_string());
            let report = orchestrator.run(&SyncConfiguration::new(settings)).await;

            assert_eq!(
                report.failure_state(),
                Some(RunState::ConfigInvalid),
                "{} = {}",
                key,
                value
            );
        }
    }

    #[tokio::test]
    async fn test_undrivable_pagination_is_config_invalid() {
        let mut fetcher = MockPageFetcher::new();
        fetcher.expect_fetch_page().never();
        let (orchestrator, _store) = orchestrator_with(
            fetcher,
            PaginationDescriptor {
                style: PaginationStyle::Cursor,
                more: MoreSignal::Flag {
                    path: "hasMore".into(),
                },
                ..Default::default()
            },
        );

        let report = orchestrator.run(&config()).await;
        assert_eq!(report.failure_state(), Some(RunState::ConfigInvalid));
        assert!(report.error.unwrap().contains("cursor_path"));
    }

    #[tokio::test]
    async fn test_record_without_identifier_fails_alone() {
        let mut fetcher = MockPageFetcher::new();
        fetcher.expect_fetch_page().times(1).returning(|_, _, _| {
            Ok(json!({"results": [{"name": "anonymous"}, {"id": "b", "name": "B"}]}))
        });
        let (orchestrator, _store) = orchestrator(fetcher);

        let report = orchestrator.run(&config()).await;
        assert!(report.success);
        assert_eq!(report.result.stats.failed, 1);
        assert_eq!(report.result.stats.created, 1);
    }

    #[tokio::test]
    async fn test_all_records_failing_marks_run_failed() {
        let mut fetcher = MockPageFetcher::new();
        fetcher
            .expect_fetch_page()
            .times(1)
            .returning(|_, _, _| Ok(json!({"results": [{"id": "a"}, {"id": "b"}]})));
        let (orchestrator, _store) = orchestrator(fetcher);

        let report = orchestrator.run(&config()).await;
        assert!(!report.success);
        assert_eq!(report.failure_state(), None);
        assert_eq!(report.result.stats.skipped, 2);
    }
}
