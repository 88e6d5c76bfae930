//! In-memory collaborators for tests.
//!
//! [`InMemoryClaimsStore`] is a complete, transactional [`ClaimsStore`]: transaction writes are
//! staged and only applied on commit, locks are plain try-acquire records, and every
//! notification, page request and transaction outcome is recorded for assertions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::schema::ClaimsSchema;
use crate::store::{
    ClaimsStore, ClaimsTransaction, IdentityPageRequest, IdentityRef, SchemaFilter, StoreError,
    VersionedClaim, VersionedClaimQuery,
};

/// One recorded `get_identity_page` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequestRecord {
    /// Requested offset
    pub offset: u64,
    /// Requested limit
    pub limit: u64,
    /// Number of identities returned
    pub returned: usize,
}

#[derive(Default)]
struct StoreState {
    schemata: Vec<ClaimsSchema>,
    identities: BTreeMap<String, Value>,
    versioned: HashMap<(String, String, String), String>,
    locks: HashMap<String, String>,
    schema_changed: u64,
    claims_changed: Vec<String>,
    page_requests: Vec<PageRequestRecord>,
    put_calls: u64,
    commits: u64,
    rollbacks: u64,
    events: Vec<String>,
    fail_commit: bool,
    fail_claims_for: Option<String>,
}

impl StoreState {
    fn apply(&mut self, write: StagedWrite) {
        match write {
            StagedWrite::CreateSchema(schema) => self.schemata.push(schema),
            StagedWrite::SetActive { key, version } => {
                for schema in self.schemata.iter_mut().filter(|s| s.key == key) {
                    schema.active = schema.version == version;
                }
            }
            StagedWrite::DeleteSchemata(key) => self.schemata.retain(|s| s.key != key),
            StagedWrite::PutClaims {
                identity_id,
                claims,
            } => {
                for claim in claims {
                    self.versioned.insert(
                        (identity_id.clone(), claim.key, claim.schema_version),
                        claim.value,
                    );
                }
            }
        }
    }
}

/// Transactional in-memory [`ClaimsStore`]. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryClaimsStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryClaimsStore {
    /// Creates an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an identity with the given claim bag (a JSON object).
    pub fn add_identity(&self, id: &str, claims: Value) {
        self.state().identities.insert(id.to_string(), claims);
    }

    /// Adds `count` identities `identity-000`, `identity-001`, ... with claims `{"sub": id}`.
    /// Returns their ids in page order.
    pub fn seed_identities(&self, count: usize) -> Vec<String> {
        let ids: Vec<String> = (0..count).map(|i| format!("identity-{i:03}")).collect();
        for id in &ids {
            self.add_identity(id, serde_json::json!({ "sub": id }));
        }
        ids
    }

    /// Stores a versioned claim directly, outside any transaction.
    pub fn insert_versioned_claim(&self, identity_id: &str, key: &str, version: &str, value: &Value) {
        self.state().versioned.insert(
            (identity_id.to_string(), key.to_string(), version.to_string()),
            value.to_string(),
        );
    }

    /// The committed value of `key` at `version` for an identity.
    #[must_use]
    pub fn versioned_claim(&self, identity_id: &str, key: &str, version: &str) -> Option<Value> {
        self.state()
            .versioned
            .get(&(identity_id.to_string(), key.to_string(), version.to_string()))
            .and_then(|value| serde_json::from_str(value).ok())
    }

    /// Number of committed versioned claims of `key`, across identities and versions.
    #[must_use]
    pub fn versioned_claim_count(&self, key: &str) -> usize {
        self.state()
            .versioned
            .keys()
            .filter(|(_, claim_key, _)| claim_key == key)
            .count()
    }

    /// Every committed schema row of `key`.
    #[must_use]
    pub fn schemata_of(&self, key: &str) -> Vec<ClaimsSchema> {
        self.state()
            .schemata
            .iter()
            .filter(|s| s.key == key)
            .cloned()
            .collect()
    }

    /// The committed active schema of `key`.
    #[must_use]
    pub fn active_schema(&self, key: &str) -> Option<ClaimsSchema> {
        self.state()
            .schemata
            .iter()
            .find(|s| s.key == key && s.active)
            .cloned()
    }

    /// Current holder of the lock on `key`.
    #[must_use]
    pub fn lock_holder(&self, key: &str) -> Option<String> {
        self.state().locks.get(key).cloned()
    }

    /// Number of `on_schema_changed` notifications.
    #[must_use]
    pub fn schema_changed_count(&self) -> u64 {
        self.state().schema_changed
    }

    /// Identity ids passed to `on_claims_changed`, in call order.
    #[must_use]
    pub fn claims_changed(&self) -> Vec<String> {
        self.state().claims_changed.clone()
    }

    /// Every `get_identity_page` call, in call order.
    #[must_use]
    pub fn page_requests(&self) -> Vec<PageRequestRecord> {
        self.state().page_requests.clone()
    }

    /// Number of `put_versioned_claims` calls, committed or not.
    #[must_use]
    pub fn put_calls(&self) -> u64 {
        self.state().put_calls
    }

    /// Number of committed transactions.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.state().commits
    }

    /// Number of rolled back transactions.
    #[must_use]
    pub fn rollbacks(&self) -> u64 {
        self.state().rollbacks
    }

    /// Lock and transaction events, e.g. `lock:email:<holder>`, `begin`, `commit`,
    /// `unlock:email:<holder>`.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    /// Clears every recorded notification, page request and event.
    pub fn reset_records(&self) {
        let mut state = self.state();
        state.schema_changed = 0;
        state.claims_changed.clear();
        state.page_requests.clear();
        state.put_calls = 0;
        state.commits = 0;
        state.rollbacks = 0;
        state.events.clear();
    }

    /// Makes every commit fail with `StoreError::TransactionFailed`.
    pub fn fail_commits(&self, fail: bool) {
        self.state().fail_commit = fail;
    }

    /// Makes `get_identity_claims` fail for one identity.
    pub fn fail_claims_for(&self, identity_id: Option<&str>) {
        self.state().fail_claims_for = identity_id.map(ToString::to_string);
    }
}

/// Whether every member of `filter` (a JSON object) equals the same member of `claims`.
fn matches_filter(filter: &Value, claims: &Value) -> bool {
    filter.as_object().is_none_or(|members| {
        members
            .iter()
            .all(|(key, expected)| claims.get(key) == Some(expected))
    })
}

#[async_trait::async_trait]
impl ClaimsStore for InMemoryClaimsStore {
    fn begin_transaction(&self) -> Result<Arc<dyn ClaimsTransaction>, StoreError> {
        self.state().events.push("begin".to_string());
        Ok(Arc::new(InMemoryTransaction {
            store: self.clone(),
            staged: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn acquire_lock(&self, key: String, holder: String) -> Result<bool, StoreError> {
        let mut state = self.state();
        if state.locks.contains_key(&key) {
            return Ok(false);
        }
        state.events.push(format!("lock:{key}:{holder}"));
        state.locks.insert(key, holder);
        Ok(true)
    }

    async fn release_lock(&self, key: String, holder: Option<String>) -> Result<(), StoreError> {
        let mut state = self.state();
        let held_by = state.locks.get(&key).cloned();
        match (held_by, holder) {
            (Some(current), Some(holder)) if current != holder => Ok(()),
            (Some(current), _) => {
                state.locks.remove(&key);
                state.events.push(format!("unlock:{key}:{current}"));
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    async fn get_schema(&self, filter: SchemaFilter) -> Result<Option<ClaimsSchema>, StoreError> {
        Ok(self
            .state()
            .schemata
            .iter()
            .find(|schema| filter.matches(schema))
            .cloned())
    }

    async fn get_schemata(&self, filter: SchemaFilter) -> Result<Vec<ClaimsSchema>, StoreError> {
        Ok(self
            .state()
            .schemata
            .iter()
            .filter(|schema| filter.matches(schema))
            .cloned()
            .collect())
    }

    async fn on_schema_changed(&self) -> Result<(), StoreError> {
        self.state().schema_changed += 1;
        Ok(())
    }

    async fn get_identity_page(
        &self,
        request: IdentityPageRequest,
    ) -> Result<Vec<IdentityRef>, StoreError> {
        let filter = request
            .filter
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()
            .map_err(|e| StoreError::Backend(format!("invalid identity filter: {e}")))?;

        let mut state = self.state();
        let offset = usize::try_from(request.offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(request.limit).unwrap_or(usize::MAX);
        let page: Vec<IdentityRef> = state
            .identities
            .iter()
            .filter(|(_, claims)| filter.as_ref().is_none_or(|f| matches_filter(f, claims)))
            .skip(offset)
            .take(limit)
            .map(|(id, _)| IdentityRef { id: id.clone() })
            .collect();

        state.page_requests.push(PageRequestRecord {
            offset: request.offset,
            limit: request.limit,
            returned: page.len(),
        });
        Ok(page)
    }

    async fn get_identity_claims(&self, identity_id: String) -> Result<String, StoreError> {
        let state = self.state();
        if state.fail_claims_for.as_deref() == Some(identity_id.as_str()) {
            return Err(StoreError::Backend(format!(
                "claims of {identity_id} are unreadable"
            )));
        }
        state
            .identities
            .get(&identity_id)
            .map(Value::to_string)
            .ok_or(StoreError::NotFound(identity_id))
    }

    async fn get_versioned_claims(
        &self,
        identity_id: String,
        queries: Vec<VersionedClaimQuery>,
    ) -> Result<Vec<VersionedClaim>, StoreError> {
        let state = self.state();
        Ok(queries
            .into_iter()
            .filter_map(|query| {
                state
                    .versioned
                    .get(&(
                        identity_id.clone(),
                        query.key.clone(),
                        query.schema_version.clone(),
                    ))
                    .map(|value| VersionedClaim {
                        key: query.key,
                        value: value.clone(),
                        schema_version: query.schema_version,
                    })
            })
            .collect())
    }

    async fn on_claims_changed(&self, identity_id: String) -> Result<(), StoreError> {
        self.state().claims_changed.push(identity_id);
        Ok(())
    }
}

enum StagedWrite {
    CreateSchema(ClaimsSchema),
    SetActive { key: String, version: String },
    DeleteSchemata(String),
    PutClaims {
        identity_id: String,
        claims: Vec<VersionedClaim>,
    },
}

/// Transaction of an [`InMemoryClaimsStore`]. Writes are staged until commit.
pub struct InMemoryTransaction {
    store: InMemoryClaimsStore,
    staged: Mutex<Vec<StagedWrite>>,
    closed: AtomicBool,
}

impl InMemoryTransaction {
    fn staged(&self) -> MutexGuard<'_, Vec<StagedWrite>> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::TransactionFailed(
                "transaction already closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Schema rows as this transaction sees them: committed rows plus staged schema writes.
    fn visible_schemata(&self) -> Vec<ClaimsSchema> {
        let mut schemata = self.store.state().schemata.clone();
        for write in self.staged().iter() {
            match write {
                StagedWrite::CreateSchema(schema) => schemata.push(schema.clone()),
                StagedWrite::DeleteSchemata(key) => schemata.retain(|s| s.key != *key),
                StagedWrite::SetActive { .. } | StagedWrite::PutClaims { .. } => {}
            }
        }
        schemata
    }
}

#[async_trait::async_trait]
impl ClaimsTransaction for InMemoryTransaction {
    async fn create_schema(&self, schema: ClaimsSchema) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self
            .visible_schemata()
            .iter()
            .any(|s| s.key == schema.key && s.version == schema.version)
        {
            return Err(StoreError::Conflict(format!(
                "schema {}@{} already exists",
                schema.key, schema.version
            )));
        }
        self.staged().push(StagedWrite::CreateSchema(schema));
        Ok(())
    }

    async fn set_active_schema(&self, key: String, version: String) -> Result<(), StoreError> {
        self.ensure_open()?;
        if !self
            .visible_schemata()
            .iter()
            .any(|s| s.key == key && s.version == version)
        {
            return Err(StoreError::NotFound(format!("schema {key}@{version}")));
        }
        self.staged().push(StagedWrite::SetActive { key, version });
        Ok(())
    }

    async fn force_delete_schema(&self, key: String) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.staged().push(StagedWrite::DeleteSchemata(key));
        Ok(())
    }

    async fn put_versioned_claims(
        &self,
        identity_id: String,
        claims: Vec<VersionedClaim>,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.state().put_calls += 1;
        self.staged().push(StagedWrite::PutClaims {
            identity_id,
            claims,
        });
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let writes: Vec<StagedWrite> = self.staged().drain(..).collect();
        let mut state = self.store.state();
        if state.fail_commit {
            state.events.push("commit_failed".to_string());
            return Err(StoreError::TransactionFailed(
                "commit rejected by the store".to_string(),
            ));
        }

        self.closed.store(true, Ordering::SeqCst);
        for write in writes {
            state.apply(write);
        }
        state.commits += 1;
        state.events.push("commit".to_string());
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.closed.store(true, Ordering::SeqCst);
        self.staged().clear();
        let mut state = self.store.state();
        state.rollbacks += 1;
        state.events.push("rollback".to_string());
        Ok(())
    }
}
