//! Persistence boundary.
//!
//! The engine only ever talks to these traits. Every read-modify-write on a
//! request or role goes through a single atomic method so the quorum count and
//! the stage advance it may trigger are decided together.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use sled::{Transactional, Tree};
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::applier::Role;
use crate::context::ApprovalContext;
use crate::error::{GovernanceError, Result};
use crate::workflow::WorkflowDefinition;

const WORKFLOWS_TREE: &str = "workflow_definitions";
const REQUESTS_TREE: &str = "approval_requests";
const ROLES_TREE: &str = "roles";
/// Ids of requests that are not yet terminal; values are empty.
const OPEN_REQUESTS_TREE: &str = "open_requests";

pub trait ApprovalRepository: Send + Sync {
    /// Create or replace the definition stored under `key`. `build` receives
    /// the current definition, if any, and returns its replacement.
    fn upsert_workflow<F>(&self, key: &str, build: F) -> Result<WorkflowDefinition>
    where
        F: Fn(Option<&WorkflowDefinition>) -> WorkflowDefinition;

    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>>;

    fn insert_request(&self, context: &ApprovalContext) -> Result<()>;

    fn get_request(&self, request_id: &str) -> Result<Option<ApprovalContext>>;

    fn list_requests(&self) -> Result<Vec<ApprovalContext>>;

    /// Requests still awaiting a decision. Terminal requests are not read.
    fn list_open_requests(&self) -> Result<Vec<ApprovalContext>>;

    /// Read the request, run `transition` on it and persist the result as one
    /// atomic step. Nothing is written when `transition` fails. `transition`
    /// may be invoked more than once under contention.
    fn advance_stage_atomically<T, F>(&self, request_id: &str, transition: F) -> Result<(ApprovalContext, T)>
    where
        F: Fn(&mut ApprovalContext) -> Result<T>;
}

pub trait RoleRepository: Send + Sync {
    fn put_role(&self, role: &Role) -> Result<()>;

    fn get_role(&self, role_id: &str) -> Result<Option<Role>>;

    fn update_role_atomically<T, F>(&self, role_id: &str, update: F) -> Result<(Role, T)>
    where
        F: Fn(&mut Role) -> Result<T>;
}

/// Everything the engine and its appliers need from one backend.
pub trait GovernanceStore: ApprovalRepository + RoleRepository + 'static {}

impl<T: ApprovalRepository + RoleRepository + 'static> GovernanceStore for T {}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> Result<T> {
    Ok(minicbor::decode(bytes)?)
}

/// sled-backed repository, one tree per record family.
pub struct SledRepository {
    instance: Arc<sled::Db>,
    workflows: Tree,
    requests: Tree,
    open_requests: Tree,
    roles: Tree,
}

impl SledRepository {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        let repo = Self {
            workflows: instance.open_tree(WORKFLOWS_TREE)?,
            requests: instance.open_tree(REQUESTS_TREE)?,
            open_requests: instance.open_tree(OPEN_REQUESTS_TREE)?,
            roles: instance.open_tree(ROLES_TREE)?,
            instance,
        };
        if repo.open_requests.is_empty() && !repo.requests.is_empty() {
            repo.rebuild_open_index()?;
        }
        Ok(repo)
    }

    /// Databases written before the open-request index existed carry
    /// requests but no index entries.
    fn rebuild_open_index(&self) -> Result<()> {
        for context in Self::scan::<ApprovalContext>(&self.requests)? {
            if !context.is_terminal() {
                self.open_requests.insert(context.id().as_bytes(), &b""[..])?;
            }
        }
        Ok(())
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(Arc::new(sled::open(path)?))
    }

    pub fn flush(&self) -> Result<()> {
        self.instance.flush()?;
        Ok(())
    }

    /// Transactional read-modify-write of one CBOR record.
    fn transact<V, T, F>(tree: &Tree, key: &str, entity: &'static str, update: F) -> Result<(V, T)>
    where
        V: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>,
        F: Fn(&mut V) -> Result<T>,
    {
        let outcome = tree.transaction(|tx| {
            let raw = tx
                .get(key.as_bytes())?
                .ok_or_else(|| ConflictableTransactionError::Abort(GovernanceError::not_found(entity, key)))?;
            let mut value: V = decode(&raw).map_err(ConflictableTransactionError::Abort)?;

            let out = update(&mut value).map_err(ConflictableTransactionError::Abort)?;

            let bytes = encode(&value).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(key.as_bytes(), bytes)?;
            Ok::<_, ConflictableTransactionError<GovernanceError>>((value, out))
        });

        outcome.map_err(|err| match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => GovernanceError::Storage(err),
        })
    }

    fn scan<V: for<'b> minicbor::Decode<'b, ()>>(tree: &Tree) -> Result<Vec<V>> {
        tree.iter()
            .values()
            .map(|raw| decode(&raw?))
            .collect()
    }
}

impl ApprovalRepository for SledRepository {
    fn upsert_workflow<F>(&self, key: &str, build: F) -> Result<WorkflowDefinition>
    where
        F: Fn(Option<&WorkflowDefinition>) -> WorkflowDefinition,
    {
        let outcome = self.workflows.transaction(|tx| {
            let existing: Option<WorkflowDefinition> = match tx.get(key.as_bytes())? {
                Some(raw) => Some(decode(&raw).map_err(ConflictableTransactionError::Abort)?),
                None => None,
            };

            let definition = build(existing.as_ref());

            let bytes = encode(&definition).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(key.as_bytes(), bytes)?;
            Ok::<_, ConflictableTransactionError<GovernanceError>>(definition)
        });

        outcome.map_err(|err| match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => GovernanceError::Storage(err),
        })
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        Self::scan(&self.workflows)
    }

    fn insert_request(&self, context: &ApprovalContext) -> Result<()> {
        let bytes = encode(context)?;
        let outcome = (&self.requests, &self.open_requests).transaction(|(requests, open)| {
            let key = context.id().as_bytes();
            requests.insert(key, bytes.as_slice())?;
            if !context.is_terminal() {
                open.insert(key, &b""[..])?;
            }
            Ok::<_, ConflictableTransactionError<GovernanceError>>(())
        });

        outcome.map_err(|err| match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => GovernanceError::Storage(err),
        })
    }

    fn get_request(&self, request_id: &str) -> Result<Option<ApprovalContext>> {
        self.requests
            .get(request_id.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    fn list_requests(&self) -> Result<Vec<ApprovalContext>> {
        Self::scan(&self.requests)
    }

    fn list_open_requests(&self) -> Result<Vec<ApprovalContext>> {
        let mut open = Vec::new();
        for key in self.open_requests.iter().keys() {
            // a request resolved between the two reads drops out here
            if let Some(raw) = self.requests.get(key?)? {
                let context: ApprovalContext = decode(&raw)?;
                if !context.is_terminal() {
                    open.push(context);
                }
            }
        }
        Ok(open)
    }

    fn advance_stage_atomically<T, F>(&self, request_id: &str, transition: F) -> Result<(ApprovalContext, T)>
    where
        F: Fn(&mut ApprovalContext) -> Result<T>,
    {
        let outcome = (&self.requests, &self.open_requests).transaction(|(requests, open)| {
            let key = request_id.as_bytes();
            let raw = requests.get(key)?.ok_or_else(|| {
                ConflictableTransactionError::Abort(GovernanceError::not_found("approval request", request_id))
            })?;
            let mut context: ApprovalContext = decode(&raw).map_err(ConflictableTransactionError::Abort)?;

            let out = transition(&mut context).map_err(ConflictableTransactionError::Abort)?;

            let bytes = encode(&context).map_err(ConflictableTransactionError::Abort)?;
            requests.insert(key, bytes)?;
            if context.is_terminal() {
                open.remove(key)?;
            }
            Ok::<_, ConflictableTransactionError<GovernanceError>>((context, out))
        });

        outcome.map_err(|err| match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => GovernanceError::Storage(err),
        })
    }
}

impl RoleRepository for SledRepository {
    fn put_role(&self, role: &Role) -> Result<()> {
        self.roles.insert(role.id.as_bytes(), encode(role)?)?;
        Ok(())
    }

    fn get_role(&self, role_id: &str) -> Result<Option<Role>> {
        self.roles
            .get(role_id.as_bytes())?
            .map(|raw| decode(&raw))
            .transpose()
    }

    fn update_role_atomically<T, F>(&self, role_id: &str, update: F) -> Result<(Role, T)>
    where
        F: Fn(&mut Role) -> Result<T>,
    {
        Self::transact(&self.roles, role_id, "role", update)
    }
}

/// Process-local repository. One lock per record family serialises every
/// read-modify-write, which is what the atomic methods promise.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    workflows: Mutex<BTreeMap<String, WorkflowDefinition>>,
    requests: Mutex<BTreeMap<String, ApprovalContext>>,
    roles: Mutex<BTreeMap<String, Role>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalRepository for InMemoryRepository {
    fn upsert_workflow<F>(&self, key: &str, build: F) -> Result<WorkflowDefinition>
    where
        F: Fn(Option<&WorkflowDefinition>) -> WorkflowDefinition,
    {
        let mut workflows = self.workflows.lock();
        let definition = build(workflows.get(key));
        workflows.insert(key.to_owned(), definition.clone());
        Ok(definition)
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        Ok(self.workflows.lock().values().cloned().collect())
    }

    fn insert_request(&self, context: &ApprovalContext) -> Result<()> {
        self.requests
            .lock()
            .insert(context.id().to_owned(), context.clone());
        Ok(())
    }

    fn get_request(&self, request_id: &str) -> Result<Option<ApprovalContext>> {
        Ok(self.requests.lock().get(request_id).cloned())
    }

    fn list_requests(&self) -> Result<Vec<ApprovalContext>> {
        Ok(self.requests.lock().values().cloned().collect())
    }

    fn list_open_requests(&self) -> Result<Vec<ApprovalContext>> {
        Ok(self
            .requests
            .lock()
            .values()
            .filter(|ctx| !ctx.is_terminal())
            .cloned()
            .collect())
    }

    fn advance_stage_atomically<T, F>(&self, request_id: &str, transition: F) -> Result<(ApprovalContext, T)>
    where
        F: Fn(&mut ApprovalContext) -> Result<T>,
    {
        let mut requests = self.requests.lock();
        let mut context = requests
            .get(request_id)
            .cloned()
            .ok_or_else(|| GovernanceError::not_found("approval request", request_id))?;

        let out = transition(&mut context)?;
        requests.insert(request_id.to_owned(), context.clone());
        Ok((context, out))
    }
}

impl RoleRepository for InMemoryRepository {
    fn put_role(&self, role: &Role) -> Result<()> {
        self.roles.lock().insert(role.id.clone(), role.clone());
        Ok(())
    }

    fn get_role(&self, role_id: &str) -> Result<Option<Role>> {
        Ok(self.roles.lock().get(role_id).cloned())
    }

    fn update_role_atomically<T, F>(&self, role_id: &str, update: F) -> Result<(Role, T)>
    where
        F: Fn(&mut Role) -> Result<T>,
    {
        let mut roles = self.roles.lock();
        let mut role = roles
            .get(role_id)
            .cloned()
            .ok_or_else(|| GovernanceError::not_found("role", role_id))?;

        let out = update(&mut role)?;
        roles.insert(role_id.to_owned(), role.clone());
        Ok((role, out))
    }
}
