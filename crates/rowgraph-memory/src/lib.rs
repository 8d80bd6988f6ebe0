//! In-memory storage backend for rowgraph.
//!
//! [`MemoryStorage`] implements [`StorageExecutor`] over plain tables held in
//! memory. Each `execute` call works on a copy of the tables and swaps it in
//! only when every operation succeeded, which gives the same all-or-nothing
//! behavior as a database transaction.
//!
//! It also carries the knobs tests need: call counters, a switch that makes
//! every fetch fail, one-shot failure injection and a hook that runs inside
//! `execute`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rowgraph_core::{
    DiffOp, GeneratedKeys, JointPath, ObjectIdentity, OrderedDiff, QueryDescriptor, RowSnapshot,
    StorageError, StorageExecutor, Value,
};

type ExecuteHook = Box<dyn Fn(&OrderedDiff) + Send + Sync>;

#[derive(Debug, Clone)]
struct Table {
    primary_key: Vec<String>,
    generated: bool,
    next_key: i64,
    rows: Vec<RowSnapshot>,
}

impl Table {
    fn key_of(&self, row: &RowSnapshot) -> Option<Vec<(String, Value)>> {
        self.primary_key
            .iter()
            .map(|c| match row.get(c) {
                Some(v) if !v.is_null() => Some((c.clone(), v.clone())),
                _ => None,
            })
            .collect()
    }

    fn position(&self, key: &[(String, Value)]) -> Option<usize> {
        self.rows.iter().position(|row| {
            key.iter()
                .all(|(column, value)| row.get(column) == Some(value))
        })
    }
}

/// Storage executor backed by in-memory tables.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<HashMap<String, Table>>,
    fetches: AtomicUsize,
    executes: AtomicUsize,
    fetches_blocked: AtomicBool,
    fail_next: Mutex<Option<StorageError>>,
    execute_hook: Mutex<Option<ExecuteHook>>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("tables", &self.lock_tables().len())
            .field("fetches", &self.fetch_count())
            .field("executes", &self.execute_count())
            .finish_non_exhaustive()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_tables(&self) -> MutexGuard<'_, HashMap<String, Table>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or replace) a table.
    ///
    /// With `generated` set, inserts that leave the single key column empty
    /// get the next integer key.
    pub fn define_table(&self, name: &str, primary_key: &[&str], generated: bool) {
        self.lock_tables().insert(
            name.to_string(),
            Table {
                primary_key: primary_key.iter().map(|c| (*c).to_string()).collect(),
                generated,
                next_key: 1,
                rows: Vec::new(),
            },
        );
    }

    /// Append rows directly, bypassing counters and hooks.
    pub fn seed<I>(&self, table: &str, rows: I) -> Result<(), StorageError>
    where
        I: IntoIterator<Item = RowSnapshot>,
    {
        let mut tables = self.lock_tables();
        let table = tables
            .get_mut(table)
            .ok_or_else(|| StorageError::backend(format!("no table '{table}'")))?;
        for row in rows {
            if table.generated {
                let key = table.primary_key.first().and_then(|c| row.get(c));
                if let Some(n) = key.and_then(Value::as_i64) {
                    table.next_key = table.next_key.max(n + 1);
                }
            }
            table.rows.push(row);
        }
        Ok(())
    }

    /// Current rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<RowSnapshot> {
        self.lock_tables()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Current row for a permanent identity.
    pub fn row(&self, identity: &ObjectIdentity) -> Option<RowSnapshot> {
        let key = identity.key()?;
        let tables = self.lock_tables();
        let table = tables.get(identity.entity())?;
        table.position(key).map(|i| table.rows[i].clone())
    }

    /// Overwrite columns of a stored row, as another process would.
    pub fn update_row(&self, identity: &ObjectIdentity, values: &RowSnapshot) -> bool {
        let Some(key) = identity.key() else {
            return false;
        };
        let mut tables = self.lock_tables();
        let Some(table) = tables.get_mut(identity.entity()) else {
            return false;
        };
        match table.position(key) {
            Some(i) => {
                table.rows[i] = table.rows[i].merged(values);
                true
            }
            None => false,
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn execute_count(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn reset_counts(&self) {
        self.fetches.store(0, Ordering::SeqCst);
        self.executes.store(0, Ordering::SeqCst);
    }

    /// Make every fetch fail until unblocked.
    pub fn block_fetches(&self, blocked: bool) {
        self.fetches_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Fail the next `execute` call with `error`, leaving the tables untouched.
    pub fn fail_next_execute(&self, error: StorageError) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Run `hook` inside every `execute` call, before the diff is applied.
    pub fn on_execute(&self, hook: impl Fn(&OrderedDiff) + Send + Sync + 'static) {
        *self.execute_hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    pub fn clear_execute_hook(&self) {
        *self.execute_hook.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn apply(
        tables: &mut HashMap<String, Table>,
        diff: &OrderedDiff,
    ) -> Result<GeneratedKeys, StorageError> {
        let mut keys = GeneratedKeys::new();
        for op in diff.iter() {
            let identity = op.identity();
            let table = tables.get_mut(identity.entity()).ok_or_else(|| {
                StorageError::backend(format!("no table '{}'", identity.entity()))
            })?;
            match op {
                DiffOp::Insert { .. } => {
                    let mut values = op.resolved_values(&keys)?;
                    if table.generated && table.primary_key.len() == 1 {
                        let column = &table.primary_key[0];
                        if values.get_or_null(column).is_null() {
                            values = values.with(column.clone(), Value::BigInt(table.next_key));
                            table.next_key += 1;
                        }
                    }
                    let key = table.key_of(&values).ok_or_else(|| {
                        StorageError::backend(format!("{identity}: primary key is incomplete"))
                    })?;
                    if table.position(&key).is_some() {
                        return Err(StorageError::backend(format!(
                            "{identity}: duplicate primary key in '{}'",
                            identity.entity()
                        )));
                    }
                    table.rows.push(values);
                    keys.insert(identity.clone(), key);
                }
                DiffOp::Update { expected, .. } | DiffOp::Delete { expected, .. } => {
                    let key = stored_key(identity, &keys)?;
                    let Some(position) = table.position(&key) else {
                        return Err(StorageError::row_count_mismatch(identity.clone(), 1, 0));
                    };
                    if let Some(expected) = expected {
                        let row = &table.rows[position];
                        let stale = expected
                            .iter()
                            .any(|(column, value)| row.get_or_null(column) != value);
                        if stale {
                            return Err(StorageError::row_count_mismatch(identity.clone(), 1, 0));
                        }
                    }
                    if matches!(op, DiffOp::Delete { .. }) {
                        table.rows.remove(position);
                    } else {
                        let values = op.resolved_values(&keys)?;
                        table.rows[position] = table.rows[position].merged(&values);
                    }
                }
            }
        }
        Ok(keys)
    }
}

fn stored_key(
    identity: &ObjectIdentity,
    keys: &GeneratedKeys,
) -> Result<Vec<(String, Value)>, StorageError> {
    if let Some(key) = identity.key() {
        return Ok(key.to_vec());
    }
    keys.get(identity)
        .map(<[(String, Value)]>::to_vec)
        .ok_or_else(|| StorageError::backend(format!("{identity} was never inserted")))
}

impl StorageExecutor for MemoryStorage {
    #[tracing::instrument(level = "debug", skip(self, diff), fields(ops = diff.len()))]
    fn execute(&self, diff: &OrderedDiff) -> Result<GeneratedKeys, StorageError> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            tracing::debug!(error = %error, "Injected execute failure");
            return Err(error);
        }
        if let Some(hook) = self
            .execute_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            hook(diff);
        }

        let mut tables = self.lock_tables();
        let mut working = tables.clone();
        let keys = Self::apply(&mut working, diff)?;
        *tables = working;
        let (inserts, updates, deletes) = diff.counts();
        tracing::debug!(inserts, updates, deletes, "Diff applied");
        Ok(keys)
    }

    #[tracing::instrument(level = "debug", skip(self, query), fields(entity = %query.entity))]
    fn fetch(&self, query: &QueryDescriptor) -> Result<Vec<RowSnapshot>, StorageError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fetches_blocked.load(Ordering::SeqCst) {
            return Err(StorageError::backend("fetches are blocked"));
        }
        let tables = self.lock_tables();
        let table = tables
            .get(&query.entity)
            .ok_or_else(|| StorageError::backend(format!("no table '{}'", query.entity)))?;

        let mut rows: Vec<RowSnapshot> = table
            .rows
            .iter()
            .filter(|row| query.qualifier.matches(row))
            .take(query.fetch_limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        for path in &query.joint {
            rows = join(&tables, rows, path)?;
        }
        tracing::trace!(rows = rows.len(), "Fetched");
        Ok(rows)
    }
}

/// Left-join `path` into every wide row.
fn join(
    tables: &HashMap<String, Table>,
    rows: Vec<RowSnapshot>,
    path: &JointPath,
) -> Result<Vec<RowSnapshot>, StorageError> {
    let target = tables
        .get(&path.target)
        .ok_or_else(|| StorageError::backend(format!("no table '{}'", path.target)))?;
    let mut joined = Vec::with_capacity(rows.len());
    for row in rows {
        let source: Option<Vec<&Value>> = path
            .joins
            .iter()
            .map(|(column, _)| {
                let value = if path.parent.is_empty() {
                    row.get_or_null(column)
                } else {
                    row.get_or_null(&format!("{}.{column}", path.parent))
                };
                (!value.is_null()).then_some(value)
            })
            .collect();
        let Some(source) = source else {
            joined.push(row);
            continue;
        };
        let mut matched = target.rows.iter().filter(|candidate| {
            path.target_filter.matches(candidate)
                && path
                    .joins
                    .iter()
                    .zip(&source)
                    .all(|((_, column), value)| candidate.get(column) == Some(*value))
        });
        if path.to_many {
            let mut any = false;
            for candidate in matched {
                any = true;
                joined.push(row.merged(&candidate.prefixed(&path.path)));
            }
            if !any {
                joined.push(row);
            }
        } else {
            match matched.next() {
                Some(candidate) => joined.push(row.merged(&candidate.prefixed(&path.path))),
                None => joined.push(row),
            }
        }
    }
    Ok(joined)
}
