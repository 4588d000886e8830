//! Node cache: a local relational mirror of the remote filesystem.
//!
//! Backed by SQLite through two tables: `statecache` for generic client
//! state blobs and `nodes` for the tree itself. Every node row carries the
//! opaque serialized node (the single source of truth) plus the columns
//! queries filter and sort on, all of which are derived from that blob at
//! write time. Two generated columns are computed by SQL functions registered
//! at open — `mimetypeVirtual` from the name and `sizeVirtual` from the
//! node-counter blob — and are never written.
//!
//! Long queries install a progress handler polling a [`CancelToken`]; a
//! cancelled query returns an empty result without error. Disk-full and I/O
//! failures reach a registered callback so the application can decide whether
//! to go read-only or resync; everything else surfaces through return values.

pub mod collate;
pub mod filter;

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, params, params_from_iter};

use crate::error::DbError;
use crate::node::{Handle, Node, NodeCounter, mime_category};

use self::collate::natural_nocase_cmp;
use self::filter::{NodeSearchFilter, NodeSearchPage, SearchOrder, SensitivityPolicy, wildcard_match};

/// Current schema version; part of the database file name.
pub const DB_VERSION: u32 = 14;
/// Previous schema version, recycled or deleted on open.
pub const LEGACY_DB_VERSION: u32 = DB_VERSION - 1;

/// Progress-handler polling period, in SQLite VM instructions.
const NUM_VM_INSTRUCTIONS: i32 = 1000;

/// Reserved slots of the `statecache` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StateId {
    SequenceNumber = 1,
    Session = 2,
    StreamUrl = 3,
}

/// Cooperative cancellation flag for long queries. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<std::sync::atomic::AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Raw row content of a node: the counter blob and the serialized node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSerialized {
    pub counter: Vec<u8>,
    pub node: Vec<u8>,
}

impl NodeSerialized {
    pub fn decode(&self) -> Option<Node> {
        let mut node = Node::deserialize(&self.node)?;
        if let Some(counter) = NodeCounter::deserialize(&self.counter) {
            node.counter = counter;
        }
        Some(node)
    }
}

/// Callback invoked for storage failures the application must know about.
pub type DbErrorCallback = Box<dyn FnMut(DbError)>;

/// Open parameters for a per-account cache file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DbConfig {
    /// Per-account configuration directory holding the database files.
    pub root: PathBuf,
    /// Account name baked into the file name.
    pub name: String,
    /// Rename a version-(V−1) file into place instead of deleting it.
    pub recycle_legacy: bool,
    /// Require every write to run inside an explicit transaction, opening
    /// one on demand.
    pub always_transacted: bool,
}

impl DbConfig {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            name: name.into(),
            recycle_legacy: true,
            always_transacted: false,
        }
    }
}

/// `megaclient_statecache<V>_<name>.db` in the account directory.
pub fn database_path(root: &Path, name: &str, version: u32) -> PathBuf {
    root.join(format!("megaclient_statecache{version}_{name}.db"))
}

#[cfg(not(target_os = "ios"))]
const SIDECAR_SUFFIXES: [&str; 2] = ["-shm", "-wal"];
#[cfg(target_os = "ios")]
const SIDECAR_SUFFIXES: [&str; 1] = ["-journal"];

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Recycles or deletes a legacy-version database before open.
fn adjust_legacy_db(config: &DbConfig, db_path: &Path) {
    if db_path.exists() {
        return;
    }
    let legacy = database_path(&config.root, &config.name, LEGACY_DB_VERSION);
    if !legacy.exists() {
        return;
    }

    if config.recycle_legacy {
        tracing::debug!(?legacy, "recycling legacy database file");
        if std::fs::rename(&legacy, db_path).is_err() {
            tracing::warn!(?legacy, "failed to rename legacy database, removing");
            let _ = std::fs::remove_file(&legacy);
            return;
        }
        for suffix in SIDECAR_SUFFIXES {
            let from = sidecar(&legacy, suffix);
            if from.exists() && std::fs::rename(&from, sidecar(db_path, suffix)).is_err() {
                tracing::warn!(?from, "failed to rename database sidecar");
            }
        }
    } else {
        tracing::debug!(?legacy, "removing legacy database file");
        let _ = std::fs::remove_file(&legacy);
        for suffix in SIDECAR_SUFFIXES {
            let _ = std::fs::remove_file(sidecar(&legacy, suffix));
        }
    }
}

const CREATE_NODES_TABLE: &str = "CREATE TABLE IF NOT EXISTS nodes (\
     nodehandle int64 PRIMARY KEY NOT NULL, \
     parenthandle int64, \
     name text, \
     fingerprint BLOB, \
     origFingerprint BLOB, \
     type tinyint, \
     mimetypeVirtual tinyint AS (getmimetype(name)) VIRTUAL, \
     sizeVirtual int64 AS (getsizefromcounter(counter)) VIRTUAL, \
     share tinyint, \
     fav tinyint, \
     ctime int64, \
     mtime int64 DEFAULT 0, \
     flags int64, \
     counter BLOB NOT NULL, \
     node BLOB NOT NULL, \
     label tinyint DEFAULT 0, \
     description text, \
     tags text)";

/// Columns a schema migration may need to add to an existing `nodes` table,
/// with an extractor pulling the value out of the serialized node.
struct NewColumn {
    name: &'static str,
    decl: &'static str,
    extract: Option<fn(&Node) -> Option<Value>>,
}

fn expected_columns() -> Vec<NewColumn> {
    vec![
        NewColumn {
            name: "mtime",
            decl: "int64 DEFAULT 0",
            extract: Some(|n| (n.mtime != 0).then_some(Value::Integer(n.mtime))),
        },
        NewColumn {
            name: "label",
            decl: "tinyint DEFAULT 0",
            extract: Some(|n| {
                let label = n.label() as u8;
                (label != 0).then_some(Value::Integer(i64::from(label)))
            }),
        },
        NewColumn {
            name: "mimetypeVirtual",
            decl: "tinyint AS (getmimetype(name)) VIRTUAL",
            extract: None,
        },
        NewColumn {
            name: "description",
            decl: "text",
            extract: Some(|n| n.description().map(|d| Value::Text(d.to_string()))),
        },
        NewColumn {
            name: "tags",
            decl: "text",
            extract: Some(|n| n.tags().map(|t| Value::Text(t.to_string()))),
        },
        NewColumn {
            name: "sizeVirtual",
            decl: "int64 AS (getsizefromcounter(counter)) VIRTUAL",
            extract: None,
        },
    ]
}

/// The relational node cache. Single-owner: only the engine thread touches
/// it, which is what makes the `matchfilter` slot equivalent to passing the
/// filter into the statement.
pub struct NodeStore {
    conn: Connection,
    path: PathBuf,
    always_transacted: bool,
    error_cb: RefCell<Option<DbErrorCallback>>,
    active_filter: Arc<Mutex<Option<NodeSearchFilter>>>,
    state_cursor: Cell<i64>,
}

impl NodeStore {
    /// Opens (creating or migrating as needed) the cache for an account.
    pub fn open(config: &DbConfig, error_cb: Option<DbErrorCallback>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.root)
            .with_context(|| format!("creating config dir {:?}", config.root))?;
        let path = database_path(&config.root, &config.name, DB_VERSION);
        adjust_legacy_db(config, &path);

        let conn = Connection::open(&path)
            .with_context(|| format!("opening node cache {path:?}"))?;

        if !cfg!(target_os = "ios") {
            conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
                .context("switching journal mode to WAL")?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS statecache (\
             id INTEGER PRIMARY KEY ASC NOT NULL, content BLOB NOT NULL)",
        )
        .context("creating statecache table")?;

        let active_filter: Arc<Mutex<Option<NodeSearchFilter>>> = Arc::new(Mutex::new(None));
        register_sql_functions(&conn, &active_filter).context("registering SQL functions")?;

        conn.execute_batch(CREATE_NODES_TABLE)
            .context("creating nodes table")?;

        add_and_populate_columns(&conn, expected_columns()).context("migrating nodes schema")?;
        create_indexes(&conn);

        conn.set_prepared_statement_cache_capacity(64);

        Ok(Self {
            conn,
            path,
            always_transacted: config.always_transacted,
            error_cb: RefCell::new(error_cb),
            active_filter,
            state_cursor: Cell::new(-1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Installs (or replaces) the storage failure callback.
    pub fn set_error_callback(&self, callback: Option<DbErrorCallback>) {
        *self.error_cb.borrow_mut() = callback;
    }

    // ---- error plumbing ----------------------------------------------------

    /// Classifies a failure, notifies the callback for disk-full and I/O
    /// errors, and reports whether it was a cancellation interrupt.
    fn error_handler(&self, err: &rusqlite::Error, operation: &str, cancellable: bool) -> bool {
        if let rusqlite::Error::SqliteFailure(e, _) = err {
            match e.code {
                ErrorCode::OperationInterrupted if cancellable => {
                    tracing::debug!(operation, "query interrupted");
                    return true;
                }
                ErrorCode::DiskFull => {
                    tracing::error!(operation, %err, "database full");
                    self.notify(DbError::Full);
                    return false;
                }
                ErrorCode::SystemIoFailure => {
                    tracing::error!(operation, %err, "database I/O failure");
                    self.notify(DbError::Io);
                    return false;
                }
                _ => {}
            }
        }
        tracing::error!(operation, %err, db = ?self.path, "database failure");
        debug_assert!(false, "unrecoverable database error during {operation}");
        false
    }

    fn notify(&self, error: DbError) {
        if let Some(cb) = self.error_cb.borrow_mut().as_mut() {
            cb(error);
        }
    }

    fn check<T>(&self, result: rusqlite::Result<T>, operation: &str, cancellable: bool) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.error_handler(&err, operation, cancellable);
                None
            }
        }
    }

    // ---- transactions ------------------------------------------------------

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn begin(&self) {
        debug_assert!(!self.in_transaction());
        tracing::debug!(db = ?self.path, "transaction BEGIN");
        let _ = self.check(self.conn.execute_batch("BEGIN"), "begin transaction", false);
    }

    pub fn commit(&self) {
        tracing::debug!(db = ?self.path, "transaction COMMIT");
        let _ = self.check(self.conn.execute_batch("COMMIT"), "commit transaction", false);
    }

    pub fn abort(&self) {
        tracing::debug!(db = ?self.path, "transaction ROLLBACK");
        let _ = self.check(self.conn.execute_batch("ROLLBACK"), "rollback", false);
    }

    /// Writes must be transacted in always-transacted mode; a missing
    /// transaction is opened on the spot.
    fn check_transaction(&self) {
        if self.always_transacted && !self.in_transaction() {
            tracing::debug!("write outside transaction, opening one");
            self.begin();
        }
    }

    // ---- statecache --------------------------------------------------------

    pub fn state_put(&self, id: u32, content: &[u8]) -> bool {
        self.check_transaction();
        let result = self
            .conn
            .prepare_cached("INSERT OR REPLACE INTO statecache (id, content) VALUES (?1, ?2)")
            .and_then(|mut stmt| stmt.execute(params![i64::from(id), content]));
        self.check(result, "put record", false).is_some()
    }

    pub fn state_get(&self, id: u32) -> Option<Vec<u8>> {
        let result = self
            .conn
            .prepare_cached("SELECT content FROM statecache WHERE id = ?1")
            .and_then(|mut stmt| {
                stmt.query_row(params![i64::from(id)], |row| row.get::<_, Vec<u8>>(0))
            });
        match result {
            Ok(content) => Some(content),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => {
                self.error_handler(&err, "get record", false);
                None
            }
        }
    }

    pub fn state_del(&self, id: u32) -> bool {
        self.check_transaction();
        let result = self
            .conn
            .prepare_cached("DELETE FROM statecache WHERE id = ?1")
            .and_then(|mut stmt| stmt.execute(params![i64::from(id)]));
        self.check(result, "delete record", false).is_some()
    }

    pub fn state_truncate(&self) {
        self.check_transaction();
        let _ = self.check(
            self.conn.execute_batch("DELETE FROM statecache"),
            "truncate",
            false,
        );
    }

    /// Resets the statecache cursor to before the first record.
    pub fn state_rewind(&self) {
        self.state_cursor.set(-1);
    }

    /// Returns the next statecache record in id order, advancing the cursor.
    pub fn state_next(&self) -> Option<(u32, Vec<u8>)> {
        let result = self
            .conn
            .prepare_cached(
                "SELECT id, content FROM statecache WHERE id > ?1 ORDER BY id LIMIT 1",
            )
            .and_then(|mut stmt| {
                stmt.query_row(params![self.state_cursor.get()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
                })
            });
        match result {
            Ok((id, content)) => {
                self.state_cursor.set(id);
                Some((id as u32, content))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => {
                self.error_handler(&err, "get next record", false);
                None
            }
        }
    }

    // ---- node writes -------------------------------------------------------

    /// Full insert-or-replace of a node. Attribute-derived columns come out
    /// of the node's attr map, never from extra parameters.
    pub fn put_node(&self, node: &Node) -> bool {
        self.check_transaction();

        let blob = node.serialize();
        debug_assert!(!blob.is_empty());
        let counter = node.counter.serialize();
        let orig_fp = node.orig_fingerprint().map(str::as_bytes).unwrap_or(&[]);

        let result = self
            .conn
            .prepare_cached(
                "INSERT OR REPLACE INTO nodes (nodehandle, parenthandle, name, fingerprint, \
                 origFingerprint, type, share, fav, ctime, mtime, flags, counter, node, label, \
                 description, tags) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, \
                 ?13, ?14, ?15, ?16)",
            )
            .and_then(|mut stmt| {
                stmt.execute(params![
                    node.handle as i64,
                    node.parent as i64,
                    node.name,
                    node.fingerprint,
                    orig_fp,
                    i64::from(node.node_type_raw),
                    i64::from(node.share),
                    node.favourite() as i64,
                    node.ctime,
                    node.mtime,
                    node.db_flags() as i64,
                    counter,
                    blob,
                    i64::from(node.label() as u8),
                    node.description(),
                    node.tags(),
                ])
            });
        self.check(result, "put node", false).is_some()
    }

    /// Rewrites only the counter blob of a node.
    pub fn update_counter(&self, handle: Handle, counter_blob: &[u8]) {
        self.check_transaction();
        let result = self
            .conn
            .prepare_cached("UPDATE nodes SET counter = ?1 WHERE nodehandle = ?2")
            .and_then(|mut stmt| stmt.execute(params![counter_blob, handle as i64]));
        let _ = self.check(result, "update counter", false);
    }

    /// Rewrites the counter blob and flags of a node.
    pub fn update_counter_and_flags(&self, handle: Handle, flags: u64, counter_blob: &[u8]) {
        self.check_transaction();
        let result = self
            .conn
            .prepare_cached("UPDATE nodes SET counter = ?1, flags = ?2 WHERE nodehandle = ?3")
            .and_then(|mut stmt| {
                stmt.execute(params![counter_blob, flags as i64, handle as i64])
            });
        let _ = self.check(result, "update counter and flags", false);
    }

    pub fn remove_node(&self, handle: Handle) -> bool {
        self.check_transaction();
        let result = self
            .conn
            .prepare_cached("DELETE FROM nodes WHERE nodehandle = ?1")
            .and_then(|mut stmt| stmt.execute(params![handle as i64]));
        self.check(result, "delete node", false).is_some()
    }

    pub fn remove_nodes(&self) -> bool {
        self.check_transaction();
        self.check(
            self.conn.execute_batch("DELETE FROM nodes"),
            "delete nodes",
            false,
        )
        .is_some()
    }

    // ---- node lookups ------------------------------------------------------

    pub fn get_node(&self, handle: Handle) -> Option<NodeSerialized> {
        let result = self
            .conn
            .prepare_cached("SELECT counter, node FROM nodes WHERE nodehandle = ?1")
            .and_then(|mut stmt| {
                stmt.query_row(params![handle as i64], |row| {
                    Ok(NodeSerialized {
                        counter: row.get(0)?,
                        node: row.get(1)?,
                    })
                })
            });
        match result {
            Ok(node) => Some(node),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => {
                self.error_handler(&err, "get node", false);
                None
            }
        }
    }

    /// Decoded convenience lookup.
    pub fn get(&self, handle: Handle) -> Option<Node> {
        self.get_node(handle)?.decode()
    }

    pub fn get_nodes_by_fingerprint(&self, fingerprint: &[u8]) -> Vec<(Handle, NodeSerialized)> {
        let result = self
            .conn
            .prepare_cached(
                "SELECT nodehandle, counter, node FROM nodes WHERE fingerprint = ?1",
            )
            .and_then(|mut stmt| collect_nodes(stmt.query(params![fingerprint])?));
        self.check(result, "get nodes by fingerprint", false)
            .unwrap_or_default()
    }

    pub fn get_node_by_fingerprint(&self, fingerprint: &[u8]) -> Option<(Handle, NodeSerialized)> {
        let result = self
            .conn
            .prepare_cached(
                "SELECT nodehandle, counter, node FROM nodes WHERE fingerprint = ?1 LIMIT 1",
            )
            .and_then(|mut stmt| collect_nodes(stmt.query(params![fingerprint])?));
        self.check(result, "get node by fingerprint", false)?
            .into_iter()
            .next()
    }

    pub fn get_nodes_by_orig_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Vec<(Handle, NodeSerialized)> {
        let result = self
            .conn
            .prepare_cached(
                "SELECT nodehandle, counter, node FROM nodes WHERE origFingerprint = ?1",
            )
            .and_then(|mut stmt| collect_nodes(stmt.query(params![fingerprint.as_bytes()])?));
        self.check(result, "get nodes by orig fingerprint", false)
            .unwrap_or_default()
    }

    /// Root-like nodes: cloud root, inbox, and rubbish.
    pub fn get_root_nodes(&self) -> Vec<(Handle, NodeSerialized)> {
        let result = self
            .conn
            .prepare_cached(
                "SELECT nodehandle, counter, node FROM nodes WHERE type BETWEEN 2 AND 4",
            )
            .and_then(|mut stmt| collect_nodes(stmt.query([])?));
        self.check(result, "get root nodes", false)
            .unwrap_or_default()
    }

    /// Nodes whose share mask intersects `share_mask`.
    pub fn get_nodes_with_shares_or_link(&self, share_mask: u8) -> Vec<(Handle, NodeSerialized)> {
        let result = self
            .conn
            .prepare_cached(
                "SELECT nodehandle, counter, node FROM nodes WHERE share & ?1 != 0",
            )
            .and_then(|mut stmt| collect_nodes(stmt.query(params![i64::from(share_mask)])?));
        self.check(result, "get nodes with shares or link", false)
            .unwrap_or_default()
    }

    pub fn child_node_by_name_type(
        &self,
        parent: Handle,
        name: &str,
        node_type: u8,
    ) -> Option<(Handle, NodeSerialized)> {
        let result = self
            .conn
            .prepare_cached(
                "SELECT nodehandle, counter, node FROM nodes \
                 WHERE parenthandle = ?1 AND name = ?2 AND type = ?3 LIMIT 1",
            )
            .and_then(|mut stmt| {
                collect_nodes(stmt.query(params![parent as i64, name, i64::from(node_type)])?)
            });
        self.check(result, "get node by name and type", false)?
            .into_iter()
            .next()
    }

    /// (size, type, flags) of a node, reading size through the virtual column.
    pub fn get_node_size_type_flags(&self, handle: Handle) -> Option<(i64, u8, u64)> {
        let result = self
            .conn
            .prepare_cached("SELECT type, sizeVirtual, flags FROM nodes WHERE nodehandle = ?1")
            .and_then(|mut stmt| {
                stmt.query_row(params![handle as i64], |row| {
                    Ok((
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(0)? as u8,
                        row.get::<_, i64>(2)? as u64,
                    ))
                })
            });
        match result {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(err) => {
                self.error_handler(&err, "get node size, type and flags", false);
                None
            }
        }
    }

    pub fn nodes_count(&self) -> u64 {
        self.conn
            .query_row("SELECT count(*) FROM nodes", [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .unwrap_or(0)
    }

    pub fn children_count(&self, parent: Handle) -> u64 {
        let result = self
            .conn
            .prepare_cached("SELECT count(*) FROM nodes WHERE parenthandle = ?1")
            .and_then(|mut stmt| stmt.query_row(params![parent as i64], |row| row.get::<_, i64>(0)));
        self.check(result, "get number of children", false)
            .map(|n| n as u64)
            .unwrap_or(0)
    }

    pub fn children_count_by_type(&self, parent: Handle, node_type: u8) -> u64 {
        let result = self
            .conn
            .prepare_cached("SELECT count(*) FROM nodes WHERE parenthandle = ?1 AND type = ?2")
            .and_then(|mut stmt| {
                stmt.query_row(params![parent as i64, i64::from(node_type)], |row| {
                    row.get::<_, i64>(0)
                })
            });
        self.check(result, "get number of children by type", false)
            .map(|n| n as u64)
            .unwrap_or(0)
    }

    /// Walks the parent chain of `node` looking for `ancestor`.
    pub fn is_ancestor(&self, node: Handle, ancestor: Handle, cancel: Option<&CancelToken>) -> bool {
        self.with_cancel(cancel, || {
            let result = self
                .conn
                .prepare_cached(
                    "WITH nodesCTE(nodehandle, parenthandle) AS (\
                     SELECT nodehandle, parenthandle FROM nodes WHERE nodehandle = ?1 \
                     UNION ALL \
                     SELECT A.nodehandle, A.parenthandle FROM nodes AS A \
                     INNER JOIN nodesCTE AS E ON (A.nodehandle = E.parenthandle)) \
                     SELECT 1 FROM nodesCTE WHERE parenthandle = ?2 LIMIT 1",
                )
                .and_then(|mut stmt| {
                    let mut rows = stmt.query(params![node as i64, ancestor as i64])?;
                    Ok(rows.next()?.is_some())
                });
            self.check(result, "is ancestor", true).unwrap_or(false)
        })
    }

    // ---- filtered queries --------------------------------------------------

    /// Children of the filter's parent matching its predicate, ordered and
    /// paged. Cancellation yields an empty result without error.
    pub fn get_children(
        &self,
        search_filter: &NodeSearchFilter,
        order: SearchOrder,
        cancel: Option<&CancelToken>,
        page: NodeSearchPage,
    ) -> Vec<(Handle, NodeSerialized)> {
        // Inherited sensitivity is not a concern here: when sensitive nodes
        // are excluded, the parent was vetted before the call.
        let sql = format!(
            "SELECT nodehandle, counter, node FROM nodes \
             WHERE parenthandle = ?1 \
             AND matchfilter(flags, type, ctime, mtime, mimetypeVirtual, name, description, \
             tags, fav) \
             ORDER BY {} LIMIT ?2 OFFSET ?3",
            order.clause()
        );

        self.with_filter(search_filter, || {
            self.with_cancel(cancel, || {
                let result = self.conn.prepare_cached(&sql).and_then(|mut stmt| {
                    collect_nodes(stmt.query(params![
                        search_filter.parent() as i64,
                        page.limit(),
                        page.offset as i64,
                    ])?)
                });
                self.check(result, "get children with filter", true)
                    .unwrap_or_default()
            })
        })
    }

    /// Recursive descent from the filter's ancestors (and optionally share
    /// roots), excluding versions, never descending into file parents, and
    /// pruning sensitive subtrees when the filter excludes them.
    pub fn search_nodes(
        &self,
        search_filter: &NodeSearchFilter,
        order: SearchOrder,
        cancel: Option<&CancelToken>,
        page: NodeSearchPage,
    ) -> Vec<(Handle, NodeSerialized)> {
        const COLUMNS: &str = "nodehandle, parenthandle, flags, name, type, counter, node, \
                               sizeVirtual, ctime, mtime, share, mimetypeVirtual, fav, label, \
                               description, tags";
        const COLUMNS_N: &str = "N.nodehandle, N.parenthandle, N.flags, N.name, N.type, \
                                 N.counter, N.node, N.sizeVirtual, N.ctime, N.mtime, N.share, \
                                 N.mimetypeVirtual, N.fav, N.label, N.description, N.tags";
        const ORDER_COLUMNS: &str =
            "nodehandle, counter, node, type, sizeVirtual, ctime, mtime, name, label, fav";
        const MATCH: &str = "matchfilter(flags, type, ctime, mtime, mimetypeVirtual, name, \
                             description, tags, fav)";

        let sql = format!(
            "WITH \
             ancestors(nodehandle) AS (\
               SELECT nodehandle FROM nodes \
               WHERE (?2 != -1 AND nodehandle = ?2) \
               OR (?3 != -1 AND nodehandle = ?3) \
               OR (?4 != -1 AND nodehandle = ?4) \
               OR (?5 != 0 AND nodehandle IN \
                  (SELECT nodehandle FROM nodes WHERE share = ?5))), \
             nodesOfShares({COLUMNS}) AS (\
               SELECT {COLUMNS} FROM nodes WHERE ?5 != 0 AND share = ?5), \
             nodesCTE({COLUMNS}) AS (\
               SELECT {COLUMNS} FROM nodes \
               WHERE parenthandle IN (SELECT nodehandle FROM ancestors) \
               UNION ALL \
               SELECT {COLUMNS_N} FROM nodes AS N \
               INNER JOIN nodesCTE AS P ON (N.parenthandle = P.nodehandle \
                 AND (P.flags & ?1 = 0) \
                 AND (?6 != 1 OR (P.flags & ?7) = 0) \
                 AND P.type != 0)), \
             nodesAfterFilters({ORDER_COLUMNS}) AS (\
               SELECT {ORDER_COLUMNS} FROM nodesOfShares WHERE {MATCH} \
               UNION ALL \
               SELECT {ORDER_COLUMNS} FROM nodesCTE WHERE {MATCH} \
               GROUP BY nodehandle) \
             SELECT {ORDER_COLUMNS} FROM nodesAfterFilters \
             ORDER BY {} LIMIT ?8 OFFSET ?9",
            order.clause()
        );

        let ancestors = search_filter.ancestors();
        let prune_sensitive =
            i64::from(search_filter.sensitivity() == SensitivityPolicy::ExcludeSensitive);

        self.with_filter(search_filter, || {
            self.with_cancel(cancel, || {
                let result = self.conn.prepare_cached(&sql).and_then(|mut stmt| {
                    collect_nodes(stmt.query(params![
                        crate::node::flags::IS_VERSION as i64,
                        ancestors[0] as i64,
                        ancestors[1] as i64,
                        ancestors[2] as i64,
                        i64::from(search_filter.included_shares()),
                        prune_sensitive,
                        crate::node::flags::IS_MARKED_SENSITIVE as i64,
                        page.limit(),
                        page.offset as i64,
                    ])?)
                });
                self.check(result, "search nodes with filter", true)
                    .unwrap_or_default()
            })
        })
    }

    /// Distinct tags across all nodes, optionally narrowed by a pattern.
    /// Each stored tag sequence is split on the delimiter and every tag is
    /// revalidated against the pattern before entering the set.
    pub fn get_all_node_tags(
        &self,
        search: &str,
        cancel: Option<&CancelToken>,
    ) -> Option<BTreeSet<String>> {
        let narrowed = search.chars().any(|c| c != '*');
        let pattern = filter::ensure_asterisk_surround(search);

        self.with_cancel(cancel, || {
            let result = self
                .conn
                .prepare_cached(
                    "SELECT DISTINCT tags FROM nodes \
                     WHERE tags IS NOT NULL AND tags != '' \
                     AND (?1 = 0 OR (tags REGEXP ?2))",
                )
                .and_then(|mut stmt| {
                    let mut rows = stmt.query(params![i64::from(narrowed), pattern])?;
                    let mut tags = BTreeSet::new();
                    while let Some(row) = rows.next()? {
                        let sequence: String = row.get(0)?;
                        for tag in sequence.split(crate::node::TAG_DELIMITER) {
                            if tag.is_empty() {
                                continue;
                            }
                            if !narrowed || wildcard_match(&pattern, tag) {
                                tags.insert(tag.to_string());
                            }
                        }
                    }
                    Ok(tags)
                });
            self.check(result, "get all node tags", true)
        })
    }

    /// Handles of favourite nodes below `root`, capped at `count` when
    /// nonzero.
    pub fn get_favourites(
        &self,
        root: Handle,
        count: u32,
        cancel: Option<&CancelToken>,
    ) -> Vec<Handle> {
        self.with_cancel(cancel, || {
            let result = self
                .conn
                .prepare_cached(
                    // previous versions excluded via P.type != 0, measurably
                    // faster than testing the flags column
                    "WITH nodesCTE(nodehandle, parenthandle, fav, type) AS (\
                     SELECT nodehandle, parenthandle, fav, type FROM nodes \
                     WHERE parenthandle = ?1 \
                     UNION ALL \
                     SELECT N.nodehandle, N.parenthandle, N.fav, N.type \
                     FROM nodes AS N INNER JOIN nodesCTE AS P \
                     ON (N.parenthandle = P.nodehandle AND P.type != 0)) \
                     SELECT node.nodehandle FROM nodesCTE AS node WHERE node.fav = 1",
                )
                .and_then(|mut stmt| {
                    let mut rows = stmt.query(params![root as i64])?;
                    let mut handles = Vec::new();
                    while let Some(row) = rows.next()? {
                        handles.push(row.get::<_, i64>(0)? as Handle);
                        if count != 0 && handles.len() as u32 >= count {
                            break;
                        }
                    }
                    Ok(handles)
                });
            self.check(result, "get favourite handles", true)
                .unwrap_or_default()
        })
    }

    /// Recently created file nodes, excluding versions and rubbish, newest
    /// first.
    pub fn get_recent_nodes(&self, page: NodeSearchPage, since: i64) -> Vec<(Handle, NodeSerialized)> {
        let exclude =
            (crate::node::flags::IS_VERSION | crate::node::flags::IS_IN_RUBBISH) as i64;
        let result = self
            .conn
            .prepare_cached(
                "SELECT n1.nodehandle, n1.counter, n1.node FROM nodes n1 \
                 WHERE n1.flags & ?1 = 0 AND n1.ctime >= ?2 AND n1.type = 0 \
                 ORDER BY n1.ctime DESC LIMIT ?3 OFFSET ?4",
            )
            .and_then(|mut stmt| {
                collect_nodes(stmt.query(params![
                    exclude,
                    since,
                    page.limit(),
                    page.offset as i64
                ])?)
            });
        self.check(result, "get recent nodes", false)
            .unwrap_or_default()
    }

    // ---- teardown ----------------------------------------------------------

    /// Closes the store and deletes its files.
    pub fn remove(self) {
        if self.in_transaction() {
            self.abort();
        }
        let path = self.path.clone();
        drop(self);
        let _ = std::fs::remove_file(&path);
        for suffix in SIDECAR_SUFFIXES {
            let _ = std::fs::remove_file(sidecar(&path, suffix));
        }
    }

    // ---- internals ---------------------------------------------------------

    fn with_filter<R>(&self, search_filter: &NodeSearchFilter, f: impl FnOnce() -> R) -> R {
        *self.active_filter.lock().unwrap() = Some(search_filter.clone());
        let result = f();
        *self.active_filter.lock().unwrap() = None;
        result
    }

    fn with_cancel<R>(&self, cancel: Option<&CancelToken>, f: impl FnOnce() -> R) -> R {
        if let Some(token) = cancel {
            let token = token.clone();
            self.conn
                .progress_handler(NUM_VM_INSTRUCTIONS, Some(move || token.is_cancelled()));
        }
        let result = f();
        if cancel.is_some() {
            self.conn.progress_handler(NUM_VM_INSTRUCTIONS, None::<fn() -> bool>);
        }
        result
    }
}

impl Drop for NodeStore {
    fn drop(&mut self) {
        if self.in_transaction() {
            tracing::debug!(db = ?self.path, "rolling back open transaction on close");
            let _ = self.conn.execute_batch("ROLLBACK");
        }
        tracing::debug!(db = ?self.path, "database closed");
    }
}

/// Drains a result set of `(handle, counter, node)` rows, skipping rows with
/// an empty node blob.
fn collect_nodes(mut rows: rusqlite::Rows<'_>) -> rusqlite::Result<Vec<(Handle, NodeSerialized)>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let handle = row.get::<_, i64>(0)? as Handle;
        let counter: Vec<u8> = row.get(1).unwrap_or_default();
        let node: Vec<u8> = row.get(2)?;
        if node.is_empty() {
            continue;
        }
        out.push((handle, NodeSerialized { counter, node }));
    }
    Ok(out)
}

fn register_sql_functions(
    conn: &Connection,
    active_filter: &Arc<Mutex<Option<NodeSearchFilter>>>,
) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "getmimetype",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let name: Option<String> = ctx.get(0)?;
            Ok(name
                .map(|n| mime_category(&n) as u8 as i64)
                .unwrap_or(crate::node::MimeCategory::Others as u8 as i64))
        },
    )?;

    conn.create_scalar_function(
        "getsizefromcounter",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let blob: Vec<u8> = ctx.get(0)?;
            Ok(NodeCounter::deserialize(&blob)
                .map(|c| c.storage)
                .unwrap_or(-1))
        },
    )?;

    conn.create_scalar_function("regexp", 2, FunctionFlags::SQLITE_UTF8, |ctx| {
        let pattern: String = ctx.get(0)?;
        let text: Option<String> = ctx.get(1)?;
        Ok(i64::from(
            text.is_some_and(|t| wildcard_match(&pattern, &t)),
        ))
    })?;

    let slot = Arc::clone(active_filter);
    conn.create_scalar_function("matchfilter", 9, FunctionFlags::SQLITE_UTF8, move |ctx| {
        let guard = slot.lock().unwrap();
        let Some(search_filter) = guard.as_ref() else {
            tracing::error!("matchfilter invoked with no active filter");
            return Ok(0i64);
        };

        let name: Option<String> = ctx.get(5)?;
        let description: Option<String> = ctx.get(6)?;
        let tags: Option<String> = ctx.get(7)?;
        let row = filter::FilterRow {
            flags: ctx.get::<i64>(0)? as u64,
            node_type: ctx.get(1)?,
            ctime: ctx.get(2)?,
            mtime: ctx.get(3)?,
            mime: ctx.get(4)?,
            name: name.as_deref(),
            description: description.as_deref(),
            tags: tags.as_deref(),
            fav: ctx.get::<i64>(8)? != 0,
        };
        Ok(i64::from(search_filter.matches_row(&row)))
    })?;

    conn.create_collation("NATURALNOCASE", |a, b| natural_nocase_cmp(a, b))?;

    Ok(())
}

/// Adds any expected column the table lacks, then populates derivable ones
/// from the serialized node in one transaction. Idempotent: a partial prior
/// run converges here.
fn add_and_populate_columns(conn: &Connection, mut cols: Vec<NewColumn>) -> anyhow::Result<()> {
    // skip existing columns
    let mut existing = BTreeSet::new();
    {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_xinfo('nodes')")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            existing.insert(row.get::<_, String>(0)?);
        }
    }
    cols.retain(|c| !existing.contains(c.name));
    if cols.is_empty() {
        return Ok(());
    }

    for col in &cols {
        conn.execute_batch(&format!(
            "ALTER TABLE nodes ADD COLUMN '{}' {}",
            col.name, col.decl
        ))
        .with_context(|| format!("adding nodes.{} column", col.name))?;
    }

    migrate_data_to_columns(conn, cols)
}

fn migrate_data_to_columns(conn: &Connection, mut cols: Vec<NewColumn>) -> anyhow::Result<()> {
    cols.retain(|c| c.extract.is_some());
    if cols.is_empty() {
        return Ok(());
    }

    tracing::info!("migrating database: populating new columns");

    let mut new_values: Vec<(i64, Vec<Value>)> = Vec::new();
    let mut total_rows = 0u64;
    {
        let mut stmt = conn.prepare("SELECT nodehandle, node FROM nodes")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            total_rows += 1;
            let handle: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let Some(node) = Node::deserialize(&blob) else {
                tracing::warn!(handle, "skipping undecodable node during migration");
                continue;
            };

            let mut any_valid = false;
            let values: Vec<Value> = cols
                .iter()
                .map(|c| match (c.extract.expect("retained above"))(&node) {
                    Some(value) => {
                        any_valid = true;
                        value
                    }
                    None => Value::Null,
                })
                .collect();

            if any_valid {
                new_values.push((handle, values));
            }
        }
    }

    tracing::info!(
        affected = new_values.len(),
        total = total_rows,
        "migrating database rows"
    );
    if new_values.is_empty() {
        return Ok(());
    }

    conn.execute_batch("BEGIN").context("migration BEGIN")?;
    {
        let assignments: Vec<String> = cols
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", c.name, i + 1))
            .collect();
        let sql = format!(
            "UPDATE nodes SET {} WHERE nodehandle = ?{}",
            assignments.join(", "),
            cols.len() + 1
        );
        let mut stmt = conn.prepare(&sql)?;
        for (handle, mut values) in new_values {
            values.push(Value::Integer(handle));
            stmt.execute(params_from_iter(values))
                .context("populating migrated columns")?;
        }
    }
    conn.execute_batch("COMMIT").context("migration COMMIT")?;

    Ok(())
}

fn create_indexes(conn: &Connection) {
    // the primary key carries its own index; these cover the hot lookups
    for sql in [
        "CREATE INDEX IF NOT EXISTS parenthandleindex ON nodes (parenthandle)",
        "CREATE INDEX IF NOT EXISTS fingerprintindex ON nodes (fingerprint)",
        "CREATE INDEX IF NOT EXISTS origfingerprintindex ON nodes (origFingerprint)",
        "CREATE INDEX IF NOT EXISTS shareindex ON nodes (share)",
        "CREATE INDEX IF NOT EXISTS favindex ON nodes (fav)",
        "CREATE INDEX IF NOT EXISTS ctimeindex ON nodes (ctime)",
    ] {
        if let Err(err) = conn.execute_batch(sql) {
            tracing::error!(%err, sql, "failed to create index");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::filter::BoolFilter;
    use super::*;
    use crate::node::{NodeType, attr};

    fn open_store(dir: &Path) -> NodeStore {
        NodeStore::open(&DbConfig::new(dir, "tester"), None).expect("open store")
    }

    fn file_node(handle: Handle, parent: Handle, name: &str) -> Node {
        let mut node = Node::new(handle, parent, NodeType::File, name);
        node.ctime = 1_000 + handle as i64;
        node.counter = NodeCounter {
            files: 1,
            storage: 100 * handle as i64,
            ..Default::default()
        };
        node
    }

    #[test]
    fn node_roundtrip_preserves_blob_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut node = file_node(42, 1, "Budget 2023.pdf");
        node.attrs.insert(attr::FAV.into(), "1".into());
        node.attrs.insert(attr::TAGS.into(), "work,q3".into());
        assert!(store.put_node(&node));

        let fetched = store.get_node(42).expect("node present");
        assert_eq!(fetched.node, node.serialize());
        let decoded = fetched.decode().unwrap();
        assert_eq!(decoded, node);
        assert!(decoded.favourite());
    }

    #[test]
    fn virtual_columns_compute_and_resist_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.put_node(&file_node(7, 1, "paper.pdf"));

        let (size, node_type, _) = store.get_node_size_type_flags(7).unwrap();
        assert_eq!(size, 700);
        assert_eq!(node_type, NodeType::File as u8);

        // generated columns reject writes at the SQL level
        assert!(
            store
                .conn
                .execute("UPDATE nodes SET sizeVirtual = 1 WHERE nodehandle = 7", [])
                .is_err()
        );

        let mime: i64 = store
            .conn
            .query_row(
                "SELECT mimetypeVirtual FROM nodes WHERE nodehandle = 7",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(mime, crate::node::MimeCategory::Pdf as u8 as i64);
    }

    #[test]
    fn counter_update_changes_size_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let node = file_node(5, 1, "a.bin");
        store.put_node(&node);

        let counter = NodeCounter {
            files: 1,
            storage: 9999,
            ..Default::default()
        };
        store.update_counter(5, &counter.serialize());

        let (size, _, _) = store.get_node_size_type_flags(5).unwrap();
        assert_eq!(size, 9999);
        // blob untouched
        assert_eq!(store.get_node(5).unwrap().node, node.serialize());
    }

    #[test]
    fn counter_and_flags_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.put_node(&file_node(6, 1, "b.bin"));

        store.update_counter_and_flags(
            6,
            crate::node::flags::IS_IN_RUBBISH,
            &NodeCounter::default().serialize(),
        );
        let (_, _, node_flags) = store.get_node_size_type_flags(6).unwrap();
        assert_eq!(node_flags, crate::node::flags::IS_IN_RUBBISH);
    }

    #[test]
    fn lookups_by_fingerprint_and_roots() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let root = Node::new(1, crate::node::UNDEF, NodeType::Root, "");
        store.put_node(&root);
        let mut a = file_node(10, 1, "a.txt");
        a.fingerprint = vec![1, 2, 3];
        let mut b = file_node(11, 1, "b.txt");
        b.fingerprint = vec![1, 2, 3];
        b.attrs.insert(attr::ORIG_FINGERPRINT.into(), "OFP".into());
        store.put_node(&a);
        store.put_node(&b);

        assert_eq!(store.get_nodes_by_fingerprint(&[1, 2, 3]).len(), 2);
        assert!(store.get_node_by_fingerprint(&[1, 2, 3]).is_some());
        assert!(store.get_node_by_fingerprint(&[9]).is_none());
        assert_eq!(store.get_nodes_by_orig_fingerprint("OFP").len(), 1);

        let roots = store.get_root_nodes();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].0, 1);
    }

    #[test]
    fn share_mask_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let mut node = file_node(20, 1, "shared.txt");
        node.share = crate::node::share::LINK;
        store.put_node(&node);
        store.put_node(&file_node(21, 1, "plain.txt"));

        assert_eq!(
            store
                .get_nodes_with_shares_or_link(crate::node::share::LINK)
                .len(),
            1
        );
        assert!(
            store
                .get_nodes_with_shares_or_link(crate::node::share::IN_SHARE)
                .is_empty()
        );
    }

    #[test]
    fn children_filter_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        let mut a = file_node(10, 1, "Budget 2023.pdf");
        a.attrs.insert(attr::FAV.into(), "1".into());
        let b = file_node(11, 1, "budget 2024.pdf");
        let c = file_node(12, 1, "notes.txt");
        store.put_node(&a);
        store.put_node(&b);
        store.put_node(&c);

        let search = NodeSearchFilter::new()
            .by_parent(1)
            .by_name("budget")
            .use_and_for_text_query(true);
        let hits = store.get_children(
            &search,
            SearchOrder::DefaultAsc,
            None,
            NodeSearchPage::default(),
        );
        let handles: Vec<Handle> = hits.iter().map(|(h, _)| *h).collect();
        assert_eq!(handles, vec![10, 11]);

        let fav_only = search.by_fav(BoolFilter::OnlyTrue);
        let hits = store.get_children(
            &fav_only,
            SearchOrder::DefaultAsc,
            None,
            NodeSearchPage::default(),
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 10);
    }

    #[test]
    fn recursive_search_descends_and_skips_file_children() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        store.put_node(&Node::new(2, 1, NodeType::Folder, "docs"));
        store.put_node(&file_node(10, 2, "deep budget.pdf"));
        // version under a file: flagged and parented by the file
        let mut version = file_node(11, 10, "deep budget.pdf");
        version.flags = crate::node::flags::IS_VERSION;
        store.put_node(&version);

        let search = NodeSearchFilter::new().by_ancestors(&[1]).by_name("budget");
        let hits = store.search_nodes(
            &search,
            SearchOrder::DefaultAsc,
            None,
            NodeSearchPage::default(),
        );
        let handles: Vec<Handle> = hits.iter().map(|(h, _)| *h).collect();
        assert_eq!(handles, vec![10]);
    }

    #[test]
    fn sensitive_subtrees_prune_when_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        let mut private_dir = Node::new(2, 1, NodeType::Folder, "private");
        private_dir.attrs.insert(attr::SENSITIVE.into(), "1".into());
        store.put_node(&private_dir);
        store.put_node(&file_node(10, 2, "hidden.txt"));
        store.put_node(&file_node(11, 1, "visible.txt"));

        let all = store.search_nodes(
            &NodeSearchFilter::new().by_ancestors(&[1]).by_name("txt"),
            SearchOrder::DefaultAsc,
            None,
            NodeSearchPage::default(),
        );
        assert_eq!(all.len(), 2);

        let visible_only = store.search_nodes(
            &NodeSearchFilter::new()
                .by_ancestors(&[1])
                .by_name("txt")
                .by_sensitivity(SensitivityPolicy::ExcludeSensitive),
            SearchOrder::DefaultAsc,
            None,
            NodeSearchPage::default(),
        );
        let handles: Vec<Handle> = visible_only.iter().map(|(h, _)| *h).collect();
        assert_eq!(handles, vec![11]);
    }

    #[test]
    fn natural_nocase_places_nfd_next_to_nfc() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        // NFD: e + combining acute; NFC: precomposed é
        let nfd = "re\u{0301}sume\u{0301}.txt";
        let nfc = "r\u{e9}sum\u{e9}.txt";
        store.put_node(&file_node(10, 1, "apple.txt"));
        store.put_node(&file_node(11, 1, nfd));
        store.put_node(&file_node(12, 1, nfc));
        store.put_node(&file_node(13, 1, "zebra.txt"));

        let fetched = store.get(11).unwrap();
        assert_eq!(fetched.serialize(), store.get_node(11).unwrap().node);
        assert_eq!(fetched.name, nfd);

        let hits = store.get_children(
            &NodeSearchFilter::new().by_parent(1),
            SearchOrder::DefaultAsc,
            None,
            NodeSearchPage::default(),
        );
        let handles: Vec<Handle> = hits.iter().map(|(h, _)| *h).collect();
        assert_eq!(handles.first(), Some(&10));
        assert_eq!(handles.last(), Some(&13));
        // the two é variants are neighbours
        let pos_nfd = handles.iter().position(|&h| h == 11).unwrap();
        let pos_nfc = handles.iter().position(|&h| h == 12).unwrap();
        assert_eq!(pos_nfd.abs_diff(pos_nfc), 1);
    }

    #[test]
    fn tags_aggregate_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        let mut a = file_node(10, 1, "a");
        a.attrs.insert(attr::TAGS.into(), "work,home".into());
        let mut b = file_node(11, 1, "b");
        b.attrs.insert(attr::TAGS.into(), "work,taxes".into());
        store.put_node(&a);
        store.put_node(&b);
        store.put_node(&file_node(12, 1, "c"));

        let tags = store.get_all_node_tags("", None).unwrap();
        assert_eq!(
            tags.into_iter().collect::<Vec<_>>(),
            vec!["home", "taxes", "work"]
        );

        let tags = store.get_all_node_tags("tax", None).unwrap();
        assert_eq!(tags.into_iter().collect::<Vec<_>>(), vec!["taxes"]);
    }

    #[test]
    fn favourites_descend_with_cap() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        store.put_node(&Node::new(2, 1, NodeType::Folder, "sub"));
        for (handle, parent) in [(10, 1u64), (11, 2), (12, 2)] {
            let mut node = file_node(handle, parent, "f");
            node.attrs.insert(attr::FAV.into(), "1".into());
            store.put_node(&node);
        }
        store.put_node(&file_node(13, 2, "plain"));

        let favs = store.get_favourites(1, 0, None);
        assert_eq!(favs.len(), 3);
        let capped = store.get_favourites(1, 2, None);
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn recents_exclude_versions_and_rubbish() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        store.put_node(&file_node(10, 1, "new.txt"));
        let mut old = file_node(11, 1, "old.txt");
        old.ctime = 10;
        store.put_node(&old);
        let mut versioned = file_node(12, 1, "v.txt");
        versioned.flags = crate::node::flags::IS_VERSION;
        store.put_node(&versioned);
        let mut binned = file_node(13, 1, "gone.txt");
        binned.flags = crate::node::flags::IS_IN_RUBBISH;
        store.put_node(&binned);

        let recents = store.get_recent_nodes(NodeSearchPage::default(), 500);
        let handles: Vec<Handle> = recents.iter().map(|(h, _)| *h).collect();
        assert_eq!(handles, vec![10]);
    }

    #[test]
    fn ancestry_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        store.put_node(&Node::new(2, 1, NodeType::Folder, "a"));
        store.put_node(&Node::new(3, 2, NodeType::Folder, "b"));
        store.put_node(&file_node(10, 3, "leaf.txt"));

        assert!(store.is_ancestor(10, 1, None));
        assert!(store.is_ancestor(3, 1, None));
        assert!(!store.is_ancestor(2, 3, None));

        assert_eq!(store.nodes_count(), 4);
        assert_eq!(store.children_count(1), 1);
        assert_eq!(store.children_count_by_type(3, NodeType::File as u8), 1);
        assert!(
            store
                .child_node_by_name_type(3, "leaf.txt", NodeType::File as u8)
                .is_some()
        );
    }

    #[test]
    fn cancellation_returns_empty_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.put_node(&Node::new(1, crate::node::UNDEF, NodeType::Root, ""));
        store.begin();
        for handle in 10..2600u64 {
            store.put_node(&file_node(handle, 1, &format!("file{handle}.txt")));
        }
        store.commit();

        let token = CancelToken::new();
        token.cancel();
        let hits = store.search_nodes(
            &NodeSearchFilter::new().by_ancestors(&[1]),
            SearchOrder::DefaultAsc,
            Some(&token),
            NodeSearchPage::default(),
        );
        assert!(hits.is_empty());

        // same query without cancellation sees everything
        let hits = store.search_nodes(
            &NodeSearchFilter::new().by_ancestors(&[1]),
            SearchOrder::DefaultAsc,
            None,
            NodeSearchPage::default(),
        );
        assert_eq!(hits.len(), 2590);
    }

    #[test]
    fn statecache_roundtrip_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        assert!(store.state_put(StateId::SequenceNumber as u32, b"S1"));
        assert!(store.state_put(StateId::Session as u32, b"sess"));
        assert_eq!(
            store.state_get(StateId::SequenceNumber as u32).as_deref(),
            Some(&b"S1"[..])
        );

        store.state_rewind();
        let mut seen = Vec::new();
        while let Some((id, _)) = store.state_next() {
            seen.push(id);
        }
        assert_eq!(seen, vec![1, 2]);

        assert!(store.state_del(StateId::Session as u32));
        assert!(store.state_get(StateId::Session as u32).is_none());
        store.state_truncate();
        assert!(store.state_get(StateId::SequenceNumber as u32).is_none());
    }

    #[test]
    fn transactions_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        store.begin();
        assert!(store.in_transaction());
        store.put_node(&file_node(10, 1, "temp.txt"));
        store.abort();
        assert!(!store.in_transaction());
        assert!(store.get_node(10).is_none());

        store.begin();
        store.put_node(&file_node(10, 1, "kept.txt"));
        store.commit();
        assert!(store.get_node(10).is_some());
    }

    #[test]
    fn always_transacted_mode_opens_transactions_for_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DbConfig::new(dir.path(), "tester");
        config.always_transacted = true;
        let store = NodeStore::open(&config, None).unwrap();

        assert!(!store.in_transaction());
        store.put_node(&file_node(9, 1, "x.txt"));
        assert!(store.in_transaction());
        store.commit();
        assert!(store.get_node(9).is_some());
    }

    #[test]
    fn migration_is_idempotent_and_converges() {
        let dir = tempfile::tempdir().unwrap();

        // seed a store, then simulate a partially migrated legacy table by
        // dropping two of the new columns
        {
            let store = open_store(dir.path());
            let mut node = file_node(10, 1, "tagged.txt");
            node.mtime = 777;
            node.attrs.insert(attr::TAGS.into(), "keep".into());
            node.attrs.insert(attr::LABEL.into(), "3".into());
            store.put_node(&node);
            store
                .conn
                .execute_batch("ALTER TABLE nodes DROP COLUMN tags")
                .unwrap();
            store
                .conn
                .execute_batch("ALTER TABLE nodes DROP COLUMN label")
                .unwrap();
        }

        // reopening adds the columns back and repopulates them from the blob
        {
            let store = open_store(dir.path());
            let (tags, label): (Option<String>, i64) = store
                .conn
                .query_row(
                    "SELECT tags, label FROM nodes WHERE nodehandle = 10",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .unwrap();
            assert_eq!(tags.as_deref(), Some("keep"));
            assert_eq!(label, 3);
        }

        // and doing it again changes nothing
        {
            let store = open_store(dir.path());
            assert_eq!(store.nodes_count(), 1);
        }
    }

    #[test]
    fn legacy_file_recycles_on_open() {
        let dir = tempfile::tempdir().unwrap();

        // create a "legacy" database at the previous schema version
        let legacy_cfg = DbConfig::new(dir.path(), "acct");
        let legacy_path = database_path(dir.path(), "acct", LEGACY_DB_VERSION);
        {
            let conn = Connection::open(&legacy_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS statecache (\
                 id INTEGER PRIMARY KEY ASC NOT NULL, content BLOB NOT NULL)",
            )
            .unwrap();
        }
        assert!(legacy_path.exists());

        let store = NodeStore::open(&legacy_cfg, None).unwrap();
        assert!(!legacy_path.exists());
        assert_eq!(
            store.path(),
            database_path(dir.path(), "acct", DB_VERSION)
        );
    }

    #[test]
    fn error_callback_sees_disk_full() {
        // classification only: a real ENOSPC is not something a unit test
        // can provoke portably
        let dir = tempfile::tempdir().unwrap();
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let store = {
            let seen = std::rc::Rc::clone(&seen);
            NodeStore::open(
                &DbConfig::new(dir.path(), "tester"),
                Some(Box::new(move |e| seen.borrow_mut().push(e))),
            )
            .unwrap()
        };
        store.notify(DbError::Full);
        store.notify(DbError::Io);
        assert_eq!(*seen.borrow(), vec![DbError::Full, DbError::Io]);
    }
}
