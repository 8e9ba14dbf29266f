//! In-process graph driver
//!
//! Keeps labelled nodes in memory and understands a small Cypher subset:
//!
//! ```text
//! RETURN <literal> [AS <name>]
//! CREATE (n:Label {key: $param, key: 'literal', ...})
//! MATCH (n:Label [{key: value, ...}]) RETURN count(n) [AS <name>]
//! MATCH (n:Label [{key: value, ...}]) RETURN n
//! MATCH (n:Label [{key: value, ...}]) [DETACH] DELETE n
//! ```
//!
//! Nodes are unique on their `id` property per label. Writes are staged in
//! the transaction and applied atomically on commit; a transaction that is
//! rolled back or dropped leaves nothing behind. Failures can be injected
//! with [`MemoryDriver::inject_fault`] and slowed down with
//! [`MemoryDriver::set_latency`].

use crate::driver::{
    AccessMode, DriverSession, DriverTransaction, GraphDriver, Params, QueryResult, QuerySummary,
    Record,
};
use crate::error::{Neo4jError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Failures the memory driver can simulate, reported with the status
/// codes a Neo4j server would send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Deadlock,
    ConnectionReset,
    ServiceUnavailable,
    ConstraintViolation,
    SyntaxError,
    Unauthorized,
    DatabaseError,
}

impl Fault {
    pub fn to_error(self) -> Neo4jError {
        let message = match self {
            Fault::Deadlock => {
                "Neo.TransientError.Transaction.DeadlockDetected: ForsetiClient[1] can't acquire ExclusiveLock"
            }
            Fault::ConnectionReset => "IOError: Connection reset by peer",
            Fault::ServiceUnavailable => {
                "Neo.TransientError.General.DatabaseUnavailable: The database is not currently available"
            }
            Fault::ConstraintViolation => {
                "Neo.ClientError.Schema.ConstraintValidationFailed: Node already exists with label"
            }
            Fault::SyntaxError => "Neo.ClientError.Statement.SyntaxError: Invalid input",
            Fault::Unauthorized => {
                "Neo.ClientError.Security.Unauthorized: The client is unauthorized due to authentication failure"
            }
            Fault::DatabaseError => {
                "Neo.DatabaseError.General.UnknownError: An unknown error occurred"
            }
        };
        Neo4jError::from_server_message(message)
    }
}

#[derive(Default)]
struct MemoryState {
    /// Committed nodes, by label
    nodes: Mutex<HashMap<String, Vec<Record>>>,
    faults: Mutex<VecDeque<Fault>>,
    persistent_fault: Mutex<Option<Fault>>,
    latency: Mutex<Duration>,
    open_fault: Mutex<Option<Fault>>,
    open_latency: Mutex<Duration>,
    queries: Mutex<Vec<String>>,
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    closed: AtomicBool,
}

impl MemoryState {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Neo4jError::ConnectionError("driver is closed".to_string()));
        }
        Ok(())
    }

    fn next_fault(&self) -> Option<Fault> {
        self.faults
            .lock()
            .pop_front()
            .or(*self.persistent_fault.lock())
    }
}

/// In-memory [`GraphDriver`]
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<MemoryState>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next query with `fault`. Queued faults fire in order.
    pub fn inject_fault(&self, fault: Fault) {
        self.state.faults.lock().push_back(fault);
    }

    /// Fail every query with `fault` until cleared with `None`.
    pub fn set_persistent_fault(&self, fault: Option<Fault>) {
        *self.state.persistent_fault.lock() = fault;
    }

    /// Delay applied to every query.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Fail every `open_session` with `fault` until cleared with `None`.
    pub fn set_open_fault(&self, fault: Option<Fault>) {
        *self.state.open_fault.lock() = fault;
    }

    /// Delay applied to every `open_session`.
    pub fn set_open_latency(&self, latency: Duration) {
        *self.state.open_latency.lock() = latency;
    }

    /// Every query text run so far, in order.
    pub fn executed_queries(&self) -> Vec<String> {
        self.state.queries.lock().clone()
    }

    /// Committed nodes with `label`.
    pub fn node_count(&self, label: &str) -> usize {
        self.state
            .nodes
            .lock()
            .get(label)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> u64 {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> u64 {
        self.state.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.state.rollbacks.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl GraphDriver for MemoryDriver {
    async fn open_session(&self) -> Result<Box<dyn DriverSession>> {
        self.state.check_open()?;

        let latency = *self.state.open_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let fault = *self.state.open_fault.lock();
        if let Some(fault) = fault {
            return Err(fault.to_error());
        }

        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            closed: false,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::Release);
        debug!("Memory driver closed");
        Ok(())
    }
}

struct MemorySession {
    state: Arc<MemoryState>,
    closed: bool,
}

#[async_trait]
impl DriverSession for MemorySession {
    async fn begin_transaction(
        &mut self,
        mode: AccessMode,
        _timeout: Duration,
    ) -> Result<Box<dyn DriverTransaction>> {
        self.state.check_open()?;
        if self.closed {
            return Err(Neo4jError::ConnectionError("session is closed".to_string()));
        }
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            mode,
            staged: Vec::new(),
            finished: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum WriteOp {
    Create { label: String, props: Record },
    Delete { label: String, filter: Record },
}

struct MemoryTransaction {
    state: Arc<MemoryState>,
    mode: AccessMode,
    staged: Vec<WriteOp>,
    finished: bool,
}

impl MemoryTransaction {
    /// Committed nodes with this transaction's staged writes applied.
    fn view(&self, label: &str) -> Vec<Record> {
        let mut nodes = self
            .state
            .nodes
            .lock()
            .get(label)
            .cloned()
            .unwrap_or_default();
        for op in &self.staged {
            apply(&mut nodes, label, op);
        }
        nodes
    }

    fn execute(&mut self, query: &str, params: &Params) -> Result<Vec<Record>> {
        let statement = parse(query, params)?;

        match statement {
            Statement::Return { key, value } => {
                let mut record = Record::new();
                record.insert(key, value);
                Ok(vec![record])
            }
            Statement::Create { label, props } => {
                self.require_write()?;
                if let Some(id) = props.get("id") {
                    if self
                        .view(&label)
                        .iter()
                        .any(|node| node.get("id") == Some(id))
                    {
                        return Err(constraint_error(&label, id));
                    }
                }
                self.staged.push(WriteOp::Create { label, props });
                Ok(Vec::new())
            }
            Statement::Count { label, filter, key } => {
                let count = self
                    .view(&label)
                    .iter()
                    .filter(|node| matches_filter(node, &filter))
                    .count();
                let mut record = Record::new();
                record.insert(key, Value::from(count as i64));
                Ok(vec![record])
            }
            Statement::Match { label, filter, var } => Ok(self
                .view(&label)
                .into_iter()
                .filter(|node| matches_filter(node, &filter))
                .map(|node| {
                    let mut record = Record::new();
                    record.insert(var.clone(), Value::Object(node));
                    record
                })
                .collect()),
            Statement::Delete { label, filter } => {
                self.require_write()?;
                self.staged.push(WriteOp::Delete { label, filter });
                Ok(Vec::new())
            }
        }
    }

    fn require_write(&self) -> Result<()> {
        if self.mode == AccessMode::Read {
            return Err(Neo4jError::from_server_message(
                "Neo.ClientError.Statement.AccessMode: Writing in read access mode not allowed",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverTransaction for MemoryTransaction {
    async fn run(&mut self, query: &str, params: &Params) -> Result<QueryResult> {
        if self.finished {
            return Err(Neo4jError::QueryError(
                "transaction already finished".to_string(),
            ));
        }
        self.state.check_open()?;

        let start = Instant::now();
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.state.queries.lock().push(query.to_string());
        if let Some(fault) = self.state.next_fault() {
            return Err(fault.to_error());
        }

        let records = self.execute(query, params)?;
        Ok(QueryResult {
            records,
            summary: QuerySummary {
                query: query.to_string(),
                access_mode: self.mode,
                elapsed: start.elapsed(),
            },
        })
    }

    async fn commit(&mut self) -> Result<()> {
        if self.finished {
            return Err(Neo4jError::QueryError(
                "transaction already finished".to_string(),
            ));
        }
        self.finished = true;
        self.state.check_open()?;

        let mut nodes = self.state.nodes.lock();

        // Validate against whatever committed while this transaction ran
        let mut touched: HashMap<String, Vec<Record>> = HashMap::new();
        for op in &self.staged {
            let label = match op {
                WriteOp::Create { label, .. } | WriteOp::Delete { label, .. } => label,
            };
            let current = touched
                .entry(label.clone())
                .or_insert_with(|| nodes.get(label).cloned().unwrap_or_default());
            if let WriteOp::Create { props, .. } = op {
                if let Some(id) = props.get("id") {
                    if current.iter().any(|node| node.get("id") == Some(id)) {
                        return Err(constraint_error(label, id));
                    }
                }
            }
            apply(current, label, op);
        }

        nodes.extend(touched);
        drop(nodes);

        self.staged.clear();
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.finished {
            self.finished = true;
            self.staged.clear();
            self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn apply(nodes: &mut Vec<Record>, label: &str, op: &WriteOp) {
    match op {
        WriteOp::Create { label: l, props } if l == label => nodes.push(props.clone()),
        WriteOp::Delete { label: l, filter } if l == label => {
            nodes.retain(|node| !matches_filter(node, filter))
        }
        _ => {}
    }
}

fn matches_filter(node: &Record, filter: &Record) -> bool {
    filter.iter().all(|(key, value)| node.get(key) == Some(value))
}

fn constraint_error(label: &str, id: &Value) -> Neo4jError {
    Neo4jError::from_server_message(format!(
        "Neo.ClientError.Schema.ConstraintValidationFailed: Node already exists with label `{}` and property `id` = {}",
        label, id
    ))
}

#[derive(Debug)]
enum Statement {
    Return { key: String, value: Value },
    Create { label: String, props: Record },
    Count { label: String, filter: Record, key: String },
    Match { label: String, filter: Record, var: String },
    Delete { label: String, filter: Record },
}

fn syntax_error(query: &str) -> Neo4jError {
    Neo4jError::from_server_message(format!(
        "Neo.ClientError.Statement.SyntaxError: Invalid input in `{}`",
        query
    ))
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let head = text.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(text[keyword.len()..].trim_start())
    } else {
        None
    }
}

fn parse(query: &str, params: &Params) -> Result<Statement> {
    let text = query.trim().trim_end_matches(';').trim();

    if let Some(rest) = strip_keyword(text, "RETURN") {
        let (expr, alias) = split_alias(rest);
        let value = parse_value(expr, params).ok_or_else(|| syntax_error(query))?;
        return Ok(Statement::Return {
            key: alias.unwrap_or(expr).to_string(),
            value,
        });
    }

    if let Some(rest) = strip_keyword(text, "CREATE") {
        let (pattern, tail) = parse_node(rest, params).ok_or_else(|| syntax_error(query))?;
        if !tail.is_empty() {
            return Err(syntax_error(query));
        }
        return Ok(Statement::Create {
            label: pattern.label,
            props: pattern.props,
        });
    }

    if let Some(rest) = strip_keyword(text, "MATCH") {
        let (pattern, tail) = parse_node(rest, params).ok_or_else(|| syntax_error(query))?;
        let var = pattern.var;

        if let Some(returned) = strip_keyword(tail, "RETURN") {
            let (expr, alias) = split_alias(returned);
            let compact: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
            if compact.eq_ignore_ascii_case(&format!("count({})", var)) {
                return Ok(Statement::Count {
                    label: pattern.label,
                    filter: pattern.props,
                    key: alias.unwrap_or(expr).to_string(),
                });
            }
            if expr == var {
                return Ok(Statement::Match {
                    label: pattern.label,
                    filter: pattern.props,
                    var,
                });
            }
            return Err(syntax_error(query));
        }

        let delete = strip_keyword(tail, "DETACH")
            .and_then(|t| strip_keyword(t, "DELETE"))
            .or_else(|| strip_keyword(tail, "DELETE"));
        if delete.map(str::trim) == Some(var.as_str()) {
            return Ok(Statement::Delete {
                label: pattern.label,
                filter: pattern.props,
            });
        }
    }

    Err(syntax_error(query))
}

fn split_alias(expr: &str) -> (&str, Option<&str>) {
    let lower = expr.to_ascii_lowercase();
    match lower.rfind(" as ") {
        Some(pos) => (expr[..pos].trim(), Some(expr[pos + 4..].trim())),
        None => (expr.trim(), None),
    }
}

struct NodePattern {
    var: String,
    label: String,
    props: Record,
}

/// Parse `(var:Label {props})`, returning the pattern and the remaining text.
fn parse_node<'a>(text: &'a str, params: &Params) -> Option<(NodePattern, &'a str)> {
    let inner_start = text.strip_prefix('(')?;
    let close = inner_start.find(')')?;
    let inner = &inner_start[..close];
    let tail = inner_start[close + 1..].trim();

    let (head, props_text) = match inner.find('{') {
        Some(open) => {
            let end = inner.rfind('}')?;
            (&inner[..open], Some(&inner[open + 1..end]))
        }
        None => (inner, None),
    };

    let (var, label) = head.trim().split_once(':')?;
    let var = var.trim();
    let label = label.trim();
    if var.is_empty() || label.is_empty() {
        return None;
    }

    let props = match props_text {
        Some(body) => parse_props(body, params)?,
        None => Record::new(),
    };

    Some((
        NodePattern {
            var: var.to_string(),
            label: label.to_string(),
            props,
        },
        tail,
    ))
}

fn parse_props(body: &str, params: &Params) -> Option<Record> {
    let mut props = Record::new();
    for entry in split_top_level(body) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (key, value) = entry.split_once(':')?;
        props.insert(key.trim().to_string(), parse_value(value.trim(), params)?);
    }
    Some(props)
}

/// Split on commas that are not inside quotes.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in body.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, ',') => {
                parts.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts
}

fn parse_value(text: &str, params: &Params) -> Option<Value> {
    if let Some(name) = text.strip_prefix('$') {
        // Missing parameters bind as null
        return Some(params.get(name).cloned().unwrap_or(Value::Null));
    }

    for quote in ['\'', '"'] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return Some(Value::String(text[1..text.len() - 1].to_string()));
        }
    }

    match text.to_ascii_lowercase().as_str() {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }

    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    text.parse::<f64>().ok().map(Value::from)
}
