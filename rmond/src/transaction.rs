//! Protocol row lifecycle: get, get-next and the multi-phase SET exchange.
//!
//! A management session changes tables through an [`Exchange`]: the ordered
//! list of variable bindings of one request PDU. The protocol layer drives
//! the exchange through the phases of [`Phase`] by calling
//! [`TableHandler::process`] once per phase, or lets [`TableHandler::apply`]
//! run the whole SET sequence with rollback.
//!
//! Row creation and deletion follow the RowStatus convention:
//!
//! - **reserve-1** on `createAndGo`/`createAndWait` inserts a fresh row in
//!   the `notInService` state (failing with `InconsistentValue` if the key is
//!   taken); writes to other columns of an existing row save the old value
//!   so that undo can restore it.
//! - **reserve-2** hands every request to the table's [`RowActor`] for
//!   cross-column validation.
//! - **action** writes the new column values.
//! - **commit** turns reserved rows `active` or `notReady`, erases rows
//!   receiving `destroy`, and lets the actor react to the created rows.
//! - **undo**/**free** restore saved values and erase every row the exchange
//!   reserved but never committed. Both are idempotent.
//!
//! Processing of a phase stops at the first failing request, whose status
//! records the failure.

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::dispatch::Dispatcher;
use crate::error::{ProtocolError, Status};
use crate::table::{Key, RowRef, Table};
use crate::value::Value;

/// RowStatus values, with their RFC 2579 codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowStatus {
    /// The row is available for use.
    Active,
    /// The row exists but is not available for use.
    NotInService,
    /// The row exists but lacks information to become active.
    NotReady,
    /// Create the row and make it active in one step.
    CreateAndGo,
    /// Create the row and leave it inactive.
    CreateAndWait,
    /// Delete the row.
    Destroy,
}

impl RowStatus {
    /// Returns the protocol code of this status.
    pub fn code(self) -> i32 {
        match self {
            Self::Active => 1,
            Self::NotInService => 2,
            Self::NotReady => 3,
            Self::CreateAndGo => 4,
            Self::CreateAndWait => 5,
            Self::Destroy => 6,
        }
    }

    /// Decodes a protocol code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Active),
            2 => Some(Self::NotInService),
            3 => Some(Self::NotReady),
            4 => Some(Self::CreateAndGo),
            5 => Some(Self::CreateAndWait),
            6 => Some(Self::Destroy),
            _ => None,
        }
    }

    /// Decodes a cell value.
    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_integer().and_then(Self::from_code)
    }
}

impl From<RowStatus> for Value {
    fn from(status: RowStatus) -> Self {
        Value::Integer(status.code())
    }
}

/// Request processing phases, with net-snmp mode numbers as codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Read a cell.
    Get,
    /// Read the next cell in column-major order.
    GetNext,
    /// First reservation pass of a SET.
    Reserve1,
    /// Second reservation pass of a SET.
    Reserve2,
    /// Apply the new values.
    Action,
    /// Make the change permanent.
    Commit,
    /// Release reservations after a failed reserve pass.
    Free,
    /// Revert an applied action.
    Undo,
}

impl Phase {
    /// Every phase, in declaration order.
    pub const ALL: [Phase; 8] = [
        Phase::Get,
        Phase::GetNext,
        Phase::Reserve1,
        Phase::Reserve2,
        Phase::Action,
        Phase::Commit,
        Phase::Free,
        Phase::Undo,
    ];

    /// Returns the mode number of this phase.
    pub fn code(self) -> i32 {
        match self {
            Self::Get => 160,
            Self::GetNext => 161,
            Self::Reserve1 => 0,
            Self::Reserve2 => 1,
            Self::Action => 2,
            Self::Commit => 3,
            Self::Free => 4,
            Self::Undo => 5,
        }
    }

    /// Decodes a mode number.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.code() == code)
    }
}

/// One variable binding of an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Row key. For get-next, the cursor; [`Key::empty`] starts the walk.
    pub key: Key,
    /// Column id. For get-next, `0` starts at the first column.
    pub column: u32,
    /// Value to write, or the value read.
    pub value: Option<Value>,
    /// Outcome of the last phase that touched this binding.
    pub status: Status,
}

impl Request {
    /// Creates a read of one cell.
    pub fn get(key: Key, column: u32) -> Self {
        Self {
            key,
            column,
            value: None,
            status: Status::NoError,
        }
    }

    /// Creates a read of the cell following `(column, key)`.
    pub fn get_next(key: Key, column: u32) -> Self {
        Self::get(key, column)
    }

    /// Creates a write of one cell.
    pub fn set(key: Key, column: u32, value: impl Into<Value>) -> Self {
        Self {
            key,
            column,
            value: Some(value.into()),
            status: Status::NoError,
        }
    }
}

/// A row touched by the reserve phase and not yet committed.
#[derive(Debug)]
struct PendingRow {
    request: usize,
    row: RowRef,
    /// Saved value of the request's column; `None` for a freshly created row.
    backup: Option<Value>,
}

/// The bindings of one request plus the rows it has reserved so far.
#[derive(Debug, Default)]
pub struct Exchange {
    requests: Vec<Request>,
    pending: Vec<PendingRow>,
}

impl Exchange {
    /// Creates an exchange over `requests`.
    pub fn new(requests: Vec<Request>) -> Self {
        Self {
            requests,
            pending: Vec::new(),
        }
    }

    /// Returns the bindings.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    /// Consumes the exchange, returning its bindings.
    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }

    /// Returns the first failing binding's status, or `NoError`.
    pub fn status(&self) -> Status {
        self.requests
            .iter()
            .map(|r| r.status)
            .find(|s| s.is_error())
            .unwrap_or_default()
    }

    /// Returns the number of rows reserved and not yet committed or released.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn fail(&mut self, index: usize, error: ProtocolError) -> ProtocolError {
        if let Some(request) = self.requests.get_mut(index) {
            request.status = error.status();
        }
        error
    }
}

/// Table-specific hooks into the SET sequence.
pub trait RowActor: Send + Sync {
    /// Cross-validates one binding during reserve-2.
    ///
    /// # Errors
    ///
    /// Returns the protocol error that aborts the exchange.
    fn reserve2(&self, table: &Table, request: &Request) -> Result<(), ProtocolError> {
        let _ = (table, request);
        Ok(())
    }

    /// Called once per commit with every row the exchange created.
    fn committed(&self, table: &Table, created: &[RowRef]) {
        let _ = (table, created);
    }
}

/// The actor of tables that need no extra validation or side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct Trivial;

impl RowActor for Trivial {}

type PhaseHandler = fn(&TableHandler, &Table, &mut Exchange) -> Result<(), ProtocolError>;

/// Routes protocol phases on one table.
pub struct TableHandler {
    table: Weak<Table>,
    actor: Arc<dyn RowActor>,
    phases: Dispatcher<i32, PhaseHandler>,
}

impl TableHandler {
    /// Creates a handler answering only get and get-next.
    pub fn read_only(table: &Arc<Table>) -> Self {
        Self {
            table: Arc::downgrade(table),
            actor: Arc::new(Trivial),
            phases: Dispatcher::new(unknown as PhaseHandler)
                .route(Phase::Get.code(), get)
                .route(Phase::GetNext.code(), get_next),
        }
    }

    /// Creates a handler supporting the full SET sequence.
    pub fn mutable(table: &Arc<Table>, actor: Arc<dyn RowActor>) -> Self {
        Self {
            table: Arc::downgrade(table),
            actor,
            phases: Dispatcher::new(unknown as PhaseHandler)
                .route(Phase::Get.code(), get)
                .route(Phase::GetNext.code(), get_next)
                .route(Phase::Reserve1.code(), reserve1)
                .route(Phase::Reserve2.code(), reserve2)
                .route(Phase::Action.code(), action)
                .route(Phase::Commit.code(), commit)
                .route(Phase::Free.code(), rollback)
                .route(Phase::Undo.code(), rollback),
        }
    }

    /// Returns the table, unless it has been torn down.
    pub fn table(&self) -> Option<Arc<Table>> {
        self.table.upgrade()
    }

    /// Returns `true` if the handler accepts SET phases.
    pub fn is_writable(&self) -> bool {
        self.phases.handles(&Phase::Reserve1.code())
    }

    /// Processes one phase, identified by its mode number.
    ///
    /// Unknown or unsupported modes answer `GenErr`, as does a handler
    /// whose table is gone.
    pub fn process(&self, mode: i32, exchange: &mut Exchange) -> Status {
        let Some(table) = self.table.upgrade() else {
            debug!(mode, "table is gone");
            return Status::GenErr;
        };
        match (self.phases.resolve(&mode))(self, &table, exchange) {
            Ok(()) => Status::NoError,
            Err(e) => e.status(),
        }
    }

    /// Runs reserve-1, reserve-2, action and commit, rolling back on failure.
    pub fn apply(&self, exchange: &mut Exchange) -> Status {
        for phase in [Phase::Reserve1, Phase::Reserve2, Phase::Action, Phase::Commit] {
            let status = self.process(phase.code(), exchange);
            if status.is_error() {
                self.process(Phase::Undo.code(), exchange);
                self.process(Phase::Free.code(), exchange);
                return status;
            }
        }
        Status::NoError
    }
}

impl fmt::Debug for TableHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandler")
            .field("table", &self.table.upgrade().map(|t| t.name().to_string()))
            .field("phases", &self.phases)
            .finish_non_exhaustive()
    }
}

fn unknown(_: &TableHandler, table: &Table, _: &mut Exchange) -> Result<(), ProtocolError> {
    warn!(table = table.name(), "unsupported request mode");
    Err(ProtocolError::GenErr)
}

fn get(_: &TableHandler, table: &Table, exchange: &mut Exchange) -> Result<(), ProtocolError> {
    for i in 0..exchange.requests.len() {
        let request = &exchange.requests[i];
        let value = table
            .find(&request.key)
            .and_then(|row| row.get(request.column));
        match value {
            Some(value) => exchange.requests[i].value = Some(value),
            None => return Err(exchange.fail(i, ProtocolError::NoSuchObject)),
        }
    }
    Ok(())
}

fn get_next(_: &TableHandler, table: &Table, exchange: &mut Exchange) -> Result<(), ProtocolError> {
    for i in 0..exchange.requests.len() {
        let request = &exchange.requests[i];
        let mut found = None;
        for column in table.schema().columns() {
            let candidate = if column.id < request.column {
                continue;
            } else if column.id == request.column {
                table.next_after(&request.key)
            } else {
                table.first()
            };
            if let Some(row) = candidate {
                found = row.get(column.id).map(|v| (column.id, row.key().clone(), v));
                break;
            }
        }
        match found {
            Some((column, key, value)) => {
                let request = &mut exchange.requests[i];
                request.column = column;
                request.key = key;
                request.value = Some(value);
            }
            None => return Err(exchange.fail(i, ProtocolError::NoSuchObject)),
        }
    }
    Ok(())
}

fn reserve1(_: &TableHandler, table: &Table, exchange: &mut Exchange) -> Result<(), ProtocolError> {
    let schema = table.schema();
    for i in 0..exchange.requests.len() {
        let request = &exchange.requests[i];
        let Some(value) = request.value.clone() else {
            return Err(exchange.fail(i, ProtocolError::WrongValue));
        };
        let Some(column) = schema.column(request.column) else {
            return Err(exchange.fail(i, ProtocolError::NoSuchObject));
        };

        if Some(column.id) == schema.row_status() {
            match RowStatus::from_value(&value) {
                Some(RowStatus::CreateAndGo | RowStatus::CreateAndWait) => {
                    // Inserted right away so concurrent sessions see the key
                    // as taken; a collision is DuplicateKey, hence
                    // InconsistentValue.
                    let reserved = table.new_row(request.key.clone()).and_then(|row| {
                        row.put(column.id, RowStatus::NotInService.into())?;
                        table.insert(Arc::clone(&row))?;
                        Ok(row)
                    });
                    let row = match reserved {
                        Ok(row) => row,
                        Err(e) => return Err(exchange.fail(i, e.into())),
                    };
                    debug!(table = table.name(), key = %row.key(), "row reserved");
                    exchange.pending.push(PendingRow {
                        request: i,
                        row,
                        backup: None,
                    });
                }
                Some(RowStatus::Destroy) => {}
                _ => return Err(exchange.fail(i, ProtocolError::WrongValue)),
            }
            continue;
        }

        if !column.mutable || schema.index_position(column.id).is_some() {
            return Err(exchange.fail(i, ProtocolError::NoSuchObject));
        }
        if column.protocol_type != value.protocol_type() {
            return Err(exchange.fail(i, ProtocolError::WrongValue));
        }
        if let Some(row) = table.find(&request.key) {
            let Some(backup) = row.get(column.id) else {
                return Err(exchange.fail(i, ProtocolError::NoSuchObject));
            };
            exchange.pending.push(PendingRow {
                request: i,
                row,
                backup: Some(backup),
            });
        }
    }
    Ok(())
}

fn reserve2(handler: &TableHandler, table: &Table, exchange: &mut Exchange) -> Result<(), ProtocolError> {
    for i in 0..exchange.requests.len() {
        if let Err(e) = handler.actor.reserve2(table, &exchange.requests[i]) {
            return Err(exchange.fail(i, e));
        }
    }
    Ok(())
}

fn action(_: &TableHandler, table: &Table, exchange: &mut Exchange) -> Result<(), ProtocolError> {
    let row_status = table.schema().row_status();
    for i in 0..exchange.requests.len() {
        let request = &exchange.requests[i];
        if Some(request.column) == row_status {
            continue;
        }
        let Some(value) = request.value.clone() else {
            return Err(exchange.fail(i, ProtocolError::WrongValue));
        };
        let Some(row) = table.find(&request.key) else {
            return Err(exchange.fail(i, ProtocolError::NoSuchObject));
        };
        if let Err(e) = row.set(request.column, value) {
            return Err(exchange.fail(i, e.into()));
        }
    }
    Ok(())
}

fn commit(handler: &TableHandler, table: &Table, exchange: &mut Exchange) -> Result<(), ProtocolError> {
    let Some(status_column) = table.schema().row_status() else {
        exchange.pending.clear();
        return Ok(());
    };

    let mut created: Vec<RowRef> = Vec::new();
    for pending in exchange.pending.drain(..) {
        if pending.backup.is_some() {
            continue;
        }
        let status = exchange.requests[pending.request]
            .value
            .as_ref()
            .and_then(RowStatus::from_value);
        let initial = match status {
            Some(RowStatus::CreateAndWait) => RowStatus::NotReady,
            _ => RowStatus::Active,
        };
        pending.row.put(status_column, initial.into())?;
        created.push(pending.row);
    }

    for request in &exchange.requests {
        if request.column != status_column
            || request.value.as_ref().and_then(RowStatus::from_value) != Some(RowStatus::Destroy)
        {
            continue;
        }
        if let Some(row) = table.find(&request.key) {
            table.erase_row(&row);
            debug!(table = table.name(), key = %row.key(), "row destroyed");
        }
    }

    let live: Vec<RowRef> = created
        .into_iter()
        .filter(|row| table.find(row.key()).is_some_and(|r| Arc::ptr_eq(&r, row)))
        .collect();
    if !live.is_empty() {
        handler.actor.committed(table, &live);
    }
    Ok(())
}

fn rollback(_: &TableHandler, table: &Table, exchange: &mut Exchange) -> Result<(), ProtocolError> {
    while let Some(pending) = exchange.pending.pop() {
        match pending.backup {
            Some(backup) => {
                let Some(request) = exchange.requests.get(pending.request) else {
                    continue;
                };
                if let Err(e) = pending.row.put(request.column, backup) {
                    warn!(
                        table = table.name(),
                        key = %pending.row.key(),
                        column = request.column,
                        "cannot restore column: {e}"
                    );
                }
            }
            None => {
                if table.erase_row(&pending.row) {
                    debug!(
                        table = table.name(),
                        key = %pending.row.key(),
                        "reservation released"
                    );
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Column, Schema};
    use crate::value::{Oid, ProtocolType};

    fn table() -> Arc<Table> {
        Arc::new(Table::new(
            Schema::new(
                "subs",
                Oid::new([1, 3, 6, 1, 4, 1, 99]),
                vec![
                    Column::read_only(1, ProtocolType::OctetString),
                    Column::read_write(2, ProtocolType::Integer),
                    Column::read_only(3, ProtocolType::Counter64),
                    Column::read_write(4, ProtocolType::Integer),
                ],
                vec![1],
                Some(4),
            )
            .unwrap(),
        ))
    }

    fn key(id: &str) -> Key {
        Key::new(vec![Value::from(id)])
    }

    fn create(id: &str, status: RowStatus) -> Request {
        Request::set(key(id), 4, status)
    }

    #[test]
    fn test_phase_codes() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_code(phase.code()), Some(phase));
        }
        assert_eq!(Phase::Reserve1.code(), 0);
        assert_eq!(Phase::Get.code(), 160);
        assert!(Phase::from_code(42).is_none());
    }

    #[test]
    fn test_row_status_codes() {
        assert_eq!(RowStatus::from_code(4), Some(RowStatus::CreateAndGo));
        assert_eq!(RowStatus::Destroy.code(), 6);
        assert!(RowStatus::from_code(0).is_none());
        assert_eq!(RowStatus::from_value(&Value::from("x")), None);
    }

    #[test]
    fn test_create_and_go_commits_active() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut exchange = Exchange::new(vec![
            create("a", RowStatus::CreateAndGo),
            Request::set(key("a"), 2, 30),
        ]);
        assert_eq!(handler.apply(&mut exchange), Status::NoError);
        assert_eq!(exchange.pending(), 0);

        let row = table.find(&key("a")).unwrap();
        assert_eq!(row.get(4), Some(RowStatus::Active.into()));
        assert_eq!(row.get(2), Some(Value::Integer(30)));
    }

    #[test]
    fn test_create_and_wait_commits_not_ready() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut exchange = Exchange::new(vec![create("a", RowStatus::CreateAndWait)]);
        assert_eq!(handler.apply(&mut exchange), Status::NoError);
        let row = table.find(&key("a")).unwrap();
        assert_eq!(row.get(4), Some(RowStatus::NotReady.into()));
    }

    #[test]
    fn test_reserved_row_is_visible_before_commit() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut exchange = Exchange::new(vec![
            create("a", RowStatus::CreateAndGo),
            Request::set(key("a"), 2, 8),
        ]);
        assert_eq!(handler.process(Phase::Reserve1.code(), &mut exchange), Status::NoError);
        let row = table.find(&key("a")).unwrap();
        assert_eq!(row.get(4), Some(RowStatus::NotInService.into()));

        for phase in [Phase::Reserve2, Phase::Action, Phase::Commit] {
            assert_eq!(handler.process(phase.code(), &mut exchange), Status::NoError);
        }
        assert_eq!(row.get(2), Some(Value::Integer(8)));
        assert_eq!(row.get(4), Some(RowStatus::Active.into()));
        assert_eq!(exchange.pending(), 0);
    }

    #[test]
    fn test_undo_erases_reservation() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut exchange = Exchange::new(vec![
            create("a", RowStatus::CreateAndGo),
            Request::set(key("a"), 2, 8),
        ]);
        assert_eq!(handler.process(Phase::Reserve1.code(), &mut exchange), Status::NoError);
        assert_eq!(exchange.pending(), 2);
        assert_eq!(handler.process(Phase::Undo.code(), &mut exchange), Status::NoError);
        assert!(table.find(&key("a")).is_none());
        assert_eq!(handler.process(Phase::Free.code(), &mut exchange), Status::NoError);
        assert_eq!(exchange.pending(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_interleaved_sessions_reserving_one_key() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut first = Exchange::new(vec![create("vm1", RowStatus::CreateAndGo)]);
        let mut second = Exchange::new(vec![create("vm1", RowStatus::CreateAndGo)]);

        assert_eq!(handler.process(Phase::Reserve1.code(), &mut first), Status::NoError);
        assert_eq!(
            handler.process(Phase::Reserve1.code(), &mut second),
            Status::InconsistentValue
        );
        assert_eq!(second.pending(), 0);
        handler.process(Phase::Free.code(), &mut second);

        // Freeing the losing session leaves the winner's reservation alone.
        let reserved = table.find(&key("vm1")).unwrap();
        for phase in [Phase::Reserve2, Phase::Action, Phase::Commit] {
            assert_eq!(handler.process(phase.code(), &mut first), Status::NoError);
        }
        let row = table.find(&key("vm1")).unwrap();
        assert!(Arc::ptr_eq(&row, &reserved));
        assert_eq!(row.get(4), Some(RowStatus::Active.into()));
    }

    #[test]
    fn test_same_key_created_twice_in_one_exchange() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut exchange = Exchange::new(vec![
            create("a", RowStatus::CreateAndGo),
            create("a", RowStatus::CreateAndWait),
        ]);
        assert_eq!(handler.apply(&mut exchange), Status::InconsistentValue);
        assert_eq!(exchange.requests()[1].status, Status::InconsistentValue);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_create_is_inconsistent() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut first = Exchange::new(vec![create("a", RowStatus::CreateAndGo)]);
        assert_eq!(handler.apply(&mut first), Status::NoError);

        let mut second = Exchange::new(vec![create("a", RowStatus::CreateAndWait)]);
        assert_eq!(handler.apply(&mut second), Status::InconsistentValue);
        assert_eq!(second.requests()[0].status, Status::InconsistentValue);
        assert_eq!(
            table.find(&key("a")).unwrap().get(4),
            Some(RowStatus::Active.into())
        );
    }

    #[test]
    fn test_bad_row_status_is_wrong_value() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        for code in [1, 2, 3, 7] {
            let mut exchange = Exchange::new(vec![Request::set(key("a"), 4, code)]);
            assert_eq!(handler.apply(&mut exchange), Status::WrongValue);
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_failure_rolls_back_whole_exchange() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut seed = Exchange::new(vec![
            create("a", RowStatus::CreateAndGo),
            Request::set(key("a"), 2, 5),
        ]);
        assert_eq!(handler.apply(&mut seed), Status::NoError);

        let mut exchange = Exchange::new(vec![
            Request::set(key("a"), 2, 99),
            create("b", RowStatus::CreateAndGo),
            Request::set(key("b"), 2, "not an integer"),
        ]);
        assert_eq!(handler.apply(&mut exchange), Status::WrongValue);
        assert_eq!(exchange.requests()[2].status, Status::WrongValue);
        assert_eq!(exchange.status(), Status::WrongValue);

        assert!(table.find(&key("b")).is_none());
        assert_eq!(table.find(&key("a")).unwrap().get(2), Some(Value::Integer(5)));
    }

    #[test]
    fn test_undo_restores_backup() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut seed = Exchange::new(vec![
            create("a", RowStatus::CreateAndGo),
            Request::set(key("a"), 2, 5),
        ]);
        handler.apply(&mut seed);

        let mut exchange = Exchange::new(vec![Request::set(key("a"), 2, 6)]);
        for phase in [Phase::Reserve1, Phase::Reserve2, Phase::Action] {
            assert_eq!(handler.process(phase.code(), &mut exchange), Status::NoError);
        }
        assert_eq!(table.find(&key("a")).unwrap().get(2), Some(Value::Integer(6)));
        handler.process(Phase::Undo.code(), &mut exchange);
        let row = table.find(&key("a")).unwrap();
        assert_eq!(row.get(2), Some(Value::Integer(5)));
        assert_eq!(row.get(4), Some(RowStatus::Active.into()));
    }

    #[test]
    fn test_destroy_erases_row() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        handler.apply(&mut Exchange::new(vec![create("vm1", RowStatus::CreateAndGo)]));
        assert!(table.find(&key("vm1")).is_some());

        let mut exchange = Exchange::new(vec![create("vm1", RowStatus::Destroy)]);
        assert_eq!(handler.apply(&mut exchange), Status::NoError);
        assert!(table.find(&key("vm1")).is_none());
    }

    #[test]
    fn test_read_only_columns_are_rejected() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        handler.apply(&mut Exchange::new(vec![create("a", RowStatus::CreateAndGo)]));

        let mut index = Exchange::new(vec![Request::set(key("a"), 1, "b")]);
        assert_eq!(handler.apply(&mut index), Status::NoSuchObject);
        let mut counter = Exchange::new(vec![Request::set(key("a"), 3, 9_u64)]);
        assert_eq!(handler.apply(&mut counter), Status::NoSuchObject);
        let mut missing = Exchange::new(vec![Request::set(key("a"), 9, 1)]);
        assert_eq!(handler.apply(&mut missing), Status::NoSuchObject);
    }

    #[test]
    fn test_set_on_absent_row_fails() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        let mut exchange = Exchange::new(vec![Request::set(key("ghost"), 2, 1)]);
        assert_eq!(handler.apply(&mut exchange), Status::NoSuchObject);
        assert!(table.is_empty());
    }

    #[test]
    fn test_get_and_get_next() {
        let table = table();
        let handler = TableHandler::mutable(&table, Arc::new(Trivial));
        handler.apply(&mut Exchange::new(vec![
            create("a", RowStatus::CreateAndGo),
            create("b", RowStatus::CreateAndGo),
            Request::set(key("b"), 2, 7),
        ]));

        let mut get = Exchange::new(vec![Request::get(key("b"), 2)]);
        assert_eq!(handler.process(Phase::Get.code(), &mut get), Status::NoError);
        assert_eq!(get.requests()[0].value, Some(Value::Integer(7)));

        let mut missing = Exchange::new(vec![Request::get(key("z"), 2)]);
        assert_eq!(handler.process(Phase::Get.code(), &mut missing), Status::NoSuchObject);

        // Column-major walk: (1,a) (1,b) (2,a) (2,b) (3,a) ...
        let mut walk = Vec::new();
        let mut cursor = Request::get_next(Key::empty(), 0);
        loop {
            let mut exchange = Exchange::new(vec![cursor.clone()]);
            if handler.process(Phase::GetNext.code(), &mut exchange).is_error() {
                break;
            }
            cursor = exchange.into_requests().remove(0);
            walk.push((cursor.column, cursor.key.clone()));
        }
        assert_eq!(walk.len(), 8);
        assert_eq!(walk[0], (1, key("a")));
        assert_eq!(walk[1], (1, key("b")));
        assert_eq!(walk[2], (2, key("a")));
        assert_eq!(walk[7], (4, key("b")));
    }

    #[test]
    fn test_read_only_handler_rejects_sets() {
        let table = table();
        let handler = TableHandler::read_only(&table);
        assert!(!handler.is_writable());
        let mut exchange = Exchange::new(vec![create("a", RowStatus::CreateAndGo)]);
        assert_eq!(handler.apply(&mut exchange), Status::GenErr);
        assert!(table.is_empty());
    }

    #[test]
    fn test_handler_of_dropped_table() {
        let table = table();
        let handler = TableHandler::read_only(&table);
        drop(table);
        assert!(handler.table().is_none());
        let mut exchange = Exchange::new(vec![Request::get(key("a"), 2)]);
        assert_eq!(handler.process(Phase::Get.code(), &mut exchange), Status::GenErr);
    }

    #[test]
    fn test_actor_sees_created_rows() {
        use std::sync::Mutex;

        #[derive(Default)]
        struct Recorder(Mutex<Vec<Key>>);

        impl RowActor for Recorder {
            fn reserve2(&self, _: &Table, request: &Request) -> Result<(), ProtocolError> {
                if request.key == key("veto") {
                    Err(ProtocolError::InconsistentValue)
                } else {
                    Ok(())
                }
            }

            fn committed(&self, _: &Table, created: &[RowRef]) {
                self.0
                    .lock()
                    .unwrap()
                    .extend(created.iter().map(|r| r.key().clone()));
            }
        }

        let table = table();
        let recorder = Arc::new(Recorder::default());
        let handler = TableHandler::mutable(&table, recorder.clone());

        let mut ok = Exchange::new(vec![create("a", RowStatus::CreateAndGo)]);
        assert_eq!(handler.apply(&mut ok), Status::NoError);
        let mut vetoed = Exchange::new(vec![create("veto", RowStatus::CreateAndGo)]);
        assert_eq!(handler.apply(&mut vetoed), Status::InconsistentValue);

        assert_eq!(*recorder.0.lock().unwrap(), vec![key("a")]);
        assert!(table.find(&key("veto")).is_none());
    }
}
