use std::collections::HashMap;

use sqlparser::ast::{
    self, Assignment, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, TableWithJoins, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::ascii::TimetableFormat;
use crate::limits::MAX_COLUMN_WIDTH;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    ConfigureConference {
        timezone: Option<String>,
        default_duration: Option<Ms>,
    },
    InsertOwner {
        kind: OwnerKind,
        id: Ulid,
        name: Option<String>,
        position: u32,
    },
    DeleteOwner {
        kind: OwnerKind,
        id: Ulid,
    },
    InsertSubmission {
        submission: Submission,
    },
    UpdateSubmissionState {
        id: Ulid,
        state: SubmissionState,
    },
    InsertAvailability {
        id: Ulid,
        owner_id: Ulid,
        start: Ms,
        end: Ms,
    },
    BatchInsertAvailabilities {
        entries: Vec<(Ulid, Ulid, Ms, Ms)>, // (id, owner_id, start, end)
    },
    DeleteAvailability {
        id: Ulid,
    },
    InsertSlot {
        slot: TalkSlot,
    },
    UpdateSlot {
        id: Ulid,
        patch: SlotPatch,
    },
    DeleteSlot {
        id: Ulid,
    },
    Freeze {
        version: String,
        comment: Option<String>,
        notify: bool,
    },
    Unfreeze {
        version: VersionRef,
    },
    SelectConference,
    SelectOwners {
        kind: OwnerKind,
    },
    SelectSubmissions,
    SelectSchedules,
    SelectSlots {
        version: VersionRef,
    },
    SelectAvailability {
        owner_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectCommonAvailability {
        owner_ids: Vec<Ulid>,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectFreeTime {
        room_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectChanges {
        version: VersionRef,
        base: Option<VersionRef>,
    },
    SelectNotifications {
        version: VersionRef,
    },
    SelectWarnings {
        version: VersionRef,
    },
    SelectTimetable {
        version: VersionRef,
        format: TimetableFormat,
        width: Option<usize>,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if let Some(cmd) = parse_listen(sql.trim()) {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Every statement of a simple-query string, in order.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let commands = split_statements(sql)
        .into_iter()
        .map(parse_sql)
        .collect::<Result<Vec<_>, _>>()?;
    if commands.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(commands)
}

/// Split on `;` outside quoted strings and identifiers.
fn split_statements(sql: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in sql.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, ';') => {
                parts.push(&sql[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&sql[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

/// Table a SELECT reads from, without interpreting its filters. Used to
/// describe statements that still carry `$n` placeholders.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_listen(sql: &str) -> Option<Command> {
    let mut words = sql.trim_end_matches(';').split_whitespace();
    let verb = words.next()?.to_ascii_uppercase();
    let channel = words.next()?.trim_matches('"').to_string();
    if words.next().is_some() {
        return None;
    }
    match verb.as_str() {
        "LISTEN" => Some(Command::Listen { channel }),
        "UNLISTEN" if channel == "*" => Some(Command::UnlistenAll),
        "UNLISTEN" => Some(Command::Unlisten { channel }),
        _ => None,
    }
}

// ── INSERT ────────────────────────────────────────────────────

const ROOM_COLUMNS: &[&str] = &["id", "name", "position"];
const SPEAKER_COLUMNS: &[&str] = &["id", "name"];
const SUBMISSION_COLUMNS: &[&str] = &["id", "title", "state", "speakers", "duration"];
const AVAILABILITY_COLUMNS: &[&str] = &["id", "owner_id", "start", "end"];
const SLOT_COLUMNS: &[&str] = &["id", "submission_id", "room_id", "start", "end", "description"];
const SCHEDULE_COLUMNS: &[&str] = &["version", "comment", "notify"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "rooms" => {
            let row = single_row(insert_rows(insert, "rooms", ROOM_COLUMNS)?, "rooms")?;
            Ok(Command::InsertOwner {
                kind: OwnerKind::Room,
                id: parse_ulid(row.required("id")?)?,
                name: row.get("name").map(parse_text_or_null).transpose()?.flatten(),
                position: row.get("position").map(parse_u32).transpose()?.unwrap_or(0),
            })
        }
        "speakers" => {
            let row = single_row(insert_rows(insert, "speakers", SPEAKER_COLUMNS)?, "speakers")?;
            Ok(Command::InsertOwner {
                kind: OwnerKind::Speaker,
                id: parse_ulid(row.required("id")?)?,
                name: row.get("name").map(parse_text_or_null).transpose()?.flatten(),
                position: 0,
            })
        }
        "submissions" => {
            let row = single_row(
                insert_rows(insert, "submissions", SUBMISSION_COLUMNS)?,
                "submissions",
            )?;
            let state = match row.get("state") {
                Some(expr) => parse_state(expr)?,
                None => SubmissionState::Submitted,
            };
            Ok(Command::InsertSubmission {
                submission: Submission {
                    id: parse_ulid(row.required("id")?)?,
                    title: parse_text(row.required("title")?)?,
                    state,
                    speakers: row.get("speakers").map(parse_ulid_list).transpose()?.unwrap_or_default(),
                    duration: row.get("duration").map(parse_i64_or_null).transpose()?.flatten(),
                },
            })
        }
        "availabilities" => {
            let rows = insert_rows(insert, "availabilities", AVAILABILITY_COLUMNS)?;
            let mut entries = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let entry = (|| {
                    Ok::<_, SqlError>((
                        parse_ulid(row.required("id")?)?,
                        parse_ulid(row.required("owner_id")?)?,
                        parse_i64(row.required("start")?)?,
                        parse_i64(row.required("end")?)?,
                    ))
                })()
                .map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?;
                entries.push(entry);
            }
            if let [(id, owner_id, start, end)] = entries[..] {
                Ok(Command::InsertAvailability {
                    id,
                    owner_id,
                    start,
                    end,
                })
            } else {
                Ok(Command::BatchInsertAvailabilities { entries })
            }
        }
        "slots" => {
            let row = single_row(insert_rows(insert, "slots", SLOT_COLUMNS)?, "slots")?;
            let opt_ulid = |col| row.get(col).map(parse_ulid_or_null).transpose().map(Option::flatten);
            let opt_i64 = |col| row.get(col).map(parse_i64_or_null).transpose().map(Option::flatten);
            Ok(Command::InsertSlot {
                slot: TalkSlot {
                    id: parse_ulid(row.required("id")?)?,
                    submission_id: opt_ulid("submission_id")?,
                    room_id: opt_ulid("room_id")?,
                    start: opt_i64("start")?,
                    end: opt_i64("end")?,
                    description: row.get("description").map(parse_text_or_null).transpose()?.flatten(),
                    is_visible: false,
                },
            })
        }
        "schedules" => {
            let row = single_row(insert_rows(insert, "schedules", SCHEDULE_COLUMNS)?, "schedules")?;
            Ok(Command::Freeze {
                version: parse_text(row.required("version")?)?,
                comment: row.get("comment").map(parse_text_or_null).transpose()?.flatten(),
                notify: row.get("notify").map(parse_bool).transpose()?.unwrap_or(false),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column)
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

/// Rows of an INSERT. Without a column list, values are taken in the
/// order of `columns`.
fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    columns: &[&str],
) -> Result<Vec<Row<'a>>, SqlError> {
    let names: Vec<String> = if insert.columns.is_empty() {
        columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(unknown) = names.iter().find(|n| !columns.contains(&n.as_str())) {
        return Err(SqlError::UnknownColumn(table, unknown.clone()));
    }

    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = body.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }

    values
        .rows
        .iter()
        .map(|row| {
            // Without a column list a shorter row fills the leading columns.
            let arity_ok = if insert.columns.is_empty() {
                row.len() <= names.len()
            } else {
                row.len() == names.len()
            };
            if !arity_ok {
                return Err(SqlError::WrongArity(table, names.len(), row.len()));
            }
            Ok(Row {
                table,
                cells: names.iter().cloned().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn single_row<'a>(mut rows: Vec<Row<'a>>, table: &'static str) -> Result<Row<'a>, SqlError> {
    if rows.len() != 1 {
        return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
    }
    rows.pop().ok_or(SqlError::Parse("empty VALUES".into()))
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rooms" => Ok(Command::DeleteOwner {
            kind: OwnerKind::Room,
            id,
        }),
        "speakers" => Ok(Command::DeleteOwner {
            kind: OwnerKind::Speaker,
            id,
        }),
        "availabilities" => Ok(Command::DeleteAvailability { id }),
        "slots" => Ok(Command::DeleteSlot { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &TableWithJoins,
    assignments: &[Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    let set = assignment_map(assignments)?;
    let allow = |table: &'static str, columns: &[&str]| match set.keys().find(|c| !columns.contains(&c.as_str())) {
        Some(unknown) => Err(SqlError::UnknownColumn(table, unknown.clone())),
        None => Ok(()),
    };

    match name.as_str() {
        "conference" => {
            allow("conference", &["timezone", "default_duration"])?;
            Ok(Command::ConfigureConference {
                timezone: set.get("timezone").map(|e| parse_text(e)).transpose()?,
                default_duration: set.get("default_duration").map(|e| parse_i64(e)).transpose()?,
            })
        }
        "submissions" => {
            allow("submissions", &["state"])?;
            let state = set
                .get("state")
                .ok_or(SqlError::MissingColumn("submissions", "state"))?;
            Ok(Command::UpdateSubmissionState {
                id: extract_where_id(selection)?,
                state: parse_state(state)?,
            })
        }
        "slots" => {
            allow("slots", &["room_id", "start", "end"])?;
            let patch = SlotPatch {
                room_id: set.get("room_id").map(|e| parse_ulid_or_null(e)).transpose()?,
                start: set.get("start").map(|e| parse_i64_or_null(e)).transpose()?,
                end: set.get("end").map(|e| parse_i64_or_null(e)).transpose()?,
            };
            Ok(Command::UpdateSlot {
                id: extract_where_id(selection)?,
                patch,
            })
        }
        "wip" => {
            allow("wip", &["version"])?;
            let version = set
                .get("version")
                .ok_or(SqlError::MissingColumn("wip", "version"))?;
            Ok(Command::Unfreeze {
                version: VersionRef::parse(&parse_text(version)?),
            })
        }
        _ => Err(SqlError::UnknownTable(name)),
    }
}

fn assignment_map(assignments: &[Assignment]) -> Result<HashMap<String, &Expr>, SqlError> {
    let mut set = HashMap::new();
    for a in assignments {
        let AssignmentTarget::ColumnName(name) = &a.target else {
            return Err(SqlError::Unsupported("tuple assignment".into()));
        };
        let column = object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?;
        set.insert(column, &a.value);
    }
    Ok(set)
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        filters.collect(selection)?;
    }
    let version = |col: &str| -> Result<Option<VersionRef>, SqlError> {
        filters
            .eq(col)
            .map(|e| parse_text(e).map(|v| VersionRef::parse(&v)))
            .transpose()
    };
    let window = || -> Result<(Ms, Ms, Option<Ms>), SqlError> {
        Ok((
            parse_i64(filters.gte("start").ok_or(SqlError::MissingFilter("start"))?)?,
            parse_i64(filters.lte("end").ok_or(SqlError::MissingFilter("end"))?)?,
            filters.eq("min_duration").map(parse_i64).transpose()?,
        ))
    };

    match table.as_str() {
        "conference" => Ok(Command::SelectConference),
        "rooms" => Ok(Command::SelectOwners {
            kind: OwnerKind::Room,
        }),
        "speakers" => Ok(Command::SelectOwners {
            kind: OwnerKind::Speaker,
        }),
        "submissions" => Ok(Command::SelectSubmissions),
        "schedules" => Ok(Command::SelectSchedules),
        "slots" => Ok(Command::SelectSlots {
            version: version("version")?.unwrap_or(VersionRef::Wip),
        }),
        "availability" => {
            let owner_id = filters.eq("owner_id").ok_or(SqlError::MissingFilter("owner_id"))?;
            let (start, end, min_duration) = window()?;
            Ok(Command::SelectAvailability {
                owner_id: parse_ulid(owner_id)?,
                start,
                end,
                min_duration,
            })
        }
        "common_availability" => {
            let owner_ids = match (filters.in_list("owner_id"), filters.eq("owner_id")) {
                (Some(list), _) => list.iter().map(parse_ulid).collect::<Result<Vec<_>, _>>()?,
                (None, Some(single)) => vec![parse_ulid(single)?],
                (None, None) => return Err(SqlError::MissingFilter("owner_id")),
            };
            let (start, end, min_duration) = window()?;
            Ok(Command::SelectCommonAvailability {
                owner_ids,
                start,
                end,
                min_duration,
            })
        }
        "free_time" => {
            let room_id = filters.eq("room_id").ok_or(SqlError::MissingFilter("room_id"))?;
            let (start, end, min_duration) = window()?;
            Ok(Command::SelectFreeTime {
                room_id: parse_ulid(room_id)?,
                start,
                end,
                min_duration,
            })
        }
        "changes" => Ok(Command::SelectChanges {
            version: version("version")?.unwrap_or(VersionRef::Wip),
            base: version("base")?,
        }),
        "notifications" => Ok(Command::SelectNotifications {
            version: version("version")?.unwrap_or(VersionRef::Wip),
        }),
        "warnings" => Ok(Command::SelectWarnings {
            version: version("version")?.unwrap_or(VersionRef::Wip),
        }),
        "timetable" => {
            let format = match filters.eq("format") {
                Some(expr) => parse_text(expr)?
                    .parse::<TimetableFormat>()
                    .map_err(|e| SqlError::Parse(e.to_string()))?,
                None => TimetableFormat::List,
            };
            let width = filters
                .eq("width")
                .map(|e| {
                    let w = parse_i64(e)?;
                    usize::try_from(w)
                        .ok()
                        .filter(|w| *w <= MAX_COLUMN_WIDTH)
                        .ok_or_else(|| SqlError::Parse(format!("bad width: {w}")))
                })
                .transpose()?;
            Ok(Command::SelectTimetable {
                version: version("version")?.unwrap_or(VersionRef::Wip),
                format,
                width,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Conjunction of simple column predicates from a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    eq: HashMap<String, &'a Expr>,
    gte: HashMap<String, &'a Expr>,
    lte: HashMap<String, &'a Expr>,
    in_list: HashMap<String, &'a [Expr]>,
}

impl<'a> Filters<'a> {
    fn collect(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.collect(inner),
            Expr::BinaryOp { left, op, right } => {
                if *op == ast::BinaryOperator::And {
                    self.collect(left)?;
                    return self.collect(right);
                }
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                let target = match op {
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.gte,
                    ast::BinaryOperator::LtEq => &mut self.lte,
                    _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
                };
                target.insert(column, right);
                Ok(())
            }
            Expr::InList {
                expr: column,
                list,
                negated: false,
            } => {
                let column = expr_column_name(column)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                self.in_list.insert(column, list.as_slice());
                Ok(())
            }
            _ => Err(SqlError::Unsupported(format!("filter {expr}"))),
        }
    }

    fn eq(&self, column: &str) -> Option<&'a Expr> {
        self.eq.get(column).copied()
    }

    fn gte(&self, column: &str) -> Option<&'a Expr> {
        self.gte.get(column).copied()
    }

    fn lte(&self, column: &str) -> Option<&'a Expr> {
        self.lte.get(column).copied()
    }

    fn in_list(&self, column: &str) -> Option<&'a [Expr]> {
        self.in_list.get(column).copied()
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_text(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

/// `ARRAY['a', 'b']`, `'{a,b}'` or `'a,b'`.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_ulid).collect();
    }
    if is_null(expr) {
        return Ok(Vec::new());
    }
    parse_text(expr)?
        .trim_matches(|c| c == '{' || c == '}')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}"))))
        .collect()
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
        Some(other) => Err(SqlError::Parse(format!("expected number, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_state(expr: &Expr) -> Result<SubmissionState, SqlError> {
    parse_text(expr)?
        .parse()
        .map_err(|UnknownState(s)| SqlError::Parse(format!("unknown submission state: {s}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const B: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_room() {
        let cmd = parse_sql(&format!("INSERT INTO rooms (id, name, position) VALUES ('{A}', 'Hall', 2)")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertOwner {
                kind: OwnerKind::Room,
                id: ulid(A),
                name: Some("Hall".into()),
                position: 2,
            }
        );
    }

    #[test]
    fn parse_insert_without_column_list() {
        let cmd = parse_sql(&format!("INSERT INTO speakers VALUES ('{A}')")).unwrap();
        assert_eq!(
            cmd,
            Command::InsertOwner {
                kind: OwnerKind::Speaker,
                id: ulid(A),
                name: None,
                position: 0,
            }
        );
    }

    #[test]
    fn parse_insert_columns_in_any_order() {
        let cmd = parse_sql(&format!("INSERT INTO rooms (name, id) VALUES (NULL, '{A}')")).unwrap();
        assert!(matches!(cmd, Command::InsertOwner { name: None, position: 0, .. }));
    }

    #[test]
    fn parse_insert_submission() {
        let sql = format!(
            "INSERT INTO submissions (id, title, state, speakers, duration) \
             VALUES ('{A}', 'Ownership', 'confirmed', '{{{A},{B}}}', 1800000)"
        );
        let Command::InsertSubmission { submission } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertSubmission");
        };
        assert_eq!(submission.title, "Ownership");
        assert_eq!(submission.state, SubmissionState::Confirmed);
        assert_eq!(submission.speakers, vec![ulid(A), ulid(B)]);
        assert_eq!(submission.duration, Some(1_800_000));

        let sql = format!("INSERT INTO submissions (id, title, speakers) VALUES ('{A}', 'T', ARRAY['{B}'])");
        let Command::InsertSubmission { submission } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertSubmission");
        };
        assert_eq!(submission.state, SubmissionState::Submitted);
        assert_eq!(submission.speakers, vec![ulid(B)]);
    }

    #[test]
    fn parse_bad_submission_state() {
        let sql = format!("INSERT INTO submissions (id, title, state) VALUES ('{A}', 'T', 'maybe')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_availability_single_and_batch() {
        let single = format!(r#"INSERT INTO availabilities (id, owner_id, start, "end") VALUES ('{A}', '{B}', 1000, 2000)"#);
        assert_eq!(
            parse_sql(&single).unwrap(),
            Command::InsertAvailability {
                id: ulid(A),
                owner_id: ulid(B),
                start: 1000,
                end: 2000,
            }
        );

        let batch = format!(
            r#"INSERT INTO availabilities (id, owner_id, start, "end") VALUES ('{A}', '{B}', 1000, 2000), ('{B}', '{B}', 3000, 4000)"#
        );
        let Command::BatchInsertAvailabilities { entries } = parse_sql(&batch).unwrap() else {
            panic!("expected BatchInsertAvailabilities");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], (ulid(B), ulid(B), 3000, 4000));
    }

    #[test]
    fn parse_batch_reports_row() {
        let batch = format!(
            r#"INSERT INTO availabilities (id, owner_id, start, "end") VALUES ('{A}', '{B}', 1000, 2000), ('nope', '{B}', 3000, 4000)"#
        );
        let err = parse_sql(&batch).unwrap_err();
        assert!(err.to_string().contains("row 1"));
    }

    #[test]
    fn parse_insert_slot_and_break() {
        let sql = format!(
            r#"INSERT INTO slots (id, submission_id, room_id, start, "end") VALUES ('{A}', '{B}', '{B}', 1000, NULL)"#
        );
        let Command::InsertSlot { slot } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertSlot");
        };
        assert_eq!(slot.submission_id, Some(ulid(B)));
        assert_eq!(slot.start, Some(1000));
        assert_eq!(slot.end, None);
        assert!(!slot.is_visible);

        let sql = format!("INSERT INTO slots (id, room_id, description) VALUES ('{A}', '{B}', 'Lunch')");
        let Command::InsertSlot { slot } = parse_sql(&sql).unwrap() else {
            panic!("expected InsertSlot");
        };
        assert!(slot.is_break());
        assert_eq!(slot.description.as_deref(), Some("Lunch"));
    }

    #[test]
    fn parse_freeze() {
        let cmd = parse_sql("INSERT INTO schedules (version, comment, notify) VALUES ('v1', 'first', true)").unwrap();
        assert_eq!(
            cmd,
            Command::Freeze {
                version: "v1".into(),
                comment: Some("first".into()),
                notify: true,
            }
        );
        let cmd = parse_sql("INSERT INTO schedules (version) VALUES ('v2')").unwrap();
        assert!(matches!(cmd, Command::Freeze { notify: false, comment: None, .. }));
    }

    #[test]
    fn parse_unknown_column_errors() {
        let sql = format!("INSERT INTO rooms (id, capacity) VALUES ('{A}', 3)");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownColumn("rooms", _))));
    }

    #[test]
    fn parse_wrong_arity_errors() {
        let sql = format!("INSERT INTO rooms (id, name) VALUES ('{A}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("rooms", 2, 1))));
    }

    #[test]
    fn parse_deletes() {
        let cmd = parse_sql(&format!("DELETE FROM speakers WHERE id = '{A}'")).unwrap();
        assert_eq!(
            cmd,
            Command::DeleteOwner {
                kind: OwnerKind::Speaker,
                id: ulid(A),
            }
        );
        let cmd = parse_sql(&format!("DELETE FROM slots WHERE id = '{A}'")).unwrap();
        assert_eq!(cmd, Command::DeleteSlot { id: ulid(A) });
        assert!(matches!(
            parse_sql("DELETE FROM slots"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_update_slot_patch() {
        let sql = format!(r#"UPDATE slots SET start = 5000, "end" = NULL WHERE id = '{A}'"#);
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::UpdateSlot {
                id: ulid(A),
                patch: SlotPatch {
                    room_id: None,
                    start: Some(Some(5000)),
                    end: Some(None),
                },
            }
        );
    }

    #[test]
    fn parse_update_submission_state() {
        let sql = format!("UPDATE submissions SET state = 'withdrawn' WHERE id = '{A}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSubmissionState {
                id: ulid(A),
                state: SubmissionState::Withdrawn,
            }
        );
    }

    #[test]
    fn parse_configure_and_unfreeze() {
        let cmd = parse_sql("UPDATE conference SET timezone = 'Europe/Berlin'").unwrap();
        assert_eq!(
            cmd,
            Command::ConfigureConference {
                timezone: Some("Europe/Berlin".into()),
                default_duration: None,
            }
        );
        let cmd = parse_sql("UPDATE wip SET version = 'latest'").unwrap();
        assert_eq!(
            cmd,
            Command::Unfreeze {
                version: VersionRef::Latest,
            }
        );
    }

    #[test]
    fn parse_select_availability() {
        let sql = format!(
            r#"SELECT * FROM availability WHERE owner_id = '{A}' AND start >= 1000 AND "end" <= 2000 AND min_duration = 500"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectAvailability {
                owner_id: ulid(A),
                start: 1000,
                end: 2000,
                min_duration: Some(500),
            }
        );
    }

    #[test]
    fn parse_select_common_availability() {
        let sql = format!(
            r#"SELECT * FROM common_availability WHERE owner_id IN ('{A}', '{B}') AND (start >= -5 AND "end" <= 10)"#
        );
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectCommonAvailability {
                owner_ids: vec![ulid(A), ulid(B)],
                start: -5,
                end: 10,
                min_duration: None,
            }
        );
    }

    #[test]
    fn parse_select_free_time_requires_window() {
        let sql = format!("SELECT * FROM free_time WHERE room_id = '{A}' AND start >= 0");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("end"))));
    }

    #[test]
    fn parse_or_filter_is_rejected() {
        let sql = format!("SELECT * FROM availability WHERE owner_id = '{A}' OR start >= 0");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_version_selects() {
        assert_eq!(
            parse_sql("SELECT * FROM slots").unwrap(),
            Command::SelectSlots {
                version: VersionRef::Wip,
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM changes WHERE version = 'v2' AND base = 'v1'").unwrap(),
            Command::SelectChanges {
                version: VersionRef::Named("v2".into()),
                base: Some(VersionRef::Named("v1".into())),
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM notifications WHERE version = 'latest'").unwrap(),
            Command::SelectNotifications {
                version: VersionRef::Latest,
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM timetable WHERE version = 'v1' AND format = 'grid' AND width = 30").unwrap(),
            Command::SelectTimetable {
                version: VersionRef::Named("v1".into()),
                format: TimetableFormat::Grid,
                width: Some(30),
            }
        );
        assert!(parse_sql("SELECT * FROM timetable WHERE format = 'pdf'").is_err());
        assert_eq!(
            parse_sql(&format!("SELECT * FROM timetable WHERE width = {MAX_COLUMN_WIDTH}")).unwrap(),
            Command::SelectTimetable {
                version: VersionRef::Wip,
                format: TimetableFormat::List,
                width: Some(MAX_COLUMN_WIDTH),
            }
        );
        assert!(parse_sql(&format!("SELECT * FROM timetable WHERE width = {}", MAX_COLUMN_WIDTH + 1)).is_err());
        assert!(parse_sql("SELECT * FROM timetable WHERE width = 9223372036854775807").is_err());
    }

    #[test]
    fn parse_listings() {
        assert_eq!(
            parse_sql("SELECT * FROM rooms").unwrap(),
            Command::SelectOwners {
                kind: OwnerKind::Room,
            }
        );
        assert_eq!(parse_sql("SELECT * FROM schedules").unwrap(), Command::SelectSchedules);
        assert_eq!(parse_sql("SELECT * FROM conference").unwrap(), Command::SelectConference);
    }

    #[test]
    fn parse_listen_unlisten() {
        assert_eq!(
            parse_sql(&format!("LISTEN speaker_{A};")).unwrap(),
            Command::Listen {
                channel: format!("speaker_{A}"),
            }
        );
        assert_eq!(
            parse_sql("unlisten \"schedule\"").unwrap(),
            Command::Unlisten {
                channel: "schedule".into(),
            }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn select_table_ignores_placeholders() {
        assert_eq!(
            select_table("SELECT * FROM free_time WHERE room_id = $1 AND start >= $2").as_deref(),
            Some("free_time")
        );
        assert_eq!(select_table("INSERT INTO rooms (id) VALUES ($1)"), None);
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql(&format!("INSERT INTO bookings (id) VALUES ('{A}')")),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }

    #[test]
    fn parse_batch_splits_outside_quotes() {
        let sql = format!(
            "LISTEN schedule; INSERT INTO rooms (id, name) VALUES ('{A}', 'Room; East');\n UNLISTEN *;"
        );
        let cmds = parse_batch(&sql).unwrap();
        assert_eq!(cmds.len(), 3);
        assert_eq!(
            cmds[1],
            Command::InsertOwner {
                kind: OwnerKind::Room,
                id: ulid(A),
                name: Some("Room; East".into()),
                position: 0,
            }
        );
        assert_eq!(cmds[2], Command::UnlistenAll);
        assert!(matches!(parse_batch(" ; ;"), Err(SqlError::Empty)));
        assert_eq!(split_statements("SELECT 'it''s;' ; x"), ["SELECT 'it''s;'", "x"]);
    }
}
