//! In-memory querier shared by the engine tests.
//!
//! `FakeQuerier` answers the catalog query from its table definitions,
//! serves `SELECT` pages according to the statement's `LIMIT` clause and
//! drains `UPDATE` batches from a per-table counter of matching rows. Every
//! statement is recorded so tests can assert on what was issued.

#![allow(dead_code)]

use async_trait::async_trait;
use splace_core::{ColumnInfo, ConnectionConfig, Engine, Querier, Result, RowCursor, SplaceError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// One table of the fake database.
#[derive(Debug, Clone)]
pub struct FakeTable {
    pub columns: Vec<ColumnInfo>,
    /// Rows matching any predicate
    pub matches: u64,
    /// Every statement against the table fails
    pub failing: bool,
}

impl FakeTable {
    pub fn new(columns: &[(&str, &str)]) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|(name, type_name)| ColumnInfo::new(*name, *type_name))
                .collect(),
            matches: 0,
            failing: false,
        }
    }

    pub fn with_matches(mut self, matches: u64) -> Self {
        self.matches = matches;
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }
}

/// A statement the fake received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issued {
    pub table: String,
    pub sql: String,
    pub offset: u64,
    pub limit: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, FakeTable>,
    queries: Vec<Issued>,
    execs: Vec<Issued>,
    catalog_broken: bool,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct FakeQuerier {
    config: ConnectionConfig,
    state: Arc<Mutex<State>>,
}

impl FakeQuerier {
    pub fn new(tables: Vec<(&str, FakeTable)>) -> Self {
        let state = State {
            tables: tables
                .into_iter()
                .map(|(name, table)| (name.to_string(), table))
                .collect(),
            ..State::default()
        };
        Self {
            config: ConnectionConfig::new(Engine::MySql, "fake:3306")
                .with_user("tester")
                .with_database("shop"),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Makes the catalog query fail like a revoked `INFORMATION_SCHEMA` grant.
    pub fn with_broken_catalog(self) -> Self {
        self.state.lock().unwrap().catalog_broken = true;
        self
    }

    /// Page queries issued against data tables (catalog query excluded).
    pub fn queries(&self) -> Vec<Issued> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn queries_for(&self, table: &str) -> Vec<Issued> {
        self.queries().into_iter().filter(|q| q.table == table).collect()
    }

    pub fn execs(&self) -> Vec<Issued> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn execs_for(&self, table: &str) -> Vec<Issued> {
        self.execs().into_iter().filter(|q| q.table == table).collect()
    }

    pub fn remaining_matches(&self, table: &str) -> u64 {
        self.state.lock().unwrap().tables[table].matches
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn catalog_rows(&self) -> Vec<Vec<String>> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .iter()
            .flat_map(|(table, definition)| {
                definition.columns.iter().map(move |column| {
                    vec![table.clone(), column.name.clone(), column.type_name.clone()]
                })
            })
            .collect()
    }
}

/// Extracts the backtick-quoted table name following `keyword`.
pub fn table_of(sql: &str, keyword: &str) -> String {
    let start = sql.find(keyword).unwrap() + keyword.len();
    let rest = &sql[start..];
    let end = rest.find("` ").unwrap();
    rest[..end].replace("``", "`")
}

/// Parses the trailing `LIMIT offset,limit` / `LIMIT limit` clause.
pub fn limit_of(sql: &str) -> (u64, Option<u64>) {
    match sql.rsplit_once(" LIMIT ") {
        None => (0, None),
        Some((_, clause)) => match clause.split_once(',') {
            Some((offset, limit)) => (offset.parse().unwrap(), Some(limit.parse().unwrap())),
            None => (0, Some(clause.parse().unwrap())),
        },
    }
}

#[async_trait]
impl Querier for FakeQuerier {
    fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn exec(&self, query: &str, args: &[String]) -> Result<u64> {
        assert!(args.is_empty(), "generated statements carry no bind arguments");
        tokio::task::yield_now().await;

        let table = table_of(query, "UPDATE `");
        let (offset, limit) = limit_of(query);
        let mut state = self.state.lock().unwrap();
        state.execs.push(Issued {
            table: table.clone(),
            sql: query.to_string(),
            offset,
            limit,
        });

        let definition = state
            .tables
            .get_mut(&table)
            .ok_or_else(|| SplaceError::statement(format!("Table 'shop.{table}' doesn't exist")))?;
        if definition.failing {
            return Err(SplaceError::statement(format!("write to '{table}' rejected")));
        }
        let affected = limit.map_or(definition.matches, |limit| definition.matches.min(limit));
        definition.matches -= affected;
        Ok(affected)
    }

    async fn query(&self, query: &str, args: &[String]) -> Result<Box<dyn RowCursor>> {
        tokio::task::yield_now().await;

        if query.contains("INFORMATION_SCHEMA.COLUMNS") {
            assert_eq!(args, [self.config.database.clone()]);
            if self.state.lock().unwrap().catalog_broken {
                return Err(SplaceError::statement("SELECT command denied to user 'tester'"));
            }
            return Ok(Box::new(FakeCursor::new(
                vec!["TABLE_NAME".into(), "COLUMN_NAME".into(), "COLUMN_TYPE".into()],
                self.catalog_rows(),
            )));
        }

        let table = table_of(query, "FROM `");
        let (offset, limit) = limit_of(query);
        let mut state = self.state.lock().unwrap();
        state.queries.push(Issued {
            table: table.clone(),
            sql: query.to_string(),
            offset,
            limit,
        });

        let definition = state
            .tables
            .get(&table)
            .ok_or_else(|| SplaceError::statement(format!("Table 'shop.{table}' doesn't exist")))?;
        if definition.failing {
            return Err(SplaceError::statement(format!("read from '{table}' rejected")));
        }

        let end = limit.map_or(definition.matches, |limit| {
            definition.matches.min(offset + limit)
        });
        let columns: Vec<String> = definition.columns.iter().map(|c| c.name.clone()).collect();
        let rows = (offset.min(end)..end)
            .map(|index| {
                columns
                    .iter()
                    .map(|column| format!("{table}.{column}#{index}"))
                    .collect()
            })
            .collect();
        Ok(Box::new(FakeCursor::new(columns, rows)))
    }

    async fn dump(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        sink.write_all(b"-- dump of shop\n")
            .await
            .map_err(|e| SplaceError::io("fake dump", e))
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "fake"
    }
}

/// Cursor over pre-built rows. Reuses its row buffer like the real drivers.
pub struct FakeCursor {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<String>>,
    current: Vec<String>,
}

impl FakeCursor {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
            current: Vec::new(),
        }
    }
}

#[async_trait]
impl RowCursor for FakeCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn advance(&mut self) -> Result<bool> {
        tokio::task::yield_now().await;
        match self.rows.next() {
            Some(row) => {
                self.current.clear();
                self.current.extend(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn row(&self) -> &[String] {
        &self.current
    }
}

/// A small shop schema: two text tables, one with a date column, and a
/// table with only temporal columns.
pub fn shop_tables() -> Vec<(&'static str, FakeTable)> {
    vec![
        (
            "people",
            FakeTable::new(&[("id", "int(11)"), ("name", "varchar(64)"), ("address", "text")]),
        ),
        (
            "posts",
            FakeTable::new(&[("title", "varchar(255)"), ("body", "longtext"), ("published", "datetime")]),
        ),
        (
            "schedule",
            FakeTable::new(&[("starts", "timestamp"), ("ends", "time(3)")]),
        ),
    ]
}
