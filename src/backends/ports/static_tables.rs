// Fixed port tables

use std::sync::Mutex;

use anyhow::Result;

use super::{PortTableBackend, PortTables};

/// Port tables held in memory and settable at runtime. Pairs with the
/// simulated capture backend and backs the test suites; carries no live OS
/// state.
#[derive(Default)]
pub struct StaticPortTables {
    tables: Mutex<PortTables>,
}

impl StaticPortTables {
    pub fn new(tables: PortTables) -> Self {
        Self {
            tables: Mutex::new(tables),
        }
    }

    /// Replace the tables the next refresh will read.
    pub fn set(&self, tables: PortTables) {
        *self.tables.lock().unwrap() = tables;
    }
}

impl PortTableBackend for StaticPortTables {
    fn name(&self) -> &'static str {
        "static"
    }

    fn port_tables(&self) -> Result<PortTables> {
        Ok(self.tables.lock().unwrap().clone())
    }
}
