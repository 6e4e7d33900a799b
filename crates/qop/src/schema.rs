//! Table schema registry used to type result columns during JSON
//! serialization. The registry is read-only and injected at start-up;
//! unknown tables fall back to the generic object-table schema.

use std::collections::HashMap;

/// Column value type, driving the JSON representation of a raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Uuid,
    IpAddr,
    Double,
    /// Anything else is emitted as an unsigned integer.
    Unsigned,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub datatype: ColumnType,
}

impl Column {
    pub fn new(name: &str, datatype: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            datatype,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Read-only mapping from table name to schema.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: HashMap<String, TableSchema>,
    object_table: TableSchema,
}

impl SchemaRegistry {
    pub fn new(tables: HashMap<String, TableSchema>, object_table: TableSchema) -> Self {
        Self {
            tables,
            object_table,
        }
    }

    /// Schema for `table`, or the generic object-table schema when the
    /// table is unknown.
    pub fn resolve(&self, table: &str) -> &TableSchema {
        self.tables.get(table).unwrap_or(&self.object_table)
    }
}

impl Default for SchemaRegistry {
    /// Built-in analytics tables plus the generic object-table fallback.
    fn default() -> Self {
        use ColumnType::*;

        let mut tables = HashMap::new();
        tables.insert(
            "FlowSeriesTable".to_string(),
            TableSchema::new(vec![
                Column::new("T", Unsigned),
                Column::new("sourcevn", String),
                Column::new("destvn", String),
                Column::new("sourceip", IpAddr),
                Column::new("destip", IpAddr),
                Column::new("vrouter", String),
                Column::new("bytes", Unsigned),
                Column::new("packets", Unsigned),
                Column::new("avg_bytes", Double),
                Column::new("avg_packets", Double),
                Column::new("flow_uuid", Uuid),
            ]),
        );
        tables.insert(
            "FlowRecordTable".to_string(),
            TableSchema::new(vec![
                Column::new("vrouter", String),
                Column::new("sourcevn", String),
                Column::new("destvn", String),
                Column::new("sourceip", IpAddr),
                Column::new("destip", IpAddr),
                Column::new("protocol", Unsigned),
                Column::new("sport", Unsigned),
                Column::new("dport", Unsigned),
                Column::new("setup_time", Unsigned),
                Column::new("teardown_time", Unsigned),
                Column::new("agg-bytes", Unsigned),
                Column::new("agg-packets", Unsigned),
                Column::new("UuidKey", Uuid),
            ]),
        );

        let object_table = TableSchema::new(vec![
            Column::new("ObjectId", String),
            Column::new("MessageTS", Unsigned),
            Column::new("ObjectLog", String),
            Column::new("SystemLog", String),
        ]);

        Self::new(tables, object_table)
    }
}
