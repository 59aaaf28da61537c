//! Flat JSON command surface.
//!
//! One command per pool operation. Arguments arrive as a JSON object with
//! camelCase keys (`uuid`, `sortColumn`, `primaryKeyColumns`, ...) and results
//! are returned as JSON. Connection-level failures of `pool_connect` come back
//! as a status report carrying the error rather than as an `Err`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{QuarryError, QuarryResult};
use crate::models::{
    BackendKind, ConnectionConfig, RowDelete, RowInsert, RowUpdate, RowValue, SortDirection,
    TableDataRequest,
};
use crate::services::interchange::{self, ConnectionsExport};
use crate::services::pool::PoolManager;

/// Every command name `dispatch` understands.
pub const COMMANDS: &[&str] = &[
    "pool_connect",
    "pool_disconnect",
    "pool_get_status",
    "pool_health_check",
    "pool_list_tables",
    "pool_get_table_data",
    "pool_get_table_structure",
    "pool_get_schema_overview",
    "pool_execute_query",
    "pool_insert_table_row",
    "pool_update_table_row",
    "pool_delete_table_row",
    "redis_search_keys",
    "redis_get_key_details",
    "redis_delete_key",
    "redis_set_key",
    "redis_set_list_key",
    "redis_set_set_key",
    "redis_set_hash_key",
    "redis_set_zset_key",
    "redis_update_ttl",
    "test_connection",
    "get_connections",
    "save_connection",
    "delete_connection",
    "export_connection",
    "export_connections",
    "import_connections",
];

#[derive(Deserialize)]
struct ById {
    uuid: Uuid,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableArgs {
    uuid: Uuid,
    schema: String,
    table: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableDataArgs {
    uuid: Uuid,
    schema: String,
    table: String,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    sort_column: Option<String>,
    #[serde(default)]
    sort_direction: Option<String>,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    100
}

impl TableDataArgs {
    fn into_request(self) -> TableDataRequest {
        let mut req = TableDataRequest::new(self.schema, self.table).page(self.page, self.limit);
        if let Some(filter) = self.filter {
            req = req.filter(filter);
        }
        if let Some(column) = self.sort_column.filter(|c| !c.trim().is_empty()) {
            let direction = SortDirection::parse(self.sort_direction.as_deref().unwrap_or("asc"));
            req = req.sort(column, direction);
        }
        req
    }
}

#[derive(Deserialize)]
struct QueryArgs {
    uuid: Uuid,
    query: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertArgs {
    uuid: Uuid,
    schema: String,
    table: String,
    values: Vec<RowValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateArgs {
    uuid: Uuid,
    schema: String,
    table: String,
    #[serde(default)]
    primary_key_columns: Vec<String>,
    #[serde(default)]
    primary_key_values: Vec<Value>,
    updates: Vec<RowValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteArgs {
    uuid: Uuid,
    schema: String,
    table: String,
    #[serde(default)]
    primary_key_columns: Vec<String>,
    #[serde(default)]
    primary_key_values: Vec<Value>,
}

/// Scan cursors are strings, but numeric cursors from older callers are accepted.
#[derive(Deserialize)]
#[serde(untagged)]
enum CursorArg {
    Text(String),
    Number(u64),
}

impl Default for CursorArg {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl CursorArg {
    fn into_token(self) -> String {
        match self {
            Self::Text(token) => token,
            Self::Number(n) => n.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct SearchKeysArgs {
    uuid: Uuid,
    #[serde(default)]
    pattern: String,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    cursor: CursorArg,
}

#[derive(Deserialize)]
struct KeyArgs {
    uuid: Uuid,
    key: String,
}

#[derive(Deserialize)]
struct SetKeyArgs {
    uuid: Uuid,
    key: String,
    value: String,
    #[serde(default)]
    ttl: Option<i64>,
}

#[derive(Deserialize)]
struct SetMembersArgs {
    uuid: Uuid,
    key: String,
    values: Vec<String>,
    #[serde(default)]
    ttl: Option<i64>,
}

#[derive(Deserialize)]
struct SetHashArgs {
    uuid: Uuid,
    key: String,
    fields: BTreeMap<String, String>,
    #[serde(default)]
    ttl: Option<i64>,
}

#[derive(Deserialize)]
struct SetZsetArgs {
    uuid: Uuid,
    key: String,
    members: Vec<(String, f64)>,
    #[serde(default)]
    ttl: Option<i64>,
}

#[derive(Deserialize)]
struct TtlArgs {
    uuid: Uuid,
    key: String,
    #[serde(default)]
    ttl: Option<i64>,
}

#[derive(Deserialize)]
struct ConfigArgs {
    config: ConnectionConfig,
}

#[derive(Deserialize)]
struct ExportManyArgs {
    uuids: Vec<Uuid>,
}

#[derive(Deserialize)]
struct ImportArgs {
    data: ConnectionsExport,
}

/// Saved connection as listed to callers. Secrets are left out.
#[derive(Debug, Serialize)]
struct ConnectionSummary {
    id: Uuid,
    name: String,
    kind: BackendKind,
    url: String,
    ssh: bool,
}

impl From<&ConnectionConfig> for ConnectionSummary {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            id: config.id,
            name: config.name.clone(),
            kind: config.kind,
            url: config.display_url(),
            ssh: config.ssh_tunnel.is_some(),
        }
    }
}

fn parse<T: DeserializeOwned>(command: &str, args: Value) -> QuarryResult<T> {
    let args = if args.is_null() { Value::Object(Default::default()) } else { args };
    serde_json::from_value(args)
        .map_err(|e| QuarryError::validation(format!("Invalid arguments for {command}: {e}")))
}

fn reply<T: Serialize>(value: T) -> QuarryResult<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Run `command` with `args` against `pool`.
pub async fn dispatch(pool: &PoolManager, command: &str, args: Value) -> QuarryResult<Value> {
    tracing::debug!(command, "Dispatching command");

    match command {
        // ========== Lifecycle ==========
        "pool_connect" => {
            let ById { uuid } = parse(command, args)?;
            match pool.connect(uuid).await {
                Ok(report) => reply(report),
                Err(e) if e.is_connection_failure() => reply(pool.status(uuid)),
                Err(e) => Err(e),
            }
        }
        "pool_disconnect" => {
            let ById { uuid } = parse(command, args)?;
            reply(pool.disconnect(uuid).await)
        }
        "pool_get_status" => {
            let ById { uuid } = parse(command, args)?;
            reply(pool.status(uuid))
        }
        "pool_health_check" => {
            let ById { uuid } = parse(command, args)?;
            reply(pool.health_check(uuid).await)
        }

        // ========== Tables and queries ==========
        "pool_list_tables" => {
            let ById { uuid } = parse(command, args)?;
            reply(pool.list_tables(uuid).await?)
        }
        "pool_get_table_data" => {
            let args: TableDataArgs = parse(command, args)?;
            let uuid = args.uuid;
            reply(pool.get_table_data(uuid, args.into_request()).await?)
        }
        "pool_get_table_structure" => {
            let TableArgs { uuid, schema, table } = parse(command, args)?;
            reply(pool.get_table_structure(uuid, &schema, &table).await?)
        }
        "pool_get_schema_overview" => {
            let ById { uuid } = parse(command, args)?;
            reply(pool.schema_overview(uuid).await?)
        }
        "pool_execute_query" => {
            let QueryArgs { uuid, query } = parse(command, args)?;
            reply(pool.execute_query(uuid, &query).await?)
        }
        "pool_insert_table_row" => {
            let InsertArgs { uuid, schema, table, values } = parse(command, args)?;
            reply(pool.insert_row(uuid, RowInsert { schema, table, values }).await?)
        }
        "pool_update_table_row" => {
            let UpdateArgs {
                uuid,
                schema,
                table,
                primary_key_columns,
                primary_key_values,
                updates,
            } = parse(command, args)?;
            let req = RowUpdate { schema, table, primary_key_columns, primary_key_values, updates };
            reply(pool.update_row(uuid, req).await?)
        }
        "pool_delete_table_row" => {
            let DeleteArgs { uuid, schema, table, primary_key_columns, primary_key_values } =
                parse(command, args)?;
            let req = RowDelete { schema, table, primary_key_columns, primary_key_values };
            reply(pool.delete_row(uuid, req).await?)
        }

        // ========== Key-value ==========
        "redis_search_keys" => {
            let SearchKeysArgs { uuid, pattern, limit, cursor } = parse(command, args)?;
            let limit = usize::try_from(limit.max(1)).unwrap_or(1);
            reply(pool.search_keys(uuid, &pattern, limit, &cursor.into_token()).await?)
        }
        "redis_get_key_details" => {
            let KeyArgs { uuid, key } = parse(command, args)?;
            reply(pool.get_key_details(uuid, &key).await?)
        }
        "redis_delete_key" => {
            let KeyArgs { uuid, key } = parse(command, args)?;
            reply(pool.delete_key(uuid, &key).await?)
        }
        "redis_set_key" => {
            let SetKeyArgs { uuid, key, value, ttl } = parse(command, args)?;
            reply(pool.set_key(uuid, &key, &value, ttl).await?)
        }
        "redis_set_list_key" => {
            let SetMembersArgs { uuid, key, values, ttl } = parse(command, args)?;
            reply(pool.set_list(uuid, &key, values, ttl).await?)
        }
        "redis_set_set_key" => {
            let SetMembersArgs { uuid, key, values, ttl } = parse(command, args)?;
            reply(pool.set_set(uuid, &key, values, ttl).await?)
        }
        "redis_set_hash_key" => {
            let SetHashArgs { uuid, key, fields, ttl } = parse(command, args)?;
            reply(pool.set_hash(uuid, &key, fields, ttl).await?)
        }
        "redis_set_zset_key" => {
            let SetZsetArgs { uuid, key, members, ttl } = parse(command, args)?;
            reply(pool.set_zset(uuid, &key, members, ttl).await?)
        }
        "redis_update_ttl" => {
            let TtlArgs { uuid, key, ttl } = parse(command, args)?;
            reply(pool.update_ttl(uuid, &key, ttl).await?)
        }

        // ========== Catalog ==========
        "test_connection" => {
            let ConfigArgs { config } = parse(command, args)?;
            reply(pool.test_connection(&config).await)
        }
        "get_connections" => {
            let configs = pool.catalog().list()?;
            reply(configs.iter().map(ConnectionSummary::from).collect::<Vec<_>>())
        }
        "save_connection" => {
            let ConfigArgs { config } = parse(command, args)?;
            config.validate().map_err(QuarryError::validation)?;
            pool.catalog().save(&config)?;
            reply(ConnectionSummary::from(&config))
        }
        "delete_connection" => {
            let ById { uuid } = parse(command, args)?;
            pool.disconnect(uuid).await;
            reply(pool.catalog().delete(uuid)?)
        }
        "export_connection" => {
            let ById { uuid } = parse(command, args)?;
            reply(interchange::export_connections(pool.catalog().as_ref(), &[uuid])?)
        }
        "export_connections" => {
            let ExportManyArgs { uuids } = parse(command, args)?;
            reply(interchange::export_connections(pool.catalog().as_ref(), &uuids)?)
        }
        "import_connections" => {
            let ImportArgs { data } = parse(command, args)?;
            let imported = interchange::import_connections(pool.catalog().as_ref(), data)?;
            reply(serde_json::json!({
                "imported": imported.len(),
                "connections": imported.iter().map(ConnectionSummary::from).collect::<Vec<_>>(),
            }))
        }

        unknown => Err(QuarryError::validation(format!("Unknown command: {unknown}"))),
    }
}
