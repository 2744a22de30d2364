// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence.
//!
//! Rows that gate a decision (the node during port assignment, the user's
//! resource row during spends and placements) are locked with `FOR UPDATE`
//! for the rest of the transaction.

use std::collections::HashSet;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};

use crate::allocation::PortRange;
use crate::error::ControlError;
use crate::ledger::split_debit;
use crate::migrations;
use crate::status::WorkloadStatus;

use super::{
    AllocationRecord, BalanceKind, LedgerEntryRecord, NewNode, NewWorkload, NodeRecord,
    Persistence, PoolDelta, ResourcePoolRecord, ResourceUsage, UserRecord, WorkloadFilter,
    WorkloadRecord, check_pool, new_id,
};

const NODE_COLUMNS: &str = "id, name, host, rpc_port, daemon_token, total_ram_mb, \
     allocated_ram_mb, total_disk_mb, allocated_disk_mb, maintenance, created_at, updated_at";

const WORKLOAD_COLUMNS: &str = "id, owner_id, node_id, name, image, ram_mb, disk_mb, \
     cpu_percent, status, primary_allocation_id, container_id, env, created_at, updated_at";

const POOL_COLUMNS: &str = "user_id, granted_balance, earned_balance, pool_ram_mb, \
     pool_cpu_cores, pool_storage_mb, updated_at";

const ALLOCATION_COLUMNS: &str = "id, node_id, workload_id, ip, port, assigned, created_at";

#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Self, ControlError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ControlError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        migrations::run_postgres(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn unique_violation(err: sqlx::Error, field: &str, message: &str) -> ControlError {
    if let sqlx::Error::Database(db) = &err
        && db.is_unique_violation()
    {
        return ControlError::validation(field, message);
    }
    err.into()
}

// ============================================================================
// Node Operations
// ============================================================================

pub async fn insert_node(pool: &PgPool, node: &NewNode) -> Result<NodeRecord, ControlError> {
    let sql = format!(
        r#"
        INSERT INTO nodes (id, name, host, rpc_port, daemon_token, total_ram_mb, total_disk_mb)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {NODE_COLUMNS}
        "#
    );

    sqlx::query_as::<_, NodeRecord>(&sql)
        .bind(new_id())
        .bind(&node.name)
        .bind(&node.host)
        .bind(i32::from(node.rpc_port))
        .bind(&node.daemon_token)
        .bind(node.total_ram_mb)
        .bind(node.total_disk_mb)
        .fetch_one(pool)
        .await
        .map_err(|e| unique_violation(e, "node", "a node with this name or address already exists"))
}

pub async fn get_node(pool: &PgPool, node_id: &str) -> Result<Option<NodeRecord>, ControlError> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = $1");
    let record = sqlx::query_as::<_, NodeRecord>(&sql)
        .bind(node_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

pub async fn list_nodes(pool: &PgPool) -> Result<Vec<NodeRecord>, ControlError> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes ORDER BY name");
    let records = sqlx::query_as::<_, NodeRecord>(&sql).fetch_all(pool).await?;

    Ok(records)
}

pub async fn set_node_maintenance(
    pool: &PgPool,
    node_id: &str,
    maintenance: bool,
) -> Result<bool, ControlError> {
    let result = sqlx::query(
        r#"
        UPDATE nodes SET maintenance = $2, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(node_id)
    .bind(maintenance)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_node(pool: &PgPool, node_id: &str) -> Result<bool, ControlError> {
    let mut tx = pool.begin().await?;

    let exists: Option<String> = sqlx::query_scalar("SELECT id FROM nodes WHERE id = $1 FOR UPDATE")
        .bind(node_id)
        .fetch_optional(&mut *tx)
        .await?;
    if exists.is_none() {
        return Ok(false);
    }

    let workloads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workloads WHERE node_id = $1")
        .bind(node_id)
        .fetch_one(&mut *tx)
        .await?;
    if workloads > 0 {
        return Err(ControlError::NodeInUse {
            node_id: node_id.to_string(),
            workloads,
        });
    }

    sqlx::query("DELETE FROM nodes WHERE id = $1")
        .bind(node_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

// ============================================================================
// User and Ledger Operations
// ============================================================================

pub async fn create_user(
    pool: &PgPool,
    username: &str,
    starting_grant: i64,
) -> Result<UserRecord, ControlError> {
    let mut tx = pool.begin().await?;

    let user = sqlx::query_as::<_, UserRecord>(
        r#"
        INSERT INTO users (id, username) VALUES ($1, $2)
        RETURNING id, username, created_at
        "#,
    )
    .bind(new_id())
    .bind(username)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| unique_violation(e, "username", "username is already taken"))?;

    sqlx::query("INSERT INTO user_resources (user_id, granted_balance) VALUES ($1, $2)")
        .bind(&user.id)
        .bind(starting_grant)
        .execute(&mut *tx)
        .await?;

    if starting_grant > 0 {
        insert_ledger_entry(
            &mut tx,
            &user.id,
            "grant",
            BalanceKind::Granted,
            starting_grant,
            "signup",
            "starting balance",
        )
        .await?;
    }

    tx.commit().await?;
    Ok(user)
}

pub async fn get_user(pool: &PgPool, user_id: &str) -> Result<Option<UserRecord>, ControlError> {
    let record = sqlx::query_as::<_, UserRecord>(
        "SELECT id, username, created_at FROM users WHERE id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn get_resource_pool(
    pool: &PgPool,
    user_id: &str,
) -> Result<Option<ResourcePoolRecord>, ControlError> {
    let sql = format!("SELECT {POOL_COLUMNS} FROM user_resources WHERE user_id = $1");
    let record = sqlx::query_as::<_, ResourcePoolRecord>(&sql)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

async fn lock_resource_pool(
    conn: &mut PgConnection,
    user_id: &str,
) -> Result<ResourcePoolRecord, ControlError> {
    let sql = format!("SELECT {POOL_COLUMNS} FROM user_resources WHERE user_id = $1 FOR UPDATE");
    sqlx::query_as::<_, ResourcePoolRecord>(&sql)
        .bind(user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ControlError::UserNotFound(user_id.to_string()))
}

async fn insert_ledger_entry(
    conn: &mut PgConnection,
    user_id: &str,
    kind: &str,
    balance: BalanceKind,
    amount: i64,
    source: &str,
    description: &str,
) -> Result<(), ControlError> {
    sqlx::query(
        r#"
        INSERT INTO ledger_entries (id, user_id, kind, balance, amount, source, description)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(new_id())
    .bind(user_id)
    .bind(kind)
    .bind(balance.as_str())
    .bind(amount)
    .bind(source)
    .bind(description)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Debit within an open transaction, earned balance first.
async fn debit(
    conn: &mut PgConnection,
    user_id: &str,
    amount: i64,
    description: &str,
) -> Result<ResourcePoolRecord, ControlError> {
    let current = lock_resource_pool(conn, user_id).await?;
    let (from_earned, from_granted) =
        split_debit(current.earned_balance, current.granted_balance, amount)?;

    let sql = format!(
        r#"
        UPDATE user_resources
        SET earned_balance = earned_balance - $2,
            granted_balance = granted_balance - $3,
            updated_at = NOW()
        WHERE user_id = $1
        RETURNING {POOL_COLUMNS}
        "#
    );
    let updated = sqlx::query_as::<_, ResourcePoolRecord>(&sql)
        .bind(user_id)
        .bind(from_earned)
        .bind(from_granted)
        .fetch_one(&mut *conn)
        .await?;

    for (balance, part) in [
        (BalanceKind::Earned, from_earned),
        (BalanceKind::Granted, from_granted),
    ] {
        if part > 0 {
            insert_ledger_entry(conn, user_id, "spend", balance, part, "spend", description)
                .await?;
        }
    }

    Ok(updated)
}

async fn raise_pool(
    conn: &mut PgConnection,
    user_id: &str,
    delta: PoolDelta,
) -> Result<ResourcePoolRecord, ControlError> {
    let sql = format!(
        r#"
        UPDATE user_resources
        SET pool_ram_mb = pool_ram_mb + $2,
            pool_cpu_cores = pool_cpu_cores + $3,
            pool_storage_mb = pool_storage_mb + $4,
            updated_at = NOW()
        WHERE user_id = $1
        RETURNING {POOL_COLUMNS}
        "#
    );
    sqlx::query_as::<_, ResourcePoolRecord>(&sql)
        .bind(user_id)
        .bind(delta.ram_mb)
        .bind(delta.cpu_cores)
        .bind(delta.storage_mb)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| ControlError::UserNotFound(user_id.to_string()))
}

pub async fn grant(
    pool: &PgPool,
    user_id: &str,
    amount: i64,
    balance: BalanceKind,
    source: &str,
    description: &str,
) -> Result<ResourcePoolRecord, ControlError> {
    let mut tx = pool.begin().await?;
    lock_resource_pool(&mut tx, user_id).await?;

    let column = match balance {
        BalanceKind::Earned => "earned_balance",
        BalanceKind::Granted => "granted_balance",
    };
    let sql = format!(
        r#"
        UPDATE user_resources SET {column} = {column} + $2, updated_at = NOW()
        WHERE user_id = $1
        RETURNING {POOL_COLUMNS}
        "#
    );
    let updated = sqlx::query_as::<_, ResourcePoolRecord>(&sql)
        .bind(user_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

    insert_ledger_entry(&mut tx, user_id, "grant", balance, amount, source, description).await?;

    tx.commit().await?;
    Ok(updated)
}

pub async fn spend(
    pool: &PgPool,
    user_id: &str,
    amount: i64,
    description: &str,
) -> Result<ResourcePoolRecord, ControlError> {
    let mut tx = pool.begin().await?;
    let updated = debit(&mut tx, user_id, amount, description).await?;
    tx.commit().await?;
    Ok(updated)
}

pub async fn add_resource_pool(
    pool: &PgPool,
    user_id: &str,
    delta: PoolDelta,
) -> Result<ResourcePoolRecord, ControlError> {
    let mut conn = pool.acquire().await?;
    raise_pool(&mut conn, user_id, delta).await
}

pub async fn purchase_resources(
    pool: &PgPool,
    user_id: &str,
    cost: i64,
    delta: PoolDelta,
    description: &str,
) -> Result<ResourcePoolRecord, ControlError> {
    let mut tx = pool.begin().await?;
    debit(&mut tx, user_id, cost, description).await?;
    let updated = raise_pool(&mut tx, user_id, delta).await?;
    tx.commit().await?;
    Ok(updated)
}

async fn usage_on(conn: &mut PgConnection, user_id: &str) -> Result<ResourceUsage, ControlError> {
    let usage = sqlx::query_as::<_, ResourceUsage>(
        r#"
        SELECT COALESCE(SUM(ram_mb), 0)::BIGINT AS ram_mb,
               COALESCE(SUM(cpu_percent), 0)::BIGINT AS cpu_percent,
               COALESCE(SUM(disk_mb), 0)::BIGINT AS disk_mb
        FROM workloads
        WHERE owner_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(usage)
}

pub async fn resource_usage(pool: &PgPool, user_id: &str) -> Result<ResourceUsage, ControlError> {
    let mut conn = pool.acquire().await?;
    usage_on(&mut conn, user_id).await
}

pub async fn list_ledger_entries(
    pool: &PgPool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<LedgerEntryRecord>, ControlError> {
    let records = sqlx::query_as::<_, LedgerEntryRecord>(
        r#"
        SELECT id, user_id, kind, balance, amount, source, description, created_at
        FROM ledger_entries
        WHERE user_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

// ============================================================================
// Workload Operations
// ============================================================================

pub async fn insert_workload(
    pool: &PgPool,
    workload: &NewWorkload,
) -> Result<WorkloadRecord, ControlError> {
    let env = serde_json::to_string(&workload.env)?;
    let mut tx = pool.begin().await?;

    let resources = lock_resource_pool(&mut tx, &workload.owner_id).await?;
    let usage = usage_on(&mut tx, &workload.owner_id).await?;
    check_pool(
        &resources,
        &usage,
        workload.ram_mb,
        i64::from(workload.cpu_percent),
        workload.disk_mb,
    )?;

    let bumped = sqlx::query(
        r#"
        UPDATE nodes
        SET allocated_ram_mb = allocated_ram_mb + $2,
            allocated_disk_mb = allocated_disk_mb + $3,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(&workload.node_id)
    .bind(workload.ram_mb)
    .bind(workload.disk_mb)
    .execute(&mut *tx)
    .await?;
    if bumped.rows_affected() == 0 {
        return Err(ControlError::NodeNotFound(workload.node_id.clone()));
    }

    let sql = format!(
        r#"
        INSERT INTO workloads (id, owner_id, node_id, name, image, ram_mb, disk_mb, cpu_percent, status, env)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING {WORKLOAD_COLUMNS}
        "#
    );
    let record = sqlx::query_as::<_, WorkloadRecord>(&sql)
        .bind(new_id())
        .bind(&workload.owner_id)
        .bind(&workload.node_id)
        .bind(&workload.name)
        .bind(&workload.image)
        .bind(workload.ram_mb)
        .bind(workload.disk_mb)
        .bind(workload.cpu_percent)
        .bind(WorkloadStatus::Installing.as_str())
        .bind(env)
        .fetch_one(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(record)
}

pub async fn get_workload(
    pool: &PgPool,
    workload_id: &str,
) -> Result<Option<WorkloadRecord>, ControlError> {
    let sql = format!("SELECT {WORKLOAD_COLUMNS} FROM workloads WHERE id = $1");
    let record = sqlx::query_as::<_, WorkloadRecord>(&sql)
        .bind(workload_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

pub async fn list_workloads(
    pool: &PgPool,
    filter: &WorkloadFilter,
) -> Result<Vec<WorkloadRecord>, ControlError> {
    let sql = format!(
        r#"
        SELECT {WORKLOAD_COLUMNS} FROM workloads
        WHERE ($1::TEXT IS NULL OR owner_id = $1)
          AND ($2::TEXT IS NULL OR node_id = $2)
        ORDER BY created_at, id
        "#
    );
    let records = sqlx::query_as::<_, WorkloadRecord>(&sql)
        .bind(filter.owner_id.as_deref())
        .bind(filter.node_id.as_deref())
        .fetch_all(pool)
        .await?;

    Ok(records)
}

pub async fn update_workload_status(
    pool: &PgPool,
    workload_id: &str,
    status: WorkloadStatus,
    container_id: Option<&str>,
) -> Result<bool, ControlError> {
    let result = sqlx::query(
        r#"
        UPDATE workloads
        SET status = $2, container_id = COALESCE($3, container_id), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(workload_id)
    .bind(status.as_str())
    .bind(container_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn delete_workload(pool: &PgPool, workload_id: &str) -> Result<bool, ControlError> {
    let mut tx = pool.begin().await?;

    let row: Option<(String, i64, i64)> = sqlx::query_as(
        "SELECT node_id, ram_mb, disk_mb FROM workloads WHERE id = $1 FOR UPDATE",
    )
    .bind(workload_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some((node_id, ram_mb, disk_mb)) = row else {
        return Ok(false);
    };

    sqlx::query("DELETE FROM allocations WHERE workload_id = $1")
        .bind(workload_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM workloads WHERE id = $1")
        .bind(workload_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r#"
        UPDATE nodes
        SET allocated_ram_mb = GREATEST(allocated_ram_mb - $2, 0),
            allocated_disk_mb = GREATEST(allocated_disk_mb - $3, 0),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(&node_id)
    .bind(ram_mb)
    .bind(disk_mb)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

// ============================================================================
// Allocation Operations
// ============================================================================

pub async fn assign_port(
    pool: &PgPool,
    workload_id: &str,
    node_id: &str,
    range: &PortRange,
) -> Result<AllocationRecord, ControlError> {
    let mut tx = pool.begin().await?;

    // Serializes concurrent assignments on this node.
    let host: String = sqlx::query_scalar("SELECT host FROM nodes WHERE id = $1 FOR UPDATE")
        .bind(node_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::NodeNotFound(node_id.to_string()))?;

    let placed_on: String = sqlx::query_scalar("SELECT node_id FROM workloads WHERE id = $1")
        .bind(workload_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| ControlError::WorkloadNotFound(workload_id.to_string()))?;
    if placed_on != node_id {
        return Err(ControlError::validation(
            "node_id",
            format!("workload '{}' is placed on node '{}'", workload_id, placed_on),
        ));
    }

    let taken: HashSet<i32> = sqlx::query_scalar(
        r#"
        SELECT port FROM allocations
        WHERE node_id = $1 AND assigned AND port BETWEEN $2 AND $3
        "#,
    )
    .bind(node_id)
    .bind(i32::from(range.start()))
    .bind(i32::from(range.end()))
    .fetch_all(&mut *tx)
    .await?
    .into_iter()
    .collect();

    let port = range
        .iter()
        .find(|p| !taken.contains(&i32::from(*p)))
        .ok_or_else(|| ControlError::PortRangeExhausted {
            node_id: node_id.to_string(),
            range: range.to_string(),
        })?;

    let sql = format!(
        r#"
        INSERT INTO allocations (id, node_id, workload_id, ip, port, assigned)
        VALUES ($1, $2, $3, $4, $5, TRUE)
        RETURNING {ALLOCATION_COLUMNS}
        "#
    );
    let allocation = sqlx::query_as::<_, AllocationRecord>(&sql)
        .bind(new_id())
        .bind(node_id)
        .bind(workload_id)
        .bind(&host)
        .bind(i32::from(port))
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query(
        r#"
        UPDATE workloads
        SET primary_allocation_id = COALESCE(primary_allocation_id, $2), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(workload_id)
    .bind(&allocation.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(allocation)
}

pub async fn get_allocation(
    pool: &PgPool,
    allocation_id: &str,
) -> Result<Option<AllocationRecord>, ControlError> {
    let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE id = $1");
    let record = sqlx::query_as::<_, AllocationRecord>(&sql)
        .bind(allocation_id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

pub async fn list_allocations(
    pool: &PgPool,
    workload_id: &str,
) -> Result<Vec<AllocationRecord>, ControlError> {
    let sql = format!(
        "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE workload_id = $1 ORDER BY port"
    );
    let records = sqlx::query_as::<_, AllocationRecord>(&sql)
        .bind(workload_id)
        .fetch_all(pool)
        .await?;

    Ok(records)
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn insert_node(&self, node: &NewNode) -> Result<NodeRecord, ControlError> {
        insert_node(&self.pool, node).await
    }

    async fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, ControlError> {
        get_node(&self.pool, node_id).await
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ControlError> {
        list_nodes(&self.pool).await
    }

    async fn set_node_maintenance(
        &self,
        node_id: &str,
        maintenance: bool,
    ) -> Result<bool, ControlError> {
        set_node_maintenance(&self.pool, node_id, maintenance).await
    }

    async fn delete_node(&self, node_id: &str) -> Result<bool, ControlError> {
        delete_node(&self.pool, node_id).await
    }

    async fn create_user(
        &self,
        username: &str,
        starting_grant: i64,
    ) -> Result<UserRecord, ControlError> {
        create_user(&self.pool, username, starting_grant).await
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, ControlError> {
        get_user(&self.pool, user_id).await
    }

    async fn get_resource_pool(
        &self,
        user_id: &str,
    ) -> Result<Option<ResourcePoolRecord>, ControlError> {
        get_resource_pool(&self.pool, user_id).await
    }

    async fn grant(
        &self,
        user_id: &str,
        amount: i64,
        balance: BalanceKind,
        source: &str,
        description: &str,
    ) -> Result<ResourcePoolRecord, ControlError> {
        grant(&self.pool, user_id, amount, balance, source, description).await
    }

    async fn spend(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<ResourcePoolRecord, ControlError> {
        spend(&self.pool, user_id, amount, description).await
    }

    async fn add_resource_pool(
        &self,
        user_id: &str,
        delta: PoolDelta,
    ) -> Result<ResourcePoolRecord, ControlError> {
        add_resource_pool(&self.pool, user_id, delta).await
    }

    async fn purchase_resources(
        &self,
        user_id: &str,
        cost: i64,
        delta: PoolDelta,
        description: &str,
    ) -> Result<ResourcePoolRecord, ControlError> {
        purchase_resources(&self.pool, user_id, cost, delta, description).await
    }

    async fn resource_usage(&self, user_id: &str) -> Result<ResourceUsage, ControlError> {
        resource_usage(&self.pool, user_id).await
    }

    async fn list_ledger_entries(
        &self,
        user_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerEntryRecord>, ControlError> {
        list_ledger_entries(&self.pool, user_id, limit).await
    }

    async fn insert_workload(
        &self,
        workload: &NewWorkload,
    ) -> Result<WorkloadRecord, ControlError> {
        insert_workload(&self.pool, workload).await
    }

    async fn get_workload(
        &self,
        workload_id: &str,
    ) -> Result<Option<WorkloadRecord>, ControlError> {
        get_workload(&self.pool, workload_id).await
    }

    async fn list_workloads(
        &self,
        filter: &WorkloadFilter,
    ) -> Result<Vec<WorkloadRecord>, ControlError> {
        list_workloads(&self.pool, filter).await
    }

    async fn update_workload_status(
        &self,
        workload_id: &str,
        status: WorkloadStatus,
        container_id: Option<&str>,
    ) -> Result<bool, ControlError> {
        update_workload_status(&self.pool, workload_id, status, container_id).await
    }

    async fn delete_workload(&self, workload_id: &str) -> Result<bool, ControlError> {
        delete_workload(&self.pool, workload_id).await
    }

    async fn assign_port(
        &self,
        workload_id: &str,
        node_id: &str,
        range: &PortRange,
    ) -> Result<AllocationRecord, ControlError> {
        assign_port(&self.pool, workload_id, node_id, range).await
    }

    async fn get_allocation(
        &self,
        allocation_id: &str,
    ) -> Result<Option<AllocationRecord>, ControlError> {
        get_allocation(&self.pool, allocation_id).await
    }

    async fn list_allocations(
        &self,
        workload_id: &str,
    ) -> Result<Vec<AllocationRecord>, ControlError> {
        list_allocations(&self.pool, workload_id).await
    }

    async fn health_check_db(&self) -> Result<bool, ControlError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
