// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ledger in PostgreSQL
//!
//! Each [`LedgerTransaction`] claims one pooled connection and runs a
//! database transaction on it from `BEGIN` to `COMMIT`.  Advisory locks are
//! `pg_advisory_xact_lock`, bounded by `lock_timeout`, so they are released
//! by the database when the transaction ends on any Nexus.

use super::not_found;
use super::Ledger;
use super::LedgerTransaction;
use super::Query;
use super::Row;
use super::Stored;
use super::Table;
use crate::db::advisory_lock::AdvisoryLockKey;
use crate::db::error::is_lock_timeout;
use crate::db::error::public_error_from_diesel;
use crate::db::error::public_error_from_diesel_create;
use crate::db::pool::DbConnection;
use crate::db::pool::Pool;
use crate::db::pool::PooledConnection;
use async_bb8_diesel::AsyncRunQueryDsl;
use async_bb8_diesel::AsyncSimpleConnection;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::sql_types::BigInt;
use ironplane_common::api::external::Error;
use ironplane_db_model::schema;
use ironplane_db_model::Allocation;
use ironplane_db_model::AllocationConstraint;
use ironplane_db_model::Instance;
use ironplane_db_model::InstanceType;
use ironplane_db_model::IpBlock;
use ironplane_db_model::Machine;
use ironplane_db_model::MachineInstanceType;
use ironplane_db_model::MachineStatus;
use ironplane_db_model::Subnet;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

type Conn = async_bb8_diesel::Connection<DbConnection>;

/// Longest `lock_timeout` PostgreSQL accepts, in milliseconds
const MAX_LOCK_TIMEOUT_MS: u128 = i32::MAX as u128;

fn into_rows<T: Stored>(rows: Vec<T>) -> Vec<Row> {
    rows.into_iter().map(T::into_row).collect()
}

macro_rules! row_statements {
    ($($variant:ident: $model:ty => $table:ident),* $(,)?) => {
        async fn get_row(
            conn: &Conn,
            table: Table,
            id: Uuid,
        ) -> Result<Option<Row>, DieselError> {
            match table {
                $(
                    Table::$variant => {
                        use schema::$table::dsl;
                        dsl::$table
                            .filter(dsl::id.eq(id))
                            .select(<$model>::as_select())
                            .first_async(conn)
                            .await
                            .optional()
                            .map(|row| row.map(Row::$variant))
                    }
                )*
            }
        }

        async fn select_table(
            conn: &Conn,
            table: Table,
        ) -> Result<Vec<Row>, DieselError> {
            match table {
                $(
                    Table::$variant => {
                        use schema::$table::dsl;
                        dsl::$table
                            .order(dsl::id)
                            .select(<$model>::as_select())
                            .load_async(conn)
                            .await
                            .map(into_rows)
                    }
                )*
            }
        }

        async fn insert_row(
            conn: &Conn,
            row: Row,
        ) -> Result<usize, DieselError> {
            match row {
                $(
                    Row::$variant(row) => {
                        diesel::insert_into(schema::$table::table)
                            .values(row)
                            .execute_async(conn)
                            .await
                    }
                )*
            }
        }

        async fn update_row(
            conn: &Conn,
            row: Row,
        ) -> Result<usize, DieselError> {
            match row {
                $(
                    Row::$variant(row) => {
                        use schema::$table::dsl;
                        let id = row.id;
                        diesel::update(dsl::$table.filter(dsl::id.eq(id)))
                            .set(row)
                            .execute_async(conn)
                            .await
                    }
                )*
            }
        }

        async fn delete_row(
            conn: &Conn,
            table: Table,
            id: Uuid,
        ) -> Result<usize, DieselError> {
            match table {
                $(
                    Table::$variant => {
                        use schema::$table::dsl;
                        diesel::delete(dsl::$table.filter(dsl::id.eq(id)))
                            .execute_async(conn)
                            .await
                    }
                )*
            }
        }
    };
}

row_statements! {
    Allocation: Allocation => allocation,
    AllocationConstraint: AllocationConstraint => allocation_constraint,
    Instance: Instance => instance,
    InstanceType: InstanceType => instance_type,
    IpBlock: IpBlock => ip_block,
    Machine: Machine => machine,
    MachineInstanceType: MachineInstanceType => machine_instance_type,
    Subnet: Subnet => subnet,
}

async fn select_rows(
    conn: &Conn,
    query: &Query,
) -> Result<Vec<Row>, DieselError> {
    match query.clone() {
        Query::All(table) => select_table(conn, table).await,
        Query::AllocationsForTenant { tenant_id } => {
            use schema::allocation::dsl;
            dsl::allocation
                .filter(dsl::tenant_id.eq(tenant_id))
                .order(dsl::id)
                .select(Allocation::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::AllocationsForTenantAtSite {
            infrastructure_provider_id,
            tenant_id,
            site_id,
        } => {
            use schema::allocation::dsl;
            let mut query = dsl::allocation
                .filter(dsl::tenant_id.eq(tenant_id))
                .filter(dsl::site_id.eq(site_id))
                .into_boxed();
            if let Some(provider_id) = infrastructure_provider_id {
                query = query
                    .filter(dsl::infrastructure_provider_id.eq(provider_id));
            }
            query
                .order(dsl::id)
                .select(Allocation::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::ConstraintsForAllocation { allocation_id } => {
            use schema::allocation_constraint::dsl;
            dsl::allocation_constraint
                .filter(dsl::allocation_id.eq(allocation_id))
                .order(dsl::id)
                .select(AllocationConstraint::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::ConstraintsReferencing { resource_type, resource_type_id } => {
            use schema::allocation_constraint::dsl;
            dsl::allocation_constraint
                .filter(dsl::resource_type.eq(resource_type))
                .filter(dsl::resource_type_id.eq(resource_type_id))
                .order(dsl::id)
                .select(AllocationConstraint::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::ConstraintsForDerivedBlock { ip_block_id } => {
            use schema::allocation_constraint::dsl;
            dsl::allocation_constraint
                .filter(dsl::derived_resource_id.eq(ip_block_id))
                .order(dsl::id)
                .select(AllocationConstraint::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::InstancesForConstraint { allocation_constraint_id } => {
            use schema::instance::dsl;
            dsl::instance
                .filter(
                    dsl::allocation_constraint_id.eq(allocation_constraint_id),
                )
                .order(dsl::id)
                .select(Instance::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::InstancesOnMachine { machine_id } => {
            use schema::instance::dsl;
            dsl::instance
                .filter(dsl::machine_id.eq(machine_id))
                .order(dsl::id)
                .select(Instance::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::AssociationsForMachine { machine_id } => {
            use schema::machine_instance_type::dsl;
            dsl::machine_instance_type
                .filter(dsl::machine_id.eq(machine_id))
                .order(dsl::id)
                .select(MachineInstanceType::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::AssociationsForInstanceType { instance_type_id } => {
            use schema::machine_instance_type::dsl;
            dsl::machine_instance_type
                .filter(dsl::instance_type_id.eq(instance_type_id))
                .order(dsl::id)
                .select(MachineInstanceType::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::SupplyMachines { instance_type_id } => {
            use schema::machine::dsl;
            dsl::machine
                .filter(dsl::instance_type_id.eq(instance_type_id))
                .filter(dsl::status.eq_any(MachineStatus::SUPPLY.to_vec()))
                .order(dsl::id)
                .select(Machine::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::IpBlocksWithParent { parent_id } => {
            use schema::ip_block::dsl;
            dsl::ip_block
                .filter(dsl::parent_id.eq(parent_id))
                .order(dsl::id)
                .select(IpBlock::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::ParentIpBlocksByNetwork {
            infrastructure_provider_id,
            site_id,
            routing_type,
            network,
        } => {
            use schema::ip_block::dsl;
            dsl::ip_block
                .filter(dsl::tenant_id.is_null())
                .filter(
                    dsl::infrastructure_provider_id
                        .eq(infrastructure_provider_id),
                )
                .filter(dsl::site_id.eq(site_id))
                .filter(dsl::routing_type.eq(routing_type))
                .filter(dsl::network.eq(network))
                .order(dsl::id)
                .select(IpBlock::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
        Query::SubnetsForBlock { ip_block_id } => {
            use schema::subnet::dsl;
            dsl::subnet
                .filter(dsl::ip_block_id.eq(ip_block_id))
                .order(dsl::id)
                .select(Subnet::as_select())
                .load_async(conn)
                .await
                .map(into_rows)
        }
    }
}

/// The ledger kept in a PostgreSQL database reached through `pool`
pub struct PostgresLedger {
    log: Logger,
    pool: Arc<Pool>,
}

impl PostgresLedger {
    pub fn new(log: &Logger, pool: Arc<Pool>) -> PostgresLedger {
        PostgresLedger {
            log: log.new(o!("component" => "PostgresLedger")),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn begin(
        &self,
        log: &Logger,
    ) -> Result<Box<dyn LedgerTransaction>, Error> {
        let conn = self.pool.claim().await.map_err(|err| {
            warn!(self.log, "failed to claim connection";
                InlineErrorChain::new(&err),
            );
            err
        })?;
        conn.batch_execute_async("BEGIN")
            .await
            .map_err(public_error_from_diesel)?;
        Ok(Box::new(PostgresTransaction {
            log: log.clone(),
            conn: Some(conn),
            finished: false,
        }))
    }
}

struct PostgresTransaction {
    log: Logger,
    /// Taken by `drop` to roll back off the caller's task
    conn: Option<PooledConnection>,
    finished: bool,
}

impl PostgresTransaction {
    fn conn(&self) -> Result<&Conn, Error> {
        self.conn
            .as_deref()
            .ok_or_else(|| {
                Error::internal_error("transaction has no connection")
            })
    }
}

#[async_trait]
impl LedgerTransaction for PostgresTransaction {
    async fn advisory_lock(
        &mut self,
        key: AdvisoryLockKey,
        wait: Duration,
    ) -> Result<bool, Error> {
        let conn = self.conn()?;
        // Zero would mean no bound at all.
        let millis = wait.as_millis().clamp(1, MAX_LOCK_TIMEOUT_MS);
        conn.batch_execute_async(&format!(
            "SET LOCAL lock_timeout = {}",
            millis
        ))
        .await
        .map_err(public_error_from_diesel)?;
        let result = diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
            .bind::<BigInt, _>(key.as_i64())
            .execute_async(conn)
            .await;
        match result {
            Ok(_) => Ok(true),
            // The database transaction is aborted from here on, which is
            // fine: a caller that cannot lock gives up on the transaction.
            Err(err) if is_lock_timeout(&err) => Ok(false),
            Err(err) => Err(public_error_from_diesel(err)),
        }
    }

    async fn get(
        &mut self,
        table: Table,
        id: Uuid,
    ) -> Result<Option<Row>, Error> {
        get_row(self.conn()?, table, id).await.map_err(public_error_from_diesel)
    }

    async fn select(&mut self, query: &Query) -> Result<Vec<Row>, Error> {
        select_rows(self.conn()?, query).await.map_err(public_error_from_diesel)
    }

    async fn insert(&mut self, row: Row) -> Result<(), Error> {
        let (table, id) = (row.table(), row.id());
        insert_row(self.conn()?, row).await.map_err(|err| {
            public_error_from_diesel_create(
                err,
                table.resource_type(),
                &id.to_string(),
            )
        })?;
        Ok(())
    }

    async fn update(&mut self, row: Row) -> Result<(), Error> {
        let (table, id) = (row.table(), row.id());
        let updated = update_row(self.conn()?, row)
            .await
            .map_err(public_error_from_diesel)?;
        if updated == 0 {
            return Err(not_found(table, id));
        }
        Ok(())
    }

    async fn delete(&mut self, table: Table, id: Uuid) -> Result<(), Error> {
        let deleted = delete_row(self.conn()?, table, id)
            .await
            .map_err(public_error_from_diesel)?;
        if deleted == 0 {
            return Err(not_found(table, id));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), Error> {
        self.conn()?
            .batch_execute_async("COMMIT")
            .await
            .map_err(public_error_from_diesel)?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(conn) = self.conn.take() else {
            return;
        };
        // The connection goes back to the pool only once it is out of the
        // transaction.
        let log = self.log.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = conn.batch_execute_async("ROLLBACK").await
                    {
                        warn!(log, "failed to roll back";
                            InlineErrorChain::new(&err),
                        );
                    }
                });
            }
            Err(_) => {
                error!(log, "no runtime to roll back on");
            }
        }
    }
}
