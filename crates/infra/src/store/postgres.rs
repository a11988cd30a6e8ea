//! Postgres-backed inventory ledger.
//!
//! Reservations are a single guarded decrement
//! (`UPDATE ... SET available = available - $q WHERE ... AND available >= $q`)
//! and releases clamp with `LEAST(quantity, available + $q)`. Both run in a
//! transaction that holds the event row lock and recomputes the aggregate
//! counters, so two concurrent reservations for the last ticket serialize and
//! the second one observes the decremented counter.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EngineError |
//! |------------|----------------------|-------------|
//! | Database (unique violation) | `23505` | `Domain(Conflict)` |
//! | Database (check constraint violation) | `23514` | `Domain(Conflict)` |
//! | Database (other) | Any other | `Store(Backend)` |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Store(Unavailable)` |
//! | Other | N/A | `Store(Backend)` |

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Runtime;
use tracing::{debug, instrument};
use uuid::Uuid;

use boxoffice_core::{AggregateRoot, DomainError, EventId, OrganizerId, TicketTypeId};
use boxoffice_inventory::{EventInventory, Release, Reservation, StoredInventory, TicketType};

use super::InventoryLedger;
use crate::error::{EngineError, EngineResult, StoreError};

/// DDL for the ledger tables. Counters are CHECK-constrained so a bad write can
/// never persist a negative or over-full count.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS event_inventory (
    event_id          UUID PRIMARY KEY,
    organizer_id      UUID NOT NULL,
    starts_at         TIMESTAMPTZ NOT NULL,
    base_price        BIGINT NOT NULL CHECK (base_price >= 0),
    seat_capacity     BIGINT CHECK (seat_capacity IS NULL OR seat_capacity > 0),
    total_tickets     BIGINT NOT NULL CHECK (total_tickets >= 0),
    available_tickets BIGINT NOT NULL CHECK (available_tickets >= 0 AND available_tickets <= total_tickets),
    version           BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS ticket_types (
    ticket_type_id UUID PRIMARY KEY,
    event_id       UUID NOT NULL REFERENCES event_inventory (event_id) ON DELETE CASCADE,
    ordinal        INTEGER NOT NULL,
    name           TEXT NOT NULL,
    price          BIGINT NOT NULL CHECK (price >= 0),
    quantity       BIGINT NOT NULL CHECK (quantity > 0),
    available      BIGINT NOT NULL CHECK (available >= 0 AND available <= quantity),
    UNIQUE (event_id, name)
);
"#;

/// Inventory ledger persisted in Postgres.
///
/// The storage traits are synchronous, so the ledger owns a small tokio
/// runtime and blocks on it. Do not call it from inside another runtime's
/// async context.
pub struct PostgresInventoryLedger {
    pool: PgPool,
    runtime: Runtime,
}

impl core::fmt::Debug for PostgresInventoryLedger {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PostgresInventoryLedger").finish_non_exhaustive()
    }
}

impl PostgresInventoryLedger {
    pub fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to start runtime: {e}")))?;
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .connect(database_url),
            )
            .map_err(|e| StoreError::Unavailable(format!("failed to connect: {e}")))?;
        Ok(Self { pool, runtime })
    }

    /// Create the ledger tables if they do not exist.
    pub fn migrate(&self) -> EngineResult<()> {
        self.runtime.block_on(async {
            sqlx::raw_sql(SCHEMA)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
            Ok(())
        })
    }

    async fn insert(&self, inventory: &EventInventory) -> EngineResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO event_inventory (
                event_id, organizer_id, starts_at, base_price, seat_capacity,
                total_tickets, available_tickets, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(inventory.event_id().as_uuid())
        .bind(inventory.organizer_id().as_uuid())
        .bind(inventory.starts_at())
        .bind(to_db(inventory.base_price())?)
        .bind(inventory.seat_capacity().map(i64::from))
        .bind(i64::from(inventory.total_tickets()))
        .bind(i64::from(inventory.available_tickets()))
        .bind(to_db(inventory.version())?)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DomainError::conflict(format!(
                    "inventory for event {} already exists",
                    inventory.event_id()
                ))
                .into()
            } else {
                map_sqlx_error("insert_inventory", e)
            }
        })?;

        for (ordinal, tt) in inventory.ticket_types().iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO ticket_types (
                    ticket_type_id, event_id, ordinal, name, price, quantity, available
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(tt.id.as_uuid())
            .bind(inventory.event_id().as_uuid())
            .bind(i32::try_from(ordinal).unwrap_or(i32::MAX))
            .bind(&tt.name)
            .bind(to_db(tt.price)?)
            .bind(i64::from(tt.quantity))
            .bind(i64::from(tt.available))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_ticket_type", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(())
    }

    async fn load(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        for_update: bool,
    ) -> EngineResult<Option<EventInventory>> {
        let sql = if for_update {
            "SELECT * FROM event_inventory WHERE event_id = $1 FOR UPDATE"
        } else {
            "SELECT * FROM event_inventory WHERE event_id = $1"
        };
        let Some(row) = sqlx::query(sql)
            .bind(event_id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("load_inventory", e))?
        else {
            return Ok(None);
        };

        let type_rows = sqlx::query(
            r#"
            SELECT ticket_type_id, name, price, quantity, available
            FROM ticket_types
            WHERE event_id = $1
            ORDER BY ordinal ASC
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_ticket_types", e))?;

        let ticket_types = type_rows
            .iter()
            .map(ticket_type_from_row)
            .collect::<Result<Vec<_>, StoreError>>()?;
        let stored = inventory_from_row(&row, ticket_types)?;
        Ok(Some(EventInventory::restore(stored)?))
    }

    /// Lock the event row, apply `f` to the loaded inventory and persist the
    /// changed counters in one transaction.
    async fn mutate<T>(
        &self,
        operation: &'static str,
        event_id: EventId,
        f: impl FnOnce(&mut EventInventory) -> Result<T, DomainError>,
    ) -> EngineResult<T> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut inventory = self
            .load(&mut tx, event_id, true)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("event {event_id}")))?;
        let loaded_version = inventory.version();

        // A domain rejection drops the transaction, which rolls it back.
        let out = f(&mut inventory)?;

        let updated = sqlx::query(
            r#"
            UPDATE event_inventory
            SET available_tickets = $2, version = $3
            WHERE event_id = $1 AND version = $4
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(i64::from(inventory.available_tickets()))
        .bind(to_db(inventory.version())?)
        .bind(to_db(loaded_version)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;
        if updated.rows_affected() != 1 {
            return Err(DomainError::conflict(format!(
                "inventory for event {event_id} changed concurrently"
            ))
            .into());
        }

        for tt in inventory.ticket_types() {
            sqlx::query("UPDATE ticket_types SET available = $2, price = $3 WHERE ticket_type_id = $1")
                .bind(tt.id.as_uuid())
                .bind(i64::from(tt.available))
                .bind(to_db(tt.price)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(operation, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        debug!(%event_id, operation, available = inventory.available_tickets(), "inventory updated");
        Ok(out)
    }
}

impl PostgresInventoryLedger {
    /// Lock the event row and validate the request against the loaded
    /// counters, so rejections carry the same errors as the in-memory ledger.
    async fn lock_and_check<T>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event_id: EventId,
        check: impl FnOnce(&mut EventInventory) -> Result<T, DomainError>,
    ) -> EngineResult<EventInventory> {
        let inventory = self
            .load(tx, event_id, true)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("event {event_id}")))?;
        check(&mut inventory.clone())?;
        Ok(inventory)
    }

    async fn reserve_guarded(
        &self,
        event_id: EventId,
        ticket_type: Option<TicketTypeId>,
        quantity: u32,
    ) -> EngineResult<Reservation> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let inventory = self
            .lock_and_check(&mut tx, event_id, |inv| inv.reserve(ticket_type, quantity))
            .await?;

        let reservation = match ticket_type.filter(|_| inventory.uses_ticket_types()) {
            Some(type_id) => {
                let row = sqlx::query(
                    r#"
                    UPDATE ticket_types
                    SET available = available - $3
                    WHERE event_id = $1 AND ticket_type_id = $2 AND available >= $3
                    RETURNING name, price, available
                    "#,
                )
                .bind(event_id.as_uuid())
                .bind(type_id.as_uuid())
                .bind(i64::from(quantity))
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("reserve_ticket_type", e))?
                .ok_or_else(|| {
                    let available = inventory.ticket_type(type_id).map_or(0, |t| t.available);
                    DomainError::insufficient(quantity, available)
                })?;
                recompute_totals(&mut tx, event_id).await?;

                Reservation {
                    event_id,
                    ticket_type_id: Some(type_id),
                    ticket_type_name: Some(row.try_get("name").map_err(|e| decode("reserve", e))?),
                    unit_price: from_db(row.try_get("price").map_err(|e| decode("reserve", e))?)?,
                    quantity,
                    remaining: from_db(row.try_get("available").map_err(|e| decode("reserve", e))?)?,
                }
            }
            None => {
                let row = sqlx::query(
                    r#"
                    UPDATE event_inventory
                    SET available_tickets = available_tickets - $2, version = version + 1
                    WHERE event_id = $1 AND available_tickets >= $2
                    RETURNING available_tickets
                    "#,
                )
                .bind(event_id.as_uuid())
                .bind(i64::from(quantity))
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("reserve_tickets", e))?
                .ok_or_else(|| DomainError::insufficient(quantity, inventory.available_tickets()))?;

                Reservation {
                    event_id,
                    ticket_type_id: None,
                    ticket_type_name: None,
                    unit_price: inventory.base_price(),
                    quantity,
                    remaining: from_db(
                        row.try_get("available_tickets").map_err(|e| decode("reserve", e))?,
                    )?,
                }
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        debug!(%event_id, quantity, remaining = reservation.remaining, "tickets reserved");
        Ok(reservation)
    }

    async fn release_guarded(
        &self,
        event_id: EventId,
        ticket_type_name: Option<&str>,
        quantity: u32,
    ) -> EngineResult<Release> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        let inventory = self
            .lock_and_check(&mut tx, event_id, |inv| inv.release(ticket_type_name, quantity))
            .await?;

        let row = match ticket_type_name.filter(|_| inventory.uses_ticket_types()) {
            Some(name) => {
                let row = sqlx::query(
                    r#"
                    WITH before AS (
                        SELECT ticket_type_id, available FROM ticket_types
                        WHERE event_id = $1 AND name = $2
                    )
                    UPDATE ticket_types t
                    SET available = LEAST(t.quantity, t.available + $3)
                    FROM before
                    WHERE t.ticket_type_id = before.ticket_type_id
                    RETURNING t.available AS available, t.available - before.available AS released
                    "#,
                )
                .bind(event_id.as_uuid())
                .bind(name)
                .bind(i64::from(quantity))
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("release_ticket_type", e))?;
                recompute_totals(&mut tx, event_id).await?;
                row
            }
            None => sqlx::query(
                r#"
                WITH before AS (
                    SELECT available_tickets FROM event_inventory WHERE event_id = $1
                )
                UPDATE event_inventory e
                SET available_tickets = LEAST(e.total_tickets, e.available_tickets + $2),
                    version = e.version + 1
                FROM before
                WHERE e.event_id = $1
                RETURNING e.available_tickets AS available,
                          e.available_tickets - before.available_tickets AS released
                "#,
            )
            .bind(event_id.as_uuid())
            .bind(i64::from(quantity))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("release_tickets", e))?,
        };

        let release = Release {
            released: from_db(row.try_get("released").map_err(|e| decode("release", e))?)?,
            available: from_db(row.try_get("available").map_err(|e| decode("release", e))?)?,
        };
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        debug!(%event_id, released = release.released, available = release.available, "tickets released");
        Ok(release)
    }
}

/// Set the aggregate counters to the per-type sums and bump the version.
async fn recompute_totals(tx: &mut Transaction<'_, Postgres>, event_id: EventId) -> EngineResult<()> {
    sqlx::query(
        r#"
        UPDATE event_inventory e
        SET total_tickets = s.total, available_tickets = s.available, version = e.version + 1
        FROM (
            SELECT COALESCE(SUM(quantity), 0) AS total, COALESCE(SUM(available), 0) AS available
            FROM ticket_types WHERE event_id = $1
        ) s
        WHERE e.event_id = $1
        "#,
    )
    .bind(event_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("recompute_totals", e))?;
    Ok(())
}

fn decode(operation: &'static str, err: sqlx::Error) -> StoreError {
    StoreError::Backend {
        operation,
        message: format!("failed to decode row: {err}"),
    }
}

impl InventoryLedger for PostgresInventoryLedger {
    #[instrument(skip(self, inventory), fields(event_id = %inventory.event_id()), err)]
    fn publish(&self, inventory: EventInventory) -> EngineResult<()> {
        self.runtime.block_on(self.insert(&inventory))
    }

    fn get(&self, event_id: EventId) -> Result<Option<EventInventory>, StoreError> {
        self.runtime
            .block_on(async {
                let mut tx = self
                    .pool
                    .begin()
                    .await
                    .map_err(|e| map_sqlx_error("begin_transaction", e))?;
                let found = self.load(&mut tx, event_id, false).await?;
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                Ok::<_, EngineError>(found)
            })
            .map_err(|e| match e {
                EngineError::Store(s) => s,
                // Rows that fail the ledger invariants are corrupt storage.
                EngineError::Domain(d) => StoreError::Backend {
                    operation: "load_inventory",
                    message: d.to_string(),
                },
            })
    }

    #[instrument(skip(self), err)]
    fn reserve(
        &self,
        event_id: EventId,
        ticket_type: Option<TicketTypeId>,
        quantity: u32,
    ) -> EngineResult<Reservation> {
        self.runtime.block_on(self.reserve_guarded(event_id, ticket_type, quantity))
    }

    #[instrument(skip(self), err)]
    fn release(
        &self,
        event_id: EventId,
        ticket_type_name: Option<&str>,
        quantity: u32,
    ) -> EngineResult<Release> {
        self.runtime
            .block_on(self.release_guarded(event_id, ticket_type_name, quantity))
    }

    fn reprice(&self, event_id: EventId, ticket_type: TicketTypeId, price: u64) -> EngineResult<()> {
        self.runtime.block_on(
            self.mutate("reprice", event_id, |inv| inv.reprice(ticket_type, price)),
        )
    }
}

fn inventory_from_row(row: &PgRow, ticket_types: Vec<TicketType>) -> Result<StoredInventory, StoreError> {
    let read = |e: sqlx::Error| StoreError::Backend {
        operation: "decode_inventory",
        message: e.to_string(),
    };
    let event_id: Uuid = row.try_get("event_id").map_err(read)?;
    let organizer_id: Uuid = row.try_get("organizer_id").map_err(read)?;
    let seat_capacity: Option<i64> = row.try_get("seat_capacity").map_err(read)?;

    Ok(StoredInventory {
        event_id: EventId::from_uuid(event_id),
        organizer_id: OrganizerId::from_uuid(organizer_id),
        starts_at: row.try_get("starts_at").map_err(read)?,
        base_price: from_db(row.try_get("base_price").map_err(read)?)?,
        seat_capacity: seat_capacity.map(from_db).transpose()?,
        ticket_types,
        total_tickets: from_db(row.try_get("total_tickets").map_err(read)?)?,
        available_tickets: from_db(row.try_get("available_tickets").map_err(read)?)?,
        version: from_db(row.try_get("version").map_err(read)?)?,
    })
}

fn ticket_type_from_row(row: &PgRow) -> Result<TicketType, StoreError> {
    let read = |e: sqlx::Error| StoreError::Backend {
        operation: "decode_ticket_type",
        message: e.to_string(),
    };
    let id: Uuid = row.try_get("ticket_type_id").map_err(read)?;
    Ok(TicketType {
        id: TicketTypeId::from_uuid(id),
        name: row.try_get("name").map_err(read)?,
        price: from_db(row.try_get("price").map_err(read)?)?,
        quantity: from_db(row.try_get("quantity").map_err(read)?)?,
        available: from_db(row.try_get("available").map_err(read)?)?,
    })
}

fn to_db(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Backend {
        operation: "encode",
        message: format!("{value} does not fit in BIGINT"),
    })
}

fn from_db<T: TryFrom<i64>>(value: i64) -> Result<T, StoreError> {
    T::try_from(value).map_err(|_| StoreError::Backend {
        operation: "decode",
        message: format!("column value {value} is out of range"),
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Map SQLx errors to EngineError.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> EngineError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                // Unique violation / check constraint violation
                Some("23505") | Some("23514") => DomainError::conflict(message).into(),
                _ => StoreError::Backend { operation, message }.into(),
            }
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{operation}: {err}")).into()
        }
        other => StoreError::Backend {
            operation,
            message: other.to_string(),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_guarded_counters() {
        assert!(SCHEMA.contains("available_tickets <= total_tickets"));
        assert!(SCHEMA.contains("available >= 0 AND available <= quantity"));
        assert!(SCHEMA.contains("UNIQUE (event_id, name)"));
    }

    #[test]
    fn pool_failures_are_storage_unavailable() {
        let err = map_sqlx_error("reserve", sqlx::Error::PoolTimedOut);
        assert!(matches!(err, EngineError::Store(StoreError::Unavailable(_))));
        assert!(err.is_fatal());
    }

    #[test]
    fn out_of_range_columns_are_backend_errors() {
        assert!(from_db::<u32>(-1).is_err());
        assert_eq!(from_db::<u32>(7).unwrap(), 7);
        assert!(to_db(u64::MAX).is_err());
    }
}
