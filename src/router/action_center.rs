// =============================================================================
// Action Center — pending orders awaiting human approval
// =============================================================================
//
// Semi-Auto keys queue their order placements here. The ownership check on
// approve/reject/delete is non-negotiable: only the owning user may act on
// a row, and a foreign caller gets OwnershipViolation with the row left
// untouched. Stored blobs never contain an API key.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::GatewayError;

/// Status of a pending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Pending,
    Approved,
    Rejected,
}

impl PendingStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

/// One queued operation.
#[derive(Debug, Clone, Serialize)]
pub struct PendingOrder {
    pub id: i64,
    pub user_id: String,
    pub api_type: String,
    pub order_blob: Value,
    pub status: PendingStatus,
    pub created_at: String,
    pub decided_at: Option<String>,
    pub decided_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub broker_order_id: Option<String>,
}

/// Event published when the queue changes; UI layers subscribe.
#[derive(Debug, Clone, Serialize)]
pub struct ActionEvent {
    pub kind: &'static str,
    pub pending_order_id: i64,
    pub user_id: String,
}

pub struct ActionCenter {
    db_path: String,
    events: broadcast::Sender<ActionEvent>,
}

impl ActionCenter {
    pub fn new(db_path: &str) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(64);
        let center = Arc::new(Self { db_path: db_path.to_string(), events });
        center.init_db()?;
        Ok(center)
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("failed to open action center store at {}", self.db_path))
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                api_type TEXT NOT NULL,
                order_blob TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                decided_at TEXT,
                decided_by TEXT,
                rejection_reason TEXT,
                broker_order_id TEXT
            )",
            [],
        )?;
        Ok(())
    }

    /// Subscribe to queue-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.events.subscribe()
    }

    // -------------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------------

    /// Queue an operation for approval. The blob is stored with any api key
    /// field stripped — a queued row must never carry a credential.
    pub fn enqueue(
        &self,
        user_id: &str,
        api_type: &str,
        order_blob: &Value,
    ) -> Result<i64, GatewayError> {
        let sanitized = strip_api_key(order_blob);

        let conn = self.conn().map_err(|e| GatewayError::Internal(e.to_string()))?;
        conn.execute(
            "INSERT INTO pending_orders (user_id, api_type, order_blob, status, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4)",
            params![user_id, api_type, sanitized.to_string(), Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();

        info!(pending_order_id = id, user_id, api_type, "pending order created");
        let _ = self.events.send(ActionEvent {
            kind: "pending_order_created",
            pending_order_id: id,
            user_id: user_id.to_string(),
        });
        Ok(id)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Fetch a row with the ownership check applied.
    pub fn get(&self, id: i64, caller: &str) -> Result<PendingOrder, GatewayError> {
        let row = self.get_any(id)?;
        if row.user_id != caller {
            return Err(GatewayError::OwnershipViolation);
        }
        Ok(row)
    }

    fn get_any(&self, id: i64) -> Result<PendingOrder, GatewayError> {
        let conn = self.conn().map_err(|e| GatewayError::Internal(e.to_string()))?;
        conn.query_row(
            "SELECT id, user_id, api_type, order_blob, status, created_at,
                    decided_at, decided_by, rejection_reason, broker_order_id
             FROM pending_orders WHERE id = ?1",
            params![id],
            |row| {
                Ok(PendingOrder {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    api_type: row.get(2)?,
                    order_blob: serde_json::from_str(&row.get::<_, String>(3)?)
                        .unwrap_or(Value::Null),
                    status: PendingStatus::parse(&row.get::<_, String>(4)?),
                    created_at: row.get(5)?,
                    decided_at: row.get(6)?,
                    decided_by: row.get(7)?,
                    rejection_reason: row.get(8)?,
                    broker_order_id: row.get(9)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| GatewayError::Internal(format!("pending order {id} not found")))
    }

    /// All rows owned by `user_id`, newest first.
    pub fn list(&self, user_id: &str) -> Result<Vec<PendingOrder>, GatewayError> {
        let conn = self.conn().map_err(|e| GatewayError::Internal(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id FROM pending_orders WHERE user_id = ?1 ORDER BY id DESC",
            )
            .map_err(GatewayError::from)?;
        let ids: Vec<i64> = stmt
            .query_map(params![user_id], |row| row.get(0))
            .map_err(GatewayError::from)?
            .filter_map(|r| r.ok())
            .collect();

        ids.into_iter().map(|id| self.get_any(id)).collect()
    }

    // -------------------------------------------------------------------------
    // Decisions
    // -------------------------------------------------------------------------

    /// Approve a pending row: ownership check, then hand the original blob
    /// back for immediate dispatch. Only `pending` rows can be approved.
    pub fn approve(&self, id: i64, caller: &str) -> Result<PendingOrder, GatewayError> {
        let row = self.get_any(id)?;
        if row.user_id != caller {
            return Err(GatewayError::OwnershipViolation);
        }
        if row.status != PendingStatus::Pending {
            return Err(GatewayError::Internal(format!(
                "pending order {id} already {}",
                row.status.as_str()
            )));
        }
        Ok(row)
    }

    /// Record the outcome of an approved dispatch.
    pub fn mark_approved(
        &self,
        id: i64,
        caller: &str,
        broker_order_id: Option<&str>,
    ) -> Result<(), GatewayError> {
        let conn = self.conn().map_err(|e| GatewayError::Internal(e.to_string()))?;
        conn.execute(
            "UPDATE pending_orders
             SET status = 'approved', decided_at = ?1, decided_by = ?2, broker_order_id = ?3
             WHERE id = ?4",
            params![Utc::now().to_rfc3339(), caller, broker_order_id, id],
        )?;
        info!(pending_order_id = id, "pending order approved");
        let _ = self.events.send(ActionEvent {
            kind: "pending_order_approved",
            pending_order_id: id,
            user_id: caller.to_string(),
        });
        Ok(())
    }

    /// Reject a pending row with a reason. Same ownership rule as approve.
    pub fn reject(&self, id: i64, caller: &str, reason: &str) -> Result<(), GatewayError> {
        let row = self.get_any(id)?;
        if row.user_id != caller {
            return Err(GatewayError::OwnershipViolation);
        }
        if row.status != PendingStatus::Pending {
            return Err(GatewayError::Internal(format!(
                "pending order {id} already {}",
                row.status.as_str()
            )));
        }

        let conn = self.conn().map_err(|e| GatewayError::Internal(e.to_string()))?;
        conn.execute(
            "UPDATE pending_orders
             SET status = 'rejected', decided_at = ?1, decided_by = ?2, rejection_reason = ?3
             WHERE id = ?4",
            params![Utc::now().to_rfc3339(), caller, reason, id],
        )?;
        info!(pending_order_id = id, reason, "pending order rejected");
        let _ = self.events.send(ActionEvent {
            kind: "pending_order_rejected",
            pending_order_id: id,
            user_id: caller.to_string(),
        });
        Ok(())
    }

    /// Delete a row. Same ownership rule.
    pub fn delete(&self, id: i64, caller: &str) -> Result<(), GatewayError> {
        let row = self.get_any(id)?;
        if row.user_id != caller {
            return Err(GatewayError::OwnershipViolation);
        }
        let conn = self.conn().map_err(|e| GatewayError::Internal(e.to_string()))?;
        conn.execute("DELETE FROM pending_orders WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl std::fmt::Debug for ActionCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionCenter").field("db_path", &self.db_path).finish()
    }
}

/// Remove credential fields from a blob before persistence.
fn strip_api_key(blob: &Value) -> Value {
    let mut sanitized = blob.clone();
    if let Some(map) = sanitized.as_object_mut() {
        map.remove("apikey");
        map.remove("api_key");
    }
    sanitized
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn center() -> (Arc<ActionCenter>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.db");
        (ActionCenter::new(path.to_str().unwrap()).unwrap(), dir)
    }

    #[test]
    fn enqueue_strips_api_key() {
        let (c, _d) = center();
        let blob = json!({"apikey": "k-secret", "symbol": "RELIANCE", "quantity": 1});
        let id = c.enqueue("u1", "placeorder", &blob).unwrap();

        let row = c.get(id, "u1").unwrap();
        assert_eq!(row.status, PendingStatus::Pending);
        assert!(row.order_blob.get("apikey").is_none());
        assert_eq!(row.order_blob["symbol"], "RELIANCE");
    }

    #[test]
    fn foreign_user_cannot_touch_a_row() {
        let (c, _d) = center();
        let id = c.enqueue("u1", "placeorder", &json!({"symbol": "SBIN"})).unwrap();

        assert!(matches!(c.get(id, "u2"), Err(GatewayError::OwnershipViolation)));
        assert!(matches!(c.approve(id, "u2"), Err(GatewayError::OwnershipViolation)));
        assert!(matches!(
            c.reject(id, "u2", "nope"),
            Err(GatewayError::OwnershipViolation)
        ));
        assert!(matches!(c.delete(id, "u2"), Err(GatewayError::OwnershipViolation)));

        // The row is untouched.
        let row = c.get(id, "u1").unwrap();
        assert_eq!(row.status, PendingStatus::Pending);
        assert!(row.decided_by.is_none());
    }

    #[test]
    fn approve_then_mark_records_broker_id() {
        let (c, _d) = center();
        let id = c.enqueue("u1", "placeorder", &json!({"symbol": "SBIN"})).unwrap();

        let row = c.approve(id, "u1").unwrap();
        assert_eq!(row.api_type, "placeorder");
        c.mark_approved(id, "u1", Some("Z-002")).unwrap();

        let row = c.get(id, "u1").unwrap();
        assert_eq!(row.status, PendingStatus::Approved);
        assert_eq!(row.broker_order_id.as_deref(), Some("Z-002"));

        // Decided rows cannot be re-approved.
        assert!(c.approve(id, "u1").is_err());
    }

    #[test]
    fn reject_records_reason() {
        let (c, _d) = center();
        let id = c.enqueue("u1", "placeorder", &json!({"symbol": "SBIN"})).unwrap();
        c.reject(id, "u1", "too risky").unwrap();

        let row = c.get(id, "u1").unwrap();
        assert_eq!(row.status, PendingStatus::Rejected);
        assert_eq!(row.rejection_reason.as_deref(), Some("too risky"));
    }

    #[test]
    fn events_fire_on_enqueue() {
        let (c, _d) = center();
        let mut rx = c.subscribe();
        let id = c.enqueue("u1", "basketorder", &json!({})).unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, "pending_order_created");
        assert_eq!(event.pending_order_id, id);
    }

    #[test]
    fn list_is_per_user_newest_first() {
        let (c, _d) = center();
        c.enqueue("u1", "placeorder", &json!({})).unwrap();
        let second = c.enqueue("u1", "smartorder", &json!({})).unwrap();
        c.enqueue("u2", "placeorder", &json!({})).unwrap();

        let rows = c.list("u1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, second);
    }
}
