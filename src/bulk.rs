//! Bulk operations tracker: in-memory registry of multi-campaign batch
//! jobs. Batch endpoints register an operation, fan the per-campaign work
//! out through the orchestrator, and clients poll the aggregate here.
//! State dies with the process; issuers reconcile by reading the
//! individual campaign statuses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BulkItemStatus {
    Pending,
    Started,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BulkOperation {
    pub id: Uuid,
    pub op_type: String,
    pub items: Vec<(Uuid, BulkItemStatus, Option<String>)>,
    created: Instant,
}

impl BulkOperation {
    /// Aggregate status: `running` until every item resolved, then
    /// `completed` or `completed_with_errors`.
    pub fn status(&self) -> &'static str {
        let pending = self
            .items
            .iter()
            .any(|(_, status, _)| *status == BulkItemStatus::Pending);
        if pending {
            return "running";
        }
        let failed = self
            .items
            .iter()
            .any(|(_, status, _)| *status == BulkItemStatus::Failed);
        if failed {
            "completed_with_errors"
        } else {
            "completed"
        }
    }

    /// Client-facing shape: `{operationId, operations{}, status}`.
    pub fn to_json(&self) -> Value {
        let operations: Map<String, Value> = self
            .items
            .iter()
            .map(|(campaign_id, status, error)| {
                let mut entry = json!({"status": status});
                if let Some(error) = error {
                    entry["error"] = json!(error);
                }
                (campaign_id.to_string(), entry)
            })
            .collect();
        json!({
            "operationId": self.id,
            "type": self.op_type,
            "operations": operations,
            "status": self.status(),
        })
    }
}

#[derive(Default)]
pub struct BulkTracker {
    operations: Mutex<HashMap<Uuid, BulkOperation>>,
}

impl BulkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_operation(&self, op_type: &str, campaign_ids: &[Uuid]) -> Uuid {
        let id = Uuid::new_v4();
        let operation = BulkOperation {
            id,
            op_type: op_type.to_string(),
            items: campaign_ids
                .iter()
                .map(|campaign_id| (*campaign_id, BulkItemStatus::Pending, None))
                .collect(),
            created: Instant::now(),
        };
        self.operations
            .lock()
            .expect("bulk tracker lock poisoned")
            .insert(id, operation);
        id
    }

    pub fn mark_started(&self, op_id: Uuid, campaign_id: Uuid) {
        self.set_status(op_id, campaign_id, BulkItemStatus::Started, None);
    }

    /// Per-item failures are recorded, never rolled back.
    pub fn mark_failed(&self, op_id: Uuid, campaign_id: Uuid, error: &str) {
        self.set_status(
            op_id,
            campaign_id,
            BulkItemStatus::Failed,
            Some(error.to_string()),
        );
    }

    fn set_status(
        &self,
        op_id: Uuid,
        campaign_id: Uuid,
        status: BulkItemStatus,
        error: Option<String>,
    ) {
        let mut operations = self.operations.lock().expect("bulk tracker lock poisoned");
        if let Some(operation) = operations.get_mut(&op_id) {
            if let Some(item) = operation
                .items
                .iter_mut()
                .find(|(id, _, _)| *id == campaign_id)
            {
                item.1 = status;
                item.2 = error;
            }
        }
    }

    pub fn get(&self, op_id: Uuid) -> Option<BulkOperation> {
        self.operations
            .lock()
            .expect("bulk tracker lock poisoned")
            .get(&op_id)
            .cloned()
    }

    /// Drop operations older than `max_age`; clients have long since
    /// stopped polling them.
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let mut operations = self.operations.lock().expect("bulk tracker lock poisoned");
        let before = operations.len();
        operations.retain(|_, op| op.created.elapsed() < max_age);
        before - operations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_status_progression() {
        let tracker = BulkTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let op = tracker.new_operation("domain_generation", &[a, b]);

        assert_eq!(tracker.get(op).unwrap().status(), "running");
        tracker.mark_started(op, a);
        assert_eq!(tracker.get(op).unwrap().status(), "running");
        tracker.mark_started(op, b);
        assert_eq!(tracker.get(op).unwrap().status(), "completed");
    }

    #[test]
    fn test_partial_failure_recorded_not_rolled_back() {
        let tracker = BulkTracker::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let op = tracker.new_operation("domain_generation", &[a, b]);
        tracker.mark_started(op, a);
        tracker.mark_failed(op, b, "discovery is not configured");

        let operation = tracker.get(op).unwrap();
        assert_eq!(operation.status(), "completed_with_errors");
        let json = operation.to_json();
        assert_eq!(json["operations"][a.to_string()]["status"], "started");
        assert_eq!(
            json["operations"][b.to_string()]["error"],
            "discovery is not configured"
        );
    }

    #[test]
    fn test_unknown_operation_is_none() {
        let tracker = BulkTracker::new();
        assert!(tracker.get(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_sweep_drops_old_operations() {
        let tracker = BulkTracker::new();
        let op = tracker.new_operation("domain_generation", &[Uuid::new_v4()]);
        assert_eq!(tracker.sweep_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(tracker.sweep_older_than(Duration::ZERO), 1);
        assert!(tracker.get(op).is_none());
    }
}
