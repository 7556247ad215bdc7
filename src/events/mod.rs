use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{PurchaseOrderStatus, QuotationStatus, RequisitionStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when nobody is listening.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "Dropping procurement event");
        }
    }
}

/// Domain events published after the owning transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    RequisitionCreated(Uuid),
    RequisitionStatusChanged {
        requisition_id: Uuid,
        old_status: RequisitionStatus,
        new_status: RequisitionStatus,
    },

    QuotationRegistered {
        quotation_id: Uuid,
        requisition_id: Uuid,
        supplier_id: Uuid,
    },
    QuotationStatusChanged {
        quotation_id: Uuid,
        old_status: QuotationStatus,
        new_status: QuotationStatus,
    },

    AwardCommitted {
        award_batch_id: Uuid,
        requisition_id: Uuid,
        purchase_order_ids: Vec<Uuid>,
    },

    PurchaseOrderCreated {
        purchase_order_id: Uuid,
        requisition_id: Uuid,
        supplier_id: Uuid,
        award_batch_id: Option<Uuid>,
    },
    PurchaseOrderStatusChanged {
        purchase_order_id: Uuid,
        old_status: PurchaseOrderStatus,
        new_status: PurchaseOrderStatus,
    },
    PurchaseOrderAmended {
        purchase_order_id: Uuid,
        snapshot_taken: bool,
    },
    OverOrderAcknowledged {
        purchase_order_id: Uuid,
        requisition_id: Uuid,
        product_ids: Vec<Uuid>,
    },

    ReceiptApplied {
        receipt_event_id: Uuid,
        purchase_order_id: Uuid,
        status: PurchaseOrderStatus,
    },

    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

/// Drains the event channel, logging each event. Returns when every sender is dropped.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        match serde_json::to_string(&event) {
            Ok(payload) => info!(target: "stateset_procurement::events", %payload, "event"),
            Err(e) => warn!(error = %e, ?event, "Unserializable procurement event"),
        }
    }
    info!("Procurement event channel closed");
}
