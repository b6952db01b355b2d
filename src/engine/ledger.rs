use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::PAYMENTS_TOTAL;

use super::{Engine, EngineError, detach};

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub customer_id: Ulid,
    pub appointment_id: Option<Ulid>,
    pub amount: Cents,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub idempotency_key: Option<String>,
}

fn count(outcome: &'static str) {
    metrics::counter!(PAYMENTS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    /// Record a payment exactly once.
    ///
    /// A reused idempotency key returns the transaction it first produced.
    /// Otherwise a repeat of (appointment, method, amount, status) is
    /// `Duplicate(existing_id)`.
    pub async fn record_payment(
        self: &Arc<Self>,
        req: PaymentRequest,
    ) -> Result<Transaction, EngineError> {
        let this = Arc::clone(self);
        detach(async move { this.record_payment_locked(req).await }).await
    }

    async fn record_payment_locked(&self, req: PaymentRequest) -> Result<Transaction, EngineError> {
        if req.amount <= 0 || req.amount > MAX_AMOUNT_CENTS {
            return Err(EngineError::Validation("amount must be positive"));
        }
        if let Some(key) = &req.idempotency_key {
            if key.is_empty() {
                return Err(EngineError::Validation("idempotency key must not be empty"));
            }
            if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(EngineError::LimitExceeded("idempotency key too long"));
            }
        } else if req.appointment_id.is_none() {
            return Err(EngineError::Validation(
                "idempotency key required for payments without an appointment",
            ));
        }

        self.owned_customer(req.customer_id)?;
        if let Some(appointment_id) = req.appointment_id {
            let appt = self.owned_appointment(appointment_id)?;
            if appt.customer_id != req.customer_id {
                return Err(EngineError::Validation("appointment belongs to another customer"));
            }
        }

        let _ledger = self.ledger_lock.lock().await;

        if let Some(key) = &req.idempotency_key
            && let Some(existing) = self.store.idempotency_keys.get(key).map(|id| *id)
        {
            count("replayed");
            debug!(transaction_id = %existing, "idempotent payment retry");
            return self.transaction(existing);
        }

        let transaction = Transaction {
            id: Ulid::new(),
            business_id: self.business_id,
            customer_id: req.customer_id,
            appointment_id: req.appointment_id,
            amount: req.amount,
            method: req.method,
            status: req.status,
            idempotency_key: req.idempotency_key,
            recorded_at: self.now_ms(),
        };
        if let Some(key) = transaction.payment_key()
            && let Some(existing) = self.store.payment_keys.get(&key).map(|id| *id)
        {
            count("duplicate");
            return Err(EngineError::Duplicate(existing));
        }

        self.persist_and_apply(Event::TransactionRecorded {
            transaction: transaction.clone(),
        })
        .await?;
        count("recorded");
        info!(
            transaction_id = %transaction.id,
            appointment_id = ?transaction.appointment_id,
            amount = transaction.amount,
            "payment recorded"
        );
        Ok(transaction)
    }

    pub fn transaction(&self, id: Ulid) -> Result<Transaction, EngineError> {
        let tx = self
            .store
            .transactions
            .get(&id)
            .map(|t| t.clone())
            .ok_or(EngineError::NotFound(id))?;
        self.ensure_owned(tx.business_id, id)?;
        Ok(tx)
    }

    /// Payments of one appointment, oldest first.
    pub fn transactions_for_appointment(&self, appointment_id: Ulid) -> Vec<Transaction> {
        let ids = self
            .store
            .appointment_payments
            .get(&appointment_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.into_iter()
            .filter_map(|id| self.transaction(id).ok())
            .collect()
    }
}
