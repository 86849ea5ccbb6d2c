use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{
    CreatePaymentIntent, CreateRefund, CreateTransfer, GatewayError, GatewayPaymentIntent,
    GatewayRefund, GatewayTransfer,
};
use crate::ports::PaymentGateway;

#[derive(Debug, Default)]
struct Recorded {
    intents: Vec<CreatePaymentIntent>,
    cancelled: Vec<String>,
    refunds: Vec<CreateRefund>,
    transfers: Vec<CreateTransfer>,
    fail_next: Option<(u16, String)>,
}

/// Records every call and hands out sequential ids (`pi_fake_1`, `re_fake_1`, ...).
#[derive(Debug, Default)]
pub struct FakeGateway {
    sequence: AtomicU64,
    recorded: Mutex<Recorded>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next call fails with an API error of the given status.
    pub fn fail_next(&self, status: u16, message: &str) {
        self.lock().fail_next = Some((status, message.to_string()));
    }

    pub fn created_intents(&self) -> Vec<CreatePaymentIntent> {
        self.lock().intents.clone()
    }

    pub fn cancelled_intents(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    pub fn refunds(&self) -> Vec<CreateRefund> {
        self.lock().refunds.clone()
    }

    pub fn transfers(&self) -> Vec<CreateTransfer> {
        self.lock().transfers.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_fake_{}", prefix, n)
    }

    fn take_failure(&self) -> Result<(), GatewayError> {
        match self.lock().fail_next.take() {
            Some((status, message)) => Err(GatewayError::Api { status, message }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_payment_intent(
        &self,
        request: &CreatePaymentIntent,
    ) -> Result<GatewayPaymentIntent, GatewayError> {
        self.take_failure()?;
        let id = self.next_id("pi");
        self.lock().intents.push(request.clone());
        Ok(GatewayPaymentIntent {
            client_secret: Some(format!("{}_secret", id)),
            id,
            status: "requires_payment_method".to_string(),
            latest_charge: None,
        })
    }

    async fn cancel_payment_intent(&self, id: &str) -> Result<(), GatewayError> {
        self.take_failure()?;
        self.lock().cancelled.push(id.to_string());
        Ok(())
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<GatewayPaymentIntent, GatewayError> {
        self.take_failure()?;
        Ok(GatewayPaymentIntent {
            id: id.to_string(),
            status: "succeeded".to_string(),
            latest_charge: Some(format!("ch_for_{}", id)),
            client_secret: None,
        })
    }

    async fn create_refund(&self, request: &CreateRefund) -> Result<GatewayRefund, GatewayError> {
        self.take_failure()?;
        let id = self.next_id("re");
        self.lock().refunds.push(request.clone());
        Ok(GatewayRefund {
            id,
            amount: request.amount,
            status: Some("pending".to_string()),
        })
    }

    async fn create_transfer(
        &self,
        request: &CreateTransfer,
    ) -> Result<GatewayTransfer, GatewayError> {
        self.take_failure()?;
        let id = self.next_id("tr");
        self.lock().transfers.push(request.clone());
        Ok(GatewayTransfer {
            id,
            amount: request.amount,
        })
    }
}
