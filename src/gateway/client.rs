use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use super::{
    CreatePaymentIntent, CreateRefund, CreateTransfer, GatewayError, GatewayPaymentIntent,
    GatewayRefund, GatewayTransfer,
};
use crate::ports::PaymentGateway;

/// Bounded retry for transient failures of a single gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for a Stripe-style payment gateway.
#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: String,
    retry: RetryPolicy,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl HttpGateway {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self::with_circuit_breaker(base_url, api_key, RetryPolicy::default(), 5, 30)
    }

    pub fn with_circuit_breaker(
        base_url: String,
        api_key: String,
        retry: RetryPolicy,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        HttpGateway {
            client,
            base_url,
            api_key,
            retry,
            circuit_breaker,
        }
    }

    pub fn circuit_state(&self) -> String {
        if self.circuit_breaker.is_call_permitted() {
            "closed".to_string()
        } else {
            "open".to_string()
        }
    }

    async fn execute<T>(
        &self,
        method: Method,
        path: &str,
        form: Vec<(String, String)>,
        idempotency_key: Option<String>,
    ) -> Result<T, GatewayError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let retry = self.retry;

        // Only failures worth retrying count toward opening the breaker.
        let result = self
            .circuit_breaker
            .call_with(GatewayError::is_transient, async move {
                let mut attempt = 0;
                loop {
                    attempt += 1;
                    let mut request = client.request(method.clone(), &url).bearer_auth(&api_key);
                    if !form.is_empty() {
                        request = request.form(&form);
                    }
                    if let Some(key) = &idempotency_key {
                        request = request.header("Idempotency-Key", key);
                    }

                    let outcome = match request.send().await {
                        Ok(response) => read_response::<T>(response).await,
                        Err(e) => Err(GatewayError::RequestError(e)),
                    };

                    match outcome {
                        Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                            let delay = retry.base_delay * 2u32.pow(attempt - 1);
                            tracing::warn!(
                                "Gateway call {} failed on attempt {}: {}. Retrying in {:?}",
                                url,
                                attempt,
                                e,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        other => return other,
                    }
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(FailsafeError::Rejected) => Err(GatewayError::CircuitBreakerOpen(
                "payment gateway circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

async fn read_response<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&body)
        .ok()
        .and_then(|envelope| envelope.error.message)
        .unwrap_or(body);
    Err(GatewayError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_payment_intent(
        &self,
        request: &CreatePaymentIntent,
    ) -> Result<GatewayPaymentIntent, GatewayError> {
        let mut form = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.clone()),
            ("metadata[booking_id]".to_string(), request.booking_id.to_string()),
        ];
        if let Some(fee) = request.application_fee_amount {
            form.push(("application_fee_amount".to_string(), fee.to_string()));
        }
        if let Some(destination) = &request.destination {
            form.push(("transfer_data[destination]".to_string(), destination.clone()));
        }

        self.execute(
            Method::POST,
            "v1/payment_intents",
            form,
            Some(request.idempotency_key.clone()),
        )
        .await
    }

    async fn cancel_payment_intent(&self, id: &str) -> Result<(), GatewayError> {
        let _: GatewayPaymentIntent = self
            .execute(
                Method::POST,
                &format!("v1/payment_intents/{}/cancel", id),
                Vec::new(),
                None,
            )
            .await?;
        Ok(())
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<GatewayPaymentIntent, GatewayError> {
        self.execute(
            Method::GET,
            &format!("v1/payment_intents/{}", id),
            Vec::new(),
            None,
        )
        .await
    }

    async fn create_refund(&self, request: &CreateRefund) -> Result<GatewayRefund, GatewayError> {
        let mut form = vec![
            ("payment_intent".to_string(), request.payment_intent.clone()),
            ("amount".to_string(), request.amount.to_string()),
        ];
        if let Some(reason) = &request.reason {
            form.push(("reason".to_string(), reason.clone()));
        }

        self.execute(
            Method::POST,
            "v1/refunds",
            form,
            Some(request.idempotency_key.clone()),
        )
        .await
    }

    async fn create_transfer(
        &self,
        request: &CreateTransfer,
    ) -> Result<GatewayTransfer, GatewayError> {
        let form = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.clone()),
            ("destination".to_string(), request.destination.clone()),
            (
                "metadata[withdrawal_request_id]".to_string(),
                request.withdrawal_request_id.to_string(),
            ),
        ];

        self.execute(
            Method::POST,
            "v1/transfers",
            form,
            Some(request.idempotency_key.clone()),
        )
        .await
    }
}
