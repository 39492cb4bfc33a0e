use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::services::payment::{
    GatewayError, GatewayRefund, GatewayRefundStatus, IntentStatus, LastPaymentError, PaymentGateway, PaymentIntent,
};

/// Сценарий для следующего confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmScript {
    Succeed,
    Decline(String),
    Unavailable,
}

#[derive(Default)]
struct Inner {
    intents: HashMap<String, PaymentIntent>,
    by_key: HashMap<String, String>,
    confirm_script: VecDeque<ConfirmScript>,
    refund_failure: Option<String>,
    fail_create: bool,
    create_calls: usize,
    refunds: Vec<(String, i64)>,
    refunds_by_key: HashMap<String, GatewayRefund>,
    canceled: Vec<String>,
}

/// Платёжный шлюз в памяти. Повтор create или refund с тем же ключом
/// возвращает тот же объект.
#[derive(Clone, Default)]
pub struct MemoryGateway {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn script_confirm(&self, script: ConfirmScript) {
        self.state().confirm_script.push_back(script);
    }

    pub fn fail_refunds_with(&self, reason: &str) {
        self.state().refund_failure = Some(reason.to_string());
    }

    pub fn fail_next_create(&self) {
        self.state().fail_create = true;
    }

    pub fn create_calls(&self) -> usize {
        self.state().create_calls
    }

    /// Реально выполненные возвраты, без повторов по ключу.
    pub fn refunds(&self) -> Vec<(String, i64)> {
        self.state().refunds.clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.state().canceled.clone()
    }

    pub fn intent(&self, id: &str) -> Option<PaymentIntent> {
        self.state().intents.get(id).cloned()
    }

    pub fn intent_count(&self) -> usize {
        self.state().intents.len()
    }
}

fn missing(intent_id: &str) -> GatewayError {
    GatewayError::Api {
        status: 404,
        code: Some("resource_missing".to_string()),
        message: format!("No such payment_intent: {intent_id}"),
        intent: None,
    }
}

fn unavailable() -> GatewayError {
    GatewayError::Api {
        status: 503,
        code: None,
        message: "gateway unavailable".to_string(),
        intent: None,
    }
}

#[async_trait]
impl PaymentGateway for MemoryGateway {
    async fn create_intent(&self, amount: i64, currency: &str, idempotency_key: &str) -> Result<PaymentIntent, GatewayError> {
        let mut state = self.state();
        state.create_calls += 1;
        if std::mem::take(&mut state.fail_create) {
            return Err(unavailable());
        }

        if let Some(existing) = state.by_key.get(idempotency_key).and_then(|id| state.intents.get(id)) {
            return Ok(existing.clone());
        }

        let n = state.intents.len() + 1;
        let intent = PaymentIntent {
            id: format!("pi_{n:04}"),
            amount,
            currency: currency.to_string(),
            status: IntentStatus::RequiresPaymentMethod,
            client_secret: Some(format!("pi_{n:04}_secret")),
            last_payment_error: None,
        };
        state.by_key.insert(idempotency_key.to_string(), intent.id.clone());
        state.intents.insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }

    async fn confirm_intent(&self, intent_id: &str, _payment_method: &str) -> Result<PaymentIntent, GatewayError> {
        let mut state = self.state();
        let script = state.confirm_script.pop_front().unwrap_or(ConfirmScript::Succeed);
        let intent = state.intents.get_mut(intent_id).ok_or_else(|| missing(intent_id))?;

        match script {
            ConfirmScript::Succeed => {
                intent.status = IntentStatus::Succeeded;
                intent.last_payment_error = None;
            }
            ConfirmScript::Decline(code) => {
                intent.status = IntentStatus::RequiresPaymentMethod;
                intent.last_payment_error = Some(LastPaymentError {
                    code: Some("card_declined".to_string()),
                    decline_code: Some(code),
                    message: None,
                });
            }
            ConfirmScript::Unavailable => return Err(unavailable()),
        }
        Ok(intent.clone())
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        let mut state = self.state();
        let intent = state.intents.get_mut(intent_id).ok_or_else(|| missing(intent_id))?;
        intent.status = IntentStatus::Canceled;
        let intent = intent.clone();
        state.canceled.push(intent_id.to_string());
        Ok(intent)
    }

    async fn refund(
        &self,
        transaction_id: &str,
        _reason: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> Result<GatewayRefund, GatewayError> {
        let mut state = self.state();
        if !state.intents.contains_key(transaction_id) {
            return Err(missing(transaction_id));
        }
        if let Some(existing) = state.refunds_by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }

        let n = state.refunds.len() + 1;
        let failure = state.refund_failure.clone();
        let refund = GatewayRefund {
            id: format!("re_{n:04}"),
            amount,
            status: if failure.is_some() {
                GatewayRefundStatus::Failed
            } else {
                GatewayRefundStatus::Succeeded
            },
            failure_reason: failure,
        };
        state.refunds.push((transaction_id.to_string(), amount));
        state.refunds_by_key.insert(idempotency_key.to_string(), refund.clone());
        Ok(refund)
    }

    async fn get_intent(&self, intent_id: &str) -> Result<PaymentIntent, GatewayError> {
        self.state().intents.get(intent_id).cloned().ok_or_else(|| missing(intent_id))
    }
}
