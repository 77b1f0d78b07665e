// Pluggable authorization backend. The real acquiring-bank integration is
// out of scope; the default implementation simulates issuer behavior.

use async_trait::async_trait;
use rand::Rng;

use crate::store::models::PaymentMethod;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Approved,
    Declined { code: String, reason: String },
}

impl Outcome {
    pub fn declined(code: &str, reason: &str) -> Self {
        Outcome::Declined { code: code.to_string(), reason: reason.to_string() }
    }
}

pub struct AuthorizeRequest<'a> {
    pub amount: i64,
    pub currency: &'a str,
    pub method: PaymentMethod,
    pub is_flagged: bool,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, req: AuthorizeRequest<'_>) -> Outcome;

    async fn refund(&self, amount: i64) -> Outcome;
}

/// Issuer simulator: approves with a configured probability. Flagged
/// attempts get a reduced approval rate.
pub struct SimulatedAuthorizer {
    success_rate: f64,
}

impl SimulatedAuthorizer {
    pub fn new(success_rate: f64) -> Self {
        Self { success_rate: success_rate.clamp(0.0, 1.0) }
    }
}

#[async_trait]
impl Authorizer for SimulatedAuthorizer {
    async fn authorize(&self, req: AuthorizeRequest<'_>) -> Outcome {
        tracing::debug!(
            amount = req.amount,
            currency = req.currency,
            method = req.method.as_str(),
            is_flagged = req.is_flagged,
            "simulating authorization"
        );
        let rate = if req.is_flagged { self.success_rate * 0.5 } else { self.success_rate };
        if rand::thread_rng().gen_bool(rate) {
            Outcome::Approved
        } else {
            Outcome::declined("payment_declined", "The issuer declined the transaction")
        }
    }

    async fn refund(&self, _amount: i64) -> Outcome {
        if rand::thread_rng().gen_bool(self.success_rate) {
            Outcome::Approved
        } else {
            Outcome::declined("refund_declined", "The issuer declined the refund")
        }
    }
}

/// Fixed-outcome authorizer for tests.
#[cfg(test)]
pub struct StaticAuthorizer {
    pub authorize: Outcome,
    pub refund: Outcome,
}

#[cfg(test)]
impl StaticAuthorizer {
    pub fn approving() -> Self {
        Self { authorize: Outcome::Approved, refund: Outcome::Approved }
    }

    pub fn declining() -> Self {
        Self {
            authorize: Outcome::declined("payment_declined", "declined by test"),
            refund: Outcome::declined("refund_declined", "declined by test"),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, _req: AuthorizeRequest<'_>) -> Outcome {
        self.authorize.clone()
    }

    async fn refund(&self, _amount: i64) -> Outcome {
        self.refund.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulator_extremes_are_deterministic() {
        let always = SimulatedAuthorizer::new(1.0);
        let req = AuthorizeRequest {
            amount: 1_000,
            currency: "INR",
            method: PaymentMethod::Upi,
            is_flagged: false,
        };
        assert_eq!(always.authorize(req).await, Outcome::Approved);
        assert_eq!(always.refund(500).await, Outcome::Approved);

        let never = SimulatedAuthorizer::new(0.0);
        let req = AuthorizeRequest {
            amount: 1_000,
            currency: "INR",
            method: PaymentMethod::Upi,
            is_flagged: false,
        };
        assert!(matches!(never.authorize(req).await, Outcome::Declined { .. }));
    }
}
