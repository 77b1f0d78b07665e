// Persisted row types. Rows are stored as serde_json documents keyed by
// their public reference (orders, payments, refunds, api keys) or by a
// numeric id drawn from the counters table (users, merchants, outbox).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Merchant,
    User,
}

impl UserRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(UserRole::Admin),
            "merchant" => Some(UserRole::Merchant),
            "user" => Some(UserRole::User),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Merchant => "merchant",
            UserRole::User => "user",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Merchant {
    pub id: u64,
    pub user_id: u64,
    pub business_name: String,
    pub business_email: String,
    pub website: Option<String>,
    pub webhook_url: Option<String>,
    /// 32 random bytes, base16. Used to sign webhook bodies for this merchant.
    pub webhook_secret: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key_id: String,
    pub merchant_id: u64,
    /// bcrypt hash of the key secret. The plaintext secret is returned once
    /// at issue time and never persisted.
    pub secret_hash: String,
    pub label: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    Attempted,
    Paid,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Attempted => "attempted",
            OrderStatus::Paid => "paid",
            OrderStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_ref: String,
    pub merchant_id: u64,
    /// Minor currency units (paise for INR).
    pub amount: i64,
    pub currency: String,
    pub receipt: Option<String>,
    pub notes: Option<String>,
    pub status: OrderStatus,
    pub attempts: u32,
    pub auto_capture: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Upi,
    Card,
    Netbanking,
    Wallet,
}

impl PaymentMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upi" => Some(PaymentMethod::Upi),
            "card" => Some(PaymentMethod::Card),
            "netbanking" => Some(PaymentMethod::Netbanking),
            "wallet" => Some(PaymentMethod::Wallet),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Upi => "upi",
            PaymentMethod::Card => "card",
            PaymentMethod::Netbanking => "netbanking",
            PaymentMethod::Wallet => "wallet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Authorized,
    Captured,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "created",
            PaymentStatus::Authorized => "authorized",
            PaymentStatus::Captured => "captured",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::PartiallyRefunded => "partially_refunded",
        }
    }

    /// True while the payment still counts against the one-successful-payment
    /// invariant of its order.
    pub fn occupies_order(&self) -> bool {
        !matches!(self, PaymentStatus::Failed)
    }

    pub fn refundable(&self) -> bool {
        matches!(self, PaymentStatus::Captured | PaymentStatus::PartiallyRefunded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub payment_ref: String,
    pub order_ref: String,
    pub merchant_id: u64,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub status: PaymentStatus,

    // Method-specific fields. Card numbers are masked before they reach the
    // row; CVV and expiry are never persisted.
    pub vpa: Option<String>,
    pub card_last4: Option<String>,
    pub card_network: Option<String>,
    pub card_name: Option<String>,
    pub email: Option<String>,
    pub contact: Option<String>,

    /// Identity used by the fraud engine to correlate recent attempts.
    pub payer_key: String,
    pub is_flagged: bool,
    pub fraud_rules: Vec<String>,

    pub error_code: Option<String>,
    pub error_reason: Option<String>,

    pub captured_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Processed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub refund_ref: String,
    pub payment_ref: String,
    pub amount: i64,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub status: RefundStatus,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Delivered,
    Failed,
}

/// Durable outbox row. Appended in the same transaction that advances
/// order/payment/refund state; drained by the dispatcher workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: u64,
    pub merchant_id: u64,
    pub event: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    /// Worker lease; rows with an unexpired lease are skipped by other workers.
    pub lease_until: Option<DateTime<Utc>>,
    pub last_response_code: Option<u16>,
    pub last_response_body: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit record of a single delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: u64,
    pub event_id: u64,
    pub merchant_id: u64,
    pub event: String,
    pub target_url: String,
    pub attempt: u32,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Refunded,
}

/// Legacy dashboard transaction. Lives in its own table, distinct from the
/// gateway order/payment rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub user_id: u64,
    /// Minor units; the dashboard JSON contract is rupees, converted at the
    /// HTTP boundary.
    pub amount: i64,
    pub method: PaymentMethod,
    pub status: TransactionStatus,
    pub idempotency_key: Option<String>,
    pub is_flagged: bool,
    pub created_at: DateTime<Utc>,
}

/// Value of the order idempotency table: the order a key resolved to plus a
/// fingerprint of the request body, so a reused key with a different body
/// can be rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub order_ref: String,
    pub fingerprint: String,
}
