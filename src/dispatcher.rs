//! Webhook dispatcher: durable outbox drained by a pool of workers.
//!
//! Request handlers append outbox rows inside the transaction that advances
//! order/payment/refund state and then wake the pool; workers claim one row
//! at a time under a lease, POST the signed body, and record every attempt.
//! Delivery is at-least-once and per-merchant ordering is not guaranteed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::gateway::{refs, Gateway};
use crate::store::models::{Merchant, OutboxStatus, WebhookEvent, WebhookLog};
use crate::store::{self, tables, Store, StoreError};

/// Stored response bodies are truncated to this many bytes.
const RESPONSE_BODY_LIMIT: usize = 500;

/// Seconds to wait before retry `attempts`: min(600, 2^attempts).
pub fn backoff(attempts: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempts).min(600))
}

/// Append an outbox row for a merchant event. Returns false when the
/// merchant has no webhook URL configured; the caller treats that as a
/// successful no-op.
pub fn enqueue(
    wtx: &WriteTransaction,
    merchant: &Merchant,
    event: &str,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    if merchant.webhook_url.is_none() {
        return Ok(false);
    }
    let id = store::next_id(wtx, "outbox")?;
    let row = WebhookEvent {
        id,
        merchant_id: merchant.id,
        event: event.to_string(),
        payload,
        status: OutboxStatus::Pending,
        attempts: 0,
        next_attempt_at: now,
        lease_until: None,
        last_response_code: None,
        last_response_body: None,
        created_at: now,
    };
    let mut outbox = wtx.open_table(tables::OUTBOX)?;
    store::put_doc_id(&mut outbox, id, &row)?;
    debug!(event_id = id, event, merchant_id = merchant.id, "enqueued webhook event");
    Ok(true)
}

pub struct Claim {
    pub event: WebhookEvent,
    pub merchant: Merchant,
}

/// Claim the next due pending row by setting its lease. Rows whose merchant
/// has disappeared or dropped its webhook URL are marked failed here rather
/// than retried forever.
pub fn claim_next(store: &Store, lease: Duration) -> Result<Option<Claim>, StoreError> {
    let now = Utc::now();
    let lease =
        chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(30));

    let wtx = store.begin_write()?;
    let mut claimed = None;
    {
        let mut outbox = wtx.open_table(tables::OUTBOX)?;
        let mut candidate: Option<WebhookEvent> = None;
        for entry in outbox.iter()? {
            let (_, value) = entry?;
            let row: WebhookEvent = serde_json::from_slice(value.value())?;
            let due = row.status == OutboxStatus::Pending
                && row.next_attempt_at <= now
                && row.lease_until.map_or(true, |l| l <= now);
            if due {
                candidate = Some(row);
                break;
            }
        }

        if let Some(mut row) = candidate {
            let merchants = wtx.open_table(tables::MERCHANTS)?;
            let merchant: Option<Merchant> = store::get_doc(&merchants, row.merchant_id)?;
            match merchant.filter(|m| m.webhook_url.is_some()) {
                Some(merchant) => {
                    row.lease_until = Some(now + lease);
                    store::put_doc_id(&mut outbox, row.id, &row)?;
                    claimed = Some(Claim { event: row, merchant });
                }
                None => {
                    warn!(event_id = row.id, "webhook target gone, marking event failed");
                    row.status = OutboxStatus::Failed;
                    store::put_doc_id(&mut outbox, row.id, &row)?;
                }
            }
        }
    }
    wtx.commit()?;
    Ok(claimed)
}

pub struct DeliveryResult {
    pub status_code: Option<u16>,
    pub body: Option<String>,
    pub success: bool,
}

/// Record the outcome of one delivery attempt: bump the counter, schedule
/// the retry or finalize the row, and append the audit log entry.
pub fn record_attempt(
    store: &Store,
    event_id: u64,
    target_url: &str,
    result: &DeliveryResult,
    max_attempts: u32,
) -> Result<(), StoreError> {
    let now = Utc::now();
    let wtx = store.begin_write()?;
    {
        let mut outbox = wtx.open_table(tables::OUTBOX)?;
        let Some(mut row) = store::get_doc::<u64, WebhookEvent>(&outbox, event_id)? else {
            return Ok(());
        };
        row.attempts += 1;
        row.lease_until = None;
        row.last_response_code = result.status_code;
        row.last_response_body = result
            .body
            .as_ref()
            .map(|b| b.chars().take(RESPONSE_BODY_LIMIT).collect());

        if result.success {
            row.status = OutboxStatus::Delivered;
        } else if row.attempts >= max_attempts {
            row.status = OutboxStatus::Failed;
        } else {
            let delay = chrono::Duration::from_std(backoff(row.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
            row.next_attempt_at = now + delay;
        }
        store::put_doc_id(&mut outbox, event_id, &row)?;

        let log_id = store::next_id(&wtx, "webhook_logs")?;
        let log = WebhookLog {
            id: log_id,
            event_id,
            merchant_id: row.merchant_id,
            event: row.event.clone(),
            target_url: target_url.to_string(),
            attempt: row.attempts,
            status_code: result.status_code,
            response_body: row.last_response_body.clone(),
            success: result.success,
            created_at: now,
        };
        let mut logs = wtx.open_table(tables::WEBHOOK_LOGS)?;
        store::put_doc_id(&mut logs, log_id, &log)?;
        let mut by_merchant = wtx.open_multimap_table(tables::WEBHOOK_LOGS_BY_MERCHANT)?;
        by_merchant.insert(row.merchant_id, log_id)?;
    }
    wtx.commit()?;
    Ok(())
}

/// Serialize the webhook body. The dispatcher signs and sends these exact
/// bytes, so receivers can verify the signature against the raw payload.
pub fn body_bytes(event: &WebhookEvent) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&json!({
        "event": event.event,
        "created_at": event.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "payload": event.payload,
    }))
}

pub fn spawn_workers(gw: &Arc<Gateway>) -> Vec<JoinHandle<()>> {
    (0..gw.settings.webhook_workers)
        .map(|worker| {
            let gw = Arc::clone(gw);
            tokio::spawn(worker_loop(gw, worker))
        })
        .collect()
}

async fn worker_loop(gw: Arc<Gateway>, worker: usize) {
    info!(worker, "webhook worker started");
    loop {
        match claim_next(&gw.store, gw.settings.webhook_lease) {
            Ok(Some(claim)) => {
                deliver(&gw, claim).await;
                // Drain eagerly while work remains.
                continue;
            }
            Ok(None) => {}
            Err(e) => warn!(worker, error = %e, "outbox claim failed"),
        }
        tokio::select! {
            _ = gw.outbox_wake.notified() => {}
            _ = tokio::time::sleep(gw.settings.webhook_poll_interval) => {}
        }
    }
}

#[instrument(skip(gw, claim), fields(event_id = claim.event.id, event = %claim.event.event, attempt = claim.event.attempts + 1))]
async fn deliver(gw: &Gateway, claim: Claim) {
    let Claim { event, merchant } = claim;
    let target_url = match merchant.webhook_url.as_deref() {
        Some(url) => url.to_string(),
        None => return,
    };

    let body = match body_bytes(&event) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "failed to serialize webhook body");
            let result = DeliveryResult {
                status_code: None,
                body: Some(format!("serialize error: {e}")),
                success: false,
            };
            if let Err(e) =
                record_attempt(&gw.store, event.id, &target_url, &result, gw.settings.webhook_max_attempts)
            {
                warn!(error = %e, "failed to record webhook attempt");
            }
            return;
        }
    };

    let secret = if merchant.webhook_secret.is_empty() {
        gw.settings.webhook_signing_secret.as_str()
    } else {
        merchant.webhook_secret.as_str()
    };
    let signature = refs::sign(&body, secret);

    let response = gw
        .http
        .post(&target_url)
        .header("Content-Type", "application/json")
        .header("X-PayFlow-Signature", signature)
        .header("X-PayFlow-Event", event.event.as_str())
        .body(body)
        .send()
        .await;

    let result = match response {
        Ok(resp) => {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            DeliveryResult {
                status_code: Some(status.as_u16()),
                body: Some(text),
                success: status.is_success(),
            }
        }
        Err(e) => DeliveryResult {
            status_code: None,
            body: Some(e.to_string()),
            success: false,
        },
    };

    if result.success {
        debug!(status = ?result.status_code, "webhook delivered");
    } else {
        info!(status = ?result.status_code, "webhook attempt failed");
    }

    if let Err(e) =
        record_attempt(&gw.store, event.id, &target_url, &result, gw.settings.webhook_max_attempts)
    {
        warn!(error = %e, "failed to record webhook attempt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn seed_merchant(store: &Store, id: u64, webhook_url: Option<&str>) -> Merchant {
        let merchant = Merchant {
            id,
            user_id: id,
            business_name: "Acme".to_string(),
            business_email: format!("ops{id}@acme.test"),
            website: None,
            webhook_url: webhook_url.map(str::to_string),
            webhook_secret: "aa".repeat(32),
            active: true,
            created_at: Utc::now(),
        };
        let wtx = store.begin_write().unwrap();
        {
            let mut merchants = wtx.open_table(tables::MERCHANTS).unwrap();
            store::put_doc_id(&mut merchants, id, &merchant).unwrap();
        }
        wtx.commit().unwrap();
        merchant
    }

    fn enqueue_one(store: &Store, merchant: &Merchant) -> bool {
        let wtx = store.begin_write().unwrap();
        let queued = enqueue(
            &wtx,
            merchant,
            "payment.captured",
            serde_json::json!({"payment_ref": "pf_pay_x", "amount": 1000}),
            Utc::now(),
        )
        .unwrap();
        wtx.commit().unwrap();
        queued
    }

    fn load_event(store: &Store, id: u64) -> WebhookEvent {
        let rtx = store.begin_read().unwrap();
        let outbox = rtx.open_table(tables::OUTBOX).unwrap();
        store::get_doc(&outbox, id).unwrap().unwrap()
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(3), Duration::from_secs(8));
        assert_eq!(backoff(9), Duration::from_secs(512));
        assert_eq!(backoff(10), Duration::from_secs(600));
        assert_eq!(backoff(40), Duration::from_secs(600));
    }

    #[test]
    fn enqueue_skips_merchants_without_webhook_url() {
        let store = Store::in_memory().unwrap();
        let silent = seed_merchant(&store, 1, None);
        assert!(!enqueue_one(&store, &silent));

        let wired = seed_merchant(&store, 2, Some("https://merchant.test/hooks"));
        assert!(enqueue_one(&store, &wired));
    }

    #[test]
    fn claim_leases_the_row_and_blocks_other_workers() {
        let store = Store::in_memory().unwrap();
        let merchant = seed_merchant(&store, 1, Some("https://merchant.test/hooks"));
        enqueue_one(&store, &merchant);

        let claim = claim_next(&store, Duration::from_secs(30)).unwrap().unwrap();
        assert_eq!(claim.event.event, "payment.captured");
        assert!(load_event(&store, claim.event.id).lease_until.is_some());

        // Second worker sees the lease and finds nothing.
        assert!(claim_next(&store, Duration::from_secs(30)).unwrap().is_none());
    }

    #[test]
    fn retry_then_success_counts_every_attempt() {
        let store = Store::in_memory().unwrap();
        let merchant = seed_merchant(&store, 1, Some("https://merchant.test/hooks"));
        enqueue_one(&store, &merchant);
        let id = claim_next(&store, Duration::from_secs(0)).unwrap().unwrap().event.id;

        // Endpoint answers 500 three times, then 200.
        for _ in 0..3 {
            let result = DeliveryResult {
                status_code: Some(500),
                body: Some("boom".to_string()),
                success: false,
            };
            record_attempt(&store, id, "https://merchant.test/hooks", &result, 8).unwrap();
        }
        let row = load_event(&store, id);
        assert_eq!(row.status, OutboxStatus::Pending);
        assert_eq!(row.attempts, 3);
        assert!(row.next_attempt_at > Utc::now());

        let result = DeliveryResult {
            status_code: Some(200),
            body: Some("ok".to_string()),
            success: true,
        };
        record_attempt(&store, id, "https://merchant.test/hooks", &result, 8).unwrap();
        let row = load_event(&store, id);
        assert_eq!(row.status, OutboxStatus::Delivered);
        assert_eq!(row.attempts, 4);
        assert_eq!(row.last_response_code, Some(200));

        // Every attempt left an audit row.
        let rtx = store.begin_read().unwrap();
        let by_merchant = rtx
            .open_multimap_table(tables::WEBHOOK_LOGS_BY_MERCHANT)
            .unwrap();
        assert_eq!(store::id_refs(&by_merchant, 1).unwrap().len(), 4);
    }

    #[test]
    fn exhausted_rows_become_terminal() {
        let store = Store::in_memory().unwrap();
        let merchant = seed_merchant(&store, 1, Some("https://merchant.test/hooks"));
        enqueue_one(&store, &merchant);
        let id = claim_next(&store, Duration::from_secs(0)).unwrap().unwrap().event.id;

        for _ in 0..8 {
            let result =
                DeliveryResult { status_code: None, body: Some("timeout".into()), success: false };
            record_attempt(&store, id, "https://merchant.test/hooks", &result, 8).unwrap();
        }
        let row = load_event(&store, id);
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.attempts, 8);

        // Terminal rows are never claimed again.
        assert!(claim_next(&store, Duration::from_secs(0)).unwrap().is_none());
    }

    #[test]
    fn body_signature_matches_exact_bytes() {
        let event = WebhookEvent {
            id: 1,
            merchant_id: 1,
            event: "order.paid".to_string(),
            payload: serde_json::json!({"order_ref": "pf_order_x", "amount": 49_900}),
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: Utc::now(),
            lease_until: None,
            last_response_code: None,
            last_response_body: None,
            created_at: Utc::now(),
        };
        let body = body_bytes(&event).unwrap();
        let sig = refs::sign(&body, "secret");
        assert!(refs::verify_signature(&body, "secret", &sig));

        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["event"], "order.paid");
        assert!(parsed["created_at"].as_str().unwrap().ends_with('Z'));
        assert_eq!(parsed["payload"]["order_ref"], "pf_order_x");
    }
}
