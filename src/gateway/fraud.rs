//! Fraud rules applied to every payment attempt.
//!
//! Pure predicates over (attempt, recent history); the engine is a fold
//! over the rule list. A hit never declines the payment by itself — it
//! decorates the row and surfaces in the admin views.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use crate::store::models::PaymentMethod;

/// Amounts above this (minor units) trip the high-value rule.
pub const HIGH_VALUE_THRESHOLD: i64 = 50_000;
/// Combined 60-second spend above this trips the velocity rule.
pub const VELOCITY_THRESHOLD: i64 = 200_000;
/// More than this many attempts inside the window trips high-frequency.
pub const FREQUENCY_LIMIT: usize = 5;
/// History window consulted by the time-based rules.
pub const WINDOW_SECONDS: i64 = 60;

static VPA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[a-z0-9._-]{2,}@[a-z]{2,}$").unwrap());

pub struct Attempt<'a> {
    pub amount: i64,
    pub method: PaymentMethod,
    pub vpa: Option<&'a str>,
}

/// A prior payment by the same payer inside the window.
#[derive(Debug, Clone)]
pub struct PriorPayment {
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

pub struct History {
    pub recent: Vec<PriorPayment>,
}

impl History {
    pub fn within_window(payments: Vec<PriorPayment>, now: DateTime<Utc>) -> Self {
        let cutoff = now - Duration::seconds(WINDOW_SECONDS);
        Self {
            recent: payments.into_iter().filter(|p| p.created_at >= cutoff).collect(),
        }
    }
}

pub struct Rule {
    pub name: &'static str,
    pub check: fn(&Attempt, &History) -> bool,
}

pub const RULES: &[Rule] = &[
    Rule { name: "high_value", check: high_value },
    Rule { name: "duplicate_amount", check: duplicate_amount },
    Rule { name: "high_frequency", check: high_frequency },
    Rule { name: "invalid_vpa", check: invalid_vpa },
    Rule { name: "velocity", check: velocity },
];

fn high_value(attempt: &Attempt, _: &History) -> bool {
    attempt.amount > HIGH_VALUE_THRESHOLD
}

fn duplicate_amount(attempt: &Attempt, history: &History) -> bool {
    history.recent.iter().any(|p| p.amount == attempt.amount)
}

fn high_frequency(_: &Attempt, history: &History) -> bool {
    // The current attempt counts toward the limit.
    history.recent.len() >= FREQUENCY_LIMIT
}

fn invalid_vpa(attempt: &Attempt, _: &History) -> bool {
    if attempt.method != PaymentMethod::Upi {
        return false;
    }
    !attempt.vpa.map(|v| VPA_RE.is_match(v)).unwrap_or(false)
}

fn velocity(attempt: &Attempt, history: &History) -> bool {
    let combined: i64 = history.recent.iter().map(|p| p.amount).sum::<i64>() + attempt.amount;
    combined > VELOCITY_THRESHOLD
}

/// Run every rule; returns the flag and the names of the rules that fired.
pub fn evaluate(attempt: &Attempt, history: &History) -> (bool, Vec<String>) {
    let hits: Vec<String> = RULES
        .iter()
        .filter(|rule| (rule.check)(attempt, history))
        .map(|rule| rule.name.to_string())
        .collect();
    (!hits.is_empty(), hits)
}

/// Run only the named rules. The legacy dashboard transactions carry no
/// payment instrument, so they skip the instrument-shaped rules.
pub fn evaluate_named(
    attempt: &Attempt,
    history: &History,
    names: &[&str],
) -> (bool, Vec<String>) {
    let hits: Vec<String> = RULES
        .iter()
        .filter(|rule| names.contains(&rule.name))
        .filter(|rule| (rule.check)(attempt, history))
        .map(|rule| rule.name.to_string())
        .collect();
    (!hits.is_empty(), hits)
}

/// Identity the time-based rules correlate on: the method-specific payer
/// identifier, lowercased.
pub fn payer_key(
    method: PaymentMethod,
    vpa: Option<&str>,
    email: Option<&str>,
    contact: Option<&str>,
    card_name: Option<&str>,
    card_last4: Option<&str>,
) -> String {
    let ident = match method {
        PaymentMethod::Upi => vpa.map(str::to_string),
        PaymentMethod::Netbanking => email.or(contact).map(str::to_string),
        PaymentMethod::Wallet => contact.map(str::to_string),
        PaymentMethod::Card => match (card_name, card_last4) {
            (Some(name), Some(last4)) => Some(format!("{name}:{last4}")),
            _ => None,
        },
    };
    ident
        .filter(|s| !s.trim().is_empty())
        .map(|s| format!("{}:{}", method.as_str(), s.trim().to_lowercase()))
        .unwrap_or_else(|| "anonymous".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upi(amount: i64, vpa: &'static str) -> Attempt<'static> {
        Attempt { amount, method: PaymentMethod::Upi, vpa: Some(vpa) }
    }

    fn empty() -> History {
        History { recent: Vec::new() }
    }

    fn history_of(amounts: &[i64]) -> History {
        let now = Utc::now();
        History {
            recent: amounts
                .iter()
                .map(|&amount| PriorPayment { amount, created_at: now })
                .collect(),
        }
    }

    #[test]
    fn clean_attempt_passes() {
        let (flagged, hits) = evaluate(&upi(49_900, "user@upi"), &empty());
        assert!(!flagged);
        assert!(hits.is_empty());
    }

    #[test]
    fn high_value_fires_above_threshold() {
        let (flagged, hits) = evaluate(&upi(75_000, "user@upi"), &empty());
        assert!(flagged);
        assert!(hits.contains(&"high_value".to_string()));

        // Boundary: exactly the threshold does not fire.
        let (flagged, _) = evaluate(&upi(HIGH_VALUE_THRESHOLD, "user@upi"), &empty());
        assert!(!flagged);
    }

    #[test]
    fn duplicate_amount_fires_on_repeat() {
        let (flagged, hits) = evaluate(&upi(1_000, "user@upi"), &history_of(&[1_000]));
        assert!(flagged);
        assert_eq!(hits, vec!["duplicate_amount"]);
    }

    #[test]
    fn old_history_is_outside_the_window() {
        let now = Utc::now();
        let stale = vec![PriorPayment {
            amount: 1_000,
            created_at: now - Duration::seconds(WINDOW_SECONDS + 5),
        }];
        let history = History::within_window(stale, now);
        let (flagged, _) = evaluate(&upi(1_000, "user@upi"), &history);
        assert!(!flagged);
    }

    #[test]
    fn high_frequency_counts_the_current_attempt() {
        let (flagged, hits) = evaluate(&upi(10, "user@upi"), &history_of(&[1, 2, 3, 4, 5]));
        assert!(flagged);
        assert!(hits.contains(&"high_frequency".to_string()));

        let (flagged, _) = evaluate(&upi(10, "user@upi"), &history_of(&[1, 2, 3, 4]));
        assert!(!flagged);
    }

    #[test]
    fn vpa_shapes() {
        for good in ["user@upi", "first.last@okbank", "a-b_c@icici", "UPPER@UPI"] {
            let (flagged, _) = evaluate(&upi(100, good), &empty());
            assert!(!flagged, "expected {good:?} to pass");
        }
        for bad in ["nobank", "@upi", "x@", "user@1bank", "u@b"] {
            let (_, hits) = evaluate(&upi(100, bad), &empty());
            assert!(hits.contains(&"invalid_vpa".to_string()), "expected {bad:?} to fire");
        }
        // Missing VPA on a UPI attempt is invalid too.
        let attempt = Attempt { amount: 100, method: PaymentMethod::Upi, vpa: None };
        let (_, hits) = evaluate(&attempt, &empty());
        assert!(hits.contains(&"invalid_vpa".to_string()));
        // Non-UPI methods ignore the rule.
        let attempt = Attempt { amount: 100, method: PaymentMethod::Card, vpa: None };
        let (flagged, _) = evaluate(&attempt, &empty());
        assert!(!flagged);
    }

    #[test]
    fn velocity_sums_the_window() {
        let (flagged, hits) = evaluate(&upi(50_000, "user@upi"), &history_of(&[160_000]));
        assert!(flagged);
        assert!(hits.contains(&"velocity".to_string()));

        let (_, hits) = evaluate(&upi(40_000, "user@upi"), &history_of(&[160_000]));
        assert!(!hits.contains(&"velocity".to_string()));
    }

    #[test]
    fn payer_keys_are_method_scoped() {
        assert_eq!(
            payer_key(PaymentMethod::Upi, Some("User@UPI"), None, None, None, None),
            "upi:user@upi"
        );
        assert_eq!(
            payer_key(PaymentMethod::Wallet, None, None, Some("9876543210"), None, None),
            "wallet:9876543210"
        );
        assert_eq!(
            payer_key(PaymentMethod::Card, None, None, None, Some("Jane Doe"), Some("4242")),
            "card:jane doe:4242"
        );
        assert_eq!(payer_key(PaymentMethod::Upi, None, None, None, None, None), "anonymous");
    }
}
