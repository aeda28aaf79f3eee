use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of a leg or ticket. Transitions `pending -> {won|lost|void}`
/// exactly once and never reverts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Won,
    Lost,
    Void,
}

impl ResultStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ResultStatus::Pending => "pending",
            ResultStatus::Won => "won",
            ResultStatus::Lost => "lost",
            ResultStatus::Void => "void",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResultStatus::Pending),
            "won" => Some(ResultStatus::Won),
            "lost" => Some(ResultStatus::Lost),
            "void" => Some(ResultStatus::Void),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, ResultStatus::Pending)
    }
}

/// Which external table a leg's match id points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Fixture,
    Event,
}

impl MatchKind {
    pub fn as_str(&self) -> &str {
        match self {
            MatchKind::Fixture => "fixture",
            MatchKind::Event => "event",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fixture" => Some(MatchKind::Fixture),
            "event" => Some(MatchKind::Event),
            _ => None,
        }
    }
}

/// One market selection inside a ticket, tied to one external match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub id: i64,
    pub ticket_id: i64,
    pub match_id: i64,
    pub match_kind: MatchKind,
    pub prediction: String,
    pub odds: f64,
    pub result: ResultStatus,
    pub match_date: Option<DateTime<Utc>>,
}

/// An accumulator coupon: 1-20 legs sold as a single unit.
/// `combined_odds` is captured at creation and immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub combined_odds: f64,
    pub price: f64,
    pub is_marketplace: bool,
    pub status: String,
    pub result: ResultStatus,
}

/// Escrow hold lifecycle. Exactly one terminal transition per hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Held,
    Released,
    Refunded,
}

impl EscrowStatus {
    pub fn as_str(&self) -> &str {
        match self {
            EscrowStatus::Held => "held",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "held" => Some(EscrowStatus::Held),
            "released" => Some(EscrowStatus::Released),
            "refunded" => Some(EscrowStatus::Refunded),
            _ => None,
        }
    }
}

/// Funds collected from a buyer, held until the ticket settles.
/// One row per (buyer, ticket) — enforced by a unique constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowHold {
    pub id: i64,
    pub user_id: i64,
    pub ticket_id: i64,
    pub amount: f64,
    pub reference: String,
    pub status: EscrowStatus,
}

/// Marketplace listing for a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub ticket_id: i64,
    pub price: f64,
    pub status: String,
    pub purchase_count: i64,
}

/// A buyer's purchase record. One row per (buyer, ticket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: i64,
    pub user_id: i64,
    pub ticket_id: i64,
    pub price: f64,
    pub purchased_at: DateTime<Utc>,
}

/// A finished match as reported by the fixture/event source, with both
/// scores present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishedMatch {
    pub id: i64,
    pub kind: MatchKind,
    pub home_name: Option<String>,
    pub away_name: Option<String>,
    pub home_score: i64,
    pub away_score: i64,
}

/// Outcome of one settlement pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SettlementReport {
    pub legs_updated: u64,
    pub tickets_settled: u64,
}

/// Round a monetary amount to 2 decimal places.
pub fn round2(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Settlement engine configuration, threaded explicitly into the engine
/// instead of read ad hoc from a settings store.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Platform cut of a winning seller's payout, percent (0-50).
    pub commission_rate_pct: f64,
    /// Matches with scores but a stale status are treated as finished this
    /// many hours after kickoff.
    pub grace_window_hours: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commission_rate_pct: 10.0,
            grace_window_hours: 2,
        }
    }
}

impl EngineConfig {
    pub fn validated(mut self) -> Self {
        self.commission_rate_pct = self.commission_rate_pct.clamp(0.0, 50.0);
        if self.grace_window_hours < 0 {
            self.grace_window_hours = 0;
        }
        self
    }
}
