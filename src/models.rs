//! Core domain types shared by stores, engines and the HTTP layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Active,
    Completed,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Pending => "pending",
            RoundStatus::Active => "active",
            RoundStatus::Completed => "completed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RoundStatus::Pending),
            "active" => Some(RoundStatus::Active),
            "completed" => Some(RoundStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    NotSettled,
    Settling,
    Settled,
    Failed,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::NotSettled => "not_settled",
            SettlementStatus::Settling => "settling",
            SettlementStatus::Settled => "settled",
            SettlementStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "not_settled" => Some(SettlementStatus::NotSettled),
            "settling" => Some(SettlementStatus::Settling),
            "settled" => Some(SettlementStatus::Settled),
            "failed" => Some(SettlementStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub round_id: String,
    pub start_at: String,
    pub end_at: String,
    pub status: RoundStatus,
    pub winning_card: Option<u8>,
    pub multiplier: f64,
    pub settlement_status: SettlementStatus,
    pub settlement_started_at: Option<String>,
    pub settlement_completed_at: Option<String>,
    pub settlement_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlipStatus {
    Pending,
    Won,
    Lost,
}

impl SlipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlipStatus::Pending => "pending",
            SlipStatus::Won => "won",
            SlipStatus::Lost => "lost",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SlipStatus::Pending),
            "won" => Some(SlipStatus::Won),
            "lost" => Some(SlipStatus::Lost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slip {
    pub slip_id: String,
    pub barcode: String,
    pub user_id: String,
    pub round_id: String,
    pub total_stake: f64,
    pub payout: f64,
    pub status: SlipStatus,
    pub claimed: bool,
    pub claimed_at: Option<String>,
    pub idempotency_key: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetLine {
    pub id: i64,
    pub slip_id: String,
    pub card: u8,
    pub stake: f64,
    pub is_winner: bool,
    pub payout: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerDirection {
    Credit,
    Debit,
}

impl LedgerDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerDirection::Credit => "credit",
            LedgerDirection::Debit => "debit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Recharge,
    Withdrawal,
    Game,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Recharge => "recharge",
            LedgerKind::Withdrawal => "withdrawal",
            LedgerKind::Game => "game",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    BetPlacement,
    Claim,
    Cancellation,
}

impl ReferenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceKind::BetPlacement => "bet_placement",
            ReferenceKind::Claim => "claim",
            ReferenceKind::Cancellation => "cancellation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletEntry {
    pub id: i64,
    pub user_id: String,
    pub amount: f64,
    pub direction: String,
    pub kind: String,
    pub reference_kind: Option<String>,
    pub reference_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Operator,
    Player,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Player => "player",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "operator" => Some(Role::Operator),
            "player" => Some(Role::Player),
            _ => None,
        }
    }

    /// Operator endpoints admit both operators and admins.
    pub fn is_operator(&self) -> bool {
        matches!(self, Role::Admin | Role::Operator)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub status: String,
    pub balance: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultMode {
    Auto,
    Manual,
}

impl ResultMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultMode::Auto => "auto",
            ResultMode::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(ResultMode::Auto),
            "manual" => Some(ResultMode::Manual),
            _ => None,
        }
    }
}

/// Per-round aggregates with the cancelled set already subtracted.
#[derive(Debug, Clone, Serialize)]
pub struct RoundStats {
    pub round_id: String,
    pub total_slips: i64,
    pub cancelled_slips: i64,
    pub total_wagered: f64,
    pub total_payout: f64,
    pub profit: f64,
}

/// Output of a settlement run.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementSummary {
    pub round_id: String,
    pub winning_card: u8,
    pub winning_slips: i64,
    pub losing_slips: i64,
    pub total_payout: f64,
    pub multiplier: f64,
}
