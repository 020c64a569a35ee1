use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Tolerance for comparing base-currency amounts.
pub const EPSILON: f64 = 0.0001;

pub fn is_zero(amount: f64) -> bool {
    amount.abs() < EPSILON
}

pub fn round_amount(amount: f64) -> f64 {
    (amount * 10_000.0).round() / 10_000.0
}

/// String-backed enum stored as TEXT and serialized with the same spelling.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            #[allow(dead_code)]
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(raw: &str) -> Option<Self> {
                match raw {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                Self::parse(raw).ok_or_else(|| {
                    FromSqlError::Other(format!("unknown {} '{}'", stringify!($name), raw).into())
                })
            }
        }
    };
}

string_enum!(AccountType {
    Asset => "ASSET",
    Liability => "LIABILITY",
    Equity => "EQUITY",
    Revenue => "REVENUE",
    Expense => "EXPENSE",
});

impl AccountType {
    pub fn is_balance_sheet(&self) -> bool {
        matches!(self, Self::Asset | Self::Liability | Self::Equity)
    }

    pub fn default_normal_side(&self) -> NormalSide {
        match self {
            Self::Asset | Self::Expense => NormalSide::Debit,
            Self::Liability | Self::Equity | Self::Revenue => NormalSide::Credit,
        }
    }
}

string_enum!(NormalSide {
    Debit => "DEBIT",
    Credit => "CREDIT",
});

string_enum!(SourceType {
    Manual => "MANUAL",
    System => "SYSTEM",
    Intercompany => "INTERCOMPANY",
    Elimination => "ELIMINATION",
    Adjustment => "ADJUSTMENT",
    Cash => "CASH",
});

string_enum!(JournalStatus {
    Draft => "DRAFT",
    Posted => "POSTED",
    Reversed => "REVERSED",
});

string_enum!(PeriodStatus {
    Open => "OPEN",
    SoftClosed => "SOFT_CLOSED",
    HardClosed => "HARD_CLOSED",
});

impl PeriodStatus {
    /// Closing only ever raises the rank; reopening lowers it.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Open => 0,
            Self::SoftClosed => 1,
            Self::HardClosed => 2,
        }
    }
}

string_enum!(CloseRunStatus {
    Completed => "COMPLETED",
    Reopened => "REOPENED",
});

string_enum!(Purpose {
    RetainedEarnings => "RETAINED_EARNINGS",
    ArControl => "AR_CONTROL",
    ApControl => "AP_CONTROL",
    CashOverShort => "CASH_OVER_SHORT",
    OpeningFloatOffset => "OPENING_FLOAT_OFFSET",
});

string_enum!(ApprovalStatus {
    Pending => "PENDING",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

string_enum!(SessionMode {
    None => "NONE",
    Optional => "OPTIONAL",
    Required => "REQUIRED",
});

string_enum!(CashSessionStatus {
    Open => "OPEN",
    Closed => "CLOSED",
});

string_enum!(CashTxnType {
    Receipt => "RECEIPT",
    Payout => "PAYOUT",
    DepositToBank => "DEPOSIT_TO_BANK",
    WithdrawalFromBank => "WITHDRAWAL_FROM_BANK",
    OpeningFloat => "OPENING_FLOAT",
    ClosingAdjustment => "CLOSING_ADJUSTMENT",
    TransferIn => "TRANSFER_IN",
    TransferOut => "TRANSFER_OUT",
});

string_enum!(CashTxnStatus {
    Draft => "DRAFT",
    Submitted => "SUBMITTED",
    Approved => "APPROVED",
    Posted => "POSTED",
    Cancelled => "CANCELLED",
    Reversed => "REVERSED",
});

string_enum!(CounterpartyKind {
    Customer => "CUSTOMER",
    Vendor => "VENDOR",
    Both => "BOTH",
});

string_enum!(Direction {
    Ar => "AR",
    Ap => "AP",
});

string_enum!(DocumentStatus {
    Draft => "DRAFT",
    Posted => "POSTED",
    Cancelled => "CANCELLED",
});

string_enum!(OpenItemStatus {
    Open => "OPEN",
    PartiallySettled => "PARTIALLY_SETTLED",
    Settled => "SETTLED",
});

string_enum!(BankLineStatus {
    Unmatched => "UNMATCHED",
    Attached => "ATTACHED",
    Applied => "APPLIED",
});

string_enum!(MatchType {
    Contains => "contains",
    StartsWith => "starts_with",
    Regex => "regex",
});

// ---------------------------------------------------------------------------
// Organisation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct LegalEntity {
    pub id: i64,
    pub tenant_id: i64,
    pub code: String,
    pub name: String,
    pub base_currency: String,
    pub requires_ic_partner: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperatingUnit {
    pub id: i64,
    pub tenant_id: i64,
    pub legal_entity_id: i64,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Chart {
    pub id: i64,
    pub tenant_id: i64,
    /// `None` marks a GLOBAL chart usable by every legal entity.
    pub legal_entity_id: Option<i64>,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Book {
    pub id: i64,
    pub tenant_id: i64,
    pub legal_entity_id: i64,
    pub calendar_id: i64,
    pub code: String,
    pub name: String,
    pub book_type: String,
    pub base_currency: String,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: i64,
    pub tenant_id: i64,
    pub chart_id: i64,
    pub chart_legal_entity_id: Option<i64>,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub normal_side: NormalSide,
    pub parent_id: Option<i64>,
    pub is_postable: bool,
    pub is_active: bool,
    pub has_children: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FiscalCalendar {
    pub id: i64,
    pub tenant_id: i64,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FiscalPeriod {
    pub id: i64,
    pub calendar_id: i64,
    pub fiscal_year: i32,
    pub period_no: i32,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub is_adjustment: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub id: i64,
    pub tenant_id: i64,
    pub legal_entity_id: i64,
    pub book_id: i64,
    pub fiscal_period_id: i64,
    pub journal_no: String,
    pub entry_date: String,
    pub document_date: Option<String>,
    pub currency: String,
    pub source_type: SourceType,
    pub source_ref_type: Option<String>,
    pub source_ref_id: Option<i64>,
    pub description: Option<String>,
    pub status: JournalStatus,
    pub total_debit_base: f64,
    pub total_credit_base: f64,
    pub mirror_of_journal_id: Option<i64>,
    pub reversal_of_journal_id: Option<i64>,
    pub reversed_by_journal_id: Option<i64>,
    pub created_by: Option<i64>,
    pub created_at: String,
    pub posted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalLine {
    pub id: i64,
    pub journal_entry_id: i64,
    pub line_no: i64,
    pub account_id: i64,
    pub account_code: String,
    pub operating_unit_id: Option<i64>,
    pub subledger_ref_type: Option<String>,
    pub subledger_ref_id: Option<i64>,
    pub counterparty_legal_entity_id: Option<i64>,
    pub description: Option<String>,
    pub currency: String,
    pub amount_txn: f64,
    pub debit_base: f64,
    pub credit_base: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalDetail {
    #[serde(flatten)]
    pub entry: JournalEntry,
    pub lines: Vec<JournalLine>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_text_roundtrip() {
        for status in PeriodStatus::ALL {
            assert_eq!(PeriodStatus::parse(status.as_str()), Some(*status));
        }
        assert_eq!(CashTxnType::parse("DEPOSIT_TO_BANK"), Some(CashTxnType::DepositToBank));
        assert_eq!(SourceType::parse("cash"), None);
    }

    #[test]
    fn test_serde_uses_storage_spelling() {
        let json = serde_json::to_string(&PeriodStatus::HardClosed).unwrap();
        assert_eq!(json, "\"HARD_CLOSED\"");
        let parsed: MatchType = serde_json::from_str("\"starts_with\"").unwrap();
        assert_eq!(parsed, MatchType::StartsWith);
    }

    #[test]
    fn test_normal_side_defaults() {
        assert_eq!(AccountType::Asset.default_normal_side(), NormalSide::Debit);
        assert_eq!(AccountType::Revenue.default_normal_side(), NormalSide::Credit);
        assert!(AccountType::Equity.is_balance_sheet());
        assert!(!AccountType::Expense.is_balance_sheet());
    }

    #[test]
    fn test_period_status_rank_orders_closing() {
        assert!(PeriodStatus::Open.rank() < PeriodStatus::SoftClosed.rank());
        assert!(PeriodStatus::SoftClosed.rank() < PeriodStatus::HardClosed.rank());
    }
}
