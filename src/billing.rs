use chrono::NaiveDate;

pub const MAX_QUANTITY: i64 = 10_000;
pub const MAX_PERIOD_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Draft,
    Finalized,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "finalized" => Some(Self::Finalized),
            "paid" => Some(Self::Paid),
            "void" => Some(Self::Void),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Finalized => "finalized",
            Self::Paid => "paid",
            Self::Void => "void",
        }
    }
}

pub fn normalize_period(raw: &str) -> Result<String, String> {
    let p = raw.trim();
    if p.is_empty() {
        return Err("period must not be empty".into());
    }
    if p.len() > MAX_PERIOD_LEN {
        return Err(format!("period length must be <= {}", MAX_PERIOD_LEN));
    }
    if p.chars().any(|c| c.is_control()) {
        return Err("period must not contain control characters".into());
    }
    Ok(p.to_string())
}

pub fn validate_quantity(q: i64) -> Result<i64, String> {
    if !(1..=MAX_QUANTITY).contains(&q) {
        return Err(format!("quantity must be in 1..={}", MAX_QUANTITY));
    }
    Ok(q)
}

/// `quantity * unit`, `None` on overflow.
pub fn line_amount(quantity: i64, unit_amount_cents: i64) -> Option<i64> {
    quantity.checked_mul(unit_amount_cents)
}

pub fn format_invoice_number(prefix: &str, seq: i64, padding: usize) -> String {
    format!("{}{:0width$}", prefix, seq, width = padding)
}

pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| format!("{} is not a YYYY-MM-DD date", s.trim()))
}

pub fn due_date(issued_on: NaiveDate, due_days: i64) -> NaiveDate {
    issued_on
        .checked_add_signed(chrono::Duration::days(due_days))
        .unwrap_or(issued_on)
}

/// Minor units as a plain decimal string, e.g. `-1205` -> `"-12.05"`.
pub fn cents_to_decimal(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub subtotal_cents: i64,
    pub paid_cents: i64,
}

impl Totals {
    pub fn balance_cents(self) -> i64 {
        self.subtotal_cents.saturating_sub(self.paid_cents)
    }
}
