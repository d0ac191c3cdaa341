// ===============================
// src/domain.rs
// ===============================
use serde::{Deserialize, Serialize};

/// Row identity. Assigned at creation, equal to the row's position after
/// every auto-grow pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Editable columns, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field { Ticker, Price, Quantity }

impl Field {
    pub const COLUMNS: [Field; 3] = [Field::Ticker, Field::Price, Field::Quantity];

    pub fn from_col(col: usize) -> Option<Field> { Self::COLUMNS.get(col).copied() }
}

impl std::str::FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ticker" | "t" => Ok(Field::Ticker),
            "price" | "preco" | "p" => Ok(Field::Price),
            "quantity" | "quantidade" | "qty" | "q" => Ok(Field::Quantity),
            other => Err(format!("unknown column '{other}' (ticker|price|quantity)")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub ticker: String,
    /// Raw user input, decimal comma allowed ("29,90").
    pub price: String,
    /// Raw user input, must hold an integer.
    pub quantity: String,
}

impl Row {
    pub fn empty(id: u64) -> Self {
        Row { id: RowId(id), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.ticker.trim().is_empty() && self.price.trim().is_empty() && self.quantity.trim().is_empty()
    }

    pub fn get(&self, field: Field) -> &str {
        match field {
            Field::Ticker => &self.ticker,
            Field::Price => &self.price,
            Field::Quantity => &self.quantity,
        }
    }

    pub fn set(&mut self, field: Field, value: String) {
        match field {
            Field::Ticker => self.ticker = value,
            Field::Price => self.price = value,
            Field::Quantity => self.quantity = value,
        }
    }

    /// Price with the decimal comma normalised; `None` unless positive and finite.
    pub fn parsed_price(&self) -> Option<f64> {
        let px = self.price.trim().replacen(',', ".", 1).parse::<f64>().ok()?;
        (px.is_finite() && px > 0.0).then_some(px)
    }

    /// Quantity as a positive integer.
    pub fn parsed_quantity(&self) -> Option<u64> {
        let qty = self.quantity.trim().parse::<u64>().ok()?;
        (qty > 0).then_some(qty)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationStatus {
    #[default]
    Unvalidated,
    Validating,
    Valid,
    Invalid,
}

impl ValidationStatus {
    pub fn from_verdict(ok: bool) -> Self {
        if ok { ValidationStatus::Valid } else { ValidationStatus::Invalid }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Unvalidated => "unvalidated",
            ValidationStatus::Validating => "validating",
            ValidationStatus::Valid => "valid",
            ValidationStatus::Invalid => "invalid",
        }
    }
}

/// Per-row validation state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerCheck {
    pub status: ValidationStatus,
    /// Ticker text the current `Validating` status was issued for.
    pub in_flight: Option<String>,
    /// Ticker text of the last resolution merged for this row.
    pub last_validated: Option<String>,
    /// Verdict that went with `last_validated`.
    pub last_valid: bool,
}

/// One oracle resolution, keyed by the ticker text it was issued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution { pub row_id: RowId, pub ticker: String, pub valid: bool }

/// Submitted holding. Field names follow the backend's payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: String,
    #[serde(rename = "preco")]
    pub price: f64,
    #[serde(rename = "quantidade")]
    pub quantity: u64,
}

// Audit trail (see recorder.rs)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Edit { row_id: RowId, field: Field, value: String },
    Paste { start_row: usize, start_col: usize, records: usize },
    Resolved { row_id: RowId, ticker: String, status: ValidationStatus },
    Stale { row_id: RowId, ticker: String },
    Saved { holdings: usize },
    SaveFailed { reason: String },
    Reset { rows: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stamped { pub ts_ms: i64, pub event: Event }

#[cfg(test)]
mod tests {
    use super::*;

    fn row(price: &str, qty: &str) -> Row {
        Row { id: RowId(0), ticker: "PETR4".into(), price: price.into(), quantity: qty.into() }
    }

    #[test]
    fn price_accepts_decimal_comma() {
        assert_eq!(row("29,90", "1").parsed_price(), Some(29.90));
        assert_eq!(row(" 68.5 ", "1").parsed_price(), Some(68.5));
    }

    #[test]
    fn price_rejects_zero_negative_and_garbage() {
        assert_eq!(row("0", "1").parsed_price(), None);
        assert_eq!(row("-3,2", "1").parsed_price(), None);
        assert_eq!(row("abc", "1").parsed_price(), None);
        assert_eq!(row("", "1").parsed_price(), None);
        assert_eq!(row("inf", "1").parsed_price(), None);
    }

    #[test]
    fn quantity_must_be_positive_integer() {
        assert_eq!(row("1", "100").parsed_quantity(), Some(100));
        assert_eq!(row("1", "0").parsed_quantity(), None);
        assert_eq!(row("1", "1.5").parsed_quantity(), None);
        assert_eq!(row("1", "-2").parsed_quantity(), None);
    }

    #[test]
    fn field_names_parse() {
        assert_eq!("Qty".parse::<Field>(), Ok(Field::Quantity));
        assert_eq!("preco".parse::<Field>(), Ok(Field::Price));
        assert!("volume".parse::<Field>().is_err());
    }

    #[test]
    fn holding_serializes_backend_field_names() {
        let h = Holding { ticker: "VALE3".into(), price: 68.5, quantity: 50 };
        let v = serde_json::to_value(&h).unwrap();
        assert_eq!(v["preco"], 68.5);
        assert_eq!(v["quantidade"], 50);
    }
}
