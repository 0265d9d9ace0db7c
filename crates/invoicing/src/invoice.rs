use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use leasebook_core::{DomainError, DomainResult, InvoiceId, InvoiceRowId, Money, PaymentId};
use leasebook_core::money::CURRENCY_SCALE;

use crate::row_amount::increase_with_360_day_calendar;

/// Monetary type of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Charge,
    CreditNote,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::Charge => "charge",
            InvoiceType::CreditNote => "credit_note",
        }
    }
}

impl core::str::FromStr for InvoiceType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "charge" => Ok(InvoiceType::Charge),
            "credit_note" => Ok(InvoiceType::CreditNote),
            other => Err(DomainError::validation(format!("unknown invoice type '{other}'"))),
        }
    }
}

/// Invoice state lifecycle.
///
/// `Open` is only ever set when the invoice is created; settlement moves an
/// invoice to `Paid` or `Refunded` but never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceState {
    Open,
    Paid,
    Refunded,
}

impl InvoiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceState::Open => "open",
            InvoiceState::Paid => "paid",
            InvoiceState::Refunded => "refunded",
        }
    }
}

impl core::str::FromStr for InvoiceState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(InvoiceState::Open),
            "paid" => Ok(InvoiceState::Paid),
            "refunded" => Ok(InvoiceState::Refunded),
            other => Err(DomainError::validation(format!("unknown invoice state '{other}'"))),
        }
    }
}

/// Compensations and increase percentages allow twelve digits, two of them
/// decimals.
pub const MAX_COMPENSATION_INPUT: Decimal = Decimal::from_parts(3_567_587_327, 232, 0, false, 2);

/// Inputs a row amount is derived from: a compensation raised by an increase
/// percentage over the period between signing and plan lawfulness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compensation {
    pub compensation_amount: Money,
    /// Yearly increase in percent (e.g. `2.50` for 2.5 %).
    pub increase_percentage: Decimal,
    pub sign_date: Option<NaiveDate>,
    pub plan_lawfulness_date: Option<NaiveDate>,
}

impl Compensation {
    /// Amount owed for this compensation.
    ///
    /// Without both dates there is no increase period, so the compensation
    /// itself is billed.
    pub fn billed_amount(&self) -> DomainResult<Money> {
        match (self.sign_date, self.plan_lawfulness_date) {
            (Some(sign), Some(lawful)) => increase_with_360_day_calendar(
                sign,
                lawful,
                self.increase_percentage,
                self.compensation_amount,
            ),
            _ => Ok(self.compensation_amount),
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        let amount = self
            .compensation_amount
            .ensure_non_negative("compensation amount")?;
        if amount.amount() > MAX_COMPENSATION_INPUT {
            return Err(DomainError::amount_out_of_range(format!(
                "compensation amount {amount} exceeds {MAX_COMPENSATION_INPUT}"
            )));
        }

        let pct = self.increase_percentage;
        if pct.is_sign_negative() && !pct.is_zero() {
            return Err(DomainError::validation(
                "increase percentage must not be negative",
            ));
        }
        if pct > MAX_COMPENSATION_INPUT {
            return Err(DomainError::amount_out_of_range(format!(
                "increase percentage {pct} exceeds {MAX_COMPENSATION_INPUT}"
            )));
        }
        // Stored with two decimals; a finer value would bill differently once reloaded.
        if pct.normalize().scale() > CURRENCY_SCALE {
            return Err(DomainError::validation(format!(
                "increase percentage {pct} has more than {CURRENCY_SCALE} decimals"
            )));
        }
        Ok(())
    }
}

/// A billed row on an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRow {
    pub id: InvoiceRowId,
    pub amount: Money,
    pub compensation: Option<Compensation>,
    pub description: Option<String>,
}

impl InvoiceRow {
    /// Row with a fixed amount.
    pub fn new(amount: Money) -> Self {
        Self {
            id: InvoiceRowId::new(),
            amount,
            compensation: None,
            description: None,
        }
    }

    /// Row whose amount is derived from compensation inputs.
    pub fn from_compensation(compensation: Compensation) -> DomainResult<Self> {
        compensation.validate()?;
        let amount = compensation.billed_amount()?;
        Ok(Self {
            id: InvoiceRowId::new(),
            amount,
            compensation: Some(compensation),
            description: None,
        })
    }

    /// Re-derive `amount` from the compensation inputs, if any.
    ///
    /// Returns `true` when the stored amount changed. The new amount is not
    /// validated here; [`crate::recompute`] does that.
    pub fn refresh_amount(&mut self) -> DomainResult<bool> {
        let Some(compensation) = &self.compensation else {
            return Ok(false);
        };
        let amount = compensation.billed_amount()?;
        if amount == self.amount {
            return Ok(false);
        }
        self.amount = amount;
        Ok(true)
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.amount.ensure_storable("invoice row amount")?;
        if let Some(c) = &self.compensation {
            c.validate()?;
        }
        Ok(())
    }
}

/// Longest filing code the bank reference format allows.
pub const FILING_CODE_MAX_LEN: usize = 35;

/// A payment registered against an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub paid_amount: Money,
    pub paid_date: NaiveDate,
    pub filing_code: Option<String>,
}

impl Payment {
    pub fn new(paid_amount: Money, paid_date: NaiveDate) -> Self {
        Self {
            id: PaymentId::new(),
            paid_amount,
            paid_date,
            filing_code: None,
        }
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.paid_amount.ensure_storable("paid amount")?;
        if let Some(code) = &self.filing_code {
            if code.chars().count() > FILING_CODE_MAX_LEN {
                return Err(DomainError::validation(format!(
                    "filing code longer than {FILING_CODE_MAX_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}

/// A credit note linked to the invoice it corrects, with its rows loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditInvoice {
    pub id: InvoiceId,
    pub rows: Vec<InvoiceRow>,
}

impl CreditInvoice {
    pub fn rows_total(&self) -> DomainResult<Money> {
        Money::try_sum(self.rows.iter().map(|r| r.amount))
    }
}

/// Request to create an invoice (issued by the billing collaborator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub invoice_id: InvoiceId,
    pub invoice_type: InvoiceType,
    /// Original invoice this credit note corrects.
    pub credited_invoice: Option<InvoiceId>,
    pub rows: Vec<InvoiceRow>,
    pub payments: Vec<Payment>,
}

impl NewInvoice {
    pub fn charge(rows: Vec<InvoiceRow>) -> Self {
        Self {
            invoice_id: InvoiceId::new(),
            invoice_type: InvoiceType::Charge,
            credited_invoice: None,
            rows,
            payments: Vec::new(),
        }
    }

    pub fn credit_note(credited_invoice: InvoiceId, rows: Vec<InvoiceRow>) -> Self {
        Self {
            invoice_id: InvoiceId::new(),
            invoice_type: InvoiceType::CreditNote,
            credited_invoice: Some(credited_invoice),
            rows,
            payments: Vec::new(),
        }
    }

    pub fn with_payments(mut self, payments: Vec<Payment>) -> Self {
        self.payments = payments;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.credited_invoice == Some(self.invoice_id) {
            return Err(DomainError::validation("an invoice cannot credit itself"));
        }
        for row in &self.rows {
            row.validate()?;
        }
        for payment in &self.payments {
            payment.validate()?;
        }
        Ok(())
    }
}

/// Every persisted column of an invoice, as read back from a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInvoice {
    pub id: InvoiceId,
    pub invoice_type: InvoiceType,
    pub state: InvoiceState,
    pub billed_amount: Money,
    pub total_amount: Money,
    pub outstanding_amount: Money,
    pub number: Option<i64>,
    pub credited_invoice: Option<InvoiceId>,
}

/// Invoice header: type, state, derived amounts and the issued number.
///
/// Child rows and payments are kept by the store and passed to the settlement
/// calculator explicitly; the derived amounts here are only changed through
/// [`crate::Settlement::apply_to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    id: InvoiceId,
    invoice_type: InvoiceType,
    state: InvoiceState,
    billed_amount: Money,
    total_amount: Money,
    outstanding_amount: Money,
    number: Option<i64>,
    credited_invoice: Option<InvoiceId>,
}

impl Invoice {
    /// A freshly created invoice: open, zero amounts, no number yet.
    pub fn open(
        id: InvoiceId,
        invoice_type: InvoiceType,
        credited_invoice: Option<InvoiceId>,
    ) -> Self {
        Self {
            id,
            invoice_type,
            state: InvoiceState::Open,
            billed_amount: Money::ZERO,
            total_amount: Money::ZERO,
            outstanding_amount: Money::ZERO,
            number: None,
            credited_invoice,
        }
    }

    pub fn id(&self) -> InvoiceId {
        self.id
    }

    pub fn invoice_type(&self) -> InvoiceType {
        self.invoice_type
    }

    pub fn state(&self) -> InvoiceState {
        self.state
    }

    pub fn billed_amount(&self) -> Money {
        self.billed_amount
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn outstanding_amount(&self) -> Money {
        self.outstanding_amount
    }

    pub fn number(&self) -> Option<i64> {
        self.number
    }

    pub fn credited_invoice(&self) -> Option<InvoiceId> {
        self.credited_invoice
    }

    /// Record the issued invoice number. A number is permanent once set.
    pub fn assign_number(&mut self, number: i64) -> DomainResult<()> {
        match self.number {
            Some(existing) if existing == number => Ok(()),
            Some(existing) => Err(DomainError::conflict(format!(
                "invoice {} already numbered {existing}",
                self.id
            ))),
            None => {
                self.number = Some(number);
                Ok(())
            }
        }
    }

    pub(crate) fn set_settled(
        &mut self,
        billed_amount: Money,
        total_amount: Money,
        outstanding_amount: Money,
        state: InvoiceState,
    ) {
        self.billed_amount = billed_amount;
        self.total_amount = total_amount;
        self.outstanding_amount = outstanding_amount;
        self.state = state;
    }
}

impl From<StoredInvoice> for Invoice {
    fn from(stored: StoredInvoice) -> Self {
        Self {
            id: stored.id,
            invoice_type: stored.invoice_type,
            state: stored.state,
            billed_amount: stored.billed_amount,
            total_amount: stored.total_amount,
            outstanding_amount: stored.outstanding_amount,
            number: stored.number,
            credited_invoice: stored.credited_invoice,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn new_invoice_starts_open_with_zero_amounts() {
        let invoice = Invoice::open(InvoiceId::new(), InvoiceType::Charge, None);
        assert_eq!(invoice.state(), InvoiceState::Open);
        assert_eq!(invoice.billed_amount(), Money::ZERO);
        assert_eq!(invoice.outstanding_amount(), Money::ZERO);
        assert_eq!(invoice.number(), None);
    }

    #[test]
    fn invoice_number_cannot_be_replaced() {
        let mut invoice = Invoice::open(InvoiceId::new(), InvoiceType::Charge, None);
        invoice.assign_number(1_000_000).unwrap();
        invoice.assign_number(1_000_000).unwrap();
        let err = invoice.assign_number(1_000_001).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(invoice.number(), Some(1_000_000));
    }

    #[test]
    fn state_and_type_use_stable_names() {
        assert_eq!(serde_json::to_string(&InvoiceState::Refunded).unwrap(), "\"refunded\"");
        assert_eq!(
            serde_json::to_string(&InvoiceType::CreditNote).unwrap(),
            "\"credit_note\""
        );
        for state in [InvoiceState::Open, InvoiceState::Paid, InvoiceState::Refunded] {
            assert_eq!(state.as_str().parse::<InvoiceState>().unwrap(), state);
        }
        assert!("void".parse::<InvoiceState>().is_err());
    }

    #[test]
    fn negative_payment_is_rejected() {
        let payment = Payment::new(Money::from_cents(-100), date(2024, 1, 1));
        assert!(payment.validate().unwrap_err().is_validation());
    }

    #[test]
    fn overlong_filing_code_is_rejected() {
        let mut payment = Payment::new(Money::from_cents(100), date(2024, 1, 1));
        payment.filing_code = Some("9".repeat(FILING_CODE_MAX_LEN + 1));
        assert!(payment.validate().is_err());
        payment.filing_code = Some("9".repeat(FILING_CODE_MAX_LEN));
        assert!(payment.validate().is_ok());
    }

    #[test]
    fn invoice_cannot_credit_itself() {
        let mut new = NewInvoice::charge(vec![InvoiceRow::new(Money::from_cents(100))]);
        new.credited_invoice = Some(new.invoice_id);
        assert!(new.validate().is_err());
    }

    #[test]
    fn compensation_without_dates_bills_the_compensation() {
        let row = InvoiceRow::from_compensation(Compensation {
            compensation_amount: Money::new(dec!(1000)),
            increase_percentage: dec!(5),
            sign_date: Some(date(2020, 1, 1)),
            plan_lawfulness_date: None,
        })
        .unwrap();
        assert_eq!(row.amount, Money::new(dec!(1000)));
    }

    #[test]
    fn refresh_amount_reports_changes_only() {
        let mut row = InvoiceRow::from_compensation(Compensation {
            compensation_amount: Money::new(dec!(1000)),
            increase_percentage: dec!(10),
            sign_date: Some(date(2020, 1, 1)),
            plan_lawfulness_date: Some(date(2021, 1, 1)),
        })
        .unwrap();
        assert_eq!(row.amount, Money::new(dec!(1100)));
        assert!(!row.refresh_amount().unwrap());

        row.amount = Money::new(dec!(1));
        assert!(row.refresh_amount().unwrap());
        assert_eq!(row.amount, Money::new(dec!(1100)));

        let mut plain = InvoiceRow::new(Money::new(dec!(5)));
        assert!(!plain.refresh_amount().unwrap());
    }

    #[test]
    fn amounts_beyond_ten_digits_are_rejected() {
        let row = InvoiceRow::new(Money::new(dec!(100000000.00)));
        assert!(matches!(
            row.validate().unwrap_err(),
            DomainError::AmountOutOfRange(_)
        ));
        assert!(InvoiceRow::new(Money::new(dec!(99999999.99))).validate().is_ok());

        let payment = Payment::new(Money::new(Decimal::MAX), date(2024, 1, 1));
        assert!(payment.validate().unwrap_err().is_validation());
    }

    #[test]
    fn increase_percentage_keeps_two_decimals() {
        let compensation = |pct| Compensation {
            compensation_amount: Money::new(dec!(10000)),
            increase_percentage: pct,
            sign_date: Some(date(2020, 1, 1)),
            plan_lawfulness_date: Some(date(2022, 1, 1)),
        };

        let err = InvoiceRow::from_compensation(compensation(dec!(1.875))).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut row = InvoiceRow::new(Money::new(dec!(10000)));
        row.compensation = Some(compensation(dec!(1.875)));
        assert!(row.validate().is_err());

        // Trailing zeros beyond two decimals are harmless.
        assert!(InvoiceRow::from_compensation(compensation(dec!(1.8800))).is_ok());
        assert!(InvoiceRow::from_compensation(compensation(dec!(1.88))).is_ok());
    }

    #[test]
    fn oversized_compensation_inputs_are_rejected() {
        let mut c = Compensation {
            compensation_amount: Money::new(dec!(10000000000.00)),
            increase_percentage: dec!(2),
            sign_date: None,
            plan_lawfulness_date: None,
        };
        assert!(c.validate().is_err());

        c.compensation_amount = Money::new(MAX_COMPENSATION_INPUT);
        assert!(c.validate().is_ok());

        c.increase_percentage = dec!(10000000000);
        assert!(c.validate().is_err());
    }
}
