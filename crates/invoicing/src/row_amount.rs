//! 360-day-calendar increase used to derive compensation row amounts.

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use leasebook_core::{DomainError, DomainResult, Money};

/// Day count between two dates on the European 30E/360 calendar.
///
/// Every month counts as 30 days; a 31st on either end is treated as the
/// 30th. The result is negative when `end` precedes `start`.
pub fn days360(start: NaiveDate, end: NaiveDate) -> i64 {
    let start_day = i64::from(start.day().min(30));
    let end_day = i64::from(end.day().min(30));

    let years = i64::from(end.year()) - i64::from(start.year());
    let months = i64::from(end.month()) - i64::from(start.month());

    years * 360 + months * 30 + (end_day - start_day)
}

/// Raise `amount` by `increase_percentage` per 360-day year, prorated over
/// the period from `start` to `end`, rounded half-up to cents.
///
/// Fails with [`DomainError::AmountOutOfRange`] if an intermediate product
/// does not fit a `Decimal`.
pub fn increase_with_360_day_calendar(
    start: NaiveDate,
    end: NaiveDate,
    increase_percentage: Decimal,
    amount: Money,
) -> DomainResult<Money> {
    let day_count = Decimal::from(days360(start, end));
    let base = amount.amount();
    // amount * (days / 360) * (pct / 100), kept as one division for exactness.
    let raised = base
        .checked_mul(day_count)
        .and_then(|v| v.checked_mul(increase_percentage))
        .and_then(|v| v.checked_div(Decimal::from(36_000)))
        .and_then(|increase| base.checked_add(increase))
        .ok_or_else(|| {
            DomainError::amount_out_of_range(format!(
                "{increase_percentage} % increase of {amount} from {start} to {end}"
            ))
        })?;
    Ok(Money::new(raised))
}
