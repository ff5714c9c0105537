// Rounding of order quantities and stop prices into exchange-acceptable form
use crate::models::{Candle, PositionSide, SymbolRules};
use rust_decimal::Decimal;

/// Long stops sit 0.1% under the reference candle's low
const LONG_STOP_FACTOR: Decimal = Decimal::from_parts(999, 0, 0, false, 3);

/// Contract quantity for `margin * leverage` of notional at `price`
///
/// Rounded down to the symbol's step size. Returns `None` when the result
/// falls below the minimum quantity or the inputs are unusable.
pub fn size_order(
    margin: Decimal,
    leverage: u32,
    price: f64,
    rules: &SymbolRules,
) -> Option<Decimal> {
    if !price.is_finite() || price <= 0.0 || rules.step_size <= Decimal::ZERO {
        return None;
    }

    let price = Decimal::try_from(price).ok()?;
    let raw = margin.checked_mul(Decimal::from(leverage))?.checked_div(price)?;

    let stepped = (raw / rules.step_size).floor() * rules.step_size;
    if stepped <= Decimal::ZERO || stepped < rules.min_qty {
        return None;
    }

    Some(stepped.round_dp(rules.quantity_precision).normalize())
}

/// Protective stop price for a position of `side`, based on `candle`
///
/// Long: 0.1% below the low. Short: at the high. Rounded half-to-even to
/// the symbol's price precision.
pub fn stop_price(side: PositionSide, candle: &Candle, price_precision: u32) -> Option<Decimal> {
    let price = match side {
        PositionSide::Long => Decimal::try_from(candle.low).ok()? * LONG_STOP_FACTOR,
        PositionSide::Short => Decimal::try_from(candle.high).ok()?,
    };

    if price <= Decimal::ZERO {
        return None;
    }

    Some(price.round_dp(price_precision).normalize())
}
