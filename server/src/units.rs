use std::time::{SystemTime, UNIX_EPOCH};

use tandem_pool_types::Currency;

/// Fee fractions are stored in parts per million.
pub const PPM_DENOMINATOR: i64 = 1_000_000;

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Pool fee retained from a raw reward, rounded down to the atomic unit.
/// The credited amount is `raw - fee_amount(raw, fee_ppm)`, so credit plus
/// fee always reconstructs the raw reward exactly.
pub fn fee_amount(raw: i64, fee_ppm: i32) -> i64 {
    debug_assert!((0..PPM_DENOMINATOR as i32).contains(&fee_ppm));
    ((raw as i128 * fee_ppm as i128) / PPM_DENOMINATOR as i128) as i64
}

/// Render an atomic amount as a decimal string for logs and notes.
pub fn format_amount(currency: Currency, atomic: i64) -> String {
    let scale = 10i64.pow(currency.decimals());
    let sign = if atomic < 0 { "-" } else { "" };
    let magnitude = atomic.unsigned_abs();
    let whole = magnitude / scale as u64;
    let frac = magnitude % scale as u64;
    format!(
        "{}{}.{:0width$}",
        sign,
        whole,
        frac,
        width = currency.decimals() as usize
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_rounds_down() {
        // 8% of 2_500_000 is exact
        assert_eq!(fee_amount(2_500_000, 80_000), 200_000);
        // 1% of 99 floors to 0
        assert_eq!(fee_amount(99, 10_000), 0);
        // credit + fee reconstructs raw for awkward values
        for raw in [1i64, 7, 99, 1_234_567, i64::MAX / 2] {
            let fee = fee_amount(raw, 123_456);
            assert!(fee >= 0 && fee <= raw);
            assert_eq!((raw - fee) + fee, raw);
        }
    }

    #[test]
    fn formats_atomic_amounts() {
        assert_eq!(format_amount(Currency::Tari, 10_000_000), "10.000000");
        assert_eq!(format_amount(Currency::Tari, 2_500_000), "2.500000");
        assert_eq!(
            format_amount(Currency::Xmr, 100_000_000_000),
            "0.100000000000"
        );
        assert_eq!(format_amount(Currency::Tari, 0), "0.000000");
        assert_eq!(format_amount(Currency::Tari, -1_840_000), "-1.840000");
    }
}
