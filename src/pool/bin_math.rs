// =============================================================================
// Bin math — pure functions for the log-spaced bin/price conversion (§4.3)
// =============================================================================

/// Convert a price to the bin id it falls in, given the pool's currently
/// active bin/price and its bin step (basis points).
///
/// `bin_id = active_id + round( log(price/active_price) / log(1 + binStep/10000) )`
pub fn bin_id_for_price(price: f64, active_id: i32, active_price: f64, bin_step_bps: u32) -> i32 {
    let step = bin_step_bps as f64 / 10_000.0;
    let offset = (price / active_price).ln() / (1.0 + step).ln();
    active_id + offset.round() as i32
}

/// Inverse of [`bin_id_for_price`].
///
/// `price(bin) = active_price * (1 + binStep/10000)^(bin - active_id)`
pub fn price_for_bin(bin_id: i32, active_id: i32, active_price: f64, bin_step_bps: u32) -> f64 {
    let step = bin_step_bps as f64 / 10_000.0;
    active_price * (1.0 + step).powi(bin_id - active_id)
}

/// Linear-approximation fallback used when the logarithmic conversion falls
/// outside sanity bounds (§4.7 step 5).
pub fn linear_price_bound(current_price: f64, bin_step_bps: u32, bin_count: u32, sign: i32) -> f64 {
    let step = bin_step_bps as f64 / 10_000.0;
    current_price + sign as f64 * step * current_price * bin_count as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_near_active_bin() {
        let active_id = 100;
        let active_price = 150.0;
        let bin_step_bps = 20; // 0.20%

        for offset in -10..=10 {
            let bin = active_id + offset;
            let price = price_for_bin(bin, active_id, active_price, bin_step_bps);
            let back = bin_id_for_price(price, active_id, active_price, bin_step_bps);
            assert_eq!(back, bin, "round-trip failed for offset {offset}");
        }
    }

    #[test]
    fn price_for_bin_matches_active_at_zero_offset() {
        let active_price = 42.0;
        assert_eq!(price_for_bin(100, 100, active_price, 25), active_price);
    }

    #[test]
    fn price_increases_with_bin_for_positive_step() {
        let active_price = 100.0;
        let lower = price_for_bin(99, 100, active_price, 10);
        let higher = price_for_bin(101, 100, active_price, 10);
        assert!(lower < active_price);
        assert!(higher > active_price);
    }

    #[test]
    fn linear_bound_moves_in_requested_direction() {
        let up = linear_price_bound(100.0, 25, 60, 1);
        let down = linear_price_bound(100.0, 25, 60, -1);
        assert!(up > 100.0);
        assert!(down < 100.0);
    }
}
