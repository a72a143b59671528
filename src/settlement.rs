//! Settlement math (§4.6): splits a session's purchased cost into platform
//! fee, host payout, and optional client credit, once `minutesUsed` is known.

use crate::models::FailureReason;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Settlement {
    pub total_purchased: f64,
    pub proportional: f64,
    pub platform_fee: f64,
    pub host_payout: f64,
    pub client_credit: f64,
}

/// Round to 2 fractional units using banker's rounding (round-half-to-even),
/// per §4.6. `f64::round` rounds half-away-from-zero, which is the wrong
/// tie-breaking rule here, so we implement the IEEE 754 roundTiesToEven
/// behavior directly.
pub fn round2(value: f64) -> f64 {
    let scaled = value * 100.0;
    let floor = scaled.floor();
    let diff = scaled - floor;
    let rounded = if (diff - 0.5).abs() < 1e-9 {
        // Exactly on the tie: round to even.
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        scaled.round()
    };
    rounded / 100.0
}

/// Compute the settlement for a session that used `minutes_used` out of
/// `minutes_purchased`, at `price_per_hour`, given the platform's fee rate,
/// the host's failure penalty rate, and why the session ended.
pub fn settle(
    price_per_hour: f64,
    minutes_purchased: i64,
    minutes_used: i64,
    platform_fee_rate: f64,
    host_penalty_rate: f64,
    failure_reason: FailureReason,
) -> Settlement {
    let minutes_purchased = minutes_purchased.max(1) as f64;
    let minutes_used = minutes_used.max(0) as f64;

    let total_purchased = price_per_hour * minutes_purchased / 60.0;
    let usage_ratio = (minutes_used / minutes_purchased).clamp(0.0, 1.0);
    let proportional = total_purchased * usage_ratio;
    let platform_fee = proportional * platform_fee_rate;
    let host_base = proportional - platform_fee;

    let (host_payout, client_credit) = if failure_reason == FailureReason::Host {
        let payout = host_base * (1.0 - host_penalty_rate);
        (payout, host_base - payout)
    } else {
        (host_base, 0.0)
    };

    Settlement {
        total_purchased: round2(total_purchased),
        proportional: round2(proportional),
        platform_fee: round2(platform_fee),
        host_payout: round2(host_payout),
        client_credit: round2(client_credit),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 0.01, "{} != {}", a, b);
    }

    #[test]
    fn happy_path_scenario() {
        // §8 scenario 1: pricePerHour=10, minutesPurchased=60, minutesUsed=30,
        // fee=0.1, penalty=0.3, failureReason=NONE.
        let s = settle(10.0, 60, 30, 0.1, 0.3, FailureReason::None);
        approx(s.proportional, 5.0);
        approx(s.platform_fee, 0.5);
        approx(s.host_payout, 4.5);
        approx(s.client_credit, 0.0);
    }

    #[test]
    fn host_fault_refund_scenario() {
        // §8 scenario 2: end at minute 15 with failureReason=HOST.
        let s = settle(10.0, 60, 15, 0.1, 0.3, FailureReason::Host);
        approx(s.proportional, 2.5);
        approx(s.platform_fee, 0.25);
        approx(s.host_payout, 1.575);
        approx(s.client_credit, 0.675);
    }

    #[test]
    fn usage_ratio_clamps_above_purchased() {
        let s = settle(6.0, 60, 120, 0.1, 0.3, FailureReason::None);
        let full = settle(6.0, 60, 60, 0.1, 0.3, FailureReason::None);
        approx(s.proportional, full.proportional);
    }

    #[test]
    fn zero_minutes_used_settles_to_zero() {
        let s = settle(10.0, 60, 0, 0.1, 0.3, FailureReason::None);
        approx(s.proportional, 0.0);
        approx(s.host_payout, 0.0);
        approx(s.client_credit, 0.0);
    }

    #[test]
    fn settlement_conserves_the_proportional_amount() {
        let s = settle(13.37, 45, 22, 0.12, 0.4, FailureReason::Host);
        let total = s.host_payout + s.client_credit + s.platform_fee;
        approx(total, s.proportional);
    }

    #[test]
    fn round2_rounds_half_to_even() {
        assert_eq!(round2(0.125), 0.12);
        assert_eq!(round2(0.135), 0.14);
        assert_eq!(round2(1.005), 1.0);
    }
}
