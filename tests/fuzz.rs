use decanter_prog::engine::{
    CollateralSource, FundEngine, FundParams, OrderTerms, SettleRequest, DEFAULT_GRACE_SECS,
    DEFAULT_LOCK_SECS,
};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

fn default_params() -> FundParams {
    FundParams {
        fee_rate_bps: 100,
        protocol_fee_rate_bps: 50,
        protocol_fee_at_settlement: 1,
        _padding: [0; 7],
        redemption_lock_secs: DEFAULT_LOCK_SECS,
        redemption_grace_secs: DEFAULT_GRACE_SECS,
    }
}

#[test]
fn deterministic_fuzz_simulation() {
    let seed = [0xabu8; 16];
    let mut rng = XorShiftRng::from_seed(seed);
    let adapter = CollateralSource::Plain;
    let mut engine = FundEngine::new(default_params());

    let venue = [1u8; 32];
    let maker = [2u8; 32];
    engine.set_venue(venue, true).unwrap();
    engine.set_maker(maker, true).unwrap();

    let mut depositors: Vec<[u8; 32]> = Vec::new();
    let mut open_orders: Vec<OrderTerms> = Vec::new();
    let mut digest_counter = 0u64;

    for i in 0..2_000 {
        let op: u8 = rng.gen_range(0..6);
        let now = 1_000 + i as i64 * 60; // one op per minute

        match op {
            0 => {
                // Deposit, occasionally from a fresh depositor
                let owner = if depositors.is_empty() || rng.gen_bool(0.1) {
                    let mut k = [0u8; 32];
                    rng.fill(&mut k);
                    depositors.push(k);
                    k
                } else {
                    depositors[rng.gen_range(0..depositors.len())]
                };
                let amount: u128 = rng.gen_range(10_000..1_000_000_000);
                let _ = engine.deposit(&owner, amount, &adapter);
            }
            1 => {
                // Queue a redemption
                if !depositors.is_empty() {
                    let owner = depositors[rng.gen_range(0..depositors.len())];
                    let shares: u128 = rng.gen_range(1..100_000_000);
                    let _ = engine.request_redemption(&owner, shares, now);
                }
            }
            2 => {
                // Claim, often outside the window
                if !depositors.is_empty() {
                    let owner = depositors[rng.gen_range(0..depositors.len())];
                    let skew: i64 = rng.gen_range(0..2 * DEFAULT_LOCK_SECS);
                    let _ = engine.claim_redemptions(&owner, now + skew, &adapter);
                }
            }
            3 => {
                // Originate a small trade expiring shortly
                let gross: u128 = rng.gen_range(1_000..100_000_000);
                let o = OrderTerms {
                    venue,
                    maker,
                    gross_collateral: gross,
                    maker_collateral: gross / 10,
                    expiry: now + rng.gen_range(60..3_600),
                    anchor_prices: [rng.gen_range(1..1_000_000), 1_050_000],
                    risk_bps: rng.gen_range(0..10_000),
                    deadline: now,
                };
                digest_counter += 1;
                let mut digest = [0u8; 32];
                digest[..8].copy_from_slice(&digest_counter.to_le_bytes());
                if engine.originate(&o, &digest, now, &adapter).is_ok() {
                    open_orders.push(o);
                }
            }
            4 => {
                // Settle an open position after its expiry
                if !open_orders.is_empty() {
                    let idx = rng.gen_range(0..open_orders.len());
                    let o = open_orders[idx];
                    let req = SettleRequest {
                        key: o.key(),
                        payoff_e6: rng.gen_range(0..=1_000_000),
                    };
                    if engine.settle_batch(&[req], o.expiry, &adapter).is_ok() {
                        open_orders.retain(|k| k.key() != o.key());
                    }
                }
            }
            5 => {
                // Transfer shares between depositors
                if depositors.len() >= 2 {
                    let from = depositors[rng.gen_range(0..depositors.len())];
                    let to = depositors[rng.gen_range(0..depositors.len())];
                    let shares: u128 = rng.gen_range(1..10_000_000);
                    let _ = engine.transfer_shares(&from, &to, shares);
                }
            }
            _ => {}
        }

        assert!(
            engine.check_conservation(&adapter),
            "Conservation violated at step {}",
            i
        );
    }
}

#[test]
fn fuzz_price_per_share_monotonic_without_losses() {
    // Every payoff returns at least the committed 90% of gross, so no
    // settlement realizes a loss and the share price must never decrease.
    let seed = [0x5cu8; 16];
    let mut rng = XorShiftRng::from_seed(seed);
    let adapter = CollateralSource::Plain;
    let mut engine = FundEngine::new(default_params());

    let venue = [1u8; 32];
    let maker = [2u8; 32];
    engine.set_venue(venue, true).unwrap();
    engine.set_maker(maker, true).unwrap();

    let mut depositors: Vec<[u8; 32]> = Vec::new();
    let mut open_orders: Vec<OrderTerms> = Vec::new();
    let mut digest_counter = 0u64;
    let mut last_pps = engine.price_per_share_e6(&adapter).unwrap();

    for i in 0..2_000 {
        let op: u8 = rng.gen_range(0..7);
        let now = 1_000 + i as i64 * 60;

        match op {
            0 => {
                let owner = if depositors.is_empty() || rng.gen_bool(0.1) {
                    let mut k = [0u8; 32];
                    rng.fill(&mut k);
                    depositors.push(k);
                    k
                } else {
                    depositors[rng.gen_range(0..depositors.len())]
                };
                let amount: u128 = rng.gen_range(10_000..1_000_000_000);
                let _ = engine.deposit(&owner, amount, &adapter);
            }
            1 => {
                if !depositors.is_empty() {
                    let owner = depositors[rng.gen_range(0..depositors.len())];
                    let shares: u128 = rng.gen_range(1..100_000_000);
                    let _ = engine.request_redemption(&owner, shares, now);
                }
            }
            2 => {
                if !depositors.is_empty() {
                    let owner = depositors[rng.gen_range(0..depositors.len())];
                    let skew: i64 = rng.gen_range(0..2 * DEFAULT_LOCK_SECS);
                    let _ = engine.claim_redemptions(&owner, now + skew, &adapter);
                }
            }
            3 => {
                // Gross kept a multiple of 10 so the 10% maker leg is exact
                let gross: u128 = rng.gen_range(100..10_000_000) * 10;
                let o = OrderTerms {
                    venue,
                    maker,
                    gross_collateral: gross,
                    maker_collateral: gross / 10,
                    expiry: now + rng.gen_range(60..3_600),
                    anchor_prices: [rng.gen_range(1..1_000_000), 1_050_000],
                    risk_bps: rng.gen_range(0..10_000),
                    deadline: now,
                };
                digest_counter += 1;
                let mut digest = [0u8; 32];
                digest[..8].copy_from_slice(&digest_counter.to_le_bytes());
                if engine.originate(&o, &digest, now, &adapter).is_ok() {
                    open_orders.push(o);
                }
            }
            4 => {
                if !open_orders.is_empty() {
                    let idx = rng.gen_range(0..open_orders.len());
                    let o = open_orders[idx];
                    let req = SettleRequest {
                        key: o.key(),
                        payoff_e6: rng.gen_range(900_000..=1_000_000),
                    };
                    if engine.settle_batch(&[req], o.expiry, &adapter).is_ok() {
                        open_orders.retain(|k| k.key() != o.key());
                    }
                }
            }
            5 => {
                if depositors.len() >= 2 {
                    let from = depositors[rng.gen_range(0..depositors.len())];
                    let to = depositors[rng.gen_range(0..depositors.len())];
                    let shares: u128 = rng.gen_range(1..10_000_000);
                    let _ = engine.transfer_shares(&from, &to, shares);
                }
            }
            6 => {
                if rng.gen_bool(0.5) {
                    let _ = engine.harvest(&adapter);
                } else {
                    let _ = engine.collect_protocol_fee(&adapter);
                }
            }
            _ => {}
        }

        let pps = engine.price_per_share_e6(&adapter).unwrap();
        assert!(
            pps >= last_pps,
            "Share price decreased at step {}: {} -> {}",
            i,
            last_pps,
            pps
        );
        last_pps = pps;
        assert!(engine.check_conservation(&adapter));
    }
}

#[test]
fn fuzz_fees_never_exceed_settled_gains() {
    let seed = [0x37u8; 16];
    let mut rng = XorShiftRng::from_seed(seed);
    let adapter = CollateralSource::Plain;
    let mut engine = FundEngine::new(default_params());

    let venue = [1u8; 32];
    let maker = [2u8; 32];
    engine.set_venue(venue, true).unwrap();
    engine.set_maker(maker, true).unwrap();
    engine
        .deposit(&[3u8; 32], 1_000_000_000_000, &adapter)
        .unwrap();

    let mut total_gain: u128 = 0;
    for i in 0..200u64 {
        let now = 1_000 + i as i64;
        let gross: u128 = rng.gen_range(1_000..1_000_000_000);
        let o = OrderTerms {
            venue,
            maker,
            gross_collateral: gross,
            maker_collateral: gross / 10,
            expiry: now + 60,
            anchor_prices: [900_000, 1_100_000],
            risk_bps: (i % 10_000) as u64,
            deadline: now,
        };
        let mut digest = [0u8; 32];
        digest[..8].copy_from_slice(&i.to_le_bytes());
        if engine.originate(&o, &digest, now, &adapter).is_err() {
            continue;
        }
        let req = SettleRequest {
            key: o.key(),
            payoff_e6: rng.gen_range(0..=1_000_000),
        };
        if let Ok(out) = engine.settle_batch(&[req], o.expiry, &adapter) {
            total_gain += out.realized_gain;
        }
    }

    let accrued = engine.total_fee.get() + engine.total_protocol_fee.get();
    // 100 + 50 bps of realized gains, give or take rounding
    assert!(accrued <= total_gain * 150 / 10_000 + 200);
    assert!(engine.check_conservation(&adapter));
}
