/// The reward-label rule: deterministic (amount, height) -> label
/// classification for coinbase outputs, backed by the chain's subsidy
/// schedule.
///
/// Schedule: 150 FLUX base subsidy, halving every 655,350 blocks, split
/// 50% MINING / 7.5% CUMULUS / 12.5% NIMBUS / 30% STRATUS. A foundation
/// payout (5% of subsidy) is matched from FOUNDATION_START_HEIGHT onward.
/// The whole table lives in this file so it can be corrected against
/// chain parameters in one place.

use crate::types::{RewardLabel, Tier, COIN};

pub const HALVING_INTERVAL: u32 = 655_350;
pub const BASE_SUBSIDY: i64 = 150 * COIN;
pub const FOUNDATION_START_HEIGHT: u32 = 1_247_000;

/// Matching tolerance for expected reward amounts. The mining output also
/// absorbs transaction fees, so it is matched from below only.
const TOLERANCE: i64 = COIN / 100;

/// Collateral matching tolerance (±1 coin covers collateral minus fees).
const COLLATERAL_TOLERANCE: i64 = COIN;

pub const CUMULUS_COLLATERAL: i64 = 1_000 * COIN;
pub const NIMBUS_COLLATERAL: i64 = 12_500 * COIN;
pub const STRATUS_COLLATERAL: i64 = 40_000 * COIN;

/// Expected per-label amounts for a given height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedRewards {
    pub mining: i64,
    pub cumulus: i64,
    pub nimbus: i64,
    pub stratus: i64,
    pub foundation: Option<i64>,
}

/// Total block subsidy at a height, before fees.
pub fn block_subsidy(height: u32) -> i64 {
    let era = height / HALVING_INTERVAL;
    if era >= 64 {
        return 0;
    }
    BASE_SUBSIDY >> era
}

/// Shares in basis points of the block subsidy.
const MINING_BP: i64 = 5_000;
const CUMULUS_BP: i64 = 750;
const NIMBUS_BP: i64 = 1_250;
const STRATUS_BP: i64 = 3_000;
const FOUNDATION_BP: i64 = 500;

pub fn expected_rewards(height: u32) -> ExpectedRewards {
    let subsidy = block_subsidy(height);
    let foundation = if height >= FOUNDATION_START_HEIGHT {
        Some(subsidy * FOUNDATION_BP / 10_000)
    } else {
        None
    };
    ExpectedRewards {
        mining: subsidy * MINING_BP / 10_000,
        cumulus: subsidy * CUMULUS_BP / 10_000,
        nimbus: subsidy * NIMBUS_BP / 10_000,
        stratus: subsidy * STRATUS_BP / 10_000,
        foundation,
    }
}

fn near(amount: i64, expected: i64) -> bool {
    (amount - expected).abs() <= TOLERANCE
}

/// Classify a single coinbase output amount.
///
/// Tier and foundation payouts are exact amounts; the mining payout also
/// carries the block's fees, so anything at or above the mining share that
/// matched nothing else is MINING.
pub fn label(amount: i64, height: u32) -> RewardLabel {
    let expected = expected_rewards(height);

    if near(amount, expected.cumulus) {
        return RewardLabel::Cumulus;
    }
    if near(amount, expected.nimbus) {
        return RewardLabel::Nimbus;
    }
    if near(amount, expected.stratus) {
        return RewardLabel::Stratus;
    }
    if let Some(foundation) = expected.foundation {
        if near(amount, foundation) {
            return RewardLabel::Foundation;
        }
    }
    if amount >= expected.mining - TOLERANCE {
        return RewardLabel::Mining;
    }
    RewardLabel::Unknown
}

/// Whether an output amount matches any reward amount for the height.
/// Used by coinbase detection for transactions without prev-outpoints.
pub fn is_reward_amount(amount: i64, height: u32) -> bool {
    !matches!(label(amount, height), RewardLabel::Unknown)
}

/// Infer a node tier from a collateral value (start transactions do not
/// carry a tier byte).
pub fn tier_from_collateral(value: i64) -> Option<Tier> {
    if (value - CUMULUS_COLLATERAL).abs() <= COLLATERAL_TOLERANCE {
        Some(Tier::Cumulus)
    } else if (value - NIMBUS_COLLATERAL).abs() <= COLLATERAL_TOLERANCE {
        Some(Tier::Nimbus)
    } else if (value - STRATUS_COLLATERAL).abs() <= COLLATERAL_TOLERANCE {
        Some(Tier::Stratus)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_halves_per_era() {
        assert_eq!(block_subsidy(0), 150 * COIN);
        assert_eq!(block_subsidy(HALVING_INTERVAL - 1), 150 * COIN);
        assert_eq!(block_subsidy(HALVING_INTERVAL), 75 * COIN);
        assert_eq!(block_subsidy(2 * HALVING_INTERVAL), 150 * COIN / 4);
        assert_eq!(block_subsidy(64 * HALVING_INTERVAL), 0);
    }

    #[test]
    fn era_zero_labels() {
        // 150 FLUX: mining 75, cumulus 11.25, nimbus 18.75, stratus 45.
        assert_eq!(label(75 * COIN, 100), RewardLabel::Mining);
        assert_eq!(label(11 * COIN + COIN / 4, 100), RewardLabel::Cumulus);
        assert_eq!(label(18 * COIN + 3 * COIN / 4, 100), RewardLabel::Nimbus);
        assert_eq!(label(45 * COIN, 100), RewardLabel::Stratus);
    }

    #[test]
    fn mining_absorbs_fees() {
        let with_fees = 75 * COIN + 1_234_567;
        assert_eq!(label(with_fees, 100), RewardLabel::Mining);
    }

    #[test]
    fn full_subsidy_payout_is_mining() {
        // Early chain paid the full subsidy to the miner.
        assert_eq!(label(150 * COIN, 10), RewardLabel::Mining);
    }

    #[test]
    fn dust_is_unknown() {
        assert_eq!(label(3 * COIN, 100), RewardLabel::Unknown);
        assert!(!is_reward_amount(3 * COIN, 100));
        assert!(is_reward_amount(45 * COIN, 100));
    }

    #[test]
    fn foundation_only_after_activation() {
        let share = block_subsidy(FOUNDATION_START_HEIGHT) * FOUNDATION_BP / 10_000;
        assert_eq!(label(share, FOUNDATION_START_HEIGHT), RewardLabel::Foundation);
        // Before activation the same amount matches nothing.
        assert_eq!(label(share, 100), RewardLabel::Unknown);
    }

    #[test]
    fn labels_recompute_from_amounts() {
        // Round-trip: every labelled amount classifies back to its label.
        let height = 200_000;
        let expected = expected_rewards(height);
        assert_eq!(label(expected.mining, height), RewardLabel::Mining);
        assert_eq!(label(expected.cumulus, height), RewardLabel::Cumulus);
        assert_eq!(label(expected.nimbus, height), RewardLabel::Nimbus);
        assert_eq!(label(expected.stratus, height), RewardLabel::Stratus);
    }

    #[test]
    fn collateral_tiers() {
        assert_eq!(tier_from_collateral(1_000 * COIN), Some(Tier::Cumulus));
        assert_eq!(tier_from_collateral(12_500 * COIN - COIN / 2), Some(Tier::Nimbus));
        assert_eq!(tier_from_collateral(40_000 * COIN + COIN), Some(Tier::Stratus));
        assert_eq!(tier_from_collateral(5_000 * COIN), None);
    }
}
