//! Bulletproof security-deposit arithmetic: ensures no member can lose
//! principal regardless of when other members default. Pure, no I/O.
//! Grounded in the original system's `SecurityDepositCalculator` — see
//! SPEC_FULL.md §4.1.

use rust_decimal::Decimal;
use tanda_core::{Error, Money};

/// The subset of `Group` fields the deposit formula needs, so this crate
/// stays pure and does not depend on `tanda-state`.
#[derive(Clone, Copy, Debug)]
pub struct GroupConfig {
    pub contribution_amount: Money,
    pub member_limit: i32,
    pub deposit_multiplier: Decimal,
}

fn check_position(position: i32, max: i32) -> Result<(), Error> {
    if position < 1 || position > max {
        return Err(Error::InvalidPosition { position, max });
    }
    Ok(())
}

fn check_group(cfg: &GroupConfig) -> Result<(), Error> {
    if cfg.member_limit < 2 {
        return Err(Error::InvalidGroup(format!(
            "member_limit must be >= 2, got {}",
            cfg.member_limit
        )));
    }
    if !cfg.contribution_amount.is_positive() {
        return Err(Error::InvalidGroup("contribution_amount must be > 0".into()));
    }
    Ok(())
}

/// `required(p, N, c, m) = ceil_to_cent(c * (N - p) * m)`.
pub fn required_for_position(cfg: &GroupConfig, position: i32) -> Result<Money, Error> {
    check_group(cfg)?;
    check_position(position, cfg.member_limit)?;
    let remaining = (cfg.member_limit - position) as i64;
    let base = cfg.contribution_amount.mul_ceil(Decimal::from(remaining));
    Ok(base.mul_ceil(cfg.deposit_multiplier))
}

/// Maximum loss other members face if this member defaults after receiving
/// their payout: independent of the multiplier, which only inflates the
/// *required* deposit above this floor.
pub fn max_loss_if_defaults(cfg: &GroupConfig, position: i32) -> Result<Money, Error> {
    check_group(cfg)?;
    check_position(position, cfg.member_limit)?;
    if position == cfg.member_limit {
        return Ok(Money::ZERO);
    }
    let remaining = (cfg.member_limit - position) as i64;
    Ok(cfg.contribution_amount.mul_ceil(Decimal::from(remaining)))
}

#[derive(Clone, Debug)]
pub struct MemberDepositAnalysis {
    pub position: i32,
    pub actual: Money,
    pub required: Money,
    /// `required - actual`, clamped at zero (never negative).
    pub gap: Money,
}

#[derive(Clone, Debug)]
pub struct GroupDepositValidation {
    pub sufficient: bool,
    pub per_member: Vec<MemberDepositAnalysis>,
    pub system_gap: Money,
}

/// A member's current deposit state, as the pure minimum this crate needs.
pub struct MemberDeposit {
    pub position: i32,
    pub deposit_amount: Money,
}

pub fn validate_group(cfg: &GroupConfig, members: &[MemberDeposit]) -> Result<GroupDepositValidation, Error> {
    check_group(cfg)?;
    let mut per_member = Vec::with_capacity(members.len());
    let mut system_gap = Money::ZERO;
    let mut sufficient = true;

    for m in members {
        let required = required_for_position(cfg, m.position)?;
        let gap = required.checked_sub(m.deposit_amount).unwrap_or(Money::ZERO);
        if gap.is_positive() {
            sufficient = false;
            system_gap += gap;
        }
        per_member.push(MemberDepositAnalysis {
            position: m.position,
            actual: m.deposit_amount,
            required,
            gap,
        });
    }

    Ok(GroupDepositValidation {
        sufficient,
        per_member,
        system_gap,
    })
}

/// Chooses the deposit-bearing position for a newly joining member:
/// `preferred` if free and in range, else the lowest unoccupied position.
pub fn assign_deposit_position(
    cfg: &GroupConfig,
    occupied: &[i32],
    preferred: Option<i32>,
) -> Result<i32, Error> {
    check_group(cfg)?;
    if let Some(p) = preferred {
        if p >= 1 && p <= cfg.member_limit && !occupied.contains(&p) {
            return Ok(p);
        }
    }
    (1..=cfg.member_limit)
        .find(|p| !occupied.contains(p))
        .ok_or(Error::GroupFull)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg(contribution_cents: i64, member_limit: i32, multiplier: Decimal) -> GroupConfig {
        GroupConfig {
            contribution_amount: Money::from_cents(contribution_cents),
            member_limit,
            deposit_multiplier: multiplier,
        }
    }

    #[test]
    fn position_one_of_five() {
        let c = cfg(100_000, 5, dec!(1));
        let required = required_for_position(&c, 1).unwrap();
        assert_eq!(required, Money::from_cents(400_000));
    }

    #[test]
    fn last_position_requires_zero() {
        let c = cfg(100_000, 5, dec!(1));
        let required = required_for_position(&c, 5).unwrap();
        assert_eq!(required, Money::ZERO);
        assert_eq!(max_loss_if_defaults(&c, 5).unwrap(), Money::ZERO);
    }

    #[test]
    fn fractional_contribution_rounds_up_to_cent() {
        // c=33.33, N=3, p=1, m=1.1 -> 33.33*2*1.1 = 73.326 -> 73.33
        let c = cfg(3333, 3, dec!(1.1));
        let required = required_for_position(&c, 1).unwrap();
        assert!(required >= Money::from_cents(7333));
    }

    #[test]
    fn multiplier_does_not_change_max_loss() {
        let c = cfg(50_000, 5, dec!(2.5));
        assert_eq!(max_loss_if_defaults(&c, 2).unwrap(), Money::from_cents(150_000));
    }

    #[test]
    fn invalid_position_rejected() {
        let c = cfg(100_000, 5, dec!(1));
        assert!(matches!(
            required_for_position(&c, 0),
            Err(Error::InvalidPosition { .. })
        ));
        assert!(matches!(
            required_for_position(&c, 6),
            Err(Error::InvalidPosition { .. })
        ));
    }

    #[test]
    fn invalid_group_rejected() {
        let c = cfg(0, 5, dec!(1));
        assert!(matches!(required_for_position(&c, 1), Err(Error::InvalidGroup(_))));
    }

    #[test]
    fn validate_group_flags_shortfall() {
        let c = cfg(100_000, 3, dec!(1));
        let members = vec![
            MemberDeposit { position: 1, deposit_amount: Money::from_cents(100_000) }, // needs 200_000
            MemberDeposit { position: 2, deposit_amount: Money::from_cents(100_000) }, // needs 100_000, ok
            MemberDeposit { position: 3, deposit_amount: Money::ZERO },                // needs 0, ok
        ];
        let report = validate_group(&c, &members).unwrap();
        assert!(!report.sufficient);
        assert_eq!(report.system_gap, Money::from_cents(100_000));
    }

    #[test]
    fn assign_position_prefers_requested_slot() {
        let c = cfg(100_000, 5, dec!(1));
        let pos = assign_deposit_position(&c, &[1, 2], Some(3)).unwrap();
        assert_eq!(pos, 3);
    }

    #[test]
    fn assign_position_falls_back_to_lowest_free() {
        let c = cfg(100_000, 5, dec!(1));
        let pos = assign_deposit_position(&c, &[1, 2], Some(2)).unwrap();
        assert_eq!(pos, 3);
    }

    #[test]
    fn assign_position_rejects_full_group() {
        let c = cfg(100_000, 3, dec!(1));
        assert!(matches!(
            assign_deposit_position(&c, &[1, 2, 3], None),
            Err(Error::GroupFull)
        ));
    }
}
