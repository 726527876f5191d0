use deadpool_postgres::Pool;
use tandem_pool_types::{BlockDiscoveryPayload, DistributeResponse};

use crate::{config::Config, database, error::Error, units};

/// One account's cut of a block reward, fee already deducted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardShare {
    pub username: String,
    pub shares: i64,

    /// Share-proportional reward before the pool fee.
    pub raw: i64,

    /// Fee rate applied, denormalized for audit.
    pub fee_ppm: i32,

    /// Fee retained by the pool.
    pub fee_amount: i64,

    /// Amount credited to the account balance.
    pub amount: i64,
}

/// Validate a block-discovery payload before any write. Negative share
/// counts and share totals that do not fit an i64 are rejected outright;
/// zero-share contributors are dropped. Returns the surviving entries
/// sorted by username. The checked total here bounds every later sum over
/// these entries.
pub fn validate_shares(payload: &BlockDiscoveryPayload) -> Result<Vec<(String, i64)>, Error> {
    if payload.total_reward <= 0 {
        return Err(Error::NonPositiveReward(payload.currency, payload.height));
    }
    let mut entries = Vec::with_capacity(payload.shares.len());
    let mut total: i64 = 0;
    for (username, shares) in &payload.shares {
        if *shares < 0 {
            return Err(Error::NegativeShareCount(payload.currency, payload.height));
        }
        if *shares == 0 {
            continue;
        }
        total = total
            .checked_add(*shares)
            .ok_or(Error::ShareTotalOverflow(payload.currency, payload.height))?;
        entries.push((username.clone(), *shares));
    }
    if entries.is_empty() {
        return Err(Error::EmptyShareTable(payload.currency, payload.height));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Share-proportional split with a single rounding policy: the per-share
/// value is floored to the atomic unit and the rounding residual goes to
/// the largest contributor (ties broken by username ascending), so credited
/// amounts plus retained fees always sum to exactly the block reward.
///
/// `entries` is (username, shares, fee_ppm), shares all positive.
pub fn split_rewards(total_reward: i64, entries: &[(String, i64, i32)]) -> (i64, Vec<RewardShare>) {
    let total_shares: i64 = entries.iter().map(|(_, shares, _)| *shares).sum();
    let per_share = total_reward / total_shares;
    let residual = total_reward - per_share * total_shares;

    let largest = entries
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(i, _)| i);

    let rewards = entries
        .iter()
        .enumerate()
        .map(|(i, (username, shares, fee_ppm))| {
            let mut raw = shares * per_share;
            if Some(i) == largest {
                raw += residual;
            }
            let fee_amount = units::fee_amount(raw, *fee_ppm);
            RewardShare {
                username: username.clone(),
                shares: *shares,
                raw,
                fee_ppm: *fee_ppm,
                fee_amount,
                amount: raw - fee_amount,
            }
        })
        .collect();
    (per_share, rewards)
}

/// Distribute a confirmed block: insert the block row, one reward entry per
/// contributing account and the matching balance credits, all in a single
/// serializable transaction. Replays of an already-recorded (currency,
/// height) are reported as processed without touching the ledger; a
/// concurrent duplicate that races past the existence check trips the
/// blocks primary key and rolls back whole.
pub async fn distribute_block(
    pool: &Pool,
    cfg: &Config,
    payload: &BlockDiscoveryPayload,
) -> Result<DistributeResponse, Error> {
    let share_entries = validate_shares(payload)?;
    let currency = payload.currency;
    let height = payload.height;

    let mut conn = pool.get().await?;
    let tx = database::serializable(&mut conn).await?;
    if database::block_exists(&tx, currency, height).await? {
        log::warn!("block already processed: {} {}", currency, height);
        return Ok(DistributeResponse {
            currency,
            height,
            already_processed: true,
            accounts_credited: 0,
        });
    }

    let now = units::unix_now();

    // Fee rates are read (and account rows locked) before the split so the
    // computed entries match what gets persisted.
    let mut entries = Vec::with_capacity(share_entries.len());
    for (username, shares) in share_entries {
        let fee_ppm = database::ensure_account(&tx, &username, cfg.default_fee_ppm, now).await?;
        entries.push((username, shares, fee_ppm));
    }

    let total_shares: i64 = entries.iter().map(|(_, shares, _)| *shares).sum();
    let (per_share_value, rewards) = split_rewards(payload.total_reward, &entries);

    database::insert_block(
        &tx,
        currency,
        height,
        payload.total_reward,
        total_shares,
        per_share_value,
        payload.discovered_at,
    )
    .await?;
    for reward in &rewards {
        database::insert_reward(
            &tx,
            currency,
            height,
            &reward.username,
            reward.amount,
            reward.fee_amount,
            reward.fee_ppm,
            reward.shares,
            now,
        )
        .await?;
        database::credit_balance(&tx, &reward.username, currency, reward.amount, now).await?;
    }
    tx.commit().await?;

    let fees_retained: i64 = rewards.iter().map(|r| r.fee_amount).sum();
    log::info!(
        "distributed block {} {}: reward {} across {} accounts, fees retained {}",
        currency,
        height,
        units::format_amount(currency, payload.total_reward),
        rewards.len(),
        units::format_amount(currency, fees_retained),
    );
    Ok(DistributeResponse {
        currency,
        height,
        already_processed: false,
        accounts_credited: rewards.len(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rand::Rng;
    use tandem_pool_types::Currency;

    use super::*;

    fn payload(total_reward: i64, shares: &[(&str, i64)]) -> BlockDiscoveryPayload {
        BlockDiscoveryPayload {
            currency: Currency::Tari,
            height: 1000,
            total_reward,
            shares: shares
                .iter()
                .map(|(name, count)| (name.to_string(), *count))
                .collect(),
            discovered_at: 1_700_000_000,
        }
    }

    fn conservation(total_reward: i64, rewards: &[RewardShare]) {
        let credited: i64 = rewards.iter().map(|r| r.amount).sum();
        let fees: i64 = rewards.iter().map(|r| r.fee_amount).sum();
        assert_eq!(
            credited + fees,
            total_reward,
            "rounding must neither create nor destroy currency"
        );
    }

    #[test]
    fn rejects_non_positive_reward() {
        assert!(matches!(
            validate_shares(&payload(0, &[("alice", 3)])),
            Err(Error::NonPositiveReward(_, _))
        ));
        assert!(matches!(
            validate_shares(&payload(-5, &[("alice", 3)])),
            Err(Error::NonPositiveReward(_, _))
        ));
    }

    #[test]
    fn rejects_empty_share_table() {
        assert!(matches!(
            validate_shares(&payload(10, &[])),
            Err(Error::EmptyShareTable(_, _))
        ));
        // zero-share contributors are dropped; all-zero is empty
        assert!(matches!(
            validate_shares(&payload(10, &[("alice", 0), ("bob", 0)])),
            Err(Error::EmptyShareTable(_, _))
        ));
    }

    #[test]
    fn drops_zero_share_contributors() {
        let entries = validate_shares(&payload(10, &[("alice", 3), ("bob", 0)])).unwrap();
        assert_eq!(entries, vec![("alice".to_string(), 3)]);
    }

    #[test]
    fn splits_block_reward_with_fees() {
        // 10.000000 Tari, shares {alice: 3, bob: 1}, 8% fee on both
        let entries = vec![
            ("alice".to_string(), 3, 80_000),
            ("bob".to_string(), 1, 80_000),
        ];
        let (per_share, rewards) = split_rewards(10_000_000, &entries);
        assert_eq!(per_share, 2_500_000);

        let alice = &rewards[0];
        assert_eq!(alice.raw, 7_500_000);
        assert_eq!(alice.fee_amount, 600_000);
        assert_eq!(alice.amount, 6_900_000);

        let bob = &rewards[1];
        assert_eq!(bob.raw, 2_500_000);
        assert_eq!(bob.fee_amount, 200_000);
        assert_eq!(bob.amount, 2_300_000);

        // credited amounts keep the 3:1 share ratio
        assert_eq!(alice.amount, bob.amount * 3);
        conservation(10_000_000, &rewards);
    }

    #[test]
    fn residual_goes_to_largest_contributor() {
        // 10 units over 4 shares: per-share floors to 2, residual 2
        let entries = vec![("alice".to_string(), 3, 0), ("bob".to_string(), 1, 0)];
        let (per_share, rewards) = split_rewards(10, &entries);
        assert_eq!(per_share, 2);
        assert_eq!(rewards[0].raw, 8);
        assert_eq!(rewards[1].raw, 2);
        conservation(10, &rewards);
    }

    #[test]
    fn residual_tie_breaks_by_username() {
        // 7 units over 4 shares: per-share floors to 1, residual 3
        let entries = vec![("zed".to_string(), 2, 0), ("amy".to_string(), 2, 0)];
        let (per_share, rewards) = split_rewards(7, &entries);
        assert_eq!(per_share, 1);
        // amy and zed hold equal shares; amy wins the residual
        let amy = rewards.iter().find(|r| r.username == "amy").unwrap();
        let zed = rewards.iter().find(|r| r.username == "zed").unwrap();
        assert_eq!(amy.raw, 5);
        assert_eq!(zed.raw, 2);
        conservation(7, &rewards);
    }

    #[test]
    fn rejects_negative_share_counts() {
        assert!(matches!(
            validate_shares(&payload(10, &[("alice", -5), ("bob", 4)])),
            Err(Error::NegativeShareCount(_, _))
        ));
    }

    #[test]
    fn rejects_share_totals_that_overflow() {
        assert!(matches!(
            validate_shares(&payload(10, &[("alice", i64::MAX), ("bob", 2)])),
            Err(Error::ShareTotalOverflow(_, _))
        ));
    }

    #[test]
    fn conservation_holds_over_random_distributions() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let total_reward = rng.gen_range(1..=1_000_000_000_000_000i64);
            let accounts = rng.gen_range(1..=20usize);
            let entries: Vec<(String, i64, i32)> = (0..accounts)
                .map(|i| {
                    (
                        format!("miner{i}"),
                        rng.gen_range(1..=1_000_000i64),
                        rng.gen_range(0..1_000_000i32),
                    )
                })
                .collect();
            let (_, rewards) = split_rewards(total_reward, &entries);
            conservation(total_reward, &rewards);
            let total_shares: i64 = entries.iter().map(|(_, s, _)| *s).sum();
            let attributed: i64 = rewards.iter().map(|r| r.shares).sum();
            assert_eq!(attributed, total_shares);
        }
    }

    #[test]
    fn validate_sorts_usernames() {
        let mut shares = HashMap::new();
        shares.insert("zed".to_string(), 1);
        shares.insert("amy".to_string(), 2);
        shares.insert("moe".to_string(), 3);
        let p = BlockDiscoveryPayload {
            currency: Currency::Xmr,
            height: 7,
            total_reward: 100,
            shares,
            discovered_at: 0,
        };
        let entries = validate_shares(&p).unwrap();
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["amy", "moe", "zed"]);
    }
}
