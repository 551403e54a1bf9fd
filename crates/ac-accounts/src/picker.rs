use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, instrument, warn};

use crate::account::{Account, AccountContext, ExternalAccount};
use crate::errors::AccountError;

/// Cooperative cancellation shared between a retry loop and whoever watches it
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub enum PickOutcome {
    /// A loaded account ready to log in
    Picked(Account),
    /// Minecraft login is throttled; the stop flag has been raised
    RateLimited,
    /// Every try failed or the inventory ran out of candidates
    Exhausted,
    /// The stop flag was raised by someone else
    Stopped,
}

/// Try up to `tries` random inventory accounts not in `existing_ids`.
///
/// The flag is checked before each inventory call, each account load, and
/// between an account's inventory lookup and its login chain.
/// A rate-limited attempt raises the flag and ends the loop, since every
/// other account would hit the same limit.
#[instrument(skip(ctx, existing_ids, stop))]
pub async fn pick_external_account(
    ctx: &AccountContext,
    existing_ids: &HashSet<String>,
    tries: usize,
    stop: &StopFlag,
) -> Result<PickOutcome, AccountError> {
    let inventory = ctx
        .inventory
        .as_ref()
        .ok_or(AccountError::MissingInventory)?;
    let mut skip = existing_ids.clone();

    for attempt in 1..=tries {
        if stop.is_stopped() {
            return Ok(PickOutcome::Stopped);
        }

        let Some(candidate) = inventory.random_available(&skip).await? else {
            return Ok(PickOutcome::Exhausted);
        };
        skip.insert(candidate.id.clone());

        if stop.is_stopped() {
            return Ok(PickOutcome::Stopped);
        }

        let mut account = ExternalAccount::new(candidate.id.clone());
        match account.fetch_info_until(ctx, stop).await {
            Ok(()) => {
                info!(attempt, id = %candidate.id, username = %account.cache.username, "Picked account");
                return Ok(PickOutcome::Picked(Account::from(account)));
            }
            Err(AccountError::Stopped) => return Ok(PickOutcome::Stopped),
            Err(AccountError::RateLimited) => {
                warn!(attempt, "Rate limited, stopping account search");
                stop.stop();
                return Ok(PickOutcome::RateLimited);
            }
            Err(e) => {
                warn!(attempt, id = %candidate.id, error = %e, "Account failed, trying another");
            }
        }
    }

    Ok(PickOutcome::Exhausted)
}
