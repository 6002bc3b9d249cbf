//! Migration-era combinators for running the same work against two backends.
//!
//! The primary backend is authoritative: its outcome is what the caller gets.
//! The shadow backend runs the same work in its own, independent transaction
//! afterwards and its outcome is only compared, never propagated.

use std::fmt::{Debug, Display};

use log::warn;

use crate::error::TransactionError;
use crate::store::AccessMode;
use crate::transaction::{TransactionContext, TransactionManager};

/// How a shadow run compared to the primary run.
#[derive(Debug, Clone, PartialEq)]
pub enum Verification<R> {
    /// Both backends produced the same result.
    Match(R),
    /// The backends disagree.
    Mismatch { primary: R, shadow: R },
    /// The shadow run failed; the primary result still stands.
    ShadowFailed { primary: R, error: String },
}

impl<R> Verification<R> {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match(_))
    }

    pub fn primary(&self) -> &R {
        match self {
            Self::Match(r) => r,
            Self::Mismatch { primary, .. } | Self::ShadowFailed { primary, .. } => primary,
        }
    }

    pub fn into_primary(self) -> R {
        match self {
            Self::Match(r) => r,
            Self::Mismatch { primary, .. } | Self::ShadowFailed { primary, .. } => primary,
        }
    }
}

/// Runs `work` in a transaction on `primary`, then in a separate transaction on
/// `shadow`, and compares the results.
///
/// A primary failure is returned as-is and the shadow never runs.
pub fn run_with_shadow<R, E, F>(
    primary: &TransactionManager,
    shadow: &TransactionManager,
    ctx: &mut TransactionContext,
    work: F,
) -> Result<Verification<R>, E>
where
    F: Fn(&mut TransactionContext) -> Result<R, E>,
    R: PartialEq + Debug,
    E: From<TransactionError> + Display,
{
    run(primary, shadow, ctx, AccessMode::ReadWrite, work)
}

/// Read-only variant of [`run_with_shadow`], for verification reads.
pub fn verify_read<R, E, F>(
    primary: &TransactionManager,
    shadow: &TransactionManager,
    ctx: &mut TransactionContext,
    work: F,
) -> Result<Verification<R>, E>
where
    F: Fn(&mut TransactionContext) -> Result<R, E>,
    R: PartialEq + Debug,
    E: From<TransactionError> + Display,
{
    run(primary, shadow, ctx, AccessMode::ReadOnly, work)
}

fn run<R, E, F>(
    primary: &TransactionManager,
    shadow: &TransactionManager,
    ctx: &mut TransactionContext,
    mode: AccessMode,
    work: F,
) -> Result<Verification<R>, E>
where
    F: Fn(&mut TransactionContext) -> Result<R, E>,
    R: PartialEq + Debug,
    E: From<TransactionError> + Display,
{
    let in_transaction = |manager: &TransactionManager, ctx: &mut TransactionContext| match mode {
        AccessMode::ReadWrite => manager.transact(ctx, &work),
        AccessMode::ReadOnly => manager.transact_read_only(ctx, &work),
    };

    let primary_result = in_transaction(primary, &mut *ctx)?;
    let verification = match in_transaction(shadow, &mut *ctx) {
        Ok(shadow_result) if shadow_result == primary_result => {
            Verification::Match(primary_result)
        }
        Ok(shadow_result) => {
            warn!(
                "{} and {} disagree: {:?} vs {:?}",
                primary.backend(),
                shadow.backend(),
                primary_result,
                shadow_result
            );
            Verification::Mismatch {
                primary: primary_result,
                shadow: shadow_result,
            }
        }
        Err(e) => {
            warn!("Shadow run on {} failed: {}", shadow.backend(), e);
            Verification::ShadowFailed {
                primary: primary_result,
                error: e.to_string(),
            }
        }
    };
    Ok(verification)
}
