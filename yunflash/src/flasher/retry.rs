//! Attempt budgeting.
//!
//! Flashing over a serial console and TFTP fails in ways that usually clear
//! up on a second try, like a board caught mid-boot or an address clash on
//! the LAN. Every failure is therefore retried until the attempt budget is
//! spent, with fresh addresses allocated before each retry.

use log::{info, warn};

use crate::{Error, Result, is_interrupted_requested};

use super::{AttemptFailure, SessionContext};

/// Total number of runs allowed by default: the first attempt plus three
/// retries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Runs `attempt` until it succeeds or `max_attempts` runs are spent.
///
/// `reallocate` is called before every retry to give the context fresh
/// network addresses. Its failure aborts the whole session, as does an
/// interrupt request between runs. Once the budget is exhausted the error of
/// the last attempt is returned.
pub fn run_with_retries<A, R>(
    ctx: &mut SessionContext,
    max_attempts: u32,
    mut attempt: A,
    mut reallocate: R,
) -> Result<String>
where
    A: FnMut(&SessionContext) -> std::result::Result<String, AttemptFailure>,
    R: FnMut(&mut SessionContext) -> Result<()>,
{
    let mut last_failure: Option<AttemptFailure> = None;

    for run in 1..=max_attempts {
        if run > 1 {
            if is_interrupted_requested() {
                break;
            }
            info!("Retrying ({run}/{max_attempts})");
            reallocate(ctx)?;
        }
        match attempt(ctx) {
            Ok(output) => return Ok(output),
            Err(failure) => {
                warn!("Attempt {run}/{max_attempts} failed: {}", failure.error);
                if !failure.output.is_empty() {
                    info!("last console output:\n{}", failure.output);
                }
                last_failure = Some(failure);
            }
        }
    }

    Err(last_failure.map_or_else(
        || Error::Config("no flashing attempts were made (max attempts is 0)".into()),
        |failure| failure.error,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::Ipv4Addr;

    fn failure() -> AttemptFailure {
        AttemptFailure {
            output: "Loading: T T T\r\n".into(),
            error: Error::Timeout("bytes-transferred".into()),
        }
    }

    #[test]
    fn budget_is_exact_total_runs() {
        let mut ctx = super::super::test_context();
        let attempts = Cell::new(0u32);
        let reallocations = Cell::new(0u32);

        let result = run_with_retries(
            &mut ctx,
            4,
            |_| {
                attempts.set(attempts.get() + 1);
                Err(failure())
            },
            |_| {
                reallocations.set(reallocations.get() + 1);
                Ok(())
            },
        );

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(attempts.get(), 4);
        assert_eq!(reallocations.get(), 3);
    }

    #[test]
    fn success_stops_retrying() {
        let mut ctx = super::super::test_context();
        let attempts = Cell::new(0u32);
        let reallocations = Cell::new(0u32);

        let result = run_with_retries(
            &mut ctx,
            4,
            |_| {
                attempts.set(attempts.get() + 1);
                if attempts.get() < 2 {
                    Err(failure())
                } else {
                    Ok("Starting kernel ...".into())
                }
            },
            |_| {
                reallocations.set(reallocations.get() + 1);
                Ok(())
            },
        );

        assert_eq!(result.unwrap(), "Starting kernel ...");
        assert_eq!(attempts.get(), 2);
        assert_eq!(reallocations.get(), 1);
    }

    #[test]
    fn first_success_never_reallocates() {
        let mut ctx = super::super::test_context();
        let result = run_with_retries(
            &mut ctx,
            4,
            |_| Ok("ok".into()),
            |_| panic!("reallocate must not run before the first attempt"),
        );
        assert_eq!(result.unwrap(), "ok");
    }

    #[test]
    fn reallocation_failure_aborts_the_session() {
        let mut ctx = super::super::test_context();
        let attempts = Cell::new(0u32);

        let result = run_with_retries(
            &mut ctx,
            4,
            |_| {
                attempts.set(attempts.get() + 1);
                Err(failure())
            },
            |_| Err(Error::Network("no usable interface left".into())),
        );

        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn retries_see_reallocated_addresses() {
        let mut ctx = super::super::test_context();
        let seen = Cell::new(Ipv4Addr::UNSPECIFIED);

        let result = run_with_retries(
            &mut ctx,
            2,
            |ctx| {
                seen.set(ctx.server_addr);
                Err(failure())
            },
            |ctx| {
                ctx.server_addr = Ipv4Addr::new(10, 1, 2, 3);
                Ok(())
            },
        );

        assert!(result.is_err());
        assert_eq!(seen.get(), Ipv4Addr::new(10, 1, 2, 3));
    }

    #[test]
    fn zero_budget_runs_nothing() {
        let mut ctx = super::super::test_context();
        let result = run_with_retries(
            &mut ctx,
            0,
            |_| panic!("attempt must not run with a zero budget"),
            |_| panic!("reallocate must not run with a zero budget"),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
