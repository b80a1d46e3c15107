//! Poll-until-done helpers bounded by a [`RequestContext`].

use std::future::Future;
use std::time::Duration;

use tonic::Status;

use super::context::RequestContext;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// The context ended before the condition was met.
    #[error("timed out waiting for the condition")]
    WaitTimeout,
    /// The condition gave up with a final status.
    #[error(transparent)]
    Status(#[from] Status),
}

/// Attempt schedule: the first tick fires immediately, later ones after
/// `period`. Ends with [`PollError::WaitTimeout`] once the context ends.
#[derive(Debug)]
pub struct Poller<'a> {
    ctx: &'a RequestContext,
    period: Duration,
    started: bool,
}

impl<'a> Poller<'a> {
    pub const fn new(ctx: &'a RequestContext, period: Duration) -> Self {
        Self {
            ctx,
            period,
            started: false,
        }
    }

    pub async fn tick(&mut self) -> Result<(), PollError> {
        if !self.started {
            self.started = true;
            return Ok(());
        }
        self.ctx
            .sleep(self.period)
            .await
            .map_err(|_| PollError::WaitTimeout)
    }
}

/// Run `condition` immediately and then every `period` until it yields a
/// value or an error.
pub async fn poll_immediate_until<T, F, Fut>(
    ctx: &RequestContext,
    period: Duration,
    mut condition: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, PollError>>,
{
    let mut poller = Poller::new(ctx, period);
    loop {
        poller.tick().await?;
        if let Some(value) = condition().await? {
            return Ok(value);
        }
    }
}
