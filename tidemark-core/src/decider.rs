//! The decision loop.
//!
//! A [`Decider`] binds a [`Category`] to one stream and exposes the
//! `transact`/`query` family. Every transact is the same loop: obtain
//! `(token, state)` per the [`LoadOption`], run the caller's pure decision
//! function, and, when it produced events, append them under the token's
//! version precondition. A conflict consumes one attempt, reloads the stream
//! tail from the write connection, and re-runs the decision against the
//! merged state; the loop is bounded by `max_attempts`.
//!
//! Decision functions must be pure in the supplied state: the loop calls
//! them once per attempt.

use std::{future::Future, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use thiserror::Error;

use crate::{
    ConfigError,
    category::{Category, CategoryError, Fold, SyncOutcome},
    codec::EventCodec,
    store::{EventLog, StoreError},
    token::StreamToken,
};

/// How the initial `(token, state)` pair is obtained.
#[derive(Clone, Debug, Default)]
pub enum LoadOption<S> {
    /// Fetch from the backend; a cache entry may seed the read but is never
    /// served stale.
    #[default]
    RequireLoad,
    /// Serve a live cache entry as-is, without contacting the backend.
    AllowStale,
    /// Skip all I/O and start from the empty stream.
    AssumeEmpty,
    /// Seed from a previously captured memento.
    FromMemento { token: StreamToken, state: S },
}

impl<S> LoadOption<S> {
    /// Seed from the pair returned by [`SyncContext::create_memento`].
    #[must_use]
    pub fn from_memento(memento: (StreamToken, S)) -> Self {
        let (token, state) = memento;
        Self::FromMemento { token, state }
    }
}

/// Stream position and state as observed by one decision attempt.
#[derive(Clone, Debug)]
pub struct SyncContext<S> {
    token: StreamToken,
    state: S,
}

impl<S> SyncContext<S> {
    pub(crate) fn new(token: StreamToken, state: S) -> Self {
        Self { token, state }
    }

    /// Count of persisted events at the observed position.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.token.version()
    }

    /// Measured stream size in bytes, when the backend reported one.
    #[must_use]
    pub fn stream_event_bytes(&self) -> Option<i64> {
        self.token.stream_bytes()
    }

    /// The folded state at the observed position.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }
}

impl<S: Clone> SyncContext<S> {
    /// Capture a `(token, state)` pair that can seed a later load via
    /// [`LoadOption::FromMemento`].
    #[must_use]
    pub fn create_memento(&self) -> (StreamToken, S) {
        (self.token.clone(), self.state.clone())
    }
}

/// Result of the reload a conflict triggers.
pub type ResyncFetch<S> = Result<(StreamToken, S), StoreError>;

/// Hook around the conflict-triggered reload.
///
/// The policy sees the 1-based attempt number and the reload future; it may
/// delay it, or transform what it yields. Cancellation propagates by
/// dropping the returned future.
pub trait ResyncPolicy<S>: Send + Sync {
    fn apply<'a>(
        &'a self,
        attempt: u32,
        resync: BoxFuture<'a, ResyncFetch<S>>,
    ) -> BoxFuture<'a, ResyncFetch<S>>
    where
        S: 'a;
}

/// Default policy: reload immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateResync;

impl<S> ResyncPolicy<S> for ImmediateResync {
    fn apply<'a>(
        &'a self,
        _attempt: u32,
        resync: BoxFuture<'a, ResyncFetch<S>>,
    ) -> BoxFuture<'a, ResyncFetch<S>>
    where
        S: 'a,
    {
        resync
    }
}

/// Delay each reload by `attempt * step`.
#[derive(Clone, Copy, Debug)]
pub struct LinearBackoff {
    step: Duration,
}

impl LinearBackoff {
    #[must_use]
    pub const fn new(step: Duration) -> Self {
        Self { step }
    }
}

impl<S: Send> ResyncPolicy<S> for LinearBackoff {
    fn apply<'a>(
        &'a self,
        attempt: u32,
        resync: BoxFuture<'a, ResyncFetch<S>>,
    ) -> BoxFuture<'a, ResyncFetch<S>>
    where
        S: 'a,
    {
        let delay = self.step.saturating_mul(attempt);
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            resync.await
        })
    }
}

/// Produces the terminal error once the attempt budget is spent.
pub type ExhaustedErrorFactory = Arc<dyn Fn(u32) -> DeciderError + Send + Sync>;

/// Failures surfaced by [`Decider`] operations.
#[derive(Debug, Error)]
pub enum DeciderError {
    /// Every sync attempt hit a competing writer.
    #[error("a competing writer kept the stream moving; gave up after {attempts} sync attempts")]
    MaxResyncsExhausted { attempts: u32 },
    /// An event could not be encoded for append.
    #[error("failed to encode event for append: {0}")]
    Codec(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The log refused or failed an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CategoryError> for DeciderError {
    fn from(error: CategoryError) -> Self {
        match error {
            CategoryError::Codec(source) => Self::Codec(source),
            CategoryError::Store(source) => Self::Store(source),
        }
    }
}

/// The public decision surface for one stream.
pub struct Decider<L, C, F>
where
    F: Fold,
{
    category: Arc<Category<L, C, F>>,
    stream: String,
    max_attempts: u32,
    resync_policy: Arc<dyn ResyncPolicy<F::State>>,
    exhausted_error: Option<ExhaustedErrorFactory>,
}

impl<L, C, F> std::fmt::Debug for Decider<L, C, F>
where
    F: Fold,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decider")
            .field("stream", &self.stream)
            .field("max_attempts", &self.max_attempts)
            .field("exhausted_error", &self.exhausted_error.is_some())
            .finish_non_exhaustive()
    }
}

impl<L, C, F> Clone for Decider<L, C, F>
where
    F: Fold,
{
    fn clone(&self) -> Self {
        Self {
            category: Arc::clone(&self.category),
            stream: self.stream.clone(),
            max_attempts: self.max_attempts,
            resync_policy: Arc::clone(&self.resync_policy),
            exhausted_error: self.exhausted_error.clone(),
        }
    }
}

impl<L, C, F> Decider<L, C, F>
where
    L: EventLog,
    F: Fold,
    C: EventCodec<Event = F::Event>,
    F::Event: Send + Sync,
{
    /// Bind `category` to `stream` with three sync attempts per transact.
    #[must_use]
    pub fn new(category: Arc<Category<L, C, F>>, stream: impl Into<String>) -> Self {
        Self {
            category,
            stream: stream.into(),
            max_attempts: 3,
            resync_policy: Arc::new(ImmediateResync),
            exhausted_error: None,
        }
    }

    /// Set the sync-attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `max_attempts` is zero.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Result<Self, ConfigError> {
        if max_attempts < 1 {
            return Err(ConfigError::new("max_attempts must be at least 1"));
        }
        self.max_attempts = max_attempts;
        Ok(self)
    }

    /// Replace the conflict-reload policy.
    #[must_use]
    pub fn with_resync_policy(
        mut self,
        policy: impl ResyncPolicy<F::State> + 'static,
    ) -> Self {
        self.resync_policy = Arc::new(policy);
        self
    }

    /// Replace the error raised when the attempt budget is spent.
    #[must_use]
    pub fn with_exhausted_error(
        mut self,
        factory: impl Fn(u32) -> DeciderError + Send + Sync + 'static,
    ) -> Self {
        self.exhausted_error = Some(Arc::new(factory));
        self
    }

    /// The stream this decider operates on.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    async fn fetch(
        &self,
        option: LoadOption<F::State>,
    ) -> Result<(StreamToken, F::State), StoreError> {
        match option {
            LoadOption::RequireLoad => self.category.load(&self.stream, false).await,
            LoadOption::AllowStale => self.category.load(&self.stream, true).await,
            LoadOption::AssumeEmpty => Ok((
                self.category.empty_token(),
                self.category.initial_state(),
            )),
            LoadOption::FromMemento { token, state } => Ok((token, state)),
        }
    }

    fn exhausted(&self, attempts: u32) -> DeciderError {
        match &self.exhausted_error {
            Some(factory) => factory(attempts),
            None => DeciderError::MaxResyncsExhausted { attempts },
        }
    }

    /// The decision loop shared by every transact shape.
    #[tracing::instrument(skip(self, decide, option), fields(stream = %self.stream))]
    async fn run<R, D, Fut>(
        &self,
        mut decide: D,
        option: LoadOption<F::State>,
    ) -> Result<(SyncContext<F::State>, R), DeciderError>
    where
        D: FnMut(SyncContext<F::State>) -> Fut,
        Fut: Future<Output = (R, Vec<F::Event>)>,
    {
        let (mut token, mut state) = self.fetch(option).await?;
        let mut attempt: u32 = 1;
        loop {
            let (result, events) = decide(SyncContext::new(token.clone(), state.clone())).await;
            if events.is_empty() {
                tracing::trace!("decision produced no events; skipping sync");
                return Ok((SyncContext::new(token, state), result));
            }

            match self
                .category
                .sync(&self.stream, &token, &state, &events)
                .await?
            {
                SyncOutcome::Written { token, state } => {
                    return Ok((SyncContext::new(token, state), result));
                }
                SyncOutcome::Conflict { actual } => {
                    tracing::debug!(
                        attempt,
                        observed_version = actual.as_ref().map(StreamToken::version),
                        "sync conflict"
                    );
                    if attempt >= self.max_attempts {
                        return Err(self.exhausted(attempt));
                    }
                    let category = &self.category;
                    let stream = self.stream.as_str();
                    let resync_token = token.clone();
                    let resync_state = state.clone();
                    let resync: BoxFuture<'_, ResyncFetch<F::State>> = Box::pin(async move {
                        category
                            .reload_from(stream, true, &resync_token, resync_state)
                            .await
                    });
                    let (next_token, next_state) =
                        self.resync_policy.apply(attempt, resync).await?;
                    token = next_token;
                    state = next_state;
                    attempt += 1;
                }
            }
        }
    }

    /// Run `interpret` and append whatever it yields.
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError`] when the attempt budget is spent or the log
    /// fails.
    pub async fn transact(
        &self,
        mut interpret: impl FnMut(&F::State) -> Vec<F::Event>,
        option: LoadOption<F::State>,
    ) -> Result<(), DeciderError> {
        self.run(
            move |ctx| {
                let events = interpret(ctx.state());
                std::future::ready(((), events))
            },
            option,
        )
        .await
        .map(|_| ())
    }

    /// [`Self::transact`], then render the post-sync state.
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError`] when the attempt budget is spent or the log
    /// fails.
    pub async fn transact_map<V>(
        &self,
        mut interpret: impl FnMut(&F::State) -> Vec<F::Event>,
        render: impl FnOnce(&F::State) -> V,
        option: LoadOption<F::State>,
    ) -> Result<V, DeciderError> {
        let (context, ()) = self
            .run(
                move |ctx| {
                    let events = interpret(ctx.state());
                    std::future::ready(((), events))
                },
                option,
            )
            .await?;
        Ok(render(context.state()))
    }

    /// Run `decide` and append its events, returning its result.
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError`] when the attempt budget is spent or the log
    /// fails.
    pub async fn transact_result<R>(
        &self,
        mut decide: impl FnMut(&F::State) -> (R, Vec<F::Event>),
        option: LoadOption<F::State>,
    ) -> Result<R, DeciderError> {
        self.run(move |ctx| std::future::ready(decide(ctx.state())), option)
            .await
            .map(|(_, result)| result)
    }

    /// [`Self::transact_result`], then map the result with the post-sync
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError`] when the attempt budget is spent or the log
    /// fails.
    pub async fn transact_result_map<R, V>(
        &self,
        mut decide: impl FnMut(&F::State) -> (R, Vec<F::Event>),
        map_result: impl FnOnce(R, &F::State) -> V,
        option: LoadOption<F::State>,
    ) -> Result<V, DeciderError> {
        let (context, result) = self
            .run(move |ctx| std::future::ready(decide(ctx.state())), option)
            .await?;
        Ok(map_result(result, context.state()))
    }

    /// Like [`Self::transact_result`], with the decision seeing the full
    /// [`SyncContext`] (version, byte hint, memento).
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError`] when the attempt budget is spent or the log
    /// fails.
    pub async fn transact_ex<R>(
        &self,
        mut decide: impl FnMut(&SyncContext<F::State>) -> (R, Vec<F::Event>),
        option: LoadOption<F::State>,
    ) -> Result<R, DeciderError> {
        self.run(move |ctx| std::future::ready(decide(&ctx)), option)
            .await
            .map(|(_, result)| result)
    }

    /// [`Self::transact_ex`], then map the result with the post-sync
    /// context.
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError`] when the attempt budget is spent or the log
    /// fails.
    pub async fn transact_ex_map<R, V>(
        &self,
        mut decide: impl FnMut(&SyncContext<F::State>) -> (R, Vec<F::Event>),
        map_result: impl FnOnce(R, &SyncContext<F::State>) -> V,
        option: LoadOption<F::State>,
    ) -> Result<V, DeciderError> {
        let (context, result) = self
            .run(move |ctx| std::future::ready(decide(&ctx)), option)
            .await?;
        Ok(map_result(result, &context))
    }

    /// The loop with a suspendable decision function.
    ///
    /// `decide` receives the context by value so it can be held across await
    /// points; it is still called once per attempt and must stay pure in the
    /// supplied state.
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError`] when the attempt budget is spent or the log
    /// fails.
    pub async fn transact_async<R, Fut>(
        &self,
        decide: impl FnMut(SyncContext<F::State>) -> Fut,
        option: LoadOption<F::State>,
    ) -> Result<R, DeciderError>
    where
        Fut: Future<Output = (R, Vec<F::Event>)>,
    {
        self.run(decide, option).await.map(|(_, result)| result)
    }

    /// Render the current state without a write path.
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError::Store`] when the load fails.
    pub async fn query<V>(
        &self,
        render: impl FnOnce(&F::State) -> V,
        option: LoadOption<F::State>,
    ) -> Result<V, DeciderError> {
        let (_, state) = self.fetch(option).await?;
        Ok(render(&state))
    }

    /// [`Self::query`] with the full [`SyncContext`] exposed.
    ///
    /// # Errors
    ///
    /// Returns [`DeciderError::Store`] when the load fails.
    pub async fn query_ex<V>(
        &self,
        render: impl FnOnce(&SyncContext<F::State>) -> V,
        option: LoadOption<F::State>,
    ) -> Result<V, DeciderError> {
        let (token, state) = self.fetch(option).await?;
        Ok(render(&SyncContext::new(token, state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_option_defaults_to_require_load() {
        assert!(matches!(
            LoadOption::<()>::default(),
            LoadOption::RequireLoad
        ));
    }

    #[test]
    fn exhausted_error_names_the_attempt_count() {
        let error = DeciderError::MaxResyncsExhausted { attempts: 3 };
        assert!(error.to_string().contains("3 sync attempts"));
    }

    #[test]
    fn sync_context_exposes_version_and_memento() {
        let context = SyncContext::new(StreamToken::of_uncompacted(6), "state".to_owned());
        assert_eq!(context.version(), 7);
        assert_eq!(context.stream_event_bytes(), None);

        let (token, state) = context.create_memento();
        assert_eq!(token.version(), 7);
        assert_eq!(state, "state");
    }

    #[test]
    fn store_errors_pass_through_transparently() {
        let error = DeciderError::from(CategoryError::Store(StoreError::StreamDeleted {
            stream: "Upload-1".to_owned(),
        }));
        assert!(matches!(
            error,
            DeciderError::Store(StoreError::StreamDeleted { .. })
        ));
    }
}
