//! Batch processors
//!
//! A processor turns a batch of outcomes into a new batch of outcomes. The
//! canonical processors apply a caller-supplied batch function to the
//! successful items and zip the outputs back onto their identities; failed
//! items are relayed untouched, at the position they came in.
//!
//! [`RetryingProcessor`] adds the partial-failure policy:
//!
//! 1. call the batch function with every pending item (retrying whole-batch
//!    errors as the [`RetryPolicy`] allows),
//! 2. on error, fail every item with the cause,
//! 3. on a short answer, call the function again item by item for the
//!    inputs that got no output, on a bounded worker pool,
//! 4. answers longer than the input are rejected as a contract violation.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

use super::outcome::{Cause, Item, ItemId, Outcome};
use super::retry::RetryPolicy;

/// Default width of the per-item fallback pool
pub const DEFAULT_FALLBACK_CONCURRENCY: usize = 4;

/// A transform over a whole batch of values.
///
/// Returning fewer outputs than inputs means some inputs silently failed;
/// returning an error fails the whole call. Any
/// `Fn(Vec<I>) -> impl Future<Output = anyhow::Result<Vec<O>>>` qualifies.
#[async_trait]
pub trait BatchFn<I, O>: Send + Sync {
    async fn call(&self, inputs: Vec<I>) -> anyhow::Result<Vec<O>>;
}

#[async_trait]
impl<I, O, F, Fut> BatchFn<I, O> for F
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(Vec<I>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Vec<O>>> + Send + 'static,
{
    async fn call(&self, inputs: Vec<I>) -> anyhow::Result<Vec<O>> {
        (self)(inputs).await
    }
}

/// One pipeline stage.
///
/// Implementations must relay failures unchanged and must not drop items
/// silently; the output order follows the input order.
#[async_trait]
pub trait Processor<I: Send + 'static, O: Send + 'static>: Send + Sync {
    async fn process(&self, batch: Vec<Outcome<I>>) -> Vec<Outcome<O>>;
}

/// Composition helpers available on every processor
pub trait ProcessorExt<I: Send + 'static, M: Send + 'static>: Processor<I, M> + Sized {
    /// Feed this processor's outcomes into `next`
    fn then<O, P>(self, next: P) -> Chain<Self, P, M>
    where
        O: Send + 'static,
        P: Processor<M, O>,
    {
        Chain {
            first: self,
            second: next,
            _mid: PhantomData,
        }
    }
}

impl<I: Send + 'static, M: Send + 'static, P: Processor<I, M>> ProcessorExt<I, M> for P {}

/// Two processors run back to back
pub struct Chain<A, B, M> {
    first: A,
    second: B,
    _mid: PhantomData<fn() -> M>,
}

#[async_trait]
impl<I, M, O, A, B> Processor<I, O> for Chain<A, B, M>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
    A: Processor<I, M>,
    B: Processor<M, O>,
{
    async fn process(&self, batch: Vec<Outcome<I>>) -> Vec<Outcome<O>> {
        let intermediate = self.first.process(batch).await;
        self.second.process(intermediate).await
    }
}

/// Work split out of an incoming batch: positions already decided (relayed
/// failures) and the items still to process, with their positions.
struct Split<I, O> {
    slots: Vec<Option<Outcome<O>>>,
    pending: Vec<(usize, Item<I>)>,
}

impl<I, O> Split<I, O> {
    fn new(batch: Vec<Outcome<I>>) -> Self {
        let mut slots = Vec::with_capacity(batch.len());
        let mut pending = Vec::new();

        for (position, outcome) in batch.into_iter().enumerate() {
            match outcome.into_item::<O>() {
                Ok(item) => {
                    pending.push((position, item));
                    slots.push(None);
                },
                Err(relayed) => slots.push(Some(relayed)),
            }
        }

        Self { slots, pending }
    }

    fn fill(&mut self, position: usize, outcome: Outcome<O>) {
        self.slots[position] = Some(outcome);
    }

    fn fail_all(&mut self, ids: impl IntoIterator<Item = (usize, ItemId)>, cause: &Cause) {
        for (position, id) in ids {
            self.fill(position, Outcome::failure(id, cause.clone()));
        }
    }

    fn finish(self) -> Vec<Outcome<O>> {
        let expected = self.slots.len();
        let outcomes: Vec<Outcome<O>> = self.slots.into_iter().flatten().collect();
        debug_assert_eq!(outcomes.len(), expected, "every position must be decided");
        outcomes
    }
}

fn no_output_cause() -> Cause {
    Cause::msg("batch function produced no output for this item")
}

fn oversized_cause(outputs: usize, inputs: usize) -> Cause {
    Cause::msg(format!(
        "batch function returned {} outputs for {} inputs",
        outputs, inputs
    ))
}

/// Applies a batch function once and zips outputs onto inputs by position.
///
/// A short answer fails the inputs left without an output; use
/// [`RetryingProcessor`] to recover them.
pub struct BatchProcessor<I, O, F> {
    func: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> BatchProcessor<I, O, F>
where
    F: BatchFn<I, O>,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F> Processor<I, O> for BatchProcessor<I, O, F>
where
    I: Send + 'static,
    O: Send + 'static,
    F: BatchFn<I, O>,
{
    async fn process(&self, batch: Vec<Outcome<I>>) -> Vec<Outcome<O>> {
        let mut split = Split::new(batch);
        if split.pending.is_empty() {
            return split.finish();
        }

        let (positions, items): (Vec<usize>, Vec<Item<I>>) =
            std::mem::take(&mut split.pending).into_iter().unzip();
        let (ids, values): (Vec<ItemId>, Vec<I>) =
            items.into_iter().map(|item| (item.id, item.value)).unzip();
        let inputs = values.len();

        match self.func.call(values).await {
            Ok(outputs) if outputs.len() > inputs => {
                split.fail_all(positions.into_iter().zip(ids), &oversized_cause(outputs.len(), inputs));
            },
            Ok(outputs) => {
                let mut outputs = outputs.into_iter();
                for (position, id) in positions.into_iter().zip(ids) {
                    let outcome = match outputs.next() {
                        Some(value) => Outcome::success(id, value),
                        None => Outcome::failure(id, no_output_cause()),
                    };
                    split.fill(position, outcome);
                }
            },
            Err(e) => {
                split.fail_all(positions.into_iter().zip(ids), &Cause::new(e));
            },
        }

        split.finish()
    }
}

type Matcher<I, O> = Arc<dyn Fn(&I, &O) -> bool + Send + Sync>;

/// Batch processor with whole-batch retry and per-item fallback
pub struct RetryingProcessor<I, O, F> {
    func: F,
    policy: RetryPolicy,
    concurrency: usize,
    matcher: Option<Matcher<I, O>>,
}

impl<I, O, F> RetryingProcessor<I, O, F>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
    F: BatchFn<I, O>,
{
    pub fn new(func: F) -> Self {
        Self {
            func,
            policy: RetryPolicy::none(),
            concurrency: DEFAULT_FALLBACK_CONCURRENCY,
            matcher: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Width of the per-item fallback pool (at least 1)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Pair outputs of a short answer with the inputs they belong to, so only
    /// the inputs without an output are called again. Without a matcher the
    /// order of a short answer carries no meaning and every input is retried.
    pub fn with_matcher(mut self, matcher: impl Fn(&I, &O) -> bool + Send + Sync + 'static) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    async fn call_batch(&self, values: &[I]) -> anyhow::Result<Vec<O>> {
        self.policy
            .retry("batch", || self.func.call(values.to_vec()), |_| true)
            .await
    }

    async fn call_single(&self, value: &I) -> Result<O, Cause> {
        let mut outputs = self
            .policy
            .retry("item", || self.func.call(vec![value.clone()]), |_| true)
            .await
            .map_err(Cause::new)?;

        match outputs.len() {
            1 => outputs.pop().ok_or_else(no_output_cause),
            0 => Err(no_output_cause()),
            n => Err(oversized_cause(n, 1)),
        }
    }

    /// Assign outputs of a short answer to inputs; returns the indices of
    /// inputs still without output
    fn match_outputs(
        &self,
        values: &[I],
        outputs: Vec<O>,
        matched: &mut [Option<O>],
    ) -> Vec<usize> {
        let Some(ref matcher) = self.matcher else {
            return (0..values.len()).collect();
        };

        let mut unused: Vec<Option<O>> = outputs.into_iter().map(Some).collect();
        for (index, value) in values.iter().enumerate() {
            let hit = unused
                .iter()
                .position(|o| o.as_ref().is_some_and(|o| matcher(value, o)));
            if let Some(hit) = hit {
                matched[index] = unused[hit].take();
            }
        }

        matched
            .iter()
            .enumerate()
            .filter(|(_, o)| o.is_none())
            .map(|(index, _)| index)
            .collect()
    }
}

#[async_trait]
impl<I, O, F> Processor<I, O> for RetryingProcessor<I, O, F>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
    F: BatchFn<I, O>,
{
    async fn process(&self, batch: Vec<Outcome<I>>) -> Vec<Outcome<O>> {
        let mut split = Split::new(batch);
        if split.pending.is_empty() {
            return split.finish();
        }

        let (positions, items): (Vec<usize>, Vec<Item<I>>) =
            std::mem::take(&mut split.pending).into_iter().unzip();
        let (ids, values): (Vec<ItemId>, Vec<I>) =
            items.into_iter().map(|item| (item.id, item.value)).unzip();
        let inputs = values.len();

        let outputs = match self.call_batch(&values).await {
            Ok(outputs) => outputs,
            Err(e) => {
                split.fail_all(positions.into_iter().zip(ids), &Cause::new(e));
                return split.finish();
            },
        };

        if outputs.len() > inputs {
            split.fail_all(
                positions.into_iter().zip(ids),
                &oversized_cause(outputs.len(), inputs),
            );
            return split.finish();
        }

        let mut matched: Vec<Option<O>> = Vec::with_capacity(inputs);
        let unmatched = if outputs.len() == inputs {
            matched.extend(outputs.into_iter().map(Some));
            Vec::new()
        } else {
            warn!(
                inputs,
                outputs = outputs.len(),
                "Partial batch result, falling back to per-item calls"
            );
            matched.resize_with(inputs, || None);
            self.match_outputs(&values, outputs, &mut matched)
        };

        let fallback: Vec<(usize, Result<O, Cause>)> = stream::iter(unmatched)
            .map(|index| {
                let value = &values[index];
                async move { (index, self.call_single(value).await) }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut singles: Vec<Option<Result<O, Cause>>> = Vec::new();
        singles.resize_with(inputs, || None);
        let recovered = fallback.iter().filter(|(_, r)| r.is_ok()).count();
        let attempted = fallback.len();
        for (index, result) in fallback {
            singles[index] = Some(result);
        }
        if attempted > 0 {
            debug!(attempted, recovered, "Per-item fallback finished");
        }

        for (index, ((position, id), output)) in positions
            .into_iter()
            .zip(ids)
            .zip(matched)
            .enumerate()
        {
            let outcome = match (output, singles[index].take()) {
                (Some(value), _) => Outcome::success(id, value),
                (None, Some(Ok(value))) => Outcome::success(id, value),
                (None, Some(Err(cause))) => Outcome::failure(id, cause),
                (None, None) => Outcome::failure(id, no_output_cause()),
            };
            split.fill(position, outcome);
        }

        split.finish()
    }
}
