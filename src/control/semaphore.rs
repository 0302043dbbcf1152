use std::fmt;

use crossbeam_channel::{Receiver, Sender, select};

use crate::context::{ContextError, RunContext};

/// Counting semaphore whose acquisition can be raced against a [`RunContext`].
///
/// Permits are tokens in a bounded channel sized to the capacity; acquiring
/// receives tokens and dropping a [`SemaphorePermit`] sends them back.
pub struct WeightedSemaphore {
    capacity: usize,
    release: Sender<()>,
    tokens: Receiver<()>,
}

impl WeightedSemaphore {
    /// A semaphore holding `capacity` units (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (release, tokens) = crossbeam_channel::bounded(capacity);
        for _ in 0..capacity {
            let _ = release.try_send(());
        }
        Self {
            capacity,
            release,
            tokens,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Units not currently held.
    pub fn available(&self) -> usize {
        self.tokens.len()
    }

    /// Take one unit, blocking until one is free or `ctx` is done.
    pub fn acquire(&self, ctx: &RunContext) -> Result<SemaphorePermit, ContextError> {
        self.acquire_weight(ctx, 1)
    }

    /// Take every unit, i.e. wait until all holders have released theirs.
    pub fn acquire_all(&self, ctx: &RunContext) -> Result<SemaphorePermit, ContextError> {
        self.acquire_weight(ctx, self.capacity)
    }

    fn acquire_weight(
        &self,
        ctx: &RunContext,
        weight: usize,
    ) -> Result<SemaphorePermit, ContextError> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let cancelled = ctx.cancelled();
        let expired = ctx.expired();
        // Units taken so far go back on early return.
        let mut permit = SemaphorePermit {
            weight: 0,
            release: self.release.clone(),
        };
        while permit.weight < weight {
            select! {
                recv(self.tokens) -> token => {
                    if token.is_err() {
                        return Err(ContextError::Cancelled(Some("semaphore closed".into())));
                    }
                    permit.weight += 1;
                }
                recv(cancelled) -> _ => {
                    return Err(ctx.err().unwrap_or(ContextError::Cancelled(None)));
                }
                recv(expired) -> _ => {
                    return Err(ctx.err().unwrap_or(ContextError::DeadlineExceeded));
                }
            }
        }
        Ok(permit)
    }
}

impl fmt::Debug for WeightedSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightedSemaphore")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// Units held from a [`WeightedSemaphore`]; released on drop.
#[must_use = "dropping a permit releases it immediately"]
pub struct SemaphorePermit {
    weight: usize,
    release: Sender<()>,
}

impl SemaphorePermit {
    pub fn weight(&self) -> usize {
        self.weight
    }
}

impl fmt::Debug for SemaphorePermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePermit")
            .field("weight", &self.weight)
            .finish()
    }
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        for _ in 0..self.weight {
            let _ = self.release.try_send(());
        }
    }
}
