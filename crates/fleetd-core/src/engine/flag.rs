//! Boolean flag resources and flag-gated manifolds.
//!
//! A flag manifold publishes a [`FlagHandle`] capturing a boolean
//! predicate at the moment its worker started, and exits with the bounce
//! sentinel when the underlying value flips. Wrapping a manifold with
//! [`with_flag`] makes it start only while the flag is set: when the flag
//! worker bounces, its generation changes and the engine stops the
//! wrapped worker, whose next start attempt re-checks the flag.

use crate::worker::WorkerError;

use super::{Context, Manifold};

/// A boolean resource published by a flag manifold. The value is the one
/// observed when the publishing worker started; the worker bounces when
/// it changes, so a running producer implies the value is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagHandle {
    value: bool,
}

impl FlagHandle {
    /// Create a flag handle with the given value.
    #[must_use]
    pub const fn new(value: bool) -> Self {
        Self { value }
    }

    /// The captured value.
    #[must_use]
    pub const fn check(&self) -> bool {
        self.value
    }
}

/// Wrap `inner` so it only runs while the named flag resource is set.
///
/// The flag becomes an additional input; an unset flag reads as an unmet
/// dependency, leaving the wrapped manifold stopped until the flag
/// manifold bounces back with a set value.
#[must_use]
pub fn with_flag(inner: Manifold, flag_name: impl Into<String>) -> Manifold {
    let flag_name = flag_name.into();
    let mut inputs = inner.inputs.clone();
    inputs.push(flag_name.clone());

    let inner_start = inner.start.clone();
    let start: super::StartFn = std::sync::Arc::new(move |ctx: Context| {
        let flag = ctx.get::<FlagHandle>(&flag_name);
        let inner_start = inner_start.clone();
        Box::pin(async move {
            let flag = flag?;
            if !flag.check() {
                return Err(WorkerError::Unmet);
            }
            inner_start(ctx).await
        })
    });
    Manifold {
        inputs,
        start,
        filter: inner.filter,
    }
}
