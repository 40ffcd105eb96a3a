//! NodeBalancer reconciliation.
//!
//! [`desired`] turns a service into the state it should have, [`differ`]
//! and [`nodes`] plan the calls needed to get there and [`engine`] runs
//! them against a [`crate::linode::LinodeApi`].

use std::future::Future;

use crate::{
    error::{CCMError, CCMResult},
    linode::LinodeResult,
    retry::RetryPolicy,
};

pub mod desired;
pub mod differ;
pub mod engine;
pub mod nodes;

pub use desired::{Backend, DesiredPort, DesiredService, TlsMaterial};
pub use engine::{IdentityStore, ReconcileEngine, ReconcileReport};

/// Run one Linode call under the retry policy.
pub(crate) async fn call<T, F, Fut>(retry: &RetryPolicy, operation: &str, op: F) -> CCMResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LinodeResult<T>>,
{
    Ok(retry.run(operation, op).await?)
}

/// Deleting something that is already gone is success.
pub(crate) fn ignore_not_found(result: CCMResult<()>) -> CCMResult<()> {
    match result {
        Err(CCMError::LinodeError(err)) if err.is_not_found() => Ok(()),
        other => other,
    }
}
