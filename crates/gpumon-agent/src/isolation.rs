//! Fault isolation for optional metric groups

use futures::FutureExt;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

/// Result of running an optional group through [`isolate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolated<T> {
    /// The group ran to completion
    Completed(T),
    /// The group failed; the failure was contained
    Suppressed(String),
}

impl<T> Isolated<T> {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Isolated::Suppressed(_))
    }
}

/// Run `group` and contain any error or panic it raises.
///
/// Only failures raised while polling `group` are caught. Each call starts
/// fresh; a suppressed failure has no effect on the next call.
///
/// A contained panic still goes through the process panic hook first, so
/// the default hook prints it to stderr on every occurrence.
pub async fn isolate<F, T, E>(group: F) -> Isolated<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match AssertUnwindSafe(group).catch_unwind().await {
        Ok(Ok(value)) => Isolated::Completed(value),
        Ok(Err(e)) => Isolated::Suppressed(e.to_string()),
        Err(panic) => Isolated::Suppressed(format!("panicked: {}", panic_message(&panic))),
    }
}

pub(crate) fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_success_passes_through() {
        let outcome = isolate(async { Ok::<_, String>(7) }).await;
        assert_eq!(outcome, Isolated::Completed(7));
        assert!(!outcome.is_suppressed());
    }

    #[tokio::test]
    async fn test_error_is_suppressed() {
        let outcome = isolate(async { Err::<(), _>("not supported") }).await;
        assert_eq!(outcome, Isolated::Suppressed("not supported".to_string()));
    }

    #[tokio::test]
    async fn test_panic_is_suppressed() {
        let outcome: Isolated<()> = isolate(async {
            if true {
                panic!("driver went away");
            }
            Ok::<_, String>(())
        })
        .await;

        assert_eq!(
            outcome,
            Isolated::Suppressed("panicked: driver went away".to_string())
        );
    }

    #[tokio::test]
    async fn test_each_call_is_independent() {
        let attempts = AtomicU32::new(0);
        let group = || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(format!("attempt {} failed", n))
            } else {
                Ok(n)
            }
        };

        assert!(isolate(group()).await.is_suppressed());
        assert_eq!(isolate(group()).await, Isolated::Completed(1));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    #[should_panic(expected = "outside the group")]
    async fn test_panics_outside_group_propagate() {
        let outcome = isolate(async { Ok::<_, String>(()) }).await;
        assert!(!outcome.is_suppressed());
        panic!("outside the group");
    }
}
