//! Majority math and a single-shot quorum latch.

/// Get the quorum majority of a total.
pub fn majority_of(total: usize) -> usize {
    (total / 2) + 1
}

/// A single-shot counter which resolves to a success or failure outcome.
///
/// Constructed with the number of successes required and the total number of participants. Each
/// participant reports exactly one of `succeed` or `fail`; the latch completes with `true` once
/// `quorum_size` successes have been counted, or with `false` as soon as success has become
/// impossible. The completion callback fires at most once; further reports are ignored.
pub struct Quorum {
    quorum_size: usize,
    total: usize,
    successes: usize,
    failures: usize,
    callback: Option<Box<dyn FnOnce(bool) + Send>>,
}

impl Quorum {
    /// Create a new latch requiring `quorum_size` successes out of `total` participants.
    pub fn new(quorum_size: usize, total: usize, callback: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            quorum_size,
            total,
            successes: 0,
            failures: 0,
            callback: Some(Box::new(callback)),
        }
    }

    /// Report a success from one participant.
    pub fn succeed(&mut self) {
        self.successes += 1;
        if self.successes >= self.quorum_size {
            self.complete(true);
        }
    }

    /// Report a failure from one participant.
    pub fn fail(&mut self) {
        self.failures += 1;
        if self.total - self.failures < self.quorum_size {
            self.complete(false);
        }
    }

    /// Check if the latch has already resolved.
    pub fn is_complete(&self) -> bool {
        self.callback.is_none()
    }

    fn complete(&mut self, outcome: bool) {
        if let Some(cb) = self.callback.take() {
            cb(outcome);
        }
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::Mutex;

    use super::*;

    fn latch(quorum_size: usize, total: usize) -> (Quorum, Arc<Mutex<Option<bool>>>) {
        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        let q = Quorum::new(quorum_size, total, move |res| {
            *o.lock().unwrap() = Some(res);
        });
        (q, outcome)
    }

    #[test]
    fn test_majority_of() {
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn test_completes_true_at_quorum() {
        let (mut q, outcome) = latch(2, 3);
        q.succeed();
        assert_eq!(*outcome.lock().unwrap(), None);
        q.succeed();
        assert_eq!(*outcome.lock().unwrap(), Some(true));
        assert!(q.is_complete());
    }

    #[test]
    fn test_completes_false_once_success_is_impossible() {
        let (mut q, outcome) = latch(2, 3);
        q.fail();
        assert_eq!(*outcome.lock().unwrap(), None);
        q.fail();
        assert_eq!(*outcome.lock().unwrap(), Some(false));
    }

    #[test]
    fn test_idempotent_after_first_completion() {
        let (mut q, outcome) = latch(1, 3);
        q.succeed();
        assert_eq!(*outcome.lock().unwrap(), Some(true));
        q.fail();
        q.fail();
        q.fail();
        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }
}
