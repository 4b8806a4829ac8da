use std::sync::atomic::{AtomicBool, Ordering};

/// Generate minibatch intervals
/// * `ntot` - number of total samples
/// * `batch_size` - the size of each batch (0 falls back to 1000)
pub fn generate_minibatch_intervals(ntot: usize, batch_size: usize) -> Vec<(usize, usize)> {
    let batch_size = if batch_size == 0 { 1000 } else { batch_size };
    let num_batches = ntot.div_ceil(batch_size);
    (0..num_batches)
        .map(|b| {
            let lb: usize = b * batch_size;
            let ub: usize = ((b + 1) * batch_size).min(ntot);
            (lb, ub)
        })
        .collect::<Vec<_>>()
}

/// Raised when a cooperative stop flag was observed between work units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted by a stop request")
    }
}

impl std::error::Error for Interrupted {}

/// Bail out with [`Interrupted`] if `stop` has been raised
pub fn check_stop(stop: Option<&AtomicBool>) -> anyhow::Result<()> {
    match stop {
        Some(flag) if flag.load(Ordering::Relaxed) => Err(Interrupted.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minibatch_intervals() {
        let jobs = generate_minibatch_intervals(10, 3);
        assert_eq!(jobs, vec![(0, 3), (3, 6), (6, 9), (9, 10)]);

        let jobs = generate_minibatch_intervals(6, 3);
        assert_eq!(jobs, vec![(0, 3), (3, 6)]);

        let jobs = generate_minibatch_intervals(1, 100);
        assert_eq!(jobs, vec![(0, 1)]);

        // zero falls back to the default block
        let jobs = generate_minibatch_intervals(5, 0);
        assert_eq!(jobs, vec![(0, 5)]);
    }

    #[test]
    fn test_check_stop() {
        let flag = AtomicBool::new(false);
        assert!(check_stop(None).is_ok());
        assert!(check_stop(Some(&flag)).is_ok());
        flag.store(true, Ordering::Relaxed);
        let err = check_stop(Some(&flag)).unwrap_err();
        assert!(err.is::<Interrupted>());
    }
}
