/// Outcome of comparing the local position against an authoritative one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CorrectionDecision {
    pub snap: bool,
    /// Where local playback should be afterwards: the remote time when
    /// snapping, the untouched local time otherwise.
    pub target_time: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DriftCorrector {
    threshold: f64,
}

impl DriftCorrector {
    pub fn new(threshold_secs: f64) -> Self {
        Self {
            threshold: threshold_secs,
        }
    }

    pub fn reconcile(&self, remote_time: f64, local_time: f64) -> CorrectionDecision {
        let drift = (local_time - remote_time).abs();
        if drift > self.threshold {
            CorrectionDecision {
                snap: true,
                target_time: remote_time,
            }
        } else {
            CorrectionDecision {
                snap: false,
                target_time: local_time,
            }
        }
    }
}
