use std::collections::VecDeque;

/// Sequence identifier within one engine.
pub type SeqId = u64;

/// Scheduling decision for a single engine step.
#[derive(Debug)]
pub struct SchedulerOutput {
    /// Sequences to process this step, in order.
    pub batch: Vec<SeqId>,
    /// A prefill step carries exactly one sequence.
    pub is_prefill: bool,
}

/// FIFO scheduler with prefill-decode interleaving.
///
/// Invariants:
///   - After a prefill step, if there are running sequences, the next step is
///     a decode.
///   - A prefill step processes exactly one new sequence (its full prompt).
///   - A decode step processes all running sequences.
///   - `max_running` bounds how many sequences decode together.
pub struct Scheduler {
    pub waiting: VecDeque<SeqId>,
    pub running: VecDeque<SeqId>,
    pub max_running: usize,
    last_was_prefill: bool,
}

impl Scheduler {
    pub fn new(max_running: usize) -> Self {
        Self {
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            max_running: max_running.max(1),
            last_was_prefill: false,
        }
    }

    pub fn add(&mut self, seq_id: SeqId) {
        self.waiting.push_back(seq_id);
    }

    /// Drop a sequence from both queues. Unknown ids are ignored.
    pub fn remove(&mut self, seq_id: SeqId) {
        self.waiting.retain(|&id| id != seq_id);
        self.running.retain(|&id| id != seq_id);
    }

    /// Next step, or `None` when there is nothing to do.
    pub fn schedule(&mut self) -> Option<SchedulerOutput> {
        let force_decode = self.last_was_prefill && !self.running.is_empty();

        if !force_decode && self.running.len() < self.max_running {
            if let Some(seq_id) = self.waiting.pop_front() {
                return Some(self.prefill(seq_id));
            }
        }

        if !self.running.is_empty() {
            self.last_was_prefill = false;
            return Some(SchedulerOutput {
                batch: self.running.iter().copied().collect(),
                is_prefill: false,
            });
        }

        self.waiting.pop_front().map(|seq_id| self.prefill(seq_id))
    }

    fn prefill(&mut self, seq_id: SeqId) -> SchedulerOutput {
        self.last_was_prefill = true;
        SchedulerOutput {
            batch: vec![seq_id],
            is_prefill: true,
        }
    }

    /// Called after a successful prefill.
    pub fn promote_to_running(&mut self, seq_id: SeqId) {
        self.running.push_back(seq_id);
    }
}
