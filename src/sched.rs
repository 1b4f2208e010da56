//! Named one-shot and repetitive timers.
//!
//! Every scheduled action has a name of the form `<event>[<data>...]`, e.g.
//! `<registration>` or `<presence><sip:bob@example.com>`. Scheduling under a
//! name that is already live cancels the predecessor first, so at most one
//! timer per name exists at any moment. Fired actions are removed from the
//! registry before they are handed to the caller, which lets the handler
//! reschedule under the same name; actions flagged repetitive are re-armed
//! automatically instead. Payloads are plain owned values, freed by drop on
//! cancel, fire or teardown.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

/// What to do when a timer fires. Carried as data so the account event loop
/// dispatches without boxed callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduledKind {
    /// Send a (re-)REGISTER.
    Register,
    /// Drop auth state and run a full re-authentication.
    Reauthenticate,
    /// Sweep open transactions for retransmit candidates.
    ResendSweep,
    /// Send a keep-alive if the link has been idle long enough.
    KeepAlive,
    /// Refresh the full batched presence subscription.
    SubscribePresenceBatched,
    /// Refresh presence for one contact.
    SubscribePresenceSingle { uri: String },
    /// Refresh presence for contacts grouped under one pool host.
    SubscribePresenceRouted {
        host: String,
        buddies: Vec<String>,
    },
    /// Refresh the presence.wpending subscription.
    SubscribeWpending,
}

#[derive(Debug)]
struct Entry {
    name: String,
    kind: ScheduledKind,
    repeat: Option<Duration>,
}

/// Timer registry keyed by action name. Deadlines are kept in a `BTreeMap`
/// ordered by `(Instant, sequence)` so two actions due at the same instant
/// fire in scheduling order.
#[derive(Debug, Default)]
pub struct Scheduler {
    queue: BTreeMap<(Instant, u64), Entry>,
    by_name: HashMap<String, (Instant, u64)>,
    seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a one-shot action `delay` from now. A live action with the same
    /// name is cancelled first.
    pub fn schedule(&mut self, name: &str, delay: Duration, kind: ScheduledKind) {
        self.schedule_inner(name, delay, kind, None);
    }

    /// Arm a repetitive action firing every `period`.
    pub fn schedule_repeating(&mut self, name: &str, period: Duration, kind: ScheduledKind) {
        self.schedule_inner(name, period, kind, Some(period));
    }

    fn schedule_inner(
        &mut self,
        name: &str,
        delay: Duration,
        kind: ScheduledKind,
        repeat: Option<Duration>,
    ) {
        debug!(action = name, delay_ms = delay.as_millis() as u64, "scheduling action");
        self.schedule_at(name, Instant::now() + delay, kind, repeat);
    }

    fn schedule_at(
        &mut self,
        name: &str,
        deadline: Instant,
        kind: ScheduledKind,
        repeat: Option<Duration>,
    ) {
        self.cancel(name);
        self.seq += 1;
        let key = (deadline, self.seq);
        self.by_name.insert(name.to_string(), key);
        self.queue.insert(
            key,
            Entry {
                name: name.to_string(),
                kind,
                repeat,
            },
        );
    }

    /// Cancel by name; the payload is dropped. Returns whether a timer was
    /// actually live.
    pub fn cancel(&mut self, name: &str) -> bool {
        if let Some(key) = self.by_name.remove(name) {
            debug!(action = name, "cancelling scheduled action");
            self.queue.remove(&key);
            true
        } else {
            false
        }
    }

    /// Cancel everything (connection teardown).
    pub fn clear(&mut self) {
        self.queue.clear();
        self.by_name.clear();
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(t, _)| *t)
    }

    /// Pop every action due at `now`. Repetitive actions are re-armed for
    /// their next period after the drain, so a short period cannot fire twice
    /// in one sweep.
    pub fn take_due(&mut self, now: Instant) -> Vec<(String, ScheduledKind)> {
        let mut due = Vec::new();
        let mut rearm = Vec::new();
        while let Some((&key, _)) = self.queue.iter().next() {
            if key.0 > now {
                break;
            }
            let entry = match self.queue.remove(&key) {
                Some(e) => e,
                None => break,
            };
            self.by_name.remove(&entry.name);
            if let Some(period) = entry.repeat {
                rearm.push((entry.name.clone(), entry.kind.clone(), period));
            }
            due.push((entry.name, entry.kind));
        }
        for (name, kind, period) in rearm {
            self.schedule_at(&name, now + period, kind, Some(period));
        }
        due
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_live_timer_per_name() {
        let mut s = Scheduler::new();
        s.schedule("<registration>", Duration::from_secs(600), ScheduledKind::Register);
        s.schedule("<registration>", Duration::from_secs(300), ScheduledKind::Register);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_cancel_by_name() {
        let mut s = Scheduler::new();
        s.schedule("<keepalive>", Duration::from_secs(30), ScheduledKind::KeepAlive);
        assert!(s.cancel("<keepalive>"));
        assert!(!s.cancel("<keepalive>"));
        assert!(s.is_empty());
        assert!(s.next_deadline().is_none());
    }

    #[test]
    fn test_due_ordering() {
        let mut s = Scheduler::new();
        s.schedule("<b>", Duration::from_millis(0), ScheduledKind::Register);
        s.schedule("<a>", Duration::from_millis(0), ScheduledKind::KeepAlive);
        let due = s.take_due(Instant::now() + Duration::from_millis(5));
        let names: Vec<_> = due.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["<b>", "<a>"]);
        assert!(s.is_empty());
    }

    #[test]
    fn test_not_due_yet() {
        let mut s = Scheduler::new();
        s.schedule("<later>", Duration::from_secs(60), ScheduledKind::Register);
        assert!(s.take_due(Instant::now()).is_empty());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_repeating_rearms() {
        let mut s = Scheduler::new();
        s.schedule_repeating("<resend>", Duration::from_millis(1), ScheduledKind::ResendSweep);
        let due = s.take_due(Instant::now() + Duration::from_millis(10));
        assert_eq!(due.len(), 1);
        // Re-armed under the same name.
        assert!(s.contains("<resend>"));
    }

    #[test]
    fn test_fired_action_can_reschedule_same_name() {
        let mut s = Scheduler::new();
        s.schedule("<presence><sip:a@x>", Duration::from_millis(0), ScheduledKind::SubscribePresenceSingle { uri: "sip:a@x".into() });
        let due = s.take_due(Instant::now() + Duration::from_millis(5));
        assert_eq!(due.len(), 1);
        // Handler reschedules itself under the same name.
        s.schedule("<presence><sip:a@x>", Duration::from_secs(300), ScheduledKind::SubscribePresenceSingle { uri: "sip:a@x".into() });
        assert_eq!(s.len(), 1);
    }
}
