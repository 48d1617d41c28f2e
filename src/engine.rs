/// Handle to one activity inside the [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityId(pub usize);

/// Start/completion notifications, delivered in simulated-time order.
/// Each activity starts at most once and completes at most once.
#[derive(Debug, Clone)]
pub enum Event<T> {
    Started {
        id: ActivityId,
        tag: T,
        at: f64,
    },
    Completed {
        id: ActivityId,
        tag: T,
        started: f64,
        at: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Waiting,
    Running { started: f64 },
    Done,
}

#[derive(Debug)]
struct Activity<T> {
    tag: T,
    duration: f64,
    pending_deps: usize,
    successors: Vec<ActivityId>,
    armed: bool,
    state: State,
}

/// Scheduled completion. The heap is a max-heap, so ordering is reversed;
/// ties resolve in insertion order.
#[derive(Debug, PartialEq)]
struct Scheduled {
    time: f64,
    seq: u64,
    id: ActivityId,
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .time
            .total_cmp(&self.time)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Cooperative discrete-event engine.
///
/// Activities are asynchronous units of work with a fixed duration and a
/// set of predecessors; an activity begins only once all predecessors have
/// completed. Completions advance the simulated clock. The engine never
/// invokes callbacks: it hands [`Event`]s back to whoever drives it, one
/// per [`Engine::advance`] call.
#[derive(Debug)]
pub struct Engine<T> {
    now: f64,
    seq: u64,
    activities: Vec<Activity<T>>,
    heap: std::collections::BinaryHeap<Scheduled>,
    inbox: std::collections::VecDeque<Event<T>>,
    in_flight: usize,
}

impl<T: Clone> Engine<T> {
    pub fn new() -> Self {
        Self {
            now: 0.0,
            seq: 0,
            activities: vec![],
            heap: std::collections::BinaryHeap::new(),
            inbox: std::collections::VecDeque::new(),
            in_flight: 0,
        }
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_idle(&self) -> bool {
        self.heap.is_empty() && self.inbox.is_empty()
    }

    /// Register an activity with its predecessors. It stays dormant until
    /// [`Engine::start`] arms it.
    pub fn add(&mut self, tag: T, duration: f64, deps: &[ActivityId]) -> ActivityId {
        let id = ActivityId(self.activities.len());
        self.activities.push(Activity {
            tag,
            duration,
            pending_deps: deps.len(),
            successors: vec![],
            armed: false,
            state: State::Waiting,
        });
        for dep in deps {
            self.activities[dep.0].successors.push(id);
        }
        id
    }

    pub fn tag(&self, id: ActivityId) -> &T {
        &self.activities[id.0].tag
    }

    /// Arm an activity: it begins as soon as (and only once) all of its
    /// predecessors are done.
    pub fn start(&mut self, id: ActivityId) {
        let a = &mut self.activities[id.0];
        if a.armed {
            return;
        }
        a.armed = true;
        if a.pending_deps == 0 {
            self.begin(id);
        }
    }

    fn begin(&mut self, id: ActivityId) {
        let now = self.now;
        let a = &mut self.activities[id.0];
        debug_assert_eq!(a.state, State::Waiting, "activity begun twice");
        a.state = State::Running { started: now };
        let finish = now + a.duration;
        let tag = a.tag.clone();
        self.in_flight += 1;
        self.heap.push(Scheduled {
            time: finish,
            seq: self.seq,
            id,
        });
        self.seq += 1;
        self.inbox.push_back(Event::Started { id, tag, at: now });
    }

    /// Deliver the next event, advancing the clock when a completion is
    /// due. `None` once everything armed has run to completion.
    pub fn advance(&mut self) -> Option<Event<T>> {
        if let Some(ev) = self.inbox.pop_front() {
            return Some(ev);
        }
        let sched = self.heap.pop()?;
        debug_assert!(sched.time >= self.now);
        self.now = sched.time;
        self.in_flight -= 1;

        let started = match self.activities[sched.id.0].state {
            State::Running { started } => started,
            _ => unreachable!("completion for an activity that is not running"),
        };
        self.activities[sched.id.0].state = State::Done;
        let tag = self.activities[sched.id.0].tag.clone();

        // wake successors whose last predecessor just finished
        let successors = self.activities[sched.id.0].successors.clone();
        for succ in successors {
            let s = &mut self.activities[succ.0];
            s.pending_deps -= 1;
            if s.pending_deps == 0 && s.armed && s.state == State::Waiting {
                self.begin(succ);
            }
        }

        Some(Event::Completed {
            id: sched.id,
            tag,
            started,
            at: self.now,
        })
    }
}

impl<T: Clone> Default for Engine<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(engine: &mut Engine<&'static str>) -> Vec<(String, f64)> {
        let mut out = vec![];
        while let Some(ev) = engine.advance() {
            match ev {
                Event::Started { tag, at, .. } => out.push((format!("start {tag}"), at)),
                Event::Completed { tag, at, .. } => out.push((format!("end {tag}"), at)),
            }
        }
        out
    }

    #[test]
    fn test_precedence_is_enforced() {
        let mut engine = Engine::new();
        let t = engine.add("transfer", 5.0, &[]);
        let r = engine.add("read", 2.0, &[t]);
        let e = engine.add("exec", 10.0, &[r]);
        let w = engine.add("write", 1.0, &[e]);
        for id in [t, r, e, w] {
            engine.start(id);
        }

        let log = drain(&mut engine);
        assert_eq!(
            log,
            vec![
                ("start transfer".to_string(), 0.0),
                ("end transfer".to_string(), 5.0),
                ("start read".to_string(), 5.0),
                ("end read".to_string(), 7.0),
                ("start exec".to_string(), 7.0),
                ("end exec".to_string(), 17.0),
                ("start write".to_string(), 17.0),
                ("end write".to_string(), 18.0),
            ]
        );
        assert!(engine.is_idle());
        assert_eq!(engine.now(), 18.0);
    }

    #[test]
    fn test_fan_in_waits_for_all_predecessors() {
        let mut engine = Engine::new();
        let r1 = engine.add("r1", 3.0, &[]);
        let r2 = engine.add("r2", 7.0, &[]);
        let e = engine.add("exec", 1.0, &[r1, r2]);
        for id in [r1, r2, e] {
            engine.start(id);
        }

        let log = drain(&mut engine);
        let exec_start = log
            .iter()
            .find(|(what, _)| what == "start exec")
            .map(|(_, at)| *at);
        assert_eq!(exec_start, Some(7.0));
    }

    #[test]
    fn test_single_delivery() {
        let mut engine = Engine::new();
        let a = engine.add("a", 1.0, &[]);
        let b = engine.add("b", 1.0, &[a]);
        engine.start(a);
        engine.start(a); // double-arm is a no-op
        engine.start(b);

        let log = drain(&mut engine);
        let starts_of_a = log.iter().filter(|(w, _)| w == "start a").count();
        let ends_of_a = log.iter().filter(|(w, _)| w == "end a").count();
        assert_eq!(starts_of_a, 1);
        assert_eq!(ends_of_a, 1);
    }

    #[test]
    fn test_zero_duration_completes_at_current_instant() {
        let mut engine = Engine::new();
        let a = engine.add("a", 0.0, &[]);
        engine.start(a);
        let log = drain(&mut engine);
        assert_eq!(
            log,
            vec![("start a".to_string(), 0.0), ("end a".to_string(), 0.0)]
        );
    }

    #[test]
    fn test_simultaneous_completions_in_insertion_order() {
        let mut engine = Engine::new();
        let a = engine.add("a", 4.0, &[]);
        let b = engine.add("b", 4.0, &[]);
        engine.start(a);
        engine.start(b);
        let log = drain(&mut engine);
        assert_eq!(log[2], ("end a".to_string(), 4.0));
        assert_eq!(log[3], ("end b".to_string(), 4.0));
    }
}
