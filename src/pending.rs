//! Client queries waiting on upstream sub-replies.
//!
//! Every forwarded question gets its own upstream transaction identifier,
//! drawn at random from the identifiers not currently in flight. Replies are
//! routed by that identifier to an internal entry key, never by the
//! client's identifier, so clients reusing the same identifier cannot touch
//! each other's entries. Each route is consumed by the first matching reply.
//!
//! All lookups and mutations happen under one lock, so completing a
//! sub-query (append answers, decrement, remove on zero) is atomic with
//! respect to concurrent replies for the same entry.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use rustc_hash::FxHashMap;

use crate::dns::{Message, Question, RCODE_NOERROR};
use crate::pool::PooledMessage;

/// Size of the 16-bit identifier space.
const ID_SPACE: usize = 1 << 16;

/// Random draws before falling back to a linear scan for a free identifier.
const RANDOM_ID_ATTEMPTS: usize = 16;

/// A client query with forwarded questions still outstanding.
#[derive(Debug)]
pub struct PendingEntry {
    /// Where the final reply goes.
    pub client: SocketAddr,
    /// The client's message, accumulating answers.
    pub reply: PooledMessage,
    /// When the query was registered.
    pub started: Instant,
    outstanding: usize,
    upstream_ids: Vec<u16>,
}

impl PendingEntry {
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Outcome of feeding an upstream reply to the table.
#[derive(Debug)]
pub enum Completion {
    /// No in-flight sub-query matches the reply.
    Miss,
    /// Answers merged; other sub-queries are still outstanding.
    Waiting { remaining: usize },
    /// The last sub-reply arrived; the entry has left the table.
    Finished(PendingEntry),
}

struct Route {
    key: u64,
    question: Question,
}

#[derive(Default)]
struct State {
    entries: FxHashMap<u64, PendingEntry>,
    routes: FxHashMap<u16, Route>,
    /// Deadlines in insertion order, which is also time order.
    expiry: VecDeque<(Instant, u64)>,
    next_key: u64,
}

impl State {
    fn allocate_id(&self, rng: &mut impl Rng) -> Option<u16> {
        if self.routes.len() >= ID_SPACE {
            return None;
        }

        for _ in 0..RANDOM_ID_ATTEMPTS {
            let id: u16 = rng.random();
            if !self.routes.contains_key(&id) {
                return Some(id);
            }
        }

        let start: u16 = rng.random();
        (0..=u16::MAX)
            .map(|offset| start.wrapping_add(offset))
            .find(|id| !self.routes.contains_key(id))
    }
}

/// Table of in-flight client queries.
pub struct PendingTable {
    state: Mutex<State>,
    timeout: Duration,
}

impl PendingTable {
    /// Create a table whose entries expire `timeout` after registration.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a client query that forwards `forwarded` upstream.
    ///
    /// Returns one fresh upstream identifier per forwarded question, in
    /// order. If the identifier space cannot fit the query, nothing is
    /// registered and the reply message is handed back.
    pub fn register(
        &self,
        client: SocketAddr,
        reply: PooledMessage,
        forwarded: &[Question],
        now: Instant,
    ) -> Result<Vec<u16>, PooledMessage> {
        let mut state = self.lock();
        if forwarded.is_empty() || state.routes.len() + forwarded.len() > ID_SPACE {
            return Err(reply);
        }

        let key = state.next_key;
        state.next_key += 1;

        let mut rng = rand::rng();
        let mut ids = Vec::with_capacity(forwarded.len());
        for question in forwarded {
            let Some(id) = state.allocate_id(&mut rng) else {
                for id in &ids {
                    state.routes.remove(id);
                }
                return Err(reply);
            };
            state.routes.insert(
                id,
                Route {
                    key,
                    question: question.clone(),
                },
            );
            ids.push(id);
        }

        state.entries.insert(
            key,
            PendingEntry {
                client,
                reply,
                started: now,
                outstanding: forwarded.len(),
                upstream_ids: ids.clone(),
            },
        );
        state.expiry.push_back((now + self.timeout, key));

        Ok(ids)
    }

    /// Merge an upstream reply into its pending entry.
    ///
    /// The reply must carry a routed identifier and echo the forwarded
    /// question; otherwise it is a miss and the route stays in place. An
    /// error reply with an empty question section (as some servers send for
    /// REFUSED or FORMERR) is accepted on the identifier alone. On a match
    /// the reply's answers are moved into the entry.
    pub fn complete(&self, reply: &mut Message) -> Completion {
        let mut state = self.lock();
        let id = reply.header.id;

        let accepted = match (state.routes.get(&id), reply.questions.as_slice()) {
            (Some(route), [question]) => question.matches(&route.question),
            (Some(_), []) => reply.header.rcode() != RCODE_NOERROR,
            _ => false,
        };
        if !accepted {
            return Completion::Miss;
        }

        let Some(route) = state.routes.remove(&id) else {
            return Completion::Miss;
        };
        let Some(entry) = state.entries.get_mut(&route.key) else {
            return Completion::Miss;
        };

        entry.reply.answers.append(&mut reply.answers);
        if entry.reply.header.rcode() == RCODE_NOERROR {
            entry.reply.header.set_rcode(reply.header.rcode());
        }
        if reply.header.is_truncated() {
            entry.reply.header.set_truncated(true);
        }
        entry.outstanding -= 1;

        if entry.outstanding > 0 {
            return Completion::Waiting {
                remaining: entry.outstanding,
            };
        }

        match state.entries.remove(&route.key) {
            Some(entry) => Completion::Finished(entry),
            None => Completion::Miss,
        }
    }

    /// Remove every entry whose deadline is at or before `now`.
    pub fn expire(&self, now: Instant) -> Vec<PendingEntry> {
        let mut state = self.lock();
        let mut expired = Vec::new();

        while let Some(&(deadline, key)) = state.expiry.front() {
            if deadline > now {
                break;
            }
            state.expiry.pop_front();

            // Finished entries are already gone.
            let Some(entry) = state.entries.remove(&key) else {
                continue;
            };
            for id in &entry.upstream_ids {
                if state.routes.get(id).is_some_and(|route| route.key == key) {
                    state.routes.remove(id);
                }
            }
            expired.push(entry);
        }

        expired
    }

    /// Number of client queries waiting on upstream.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of sub-queries waiting on upstream.
    pub fn in_flight(&self) -> usize {
        self.lock().routes.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Every mutation is a single insert or remove, so a poisoned table is
        // still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{CLASS_IN, Name, RCODE_NXDOMAIN, RCODE_REFUSED, Record, TYPE_A};
    use crate::pool::MessagePool;
    use std::net::Ipv4Addr;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn question(name: &str) -> Question {
        Question {
            name: Name::from_ascii(name).unwrap(),
            qtype: TYPE_A,
            qclass: CLASS_IN,
        }
    }

    fn client_query(pool: &MessagePool, id: u16, names: &[&str]) -> PooledMessage {
        let mut message = pool.checkout();
        message.clear();
        message.header.id = id;
        message.questions.extend(names.iter().map(|n| question(n)));
        message
    }

    fn upstream_reply(id: u16, name: &str, addr: Ipv4Addr) -> Message {
        let mut reply = Message::default();
        reply.header.id = id;
        reply.header.set_response(true);
        reply.questions.push(question(name));
        reply.answers.push(Record::a(
            Name::from_ascii(name).unwrap(),
            CLASS_IN,
            60,
            addr,
        ));
        reply
    }

    fn client(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn single_question_round_trip() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);
        let now = Instant::now();

        let forwarded = [question("example.com")];
        let query = client_query(&pool, 0x1234, &["example.com"]);
        let ids = table.register(client(1000), query, &forwarded, now).unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(table.len(), 1);

        let mut reply = upstream_reply(ids[0], "example.com", Ipv4Addr::new(1, 2, 3, 4));
        let Completion::Finished(entry) = table.complete(&mut reply) else {
            panic!("expected finished entry");
        };
        assert_eq!(entry.client, client(1000));
        assert_eq!(entry.reply.header.id, 0x1234);
        assert_eq!(entry.reply.answers.len(), 1);
        assert!(table.is_empty());
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn questionless_error_reply_completes() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);

        let forwarded = [question("refused.test")];
        let query = client_query(&pool, 3, &["refused.test"]);
        let ids = table.register(client(1), query, &forwarded, Instant::now()).unwrap();

        let mut empty_ok = Message::default();
        empty_ok.header.id = ids[0];
        empty_ok.header.set_response(true);
        assert!(matches!(table.complete(&mut empty_ok), Completion::Miss));

        let mut refused = empty_ok.clone();
        refused.header.set_rcode(RCODE_REFUSED);
        let Completion::Finished(entry) = table.complete(&mut refused) else {
            panic!("expected finished entry");
        };
        assert_eq!(entry.reply.header.rcode(), RCODE_REFUSED);
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn truncated_sub_reply_marks_client_reply() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);

        let forwarded = [question("big.test")];
        let query = client_query(&pool, 4, &["big.test"]);
        let ids = table.register(client(1), query, &forwarded, Instant::now()).unwrap();

        let mut reply = upstream_reply(ids[0], "big.test", Ipv4Addr::new(1, 1, 1, 1));
        reply.header.set_truncated(true);
        let Completion::Finished(entry) = table.complete(&mut reply) else {
            panic!("expected finished entry");
        };
        assert!(entry.reply.header.is_truncated());
    }

    #[test]
    fn multi_question_waits_for_all_replies() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);

        let forwarded = [question("a.test"), question("b.test"), question("c.test")];
        let query = client_query(&pool, 7, &["a.test", "b.test", "c.test"]);
        let ids = table
            .register(client(1), query, &forwarded, Instant::now())
            .unwrap();
        assert_eq!(table.in_flight(), 3);

        let mut reply = upstream_reply(ids[1], "b.test", Ipv4Addr::new(2, 2, 2, 2));
        assert!(matches!(
            table.complete(&mut reply),
            Completion::Waiting { remaining: 2 }
        ));
        let mut reply = upstream_reply(ids[0], "a.test", Ipv4Addr::new(1, 1, 1, 1));
        assert!(matches!(
            table.complete(&mut reply),
            Completion::Waiting { remaining: 1 }
        ));

        let mut reply = upstream_reply(ids[2], "c.test", Ipv4Addr::new(3, 3, 3, 3));
        let Completion::Finished(entry) = table.complete(&mut reply) else {
            panic!("expected finished entry");
        };
        assert_eq!(entry.reply.answers.len(), 3);
    }

    #[test]
    fn upstream_ids_are_unique_per_sub_query() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);

        let mut all = Vec::new();
        for port in 0..200 {
            let forwarded = [question("x.test"), question("y.test")];
            let query = client_query(&pool, 1, &["x.test", "y.test"]);
            all.extend(
                table
                    .register(client(port), query, &forwarded, Instant::now())
                    .unwrap(),
            );
        }

        let mut unique = all.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), all.len());
        assert_eq!(table.in_flight(), 400);
    }

    #[test]
    fn same_client_id_from_two_clients_does_not_collide() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);
        let now = Instant::now();

        let forwarded = [question("same.test")];
        let first = table
            .register(client(1), client_query(&pool, 42, &["same.test"]), &forwarded, now)
            .unwrap();
        let second = table
            .register(client(2), client_query(&pool, 42, &["same.test"]), &forwarded, now)
            .unwrap();
        assert_ne!(first, second);

        let mut reply = upstream_reply(second[0], "same.test", Ipv4Addr::new(2, 2, 2, 2));
        let Completion::Finished(entry) = table.complete(&mut reply) else {
            panic!("expected finished entry");
        };
        assert_eq!(entry.client, client(2));

        let mut reply = upstream_reply(first[0], "same.test", Ipv4Addr::new(1, 1, 1, 1));
        let Completion::Finished(entry) = table.complete(&mut reply) else {
            panic!("expected finished entry");
        };
        assert_eq!(entry.client, client(1));
        assert_eq!(entry.reply.answers[0].rdata, vec![1, 1, 1, 1]);
    }

    #[test]
    fn unknown_and_duplicate_replies_are_misses() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);

        let forwarded = [question("a.test"), question("b.test")];
        let query = client_query(&pool, 1, &["a.test", "b.test"]);
        let ids = table
            .register(client(1), query, &forwarded, Instant::now())
            .unwrap();

        let unknown = (0..=u16::MAX).find(|id| !ids.contains(id)).unwrap();
        let mut reply = upstream_reply(unknown, "a.test", Ipv4Addr::new(1, 1, 1, 1));
        assert!(matches!(table.complete(&mut reply), Completion::Miss));

        let mut reply = upstream_reply(ids[0], "a.test", Ipv4Addr::new(1, 1, 1, 1));
        assert!(matches!(table.complete(&mut reply), Completion::Waiting { .. }));
        let mut duplicate = upstream_reply(ids[0], "a.test", Ipv4Addr::new(1, 1, 1, 1));
        assert!(matches!(table.complete(&mut duplicate), Completion::Miss));

        assert_eq!(table.len(), 1);
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn reply_for_other_question_is_a_miss() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);

        let forwarded = [question("a.test")];
        let query = client_query(&pool, 1, &["a.test"]);
        let ids = table
            .register(client(1), query, &forwarded, Instant::now())
            .unwrap();

        let mut spoofed = upstream_reply(ids[0], "evil.test", Ipv4Addr::new(6, 6, 6, 6));
        assert!(matches!(table.complete(&mut spoofed), Completion::Miss));

        let mut genuine = upstream_reply(ids[0], "A.TEST", Ipv4Addr::new(1, 1, 1, 1));
        assert!(matches!(table.complete(&mut genuine), Completion::Finished(_)));
    }

    #[test]
    fn first_error_rcode_is_kept() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);

        let forwarded = [question("missing.test")];
        let query = client_query(&pool, 1, &["missing.test"]);
        let ids = table
            .register(client(1), query, &forwarded, Instant::now())
            .unwrap();

        let mut reply = upstream_reply(ids[0], "missing.test", Ipv4Addr::LOCALHOST);
        reply.answers.clear();
        reply.header.set_rcode(RCODE_NXDOMAIN);

        let Completion::Finished(entry) = table.complete(&mut reply) else {
            panic!("expected finished entry");
        };
        assert_eq!(entry.reply.header.rcode(), RCODE_NXDOMAIN);
        assert!(entry.reply.answers.is_empty());
    }

    #[test]
    fn expire_removes_stale_entries_and_routes() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);
        let start = Instant::now();

        let forwarded = [question("slow.test"), question("fast.test")];
        let query = client_query(&pool, 1, &["slow.test", "fast.test"]);
        let ids = table.register(client(1), query, &forwarded, start).unwrap();

        let later = start + Duration::from_secs(1);
        let forwarded = [question("later.test")];
        let query = client_query(&pool, 2, &["later.test"]);
        table.register(client(2), query, &forwarded, later).unwrap();

        let mut reply = upstream_reply(ids[1], "fast.test", Ipv4Addr::new(1, 1, 1, 1));
        assert!(matches!(table.complete(&mut reply), Completion::Waiting { .. }));

        assert!(table.expire(start + TIMEOUT - Duration::from_millis(1)).is_empty());

        let expired = table.expire(start + TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].client, client(1));
        assert_eq!(expired[0].outstanding(), 1);
        assert_eq!(expired[0].reply.answers.len(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.in_flight(), 1);

        let mut late = upstream_reply(ids[0], "slow.test", Ipv4Addr::new(2, 2, 2, 2));
        assert!(matches!(table.complete(&mut late), Completion::Miss));

        assert_eq!(table.expire(later + TIMEOUT).len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn expired_messages_return_to_pool() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);
        let start = Instant::now();

        let forwarded = [question("a.test")];
        let query = client_query(&pool, 1, &["a.test"]);
        table.register(client(1), query, &forwarded, start).unwrap();
        assert_eq!(pool.idle(), 0);

        drop(table.expire(start + TIMEOUT));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn register_without_questions_is_rejected() {
        let pool = MessagePool::new();
        let table = PendingTable::new(TIMEOUT);

        let query = client_query(&pool, 1, &[]);
        assert!(table.register(client(1), query, &[], Instant::now()).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn concurrent_replies_finish_exactly_once() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pool = MessagePool::new();
        let table = Arc::new(PendingTable::new(TIMEOUT));

        let names: Vec<String> = (0..32).map(|i| format!("q{i}.test")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let forwarded: Vec<Question> = names.iter().map(|n| question(n)).collect();
        let query = client_query(&pool, 9, &refs);
        let ids = table
            .register(client(1), query, &forwarded, Instant::now())
            .unwrap();

        let finished = Arc::new(AtomicUsize::new(0));
        let workers: Vec<_> = ids
            .into_iter()
            .zip(names)
            .map(|(id, name)| {
                let table = table.clone();
                let finished = finished.clone();
                std::thread::spawn(move || {
                    let mut reply = upstream_reply(id, &name, Ipv4Addr::LOCALHOST);
                    if let Completion::Finished(entry) = table.complete(&mut reply) {
                        assert_eq!(entry.reply.answers.len(), 32);
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }
}
