//! Query correlation and reply merging.
//!
//! Handles the core pipeline for every datagram on the shared socket:
//! 1. Client query: answer A questions from the hosts overrides, forward
//!    each remaining question upstream as its own sub-query
//! 2. Upstream reply: route it to the pending client query, merge answers
//! 3. Once every sub-query has answered, emit one reply to the client
//!
//! Transports handle the actual I/O, the engine decides what to send where.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::dns::{CLASS_IN, Header, Message, RCODE_NOERROR, RCODE_SERVFAIL, Record, TYPE_A};
use crate::error::Result;
use crate::hosts::Overrides;
use crate::pending::{Completion, PendingTable};
use crate::pool::{MessagePool, PooledMessage};
use crate::stats::Stats;
use crate::transport::MAX_UDP_PAYLOAD;

/// TTL of records synthesized from the override table.
pub const OVERRIDE_TTL: u32 = 600;

/// A datagram the transport should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Final reply to a client.
    Client { addr: SocketAddr, bytes: Vec<u8> },
    /// Single-question sub-query for the upstream resolver.
    Upstream { bytes: Vec<u8> },
}

/// Correlation engine shared by every datagram task.
pub struct Engine {
    overrides: Arc<Overrides>,
    pending: PendingTable,
    pool: MessagePool,
    upstream: SocketAddr,
    stats: Arc<Stats>,
}

impl Engine {
    /// Create an engine forwarding to `upstream`; pending queries are
    /// abandoned after `timeout`.
    pub fn new(
        overrides: Arc<Overrides>,
        upstream: SocketAddr,
        timeout: Duration,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            overrides,
            pending: PendingTable::new(timeout),
            pool: MessagePool::new(),
            upstream,
            stats,
        }
    }

    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    /// Process one datagram received from `source`.
    ///
    /// Messages with the response flag set are always treated as upstream
    /// replies, everything else as client queries. Malformed datagrams are
    /// reported as errors and have no other effect.
    pub fn handle(
        &self,
        datagram: &[u8],
        source: SocketAddr,
        now: Instant,
    ) -> Result<Vec<Outbound>> {
        let mut message = self.pool.checkout();
        if let Err(e) = message.decode_into(datagram) {
            self.stats.record_decode_error();
            return Err(e.into());
        }

        if message.header.is_response() {
            Ok(self.handle_upstream_reply(&mut message, source))
        } else {
            Ok(self.handle_client_query(message, source, now))
        }
    }

    fn handle_client_query(
        &self,
        mut query: PooledMessage,
        client: SocketAddr,
        now: Instant,
    ) -> Vec<Outbound> {
        self.stats.record_request();

        // One snapshot for the whole query, so a reload cannot split it.
        let table = self.overrides.snapshot();
        let mut local = Vec::new();
        let mut forwarded = Vec::new();

        for question in &query.questions {
            if question.qtype == TYPE_A && question.qclass == CLASS_IN {
                if let Some(addr) = table.lookup(&question.name) {
                    debug!(%client, name = %question.name, %addr, "answered from hosts");
                    local.push(Record::a(
                        question.name.clone(),
                        question.qclass,
                        OVERRIDE_TTL,
                        addr,
                    ));
                    continue;
                }
            }
            forwarded.push(question.clone());
        }

        query.answers.clear();
        query.authorities.clear();
        query.additionals.clear();
        query.answers.extend(local);

        if forwarded.is_empty() {
            self.stats.record_answered_locally();
            return vec![Outbound::Client {
                addr: client,
                bytes: finish_reply(&mut query),
            }];
        }

        let header = query.header;
        let ids = match self.pending.register(client, query, &forwarded, now) {
            Ok(ids) => ids,
            Err(mut reply) => {
                warn!(%client, id = header.id, "no free upstream identifiers, answering SERVFAIL");
                reply.header.set_rcode(RCODE_SERVFAIL);
                return vec![Outbound::Client {
                    addr: client,
                    bytes: finish_reply(&mut reply),
                }];
            }
        };

        self.stats.record_forwarded(ids.len());
        let mut sub_query = self.pool.checkout();
        ids.into_iter()
            .zip(forwarded)
            .map(|(id, question)| {
                debug!(
                    %client,
                    client_id = header.id,
                    upstream_id = id,
                    name = %question.name,
                    qtype = question.qtype,
                    "forwarding"
                );
                sub_query.clear();
                sub_query.header = sub_query_header(header, id);
                sub_query.questions.push(question);
                Outbound::Upstream {
                    bytes: sub_query.encode(),
                }
            })
            .collect()
    }

    fn handle_upstream_reply(&self, reply: &mut Message, source: SocketAddr) -> Vec<Outbound> {
        if !same_endpoint(source, self.upstream) {
            trace!(%source, id = reply.header.id, "ignoring response from unexpected source");
            self.stats.record_miss();
            return Vec::new();
        }

        match self.pending.complete(reply) {
            Completion::Miss => {
                trace!(id = reply.header.id, "no pending query for upstream reply");
                self.stats.record_miss();
                Vec::new()
            }
            Completion::Waiting { remaining } => {
                trace!(id = reply.header.id, remaining, "merged partial upstream reply");
                Vec::new()
            }
            Completion::Finished(mut entry) => {
                let elapsed = entry.started.elapsed();
                self.stats.record_completed(elapsed);
                debug!(
                    client = %entry.client,
                    id = entry.reply.header.id,
                    answers = entry.reply.answers.len(),
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    "query complete"
                );
                vec![Outbound::Client {
                    addr: entry.client,
                    bytes: finish_reply(&mut entry.reply),
                }]
            }
        }
    }

    /// Drop pending queries older than the timeout, answering their
    /// clients with SERVFAIL.
    pub fn expire(&self, now: Instant) -> Vec<Outbound> {
        self.pending
            .expire(now)
            .into_iter()
            .map(|mut entry| {
                self.stats.record_expired();
                debug!(
                    client = %entry.client,
                    id = entry.reply.header.id,
                    outstanding = entry.outstanding(),
                    "upstream did not answer in time"
                );
                entry.reply.header.set_rcode(RCODE_SERVFAIL);
                Outbound::Client {
                    addr: entry.client,
                    bytes: finish_reply(&mut entry.reply),
                }
            })
            .collect()
    }
}

/// Header for a sub-query: the client's flags under a fresh identifier.
fn sub_query_header(client: Header, id: u16) -> Header {
    let mut header = Header {
        id,
        flags: client.flags,
    };
    header.set_response(false);
    header.set_rcode(RCODE_NOERROR);
    header
}

/// Turn an accumulated client message into its wire reply.
///
/// A reply too large for one UDP datagram loses whole records from the end
/// and carries TC, so the client can retry over TCP.
fn finish_reply(reply: &mut Message) -> Vec<u8> {
    reply.header.set_response(true);
    reply.header.set_recursion_available(true);

    let mut bytes = reply.encode();
    while bytes.len() > MAX_UDP_PAYLOAD {
        let dropped = reply
            .additionals
            .pop()
            .or_else(|| reply.authorities.pop())
            .or_else(|| reply.answers.pop());
        if dropped.is_none() {
            break;
        }
        reply.header.set_truncated(true);
        bytes.clear();
        reply.encode_into(&mut bytes);
    }
    bytes
}

fn same_endpoint(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port() && a.ip().to_canonical() == b.ip().to_canonical()
}
