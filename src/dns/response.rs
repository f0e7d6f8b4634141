//! Locally synthesised responses
//!
//! Answers that never touch an upstream: `block`/`nxdomain` decisions,
//! forced addresses from the hosts file, and the SERVFAIL/FORMERR error
//! replies produced by the handler.

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};

/// TTL on answers synthesised from forced addresses
pub const LOCAL_ANSWER_TTL: u32 = 60;

/// Empty response echoing the query's ID, flags and question
#[must_use]
pub fn response_to(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.set_authoritative(false);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    response
}

/// NXDOMAIN for a blocked or `nxdomain` name
#[must_use]
pub fn nxdomain(query: &Message) -> Message {
    let mut response = response_to(query);
    response.set_response_code(ResponseCode::NXDomain);
    response
}

/// SERVFAIL for an upstream failure
#[must_use]
pub fn servfail(query: &Message) -> Message {
    let mut response = response_to(query);
    response.set_response_code(ResponseCode::ServFail);
    response
}

/// Header-only error reply for a query whose body could not be used
#[must_use]
pub fn header_only(id: u16, rcode: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(id);
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(rcode);
    response
}

/// Answer from forced addresses
///
/// A queries get the IPv4 addresses, AAAA queries the IPv6 ones; any
/// other type (or a family with no address) is an empty NOERROR.
#[must_use]
pub fn local_answer(query: &Message, addrs: &[IpAddr]) -> Message {
    let mut response = response_to(query);
    response.set_response_code(ResponseCode::NoError);
    for q in query.queries() {
        let name = q.name().clone();
        for addr in addrs {
            let rdata = match (q.query_type(), addr) {
                (RecordType::A, IpAddr::V4(v4)) => RData::A(A(*v4)),
                (RecordType::AAAA, IpAddr::V6(v6)) => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(name.clone(), LOCAL_ANSWER_TTL, rdata));
        }
    }
    response
}

/// A and AAAA addresses in the answer section
#[must_use]
pub fn answer_addrs(response: &Message) -> Vec<IpAddr> {
    response
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Smallest answer TTL, `None` when there are no answers
#[must_use]
pub fn min_answer_ttl(response: &Message) -> Option<u32> {
    response.answers().iter().map(Record::ttl).min()
}
