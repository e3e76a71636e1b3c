//! Full DNS message handling for upstream responses and synthesized replies.
//!
//! Queries are only ever inspected with the lightweight QNAME parser; this
//! module decodes complete messages when answers must be examined or a reply
//! must be forged.

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::RData;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};

use crate::error::Result;

/// Addresses carried by the A and AAAA records of a response's answer section.
///
/// Returns None if the response cannot be decoded.
pub fn resolved_addresses(response: &[u8]) -> Option<Vec<IpAddr>> {
    let message = Message::from_bytes(response).ok()?;
    let addresses = message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect();
    Some(addresses)
}

/// Build an NXDOMAIN response for a raw query, echoing its id and questions.
pub fn nxdomain_response(query: &[u8]) -> Result<Vec<u8>> {
    let query = Message::from_bytes(query)?;

    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NXDomain);
    response.add_queries(query.queries().iter().cloned());

    Ok(response.to_bytes()?)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, Record, RecordType};
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    /// Encode a query for `domain` with the given id.
    pub fn query_bytes(domain: &str, id: u16) -> Vec<u8> {
        let mut query = Query::new();
        query.set_name(Name::from_str(domain).unwrap());
        query.set_query_type(RecordType::A);

        let mut message = Message::new();
        message.set_id(id).set_recursion_desired(true);
        message.add_query(query);
        message.to_bytes().unwrap()
    }

    /// Encode a response for `domain` answering with `addresses`.
    pub fn response_bytes(domain: &str, id: u16, addresses: &[IpAddr]) -> Vec<u8> {
        let name = Name::from_str(domain).unwrap();
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_response_code(ResponseCode::NoError);
        for address in addresses {
            let rdata = match address {
                IpAddr::V4(ip) => RData::A(A(*ip)),
                IpAddr::V6(ip) => RData::AAAA(AAAA(*ip)),
            };
            message.add_answer(Record::from_rdata(name.clone(), 300, rdata));
        }
        message.to_bytes().unwrap()
    }

    #[test]
    fn should_collect_a_and_aaaa_answers() {
        let v4 = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        let v6 = IpAddr::V6(Ipv6Addr::new(0x2606, 0x2800, 0x220, 1, 0, 0, 0, 0x1946));
        let response = response_bytes("example.com", 7, &[v4, v6]);

        assert_eq!(resolved_addresses(&response), Some(vec![v4, v6]));
    }

    #[test]
    fn should_skip_non_address_records() {
        let name = Name::from_str("www.example.com").unwrap();
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_answer(Record::from_rdata(
            name,
            60,
            RData::CNAME(CNAME(Name::from_str("example.com").unwrap())),
        ));

        let response = message.to_bytes().unwrap();
        assert_eq!(resolved_addresses(&response), Some(vec![]));
    }

    #[test]
    fn should_return_none_for_garbage() {
        assert!(resolved_addresses(&[0xff; 5]).is_none());
    }

    #[test]
    fn should_build_nxdomain_echoing_question() {
        let query = query_bytes("ads.example.com", 4242);
        let response = Message::from_bytes(&nxdomain_response(&query).unwrap()).unwrap();

        assert_eq!(response.id(), 4242);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.recursion_desired());
        assert!(response.answers().is_empty());
        assert_eq!(
            response.queries()[0].name().to_utf8().trim_end_matches('.'),
            "ads.example.com"
        );
    }

    #[test]
    fn should_fail_nxdomain_for_undecodable_query() {
        assert!(nxdomain_response(&[1, 2, 3]).is_err());
    }
}
