//! QNAME extraction from raw DNS messages.
//!
//! Only the first question is read, and compression pointers are rejected
//! rather than followed: a query's own question never needs them.

/// Size of the fixed DNS message header.
pub const DNS_HEADER_SIZE: usize = 12;

/// Top two bits marking a compression pointer in a label length byte.
const POINTER_MASK: u8 = 0xC0;

/// Extract the queried domain name from a DNS message.
///
/// Labels are joined with dots and copied verbatim; no character set
/// validation takes place. Returns None when the message is shorter than its
/// header, a label runs past the end of the buffer, the name is not
/// terminated, or a compression pointer is encountered.
pub fn extract_qname(message: &[u8]) -> Option<String> {
    if message.len() < DNS_HEADER_SIZE {
        return None;
    }

    let mut name = String::new();
    let mut pos = DNS_HEADER_SIZE;
    loop {
        let len = *message.get(pos)?;
        if len == 0 {
            return Some(name);
        }
        if len & POINTER_MASK == POINTER_MASK {
            return None;
        }

        let start = pos + 1;
        let label = message.get(start..start + usize::from(len))?;
        if !name.is_empty() {
            name.push('.');
        }
        name.extend(label.iter().map(|&byte| char::from(byte)));
        pos = start + usize::from(len);
    }
}
