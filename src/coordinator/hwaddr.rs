use macaddr::MacAddr6;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Two-octet prefix from `"0a:1b"` or `"0a-1b"`.
pub fn parse_prefix(s: &str) -> Option<[u8; 2]> {
    let bytes = s.as_bytes();
    if bytes.len() != 5 || !matches!(bytes[2], b':' | b'-') {
        return None;
    }
    let octet = |part: &str| {
        if part.chars().all(|c| c.is_ascii_hexdigit()) {
            u8::from_str_radix(part, 16).ok()
        } else {
            None
        }
    };
    Some([octet(s.get(0..2)?)?, octet(s.get(3..5)?)?])
}

/// Stable MAC for a pod address: the configured prefix followed by four
/// bytes taken from the IP. IPv4 uses the address itself; IPv6 folds its
/// upper 96 bits into the low 32 through a hash so addresses that only
/// differ above the low bytes still get distinct MACs.
pub fn derive(prefix: [u8; 2], ip: IpAddr) -> MacAddr6 {
    let suffix: [u8; 4] = match ip {
        IpAddr::V4(v4) => v4.octets(),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let digest = Sha256::digest(&octets[..12]);
            let mut out = [0u8; 4];
            for (i, b) in out.iter_mut().enumerate() {
                *b = octets[12 + i] ^ digest[i];
            }
            out
        }
    };
    MacAddr6::new(prefix[0], prefix[1], suffix[0], suffix[1], suffix[2], suffix[3])
}
