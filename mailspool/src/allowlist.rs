//! Source addresses allowed to relay through us.

use std::net::Ipv4Addr;

use tracing::warn;

/// Ordered list of `(network, mask)` pairs from the `IPsForRelay` entries.
pub struct RelayAllowlist {
    entries: Vec<(u32, u32)>,
}

fn prefix_mask(bits: u8) -> u32 {
    match bits {
        0 => 0,
        32 => u32::MAX,
        n => !(u32::MAX >> n),
    }
}

impl RelayAllowlist {
    /// Parse `A.B.C.D[/prefix]` entries; invalid ones are warned about and
    /// skipped, matching how the rest of startup treats bad names.
    pub fn new(values: &[&str]) -> RelayAllowlist {
        let mut entries = Vec::new();
        for value in values {
            let (addr, bits) = match value.split_once('/') {
                Some((addr, bits)) => match bits.parse::<u8>() {
                    Ok(bits) if bits <= 32 => (addr, bits),
                    _ => {
                        warn!(entry = %value, "Ignoring relay IP entry");
                        continue;
                    }
                },
                None => (*value, 32),
            };
            let ip = match addr.parse::<Ipv4Addr>() {
                Ok(ip) => u32::from(ip),
                Err(_) => {
                    warn!(entry = %value, "Ignoring relay IP entry");
                    continue;
                }
            };
            let mask = prefix_mask(bits);
            let entry = (ip & mask, mask);
            match entries.binary_search(&entry) {
                Ok(_) => (),
                Err(pos) => entries.insert(pos, entry),
            }
        }
        RelayAllowlist { entries }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let ip = u32::from(ip);
        self.entries.iter().any(|&(net, mask)| ip & mask == net)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
