//! Identifier generation for cloned domains.

/// Source of fresh domain UUIDs and NIC MAC addresses.
///
/// Injected into the descriptor rewrite so tests can supply deterministic
/// sequences.
pub trait IdSource {
    /// A fresh domain UUID in libvirt's canonical hyphenated form.
    fn domain_uuid(&mut self) -> String;

    /// A fresh unicast MAC in the locally-administered QEMU range.
    fn mac_address(&mut self) -> String;
}

/// The `52:54:00` OUI QEMU reserves for locally-administered guest NICs.
pub const MAC_PREFIX: &str = "52:54:00";

/// Production source: v4 UUIDs and random `52:54:00` MACs.
#[derive(Debug, Default)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn domain_uuid(&mut self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn mac_address(&mut self) -> String {
        use rand::Rng;
        let mut rng = rand::rng();
        format!(
            "{MAC_PREFIX}:{:02x}:{:02x}:{:02x}",
            rng.random::<u8>(),
            rng.random::<u8>(),
            rng.random::<u8>()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_format_and_uniqueness() {
        let mut ids = RandomIds;
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let uuid = ids.domain_uuid();
            assert_eq!(uuid.len(), 36);
            assert_eq!(uuid.matches('-').count(), 4);
            assert!(seen.insert(uuid), "duplicate uuid generated");
        }
    }

    #[test]
    fn test_mac_prefix_and_shape() {
        let mut ids = RandomIds;
        for _ in 0..50 {
            let mac = ids.mac_address();
            assert!(mac.starts_with("52:54:00:"));
            assert_eq!(mac.len(), 17);
            assert_eq!(mac.matches(':').count(), 5);
        }
    }
}
