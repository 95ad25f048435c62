use alloy::primitives::{address, Address};

/// Protocol version carried in challenges, proofs and oracle requests.
pub const PROTOCOL_VERSION: u32 = 1;

/// The only payment scheme this server issues challenges for.
pub const SCHEME_EXACT: &str = "exact";

/// Request header carrying the base64-encoded payment proof.
pub const PAYMENT_HEADER: &str = "X-PAYMENT";

/// Header sent to the oracle on every call.
pub const PROTOCOL_VERSION_HEADER: &str = "X-Protocol-Version";

/// Header carrying the HMAC of the oracle request body, when a secret is configured.
pub const ORACLE_AUTH_HEADER: &str = "X-Oracle-Auth";

/// Validity window advertised in every challenge.
pub const MAX_TIMEOUT_SECONDS: u64 = 60;

/// Default response mime type advertised in challenges.
pub const DEFAULT_MIME_TYPE: &str = "application/json";

/// Default timeouts for the two oracle calls.
pub const VERIFY_TIMEOUT_SECS: u64 = 10;
pub const SETTLE_TIMEOUT_SECS: u64 = 15;

/// A network the server can price in, with the stablecoin it settles by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownNetwork {
    /// Human-readable network name used on the wire (e.g. "base-sepolia").
    pub name: &'static str,
    /// EVM chain id.
    pub chain_id: u64,
    /// Default settlement asset (6-decimal USD stablecoin).
    pub default_asset: Address,
    pub decimals: u32,
}

pub static KNOWN_NETWORKS: &[KnownNetwork] = &[
    KnownNetwork {
        name: "base",
        chain_id: 8453,
        default_asset: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
        decimals: 6,
    },
    KnownNetwork {
        name: "base-sepolia",
        chain_id: 84532,
        default_asset: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
        decimals: 6,
    },
    KnownNetwork {
        name: "polygon",
        chain_id: 137,
        default_asset: address!("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359"),
        decimals: 6,
    },
    KnownNetwork {
        name: "polygon-amoy",
        chain_id: 80002,
        default_asset: address!("0x41E94Eb019C0762f9Bfcf9Fb1E58725BfB0e7582"),
        decimals: 6,
    },
    KnownNetwork {
        name: "avalanche",
        chain_id: 43114,
        default_asset: address!("0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E"),
        decimals: 6,
    },
    KnownNetwork {
        name: "avalanche-fuji",
        chain_id: 43113,
        default_asset: address!("0x5425890298aed601595a70AB815c96711a31Bc65"),
        decimals: 6,
    },
    // pathUSD on Tempo Moderato
    KnownNetwork {
        name: "tempo-moderato",
        chain_id: 42431,
        default_asset: address!("0x20c0000000000000000000000000000000000000"),
        decimals: 6,
    },
];

/// Look up a known network by its wire name.
pub fn known_network(name: &str) -> Option<&'static KnownNetwork> {
    KNOWN_NETWORKS.iter().find(|n| n.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_network_lookup() {
        let net = known_network("base-sepolia").unwrap();
        assert_eq!(net.chain_id, 84532);
        assert_eq!(net.decimals, 6);
        assert!(known_network("dogecoin").is_none());
    }

    #[test]
    fn test_network_names_unique() {
        for (i, a) in KNOWN_NETWORKS.iter().enumerate() {
            for b in &KNOWN_NETWORKS[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }
}
