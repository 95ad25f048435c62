//! Canonical challenge construction.

use alloy::primitives::Address;

use crate::constants::{known_network, DEFAULT_MIME_TYPE, MAX_TIMEOUT_SECONDS, SCHEME_EXACT};
use crate::error::X402Error;
use crate::payment::PaymentRequirements;

/// Build the payment challenge for a priced request.
///
/// `amount` must be a non-negative base-10 integer in the asset's base units.
/// When `asset` is `None` the network's default stablecoin is used. Pure: no I/O.
pub fn build_challenge(
    network: &str,
    pay_to: Address,
    asset: Option<Address>,
    amount: &str,
    description: &str,
) -> Result<PaymentRequirements, X402Error> {
    let amount = normalize_amount(amount)?;
    let asset = match asset {
        Some(asset) => asset,
        None => resolve_asset(network)?,
    };

    Ok(PaymentRequirements {
        scheme: SCHEME_EXACT.to_string(),
        network: network.to_string(),
        pay_to,
        asset,
        description: description.to_string(),
        mime_type: DEFAULT_MIME_TYPE.to_string(),
        max_amount_required: amount,
        max_timeout_seconds: MAX_TIMEOUT_SECONDS,
    })
}

/// Default settlement asset for a network.
pub fn resolve_asset(network: &str) -> Result<Address, X402Error> {
    known_network(network)
        .map(|n| n.default_asset)
        .ok_or_else(|| X402Error::UnsupportedNetwork(network.to_string()))
}

/// Validate a base-unit amount and return its canonical form.
///
/// Digits only: no sign, whitespace, separators or decimal point. Leading
/// zeros are dropped so equal amounts compare equal as strings.
pub fn normalize_amount(amount: &str) -> Result<String, X402Error> {
    if amount.is_empty() || !amount.bytes().all(|b| b.is_ascii_digit()) {
        return Err(X402Error::InvalidAmount(format!(
            "'{amount}' is not a non-negative integer"
        )));
    }
    let value: u128 = amount
        .parse()
        .map_err(|_| X402Error::InvalidAmount(format!("'{amount}' is out of range")))?;
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::KNOWN_NETWORKS;

    #[test]
    fn test_build_challenge_resolves_asset() {
        let pay_to = Address::repeat_byte(0xaa);
        let req = build_challenge("base-sepolia", pay_to, None, "50000", "Sticker").unwrap();

        let expected_asset = KNOWN_NETWORKS
            .iter()
            .find(|n| n.name == "base-sepolia")
            .unwrap()
            .default_asset;
        assert_eq!(req.scheme, "exact");
        assert_eq!(req.network, "base-sepolia");
        assert_eq!(req.pay_to, pay_to);
        assert_eq!(req.asset, expected_asset);
        assert_eq!(req.max_amount_required, "50000");
        assert_eq!(req.max_timeout_seconds, MAX_TIMEOUT_SECONDS);
        assert_eq!(req.mime_type, "application/json");
        assert_eq!(req.description, "Sticker");
    }

    #[test]
    fn test_explicit_asset_wins() {
        let asset = Address::repeat_byte(0x01);
        let req =
            build_challenge("private-devnet", Address::ZERO, Some(asset), "1", "x").unwrap();
        assert_eq!(req.asset, asset);
    }

    #[test]
    fn test_unknown_network_without_asset() {
        let err = build_challenge("private-devnet", Address::ZERO, None, "1", "x").unwrap_err();
        assert!(matches!(err, X402Error::UnsupportedNetwork(_)));
    }

    #[test]
    fn test_rejects_malformed_amounts() {
        for bad in ["", "-1", "1.5", " 10", "10 ", "1e6", "0x10", "+5", "١٢"] {
            let err = normalize_amount(bad).unwrap_err();
            assert!(
                matches!(err, X402Error::InvalidAmount(_)),
                "expected InvalidAmount for {bad:?}"
            );
        }
    }

    #[test]
    fn test_rejects_overflow() {
        let too_big = "9".repeat(60);
        assert!(matches!(
            normalize_amount(&too_big),
            Err(X402Error::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_zero_and_leading_zeros() {
        assert_eq!(normalize_amount("0").unwrap(), "0");
        assert_eq!(normalize_amount("0007").unwrap(), "7");
    }

    #[test]
    fn test_is_deterministic() {
        let a = build_challenge("base", Address::ZERO, None, "10", "d").unwrap();
        let b = build_challenge("base", Address::ZERO, None, "10", "d").unwrap();
        assert_eq!(a, b);
    }
}
