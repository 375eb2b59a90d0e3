//! Utility functions for identifier minting

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::CustodyError;

// construct a unique id with a human-readable prefix then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> Result<String, CustodyError> {
    let hrp = bech32::Hrp::parse(hrp)
        .map_err(|e| CustodyError::InvalidInput(format!("invalid identifier prefix: {e}")))?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())
        .map_err(|e| CustodyError::InvalidInput(format!("identifier encoding failed: {e}")))?;
    Ok(encode)
}
