//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

pub const REQUEST_HRP: &str = "req_";
pub const WORKFLOW_HRP: &str = "wf_";
pub const STAGE_HRP: &str = "stg_";
pub const DECISION_HRP: &str = "dec_";

// construct a unique time-ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Same as [`new_uuid_to_bech32`] for the crate's fixed prefixes, which are
/// always valid human readable parts.
pub(crate) fn new_id(hrp: &'static str) -> String {
    new_uuid_to_bech32(hrp).unwrap_or_else(|_| format!("{hrp}{}", uuid7()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_prefixes_encode() {
        for hrp in [REQUEST_HRP, WORKFLOW_HRP, STAGE_HRP, DECISION_HRP] {
            let id = new_uuid_to_bech32(hrp).unwrap();
            assert!(id.starts_with(&format!("{hrp}1")));
        }
    }
}
