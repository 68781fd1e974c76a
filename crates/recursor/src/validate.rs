//! DNSSEC validation state and the injected verifier seam.
//!
//! The engine tracks where every zone cut sits in the
//! Indeterminate/Insecure/Secure/Bogus lattice and combines per-RRset
//! verdicts monotonically: once Bogus, always Bogus; a Secure answer crossing
//! an unsigned span degrades to Insecure. The cryptography itself — checking
//! signatures against keys, and keys against DS digests — is behind the
//! [`DnssecVerifier`] trait.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use crate::proto::rr::{Name, Record};

/// Where a query or RRset sits in the validation lattice.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ValidationState {
    /// No validation has been attempted (or validation is off).
    #[default]
    Indeterminate,
    /// Provably outside any signed span.
    Insecure,
    /// Validated all the way from a trust anchor.
    Secure,
    /// A signed zone answered without any RRSIG.
    BogusNoRrsig,
    /// Signatures were present but none validated.
    BogusNoValidRrsig,
    /// The DNSKEY set did not match the delegating DS set.
    BogusNoValidDnskey,
    /// The DS chain could not be retrieved.
    BogusUnableToGetDss,
    /// The DNSKEY set could not be retrieved.
    BogusUnableToGetDnskeys,
    /// A denial proof was present but did not hold.
    BogusInvalidDenial,
    /// A secure zone denied existence without any proof.
    BogusMissingNegativeIndication,
}

impl ValidationState {
    /// True for every Bogus flavor.
    pub fn is_bogus(self) -> bool {
        !matches!(self, Self::Indeterminate | Self::Insecure | Self::Secure)
    }
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Indeterminate => "Indeterminate",
            Self::Insecure => "Insecure",
            Self::Secure => "Secure",
            Self::BogusNoRrsig => "Bogus (no RRSIG)",
            Self::BogusNoValidRrsig => "Bogus (no valid RRSIG)",
            Self::BogusNoValidDnskey => "Bogus (no valid DNSKEY)",
            Self::BogusUnableToGetDss => "Bogus (unable to get DS records)",
            Self::BogusUnableToGetDnskeys => "Bogus (unable to get DNSKEYs)",
            Self::BogusInvalidDenial => "Bogus (invalid denial)",
            Self::BogusMissingNegativeIndication => "Bogus (missing negative indication)",
        };
        f.write_str(name)
    }
}

/// Fold `update` into `state`, keeping the worst of the two.
///
/// Bogus is terminal. Insecure beats Secure — an answer that crossed an
/// unsigned delegation cannot claim to be Secure. Indeterminate yields to
/// anything known.
pub fn update_validation_state(state: &mut ValidationState, update: ValidationState) {
    use ValidationState::*;
    if state.is_bogus() {
        return;
    }
    if update.is_bogus() {
        *state = update;
        return;
    }
    *state = match (*state, update) {
        (Indeterminate, new) => new,
        (old, Indeterminate) => old,
        (Secure, Secure) => Secure,
        _ => Insecure,
    };
}

/// Trust anchors and fetched DS sets: zone name to its DS records.
pub type DsMap = HashMap<Name, Vec<Record>>;

/// The injected DNSSEC cryptography.
///
/// Records are passed through opaquely; implementations interpret the
/// RRSIG/DNSKEY/DS rdata themselves. A verdict of `Err(state)` carries the
/// Bogus flavor to record.
pub trait DnssecVerifier: Send + Sync {
    /// Check `signatures` over `records` with the zone's validated `keys`.
    fn validate_rrset(
        &self,
        records: &[Record],
        signatures: &[Record],
        keys: &[Record],
        now: SystemTime,
    ) -> Result<(), ValidationState>;

    /// Check a DNSKEY RRset against the delegating DS set; returns the keys
    /// that may be used for validation in `zone`.
    fn validate_dnskeys_against_ds(
        &self,
        zone: &Name,
        dnskeys: &[Record],
        signatures: &[Record],
        ds_set: &[Record],
        now: SystemTime,
    ) -> Result<Vec<Record>, ValidationState>;

    /// Configured trust anchors.
    fn trust_anchors(&self) -> &DsMap;
}

/// A verifier with no trust anchors: every zone is treated as unsigned and
/// every answer comes back Insecure. The validation methods are never
/// reached in that configuration; if handed data anyway they refuse it.
#[derive(Debug, Default)]
pub struct NoVerifier {
    anchors: DsMap,
}

impl NoVerifier {
    /// Create the verifier.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DnssecVerifier for NoVerifier {
    fn validate_rrset(
        &self,
        _records: &[Record],
        _signatures: &[Record],
        _keys: &[Record],
        _now: SystemTime,
    ) -> Result<(), ValidationState> {
        Err(ValidationState::BogusNoValidRrsig)
    }

    fn validate_dnskeys_against_ds(
        &self,
        _zone: &Name,
        _dnskeys: &[Record],
        _signatures: &[Record],
        _ds_set: &[Record],
        _now: SystemTime,
    ) -> Result<Vec<Record>, ValidationState> {
        Err(ValidationState::BogusNoValidDnskey)
    }

    fn trust_anchors(&self) -> &DsMap {
        &self.anchors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ValidationState::*;

    #[test]
    fn bogus_is_terminal() {
        let mut state = BogusNoRrsig;
        update_validation_state(&mut state, Secure);
        assert_eq!(state, BogusNoRrsig);

        let mut state = Secure;
        update_validation_state(&mut state, BogusNoValidRrsig);
        assert_eq!(state, BogusNoValidRrsig);
    }

    #[test]
    fn insecure_beats_secure() {
        let mut state = Secure;
        update_validation_state(&mut state, Insecure);
        assert_eq!(state, Insecure);

        let mut state = Insecure;
        update_validation_state(&mut state, Secure);
        assert_eq!(state, Insecure);
    }

    #[test]
    fn indeterminate_yields() {
        let mut state = Indeterminate;
        update_validation_state(&mut state, Secure);
        assert_eq!(state, Secure);

        let mut state = Secure;
        update_validation_state(&mut state, Indeterminate);
        assert_eq!(state, Secure);
    }

    #[test]
    fn bogus_flavors_are_bogus() {
        assert!(BogusMissingNegativeIndication.is_bogus());
        assert!(BogusUnableToGetDss.is_bogus());
        assert!(!Secure.is_bogus());
        assert!(!Insecure.is_bogus());
        assert!(!Indeterminate.is_bogus());
    }
}
