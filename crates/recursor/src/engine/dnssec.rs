//! DNSSEC state propagation: the trust-anchor-seeded walk over zone cuts,
//! DS and DNSKEY retrieval, and RRSIG validation through the injected
//! verifier. Everything here produces lattice states; the cryptography
//! itself lives behind [`crate::validate::DnssecVerifier`].

use async_recursion::async_recursion;
use tracing::{debug, trace};

use crate::config::DnssecMode;
use crate::error::Error;
use crate::normalized_rtype;
use crate::proto::op::ResponseCode;
use crate::proto::rr::{Name, Record, RecordType};
use crate::validate::ValidationState;

use super::Resolver;

impl Resolver<'_> {
    /// Whether this resolution validates at all. Out-of-band answers are
    /// local configuration and never validated.
    pub(crate) fn should_validate(&self) -> bool {
        !self.was_out_of_band()
            && matches!(
                self.config.dnssec_mode,
                DnssecMode::Process | DnssecMode::LogFail | DnssecMode::Validate
            )
    }

    /// The lattice state of a zone cut, memoized per resolution.
    ///
    /// A trust anchor makes a cut Secure outright. Below a Secure parent the
    /// DS chain decides; an Insecure or Bogus parent passes its state down.
    /// With no anchors at all everything is Insecure from the root on.
    #[async_recursion]
    pub(crate) async fn validation_state_for_cut(
        &mut self,
        zone: &Name,
        depth: u32,
    ) -> Result<ValidationState, Error> {
        if let Some(state) = self.cut_states.get(zone) {
            return Ok(*state);
        }
        Error::recursion_exceeded(self.config.max_depth, depth, zone)?;

        let state = if self.verifier.trust_anchors().contains_key(zone) {
            ValidationState::Secure
        } else if zone.is_root() {
            ValidationState::Insecure
        } else {
            let parent = zone.base_name();
            match self.validation_state_for_cut(&parent, depth + 1).await? {
                ValidationState::Secure => self.ds_records_for(zone, depth).await?.0,
                inherited => inherited,
            }
        };
        trace!(%zone, %state, "zone cut state");
        self.cut_states.insert(zone.clone(), state);
        Ok(state)
    }

    /// The DS set delegating `zone`, from a trust anchor or from a validated
    /// DS lookup in the parent. `Insecure` with an empty set means a proven
    /// unsigned delegation.
    #[async_recursion]
    pub(crate) async fn ds_records_for(
        &mut self,
        zone: &Name,
        depth: u32,
    ) -> Result<(ValidationState, Vec<Record>), Error> {
        if let Some(ds) = self.verifier.trust_anchors().get(zone) {
            return Ok((ValidationState::Secure, ds.clone()));
        }
        if zone.is_root() {
            return Ok((ValidationState::Insecure, Vec::new()));
        }

        match self.sub_resolve(zone, RecordType::DS, depth + 1).await {
            Ok((ResponseCode::NoError, records, state)) => {
                let ds: Vec<Record> = records
                    .into_iter()
                    .filter(|record| normalized_rtype(record.record_type()) == RecordType::DS)
                    .collect();
                if ds.is_empty() {
                    // NODATA at the parent: an unsigned delegation.
                    Ok((ValidationState::Insecure, Vec::new()))
                } else if state == ValidationState::Secure {
                    Ok((ValidationState::Secure, ds))
                } else if state.is_bogus() {
                    Ok((state, Vec::new()))
                } else {
                    Ok((ValidationState::BogusUnableToGetDss, Vec::new()))
                }
            }
            Ok(_) => Ok((ValidationState::BogusUnableToGetDss, Vec::new())),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(%zone, error = %e, "DS lookup failed");
                Ok((ValidationState::BogusUnableToGetDss, Vec::new()))
            }
        }
    }

    /// The validated DNSKEY set of `zone`, from cache or a fresh lookup.
    #[async_recursion]
    pub(crate) async fn dnskeys_for(
        &mut self,
        zone: &Name,
        depth: u32,
    ) -> Result<(ValidationState, Vec<Record>), Error> {
        if let Some(hit) = self.record_cache.get(zone, RecordType::DNSKEY, self.now) {
            return Ok((hit.state, hit.records));
        }
        match self.sub_resolve(zone, RecordType::DNSKEY, depth + 1).await {
            Ok((ResponseCode::NoError, records, state)) => {
                let keys: Vec<Record> = records
                    .into_iter()
                    .filter(|record| {
                        normalized_rtype(record.record_type()) == RecordType::DNSKEY
                    })
                    .collect();
                if keys.is_empty() {
                    Ok((ValidationState::BogusUnableToGetDnskeys, Vec::new()))
                } else {
                    Ok((state, keys))
                }
            }
            Ok(_) => Ok((ValidationState::BogusUnableToGetDnskeys, Vec::new())),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                debug!(%zone, error = %e, "DNSKEY lookup failed");
                Ok((ValidationState::BogusUnableToGetDnskeys, Vec::new()))
            }
        }
    }

    /// Judge one RRset: where does it sit in the lattice given the state of
    /// its zone and its signatures?
    ///
    /// The DNSKEY set of a zone is special-cased — it is judged against the
    /// delegating DS set rather than against itself.
    #[async_recursion]
    pub(crate) async fn validate_records_with_sigs(
        &mut self,
        auth: &Name,
        name: &Name,
        rtype: RecordType,
        records: &[Record],
        signatures: &[Record],
        depth: u32,
    ) -> Result<ValidationState, Error> {
        if !self.should_validate() {
            return Ok(ValidationState::Indeterminate);
        }
        let cut_state = self.validation_state_for_cut(auth, depth + 1).await?;
        if cut_state != ValidationState::Secure {
            return Ok(cut_state);
        }

        if normalized_rtype(rtype) == RecordType::DNSKEY && name == auth {
            let (ds_state, ds_set) = self.ds_records_for(auth, depth).await?;
            if ds_state != ValidationState::Secure {
                return Ok(if ds_state.is_bogus() {
                    ds_state
                } else {
                    ValidationState::BogusUnableToGetDss
                });
            }
            return Ok(
                match self.verifier.validate_dnskeys_against_ds(
                    auth,
                    records,
                    signatures,
                    &ds_set,
                    self.wall_now,
                ) {
                    Ok(_keys) => ValidationState::Secure,
                    Err(bogus) => bogus,
                },
            );
        }

        if signatures.is_empty() {
            return Ok(ValidationState::BogusNoRrsig);
        }
        let (key_state, keys) = self.dnskeys_for(auth, depth).await?;
        if key_state != ValidationState::Secure {
            return Ok(if key_state.is_bogus() {
                key_state
            } else {
                ValidationState::BogusUnableToGetDnskeys
            });
        }
        Ok(
            match self
                .verifier
                .validate_rrset(records, signatures, &keys, self.wall_now)
            {
                Ok(()) => ValidationState::Secure,
                Err(bogus) => bogus,
            },
        )
    }

    /// The lattice state of a negative answer, judged from its SOA and
    /// denial evidence. A Secure zone denying without evidence is Bogus.
    pub(crate) async fn neg_evidence_state(
        &mut self,
        zone: &Name,
        soa_records: &[Record],
        soa_signatures: &[Record],
        has_denial: bool,
        depth: u32,
    ) -> Result<ValidationState, Error> {
        if !self.should_validate() {
            return Ok(ValidationState::Indeterminate);
        }
        let cut_state = self.validation_state_for_cut(zone, depth + 1).await?;
        if cut_state != ValidationState::Secure {
            return Ok(cut_state);
        }
        if soa_signatures.is_empty() || !has_denial {
            return Ok(ValidationState::BogusMissingNegativeIndication);
        }
        let soa_state = self
            .validate_records_with_sigs(zone, zone, RecordType::SOA, soa_records, soa_signatures, depth)
            .await?;
        if soa_state != ValidationState::Secure {
            return Ok(soa_state);
        }
        // The NSEC/NSEC3 span checks live behind the verifier seam; with
        // Secure SOA evidence and denial records present the denial stands.
        Ok(ValidationState::Secure)
    }
}
