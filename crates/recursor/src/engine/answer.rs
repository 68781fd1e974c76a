//! Response processing: bailiwick sanitization, AA fix-up, RRset grouping
//! into the caches, and classification into answer / referral / CNAME /
//! negative.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::cache::NegativeEntry;
use crate::error::Error;
use crate::proto::op::{Message, ResponseCode};
use crate::proto::rr::{Name, Record, RecordType};
use crate::validate::{update_validation_state, ValidationState};
use crate::{is_subzone, normalized_rtype};

use super::{NsSet, NsSetEntry, Resolver};

/// What one processed response amounted to.
#[derive(Debug)]
pub(crate) struct ProcessedAnswer {
    pub(crate) nameservers: NsSet,
    pub(crate) new_auth: Option<Name>,
    pub(crate) new_target: Option<Name>,
    pub(crate) real_referral: bool,
    pub(crate) negative: bool,
    pub(crate) rcode: ResponseCode,
}

impl ProcessedAnswer {
    pub(crate) fn new() -> Self {
        Self {
            nameservers: NsSet::new(),
            new_auth: None,
            new_target: None,
            real_referral: false,
            negative: false,
            rcode: ResponseCode::ServFail,
        }
    }
}

impl Resolver<'_> {
    /// Drop everything outside the bailiwick of the zone we asked, and
    /// anything in the answer section that is not on the qname/CNAME chain.
    pub(crate) fn sanitize_records(&self, message: &mut Message, qname: &Name, auth: &Name) {
        let mut chain: Vec<Name> = vec![qname.clone()];
        message.answers_mut().retain(|record| {
            if !is_subzone(auth, record.name()) {
                trace!(name = %record.name(), %auth, "dropping out-of-bailiwick answer record");
                return false;
            }
            if !chain.iter().any(|name| name == record.name()) {
                trace!(name = %record.name(), "dropping off-chain answer record");
                return false;
            }
            if let Some(cname) = record.data().as_cname() {
                chain.push(cname.0.clone());
            }
            true
        });

        message.name_servers_mut().retain(|record| {
            let keep = is_subzone(auth, record.name())
                && matches!(
                    normalized_rtype(record.record_type()),
                    RecordType::NS
                        | RecordType::SOA
                        | RecordType::DS
                        | RecordType::NSEC
                        | RecordType::NSEC3
                        | RecordType::RRSIG
                );
            if !keep {
                trace!(name = %record.name(), %auth, "dropping authority record");
            }
            keep
        });

        message.additionals_mut().retain(|record| {
            let rtype = normalized_rtype(record.record_type());
            if rtype == RecordType::OPT {
                return true;
            }
            let keep = matches!(rtype, RecordType::A | RecordType::AAAA)
                && is_subzone(auth, record.name());
            if !keep {
                trace!(name = %record.name(), %auth, "dropping additional record");
            }
            keep
        });
    }

    /// Some upstreams we forward to with RD answer authoritatively but
    /// forget the AA bit; repair it so their answers are cacheable.
    pub(crate) fn fixup_answer(
        &self,
        message: &mut Message,
        qname: &Name,
        qtype: RecordType,
        was_forwarded: bool,
        send_rd: bool,
    ) {
        if message.authoritative() || !was_forwarded || !send_rd {
            return;
        }
        let qtype = normalized_rtype(qtype);
        let has_answer = message.answers().iter().any(|record| {
            record.name() == qname && normalized_rtype(record.record_type()) == qtype
        });
        if has_answer {
            trace!(%qname, "repairing missing AA bit on forwarded answer");
            message.set_authoritative(true);
        }
    }

    /// Group the message into RRsets and store them in the record cache,
    /// validating what deserves validation. The outer validation state picks
    /// up the verdict of the RRsets that answer the question.
    pub(crate) async fn update_cache_from_records(
        &mut self,
        message: &Message,
        qname: &Name,
        auth: &Name,
        state: &mut ValidationState,
        depth: u32,
    ) -> Result<(), Error> {
        let message_auth = message.authoritative();

        let mut sets: HashMap<(Name, RecordType), (Vec<Record>, bool)> = HashMap::new();
        let mut sigs: HashMap<Name, Vec<Record>> = HashMap::new();

        let sections = [
            (message.answers(), true),
            (message.name_servers(), false),
            (message.additionals(), false),
        ];
        for (records, from_answer) in sections {
            for record in records {
                let rtype = normalized_rtype(record.record_type());
                if rtype == RecordType::OPT {
                    continue;
                }
                if rtype == RecordType::RRSIG {
                    sigs.entry(record.name().clone())
                        .or_default()
                        .push(record.clone());
                    continue;
                }
                let entry = sets
                    .entry((record.name().clone(), rtype))
                    .or_insert_with(|| (Vec::new(), from_answer));
                entry.0.push(record.clone());
                entry.1 |= from_answer;
            }
        }

        for ((name, rtype), (records, from_answer)) in sets {
            let rr_sigs = sigs.get(&name).cloned().unwrap_or_default();
            let auth_flag = from_answer && message_auth;

            // Delegation NS sets and glue are unsigned by design; only
            // answer-section RRsets get judged here. Negative evidence is
            // judged separately when the denial is cached.
            let rec_state = if self.should_validate() && from_answer {
                self.validate_records_with_sigs(auth, &name, rtype, &records, &rr_sigs, depth)
                    .await?
            } else {
                ValidationState::Indeterminate
            };

            if from_answer && name == *qname {
                update_validation_state(state, rec_state);
            }
            if rec_state.is_bogus() {
                debug!(%name, %rtype, %rec_state, "caching bogus RRset with capped TTL");
            }
            let ttl_cap = rec_state.is_bogus().then_some(self.config.max_bogus_ttl);
            self.record_cache.insert(
                &name, rtype, records, rr_sigs, auth_flag, rec_state, ttl_cap, self.now,
            );
        }
        Ok(())
    }

    /// Classify a sanitized response. Returns true when the resolution is
    /// finished (answer or negative); referrals and CNAME targets are left
    /// in `out` for the caller to act on.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn process_records(
        &mut self,
        message: &Message,
        qname: &Name,
        qtype: RecordType,
        auth: &Name,
        ret: &mut Vec<Record>,
        out: &mut ProcessedAnswer,
        state: &mut ValidationState,
        depth: u32,
    ) -> Result<bool, Error> {
        let qtype = normalized_rtype(qtype);
        let rcode = message.response_code();

        if rcode == ResponseCode::NXDomain {
            let neg_state = self.cache_negative(message, qname, None, depth).await?;
            update_validation_state(state, neg_state);
            out.rcode = ResponseCode::NXDomain;
            out.negative = true;
            debug!(%qname, "got NXDOMAIN");
            return Ok(true);
        }
        if rcode != ResponseCode::NoError {
            trace!(%qname, %rcode, "unhelpful rcode from server");
            return Ok(false);
        }

        let mut found_answer = false;
        let mut new_target = None;
        for record in message.answers() {
            let rtype = normalized_rtype(record.record_type());
            if rtype == RecordType::RRSIG {
                continue;
            }
            if record.name() == qname && (rtype == qtype || qtype == RecordType::ANY) {
                ret.push(record.clone());
                found_answer = true;
            } else if record.name() == qname
                && rtype == RecordType::CNAME
                && qtype != RecordType::CNAME
                && qtype != RecordType::ANY
            {
                ret.push(record.clone());
                new_target = record.data().as_cname().map(|cname| cname.0.clone());
            }
        }

        // Authoritative servers may put their own NS set in the authority
        // section when asked for it directly.
        if !found_answer && qtype == RecordType::NS && message.authoritative() {
            for record in message.name_servers() {
                if normalized_rtype(record.record_type()) == RecordType::NS
                    && record.name() == qname
                {
                    ret.push(record.clone());
                    found_answer = true;
                }
            }
        }

        if found_answer {
            out.rcode = ResponseCode::NoError;
            return Ok(true);
        }
        if let Some(target) = new_target {
            out.new_target = Some(target);
            return Ok(false);
        }

        // Referral: an NS set for a zone strictly deeper than the one asked.
        let mut new_auth: Option<Name> = None;
        let mut nameservers = NsSet::new();
        for record in message.name_servers() {
            if normalized_rtype(record.record_type()) != RecordType::NS {
                continue;
            }
            let owner = record.name();
            if is_subzone(auth, owner) && *owner != *auth && is_subzone(owner, qname) {
                new_auth = Some(owner.clone());
                if let Some(ns) = record.data().as_ns() {
                    nameservers
                        .entry(ns.0.clone())
                        .or_insert_with(NsSetEntry::default);
                }
            }
        }
        if let Some(owner) = new_auth {
            if !nameservers.is_empty() {
                out.real_referral = true;
                out.new_auth = Some(owner);
                out.nameservers = nameservers;
                return Ok(false);
            }
        }

        // NODATA: no answer, no referral, but an in-bailiwick SOA.
        let has_soa = message.name_servers().iter().any(|record| {
            normalized_rtype(record.record_type()) == RecordType::SOA
                && is_subzone(record.name(), qname)
        });
        if has_soa {
            let neg_state = self
                .cache_negative(message, qname, Some(qtype), depth)
                .await?;
            update_validation_state(state, neg_state);
            out.rcode = ResponseCode::NoError;
            out.negative = true;
            debug!(%qname, %qtype, "got NODATA");
            return Ok(true);
        }

        Ok(false)
    }

    /// Store a denial in the negative cache, with the SOA and NSEC evidence
    /// and the validation verdict on that evidence.
    async fn cache_negative(
        &mut self,
        message: &Message,
        qname: &Name,
        qtype: Option<RecordType>,
        depth: u32,
    ) -> Result<ValidationState, Error> {
        let mut soa_owner: Option<Name> = None;
        let mut soa_records = Vec::new();
        let mut soa_minimum = u32::MAX;
        let mut denial_records = Vec::new();

        for record in message.name_servers() {
            match normalized_rtype(record.record_type()) {
                RecordType::SOA => {
                    soa_owner = Some(record.name().clone());
                    if let Some(soa) = record.data().as_soa() {
                        soa_minimum = soa_minimum.min(soa.minimum());
                    }
                    soa_records.push(record.clone());
                }
                RecordType::NSEC | RecordType::NSEC3 => denial_records.push(record.clone()),
                _ => {}
            }
        }

        let Some(zone) = soa_owner else {
            // A denial with no SOA cannot be cached or trusted.
            return Ok(ValidationState::Indeterminate);
        };

        let mut soa_signatures = Vec::new();
        for record in message.name_servers() {
            if normalized_rtype(record.record_type()) == RecordType::RRSIG {
                if record.name() == &zone {
                    soa_signatures.push(record.clone());
                } else {
                    denial_records.push(record.clone());
                }
            }
        }

        let ttl = soa_records
            .iter()
            .map(Record::ttl)
            .min()
            .unwrap_or(0)
            .min(soa_minimum);

        let neg_state = self
            .neg_evidence_state(
                &zone,
                &soa_records,
                &soa_signatures,
                !denial_records.is_empty(),
                depth,
            )
            .await?;

        let entry = NegativeEntry {
            name: qname.clone(),
            qtype,
            auth_zone: zone,
            soa_records,
            soa_signatures,
            denial_records,
            state: neg_state,
        };
        self.negative_cache.insert(entry, ttl, self.now);
        Ok(neg_state)
    }
}
