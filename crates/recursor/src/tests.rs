//! End-to-end scenarios: a recursor wired to a scripted mock transport.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::RecursorConfig;
use crate::normalized_rtype;
use crate::proto::op::{Message, MessageType, ResponseCode};
use crate::proto::rr::rdata::{A, CNAME, NS, SOA};
use crate::proto::rr::rdata::null::NULL;
use crate::proto::rr::{DNSClass, Name, RData, Record, RecordType};
use crate::transport::{AskOptions, AskReply, AskStatus, AskTransport};
use crate::validate::{DnssecVerifier, DsMap, ValidationState};
use crate::zones::{AuthZone, DomainMap};
use crate::Recursor;

const ROOT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
const TLD_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));
const LEAF_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 3));
const DOWN_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5));
const FWD_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 9, 9, 9));

fn subscribe() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn name(s: &str) -> Name {
    Name::from_ascii(s).unwrap()
}

fn a(owner: &str, addr: [u8; 4]) -> Record {
    Record::from_rdata(
        name(owner),
        3600,
        RData::A(A::new(addr[0], addr[1], addr[2], addr[3])),
    )
}

fn ns(owner: &str, target: &str) -> Record {
    Record::from_rdata(name(owner), 3600, RData::NS(NS(name(target))))
}

fn cname(owner: &str, target: &str) -> Record {
    Record::from_rdata(name(owner), 3600, RData::CNAME(CNAME(name(target))))
}

fn soa(zone: &str) -> Record {
    Record::from_rdata(
        name(zone),
        300,
        RData::SOA(SOA::new(
            name(&format!("ns1.{zone}")),
            name(&format!("hostmaster.{zone}")),
            1,
            7200,
            3600,
            1_209_600,
            300,
        )),
    )
}

/// Opaque DNSSEC-type record; the mock verifier never looks inside.
fn tok(code: u16, owner: &str) -> Record {
    Record::from_rdata(
        name(owner),
        3600,
        RData::Unknown {
            code: hickory_proto::rr::RecordType::Unknown(code),
            rdata: NULL::with(vec![0]),
        },
    )
}

fn rrsig(owner: &str) -> Record {
    tok(u16::from(RecordType::RRSIG), owner)
}

fn ds(owner: &str) -> Record {
    tok(u16::from(RecordType::DS), owner)
}

fn dnskey(owner: &str) -> Record {
    tok(u16::from(RecordType::DNSKEY), owner)
}

fn nsec(owner: &str) -> Record {
    tok(u16::from(RecordType::NSEC), owner)
}

fn response() -> Message {
    let mut message = Message::new();
    message.set_message_type(MessageType::Response);
    message
}

fn answer_msg(records: Vec<Record>) -> Message {
    let mut message = response();
    message.set_authoritative(true);
    for record in records {
        message.add_answer(record);
    }
    message
}

fn referral_msg(authority: Vec<Record>, glue: Vec<Record>) -> Message {
    let mut message = response();
    for record in authority {
        message.add_name_server(record);
    }
    for record in glue {
        message.add_additional(record);
    }
    message
}

fn negative_msg(rcode: ResponseCode, authority: Vec<Record>) -> Message {
    let mut message = response();
    message.set_response_code(rcode);
    message.set_authoritative(true);
    for record in authority {
        message.add_name_server(record);
    }
    message
}

#[derive(Clone, Debug)]
struct LoggedQuery {
    server: IpAddr,
    qname: Name,
    qtype: RecordType,
    tcp: bool,
    send_rd: bool,
}

/// Scripted transport: a (server, qname, qtype) table of replies, with
/// everything unscripted timing out. Records every query it sees.
#[derive(Default)]
struct MockTransport {
    responses: HashMap<(IpAddr, String, RecordType), AskReply>,
    edns_refusers: HashSet<IpAddr>,
    log: Mutex<Vec<LoggedQuery>>,
}

impl MockTransport {
    fn new() -> Self {
        Self::default()
    }

    fn key(server: IpAddr, qname: &str, qtype: RecordType) -> (IpAddr, String, RecordType) {
        (
            server,
            name(qname).to_lowercase().to_string(),
            normalized_rtype(qtype),
        )
    }

    fn on(&mut self, server: IpAddr, qname: &str, qtype: RecordType, message: Message) {
        self.responses
            .insert(Self::key(server, qname, qtype), AskReply::success(message));
    }

    fn on_status(&mut self, server: IpAddr, qname: &str, qtype: RecordType, status: AskStatus) {
        self.responses
            .insert(Self::key(server, qname, qtype), AskReply::status(status));
    }

    fn refuse_edns(&mut self, server: IpAddr) {
        self.edns_refusers.insert(server);
    }

    fn queries(&self) -> Vec<LoggedQuery> {
        self.log.lock().clone()
    }

    fn queries_to(&self, server: IpAddr) -> usize {
        self.log.lock().iter().filter(|q| q.server == server).count()
    }
}

#[async_trait]
impl AskTransport for MockTransport {
    async fn ask(
        &self,
        server: IpAddr,
        qname: &Name,
        qtype: RecordType,
        options: &AskOptions,
    ) -> AskReply {
        self.log.lock().push(LoggedQuery {
            server,
            qname: qname.clone(),
            qtype: normalized_rtype(qtype),
            tcp: options.tcp,
            send_rd: options.send_rd,
        });
        if options.edns && self.edns_refusers.contains(&server) {
            let mut message = response();
            message.set_response_code(ResponseCode::FormErr);
            return AskReply::success(message);
        }
        let key = (
            server,
            qname.to_lowercase().to_string(),
            normalized_rtype(qtype),
        );
        self.responses
            .get(&key)
            .cloned()
            .unwrap_or_else(|| AskReply::status(AskStatus::Timeout))
    }
}

/// Trust-anchored verifier that accepts everything it is shown.
struct AcceptAllVerifier {
    anchors: DsMap,
}

impl AcceptAllVerifier {
    fn with_root_anchor() -> Self {
        let mut anchors = DsMap::new();
        anchors.insert(Name::root(), vec![ds(".")]);
        Self { anchors }
    }
}

impl DnssecVerifier for AcceptAllVerifier {
    fn validate_rrset(
        &self,
        _records: &[Record],
        _signatures: &[Record],
        _keys: &[Record],
        _now: SystemTime,
    ) -> Result<(), ValidationState> {
        Ok(())
    }

    fn validate_dnskeys_against_ds(
        &self,
        _zone: &Name,
        dnskeys: &[Record],
        _signatures: &[Record],
        _ds_set: &[Record],
        _now: SystemTime,
    ) -> Result<Vec<Record>, ValidationState> {
        Ok(dnskeys.to_vec())
    }

    fn trust_anchors(&self) -> &DsMap {
        &self.anchors
    }
}

fn test_config() -> RecursorConfig {
    RecursorConfig {
        dont_query: Vec::new(),
        do_ipv6: false,
        qname_minimization: false,
        root_hints: vec![(name("a.root-servers.test."), ROOT_IP)],
        ..RecursorConfig::default()
    }
}

/// Root and com referrals plus the example.com servers; the base topology
/// most scenarios build on.
fn example_com_transport(leaf_qname: &str, leaf_qtype: RecordType) -> MockTransport {
    let mut transport = MockTransport::new();
    transport.on(
        ROOT_IP,
        leaf_qname,
        leaf_qtype,
        referral_msg(
            vec![ns("com.", "ns1.gtld.test.")],
            vec![a("ns1.gtld.test.", [192, 0, 2, 2])],
        ),
    );
    transport.on(
        TLD_IP,
        leaf_qname,
        leaf_qtype,
        referral_msg(
            vec![ns("example.com.", "ns1.example.com.")],
            vec![a("ns1.example.com.", [192, 0, 2, 3])],
        ),
    );
    transport
}

fn build(transport: MockTransport, config: RecursorConfig, now: Instant) -> Recursor {
    Recursor::builder()
        .config(config)
        .transport(Arc::new(transport))
        .build(now)
        .unwrap()
}

#[tokio::test]
async fn resolves_iteratively_from_the_roots() {
    subscribe();
    let now = Instant::now();

    let mut transport = example_com_transport("example.com.", RecordType::A);
    transport.on(
        LEAF_IP,
        "example.com.",
        RecordType::A,
        answer_msg(vec![a("example.com.", [192, 0, 2, 10])]),
    );

    let recursor = build(transport, test_config(), now);
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("example.com."), RecordType::A, DNSClass::IN, now)
        .await;

    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(
        outcome.records[0].data().ip_addr(),
        Some("192.0.2.10".parse().unwrap())
    );
    // No trust anchors: the whole tree is provably unsigned.
    assert_eq!(outcome.validation_state, ValidationState::Insecure);
}

#[tokio::test]
async fn cached_answers_make_no_transport_calls() {
    subscribe();
    let now = Instant::now();

    let mut transport = example_com_transport("example.com.", RecordType::A);
    transport.on(
        LEAF_IP,
        "example.com.",
        RecordType::A,
        answer_msg(vec![a("example.com.", [192, 0, 2, 10])]),
    );
    let transport = Arc::new(transport);

    let recursor = Recursor::builder()
        .config(test_config())
        .transport(transport.clone())
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();
    let qname = name("example.com.");

    recursor
        .resolve(&mut worker, &qname, RecordType::A, DNSClass::IN, now)
        .await;
    let after_first = transport.queries().len();
    assert!(after_first >= 3);

    // Second ask: served from the packet cache.
    let outcome = recursor
        .resolve(&mut worker, &qname, RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(transport.queries().len(), after_first);
    assert_eq!(
        recursor.counters().packet_cache_hits.load(Ordering::Relaxed),
        1
    );

    // Bypass the packet cache: the record cache answers, still no traffic.
    let mut resolver = recursor.resolver(&mut worker, now);
    let mut records = Vec::new();
    let rcode = resolver
        .begin_resolve(&qname, RecordType::A, DNSClass::IN, &mut records, 0)
        .await
        .unwrap();
    assert_eq!(rcode, ResponseCode::NoError);
    assert_eq!(records.len(), 1);
    assert_eq!(transport.queries().len(), after_first);
}

#[tokio::test]
async fn nxdomain_is_negative_cached() {
    subscribe();
    let now = Instant::now();

    let qname = "nonexistent.example.com.";
    let mut transport = example_com_transport(qname, RecordType::A);
    transport.on(
        LEAF_IP,
        qname,
        RecordType::A,
        negative_msg(ResponseCode::NXDomain, vec![soa("example.com.")]),
    );
    let transport = Arc::new(transport);

    let recursor = Recursor::builder()
        .config(test_config())
        .transport(transport.clone())
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name(qname), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NXDomain);
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.validation_state, ValidationState::Insecure);

    // The whole-name denial covers other types, straight from the cache.
    let queries_before = transport.queries().len();
    let mut resolver = recursor.resolver(&mut worker, now);
    let mut records = Vec::new();
    let rcode = resolver
        .begin_resolve(&name(qname), RecordType::AAAA, DNSClass::IN, &mut records, 0)
        .await
        .unwrap();
    assert_eq!(rcode, ResponseCode::NXDomain);
    assert_eq!(transport.queries().len(), queries_before);
}

fn cname_chain_transport() -> MockTransport {
    let mut transport = MockTransport::new();
    transport.on(
        ROOT_IP,
        "a.test.",
        RecordType::A,
        referral_msg(
            vec![ns("test.", "ns1.test.")],
            vec![a("ns1.test.", [192, 0, 2, 3])],
        ),
    );
    transport.on(
        LEAF_IP,
        "a.test.",
        RecordType::A,
        answer_msg(vec![cname("a.test.", "b.test.")]),
    );
    transport.on(
        LEAF_IP,
        "b.test.",
        RecordType::A,
        answer_msg(vec![cname("b.test.", "c.test.")]),
    );
    transport.on(
        LEAF_IP,
        "c.test.",
        RecordType::A,
        answer_msg(vec![cname("c.test.", "d.test.")]),
    );
    transport.on(
        LEAF_IP,
        "d.test.",
        RecordType::A,
        answer_msg(vec![a("d.test.", [198, 51, 100, 1])]),
    );
    transport
}

#[tokio::test]
async fn cname_chain_is_followed() {
    subscribe();
    let now = Instant::now();
    let recursor = build(cname_chain_transport(), test_config(), now);
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("a.test."), RecordType::A, DNSClass::IN, now)
        .await;

    assert_eq!(outcome.rcode, ResponseCode::NoError);
    let cnames = outcome
        .records
        .iter()
        .filter(|r| r.record_type() == RecordType::CNAME)
        .count();
    let addresses = outcome
        .records
        .iter()
        .filter(|r| r.record_type() == RecordType::A)
        .count();
    assert_eq!(cnames, 3, "expected the full chain: {:?}", outcome.records);
    assert_eq!(addresses, 1);
    assert_eq!(
        outcome.records.last().unwrap().data().ip_addr(),
        Some("198.51.100.1".parse().unwrap())
    );
}

#[tokio::test]
async fn overlong_cname_chain_servfails() {
    subscribe();
    let now = Instant::now();
    let config = RecursorConfig {
        max_cname_chain: 1,
        ..test_config()
    };
    let recursor = build(cname_chain_transport(), config, now);
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("a.test."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::ServFail);
}

#[tokio::test]
async fn cname_cycle_servfails() {
    subscribe();
    let now = Instant::now();

    let mut transport = MockTransport::new();
    transport.on(
        ROOT_IP,
        "x.test.",
        RecordType::A,
        referral_msg(
            vec![ns("test.", "ns1.test.")],
            vec![a("ns1.test.", [192, 0, 2, 3])],
        ),
    );
    transport.on(
        LEAF_IP,
        "x.test.",
        RecordType::A,
        answer_msg(vec![cname("x.test.", "y.test.")]),
    );
    transport.on(
        LEAF_IP,
        "y.test.",
        RecordType::A,
        answer_msg(vec![cname("y.test.", "x.test.")]),
    );

    let recursor = build(transport, test_config(), now);
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("x.test."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::ServFail);
}

#[tokio::test]
async fn repeated_timeouts_throttle_the_server() {
    subscribe();
    let now = Instant::now();

    let mut transport = MockTransport::new();
    // Only the delegation is scripted; every query to DOWN_IP times out.
    transport.on(
        ROOT_IP,
        "q1.down.test.",
        RecordType::A,
        referral_msg(
            vec![ns("down.test.", "ns1.down.test.")],
            vec![a("ns1.down.test.", [192, 0, 2, 5])],
        ),
    );
    let transport = Arc::new(transport);

    let config = RecursorConfig {
        server_down_max_fails: 4,
        server_down_throttle_time: Duration::from_secs(60),
        ..test_config()
    };
    let recursor = Recursor::builder()
        .config(config)
        .transport(transport.clone())
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    for i in 1..=5 {
        let qname = name(&format!("q{i}.down.test."));
        let outcome = recursor
            .resolve(&mut worker, &qname, RecordType::A, DNSClass::IN, now)
            .await;
        assert_eq!(outcome.rcode, ResponseCode::ServFail);
    }

    // The 4th timeout tripped the server-down limit; the 5th question never
    // reached the wire.
    assert_eq!(transport.queries_to(DOWN_IP), 4);
    assert!(worker
        .throttle
        .should_throttle(now, &(DOWN_IP, Name::root(), 0)));
    assert!(!worker.throttle.should_throttle(
        now + Duration::from_secs(61),
        &(DOWN_IP, Name::root(), 0)
    ));
}

#[tokio::test]
async fn qname_minimization_walks_label_by_label() {
    subscribe();
    let now = Instant::now();

    let mut transport = MockTransport::new();
    transport.on(
        ROOT_IP,
        "com.",
        RecordType::NS,
        referral_msg(
            vec![ns("com.", "ns1.gtld.test.")],
            vec![a("ns1.gtld.test.", [192, 0, 2, 2])],
        ),
    );
    transport.on(
        TLD_IP,
        "example.com.",
        RecordType::NS,
        referral_msg(
            vec![ns("example.com.", "ns1.example.com.")],
            vec![a("ns1.example.com.", [192, 0, 2, 3])],
        ),
    );
    transport.on(
        LEAF_IP,
        "sub.example.com.",
        RecordType::NS,
        negative_msg(ResponseCode::NoError, vec![soa("example.com.")]),
    );
    transport.on(
        LEAF_IP,
        "deep.sub.example.com.",
        RecordType::A,
        answer_msg(vec![a("deep.sub.example.com.", [192, 0, 2, 77])]),
    );
    let transport = Arc::new(transport);

    let config = RecursorConfig {
        qname_minimization: true,
        ..test_config()
    };
    let recursor = Recursor::builder()
        .config(config)
        .transport(transport.clone())
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(
            &mut worker,
            &name("deep.sub.example.com."),
            RecordType::A,
            DNSClass::IN,
            now,
        )
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);

    let asked: Vec<(Name, RecordType)> = transport
        .queries()
        .iter()
        .map(|q| (q.qname.clone(), q.qtype))
        .collect();
    let expected = [
        (name("com."), RecordType::NS),
        (name("example.com."), RecordType::NS),
        (name("sub.example.com."), RecordType::NS),
        (name("deep.sub.example.com."), RecordType::A),
    ];
    // The expected probes appear in order (other queries may interleave).
    let mut position = 0;
    for query in &asked {
        if position < expected.len() && *query == expected[position] {
            position += 1;
        }
    }
    assert_eq!(position, expected.len(), "probe order was {asked:?}");
}

#[tokio::test]
async fn rate_limited_refresh_tasks_count_once() {
    subscribe();
    let now = Instant::now();
    let recursor = build(MockTransport::new(), test_config(), now);

    let deadline = SystemTime::now() + Duration::from_secs(300);
    for _ in 0..10 {
        recursor.push_resolve_task(name("example.com."), RecordType::A, now, deadline);
    }
    assert_eq!(recursor.task_queue().resolve_tasks_pushed(), 1);
    assert_eq!(recursor.task_queue().len(), 1);
}

#[tokio::test]
async fn validated_chain_is_secure() {
    subscribe();
    let now = Instant::now();

    let mut transport = example_com_transport("example.com.", RecordType::A);
    transport.on(
        LEAF_IP,
        "example.com.",
        RecordType::A,
        answer_msg(vec![a("example.com.", [192, 0, 2, 10]), rrsig("example.com.")]),
    );
    transport.on(
        ROOT_IP,
        ".",
        RecordType::DNSKEY,
        answer_msg(vec![dnskey("."), rrsig(".")]),
    );
    transport.on(
        ROOT_IP,
        "com.",
        RecordType::DS,
        answer_msg(vec![ds("com."), rrsig("com.")]),
    );
    transport.on(
        TLD_IP,
        "com.",
        RecordType::DNSKEY,
        answer_msg(vec![dnskey("com."), rrsig("com.")]),
    );
    transport.on(
        TLD_IP,
        "example.com.",
        RecordType::DS,
        answer_msg(vec![ds("example.com."), rrsig("example.com.")]),
    );
    transport.on(
        LEAF_IP,
        "example.com.",
        RecordType::DNSKEY,
        answer_msg(vec![dnskey("example.com."), rrsig("example.com.")]),
    );

    let recursor = Recursor::builder()
        .config(test_config())
        .transport(Arc::new(transport))
        .verifier(Arc::new(AcceptAllVerifier::with_root_anchor()))
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("example.com."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(outcome.validation_state, ValidationState::Secure);
}

#[tokio::test]
async fn secure_nxdomain_with_denial_evidence() {
    subscribe();
    let now = Instant::now();

    let qname = "ghost.example.com.";
    let mut transport = example_com_transport(qname, RecordType::A);
    transport.on(
        LEAF_IP,
        qname,
        RecordType::A,
        negative_msg(
            ResponseCode::NXDomain,
            vec![
                soa("example.com."),
                rrsig("example.com."),
                nsec("ghost.example.com."),
                rrsig("ghost.example.com."),
            ],
        ),
    );
    transport.on(
        ROOT_IP,
        ".",
        RecordType::DNSKEY,
        answer_msg(vec![dnskey("."), rrsig(".")]),
    );
    transport.on(
        ROOT_IP,
        "com.",
        RecordType::DS,
        answer_msg(vec![ds("com."), rrsig("com.")]),
    );
    transport.on(
        TLD_IP,
        "com.",
        RecordType::DNSKEY,
        answer_msg(vec![dnskey("com."), rrsig("com.")]),
    );
    transport.on(
        TLD_IP,
        "example.com.",
        RecordType::DS,
        answer_msg(vec![ds("example.com."), rrsig("example.com.")]),
    );
    transport.on(
        LEAF_IP,
        "example.com.",
        RecordType::DNSKEY,
        answer_msg(vec![dnskey("example.com."), rrsig("example.com.")]),
    );

    let recursor = Recursor::builder()
        .config(test_config())
        .transport(Arc::new(transport))
        .verifier(Arc::new(AcceptAllVerifier::with_root_anchor()))
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name(qname), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NXDomain);
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.validation_state, ValidationState::Secure);
}

#[tokio::test]
async fn edns_refusing_server_is_downgraded() {
    subscribe();
    let now = Instant::now();

    let mut transport = example_com_transport("example.com.", RecordType::A);
    transport.on(
        LEAF_IP,
        "example.com.",
        RecordType::A,
        answer_msg(vec![a("example.com.", [192, 0, 2, 10])]),
    );
    transport.refuse_edns(LEAF_IP);

    let recursor = build(transport, test_config(), now);
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("example.com."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(
        worker.edns_status.mode(LEAF_IP),
        crate::throttle::EdnsMode::NoEdns
    );
}

#[tokio::test]
async fn truncated_udp_answers_retry_over_tcp() {
    subscribe();
    let now = Instant::now();

    let mut transport = example_com_transport("example.com.", RecordType::A);
    let mut truncated = answer_msg(vec![a("example.com.", [192, 0, 2, 10])]);
    truncated.set_truncated(true);
    transport.on(LEAF_IP, "example.com.", RecordType::A, truncated);

    let recursor = build(transport, test_config(), now);
    let mut worker = recursor.worker_state();

    // The mock returns the truncated flag on TCP too, so the resolution
    // accepts the TCP copy as-is.
    let outcome = recursor
        .resolve(&mut worker, &name("example.com."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert!(
        recursor.counters().tcpoutqueries.load(Ordering::Relaxed) >= 1,
        "expected a TCP retry"
    );
}

#[tokio::test]
async fn out_of_bailiwick_records_never_reach_the_cache() {
    subscribe();
    let now = Instant::now();

    let mut transport = example_com_transport("example.com.", RecordType::A);
    let mut poisoned = answer_msg(vec![
        a("example.com.", [192, 0, 2, 10]),
        a("victim.example.org.", [203, 0, 113, 66]),
    ]);
    poisoned.add_additional(a("victim.example.org.", [203, 0, 113, 66]));
    transport.on(LEAF_IP, "example.com.", RecordType::A, poisoned);

    let recursor = build(transport, test_config(), now);
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("example.com."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(outcome.records.len(), 1);
    assert!(recursor
        .record_cache()
        .get(&name("victim.example.org."), RecordType::A, now)
        .is_none());
}

#[tokio::test]
async fn forward_zone_goes_straight_to_its_servers() {
    subscribe();
    let now = Instant::now();

    let mut transport = MockTransport::new();
    transport.on(
        FWD_IP,
        "host.corp.test.",
        RecordType::A,
        answer_msg(vec![a("host.corp.test.", [10, 0, 0, 42])]),
    );

    let mut map = DomainMap::new();
    map.insert(
        name("corp.test."),
        AuthZone::forward(name("corp.test."), vec![FWD_IP], true),
    );

    // Note: the default don't-query list covers 10.0.0.0/8; explicitly
    // configured forwarders pierce it.
    let config = RecursorConfig {
        do_ipv6: false,
        root_hints: vec![(name("a.root-servers.test."), ROOT_IP)],
        ..RecursorConfig::default()
    };
    let recursor = Recursor::builder()
        .config(config)
        .transport(Arc::new(transport))
        .domain_map(map)
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("host.corp.test."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(outcome.records.len(), 1);
}

#[tokio::test]
async fn forwarded_queries_carry_rd_when_configured() {
    subscribe();
    let now = Instant::now();

    let mut transport = MockTransport::new();
    transport.on(
        FWD_IP,
        "host.corp.test.",
        RecordType::A,
        answer_msg(vec![a("host.corp.test.", [10, 0, 0, 42])]),
    );
    let transport = Arc::new(transport);

    let mut map = DomainMap::new();
    map.insert(
        name("corp.test."),
        AuthZone::forward(name("corp.test."), vec![FWD_IP], true),
    );

    let recursor = Recursor::builder()
        .config(test_config())
        .transport(transport.clone())
        .domain_map(map)
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    recursor
        .resolve(&mut worker, &name("host.corp.test."), RecordType::A, DNSClass::IN, now)
        .await;
    let queries = transport.queries();
    assert_eq!(queries.len(), 1);
    assert!(queries[0].send_rd);
    assert!(!queries[0].tcp);
}

#[tokio::test]
async fn auth_zone_is_served_out_of_band() {
    subscribe();
    let now = Instant::now();

    let mut zone = AuthZone::new(name("static.test."));
    zone.add_record(soa("static.test."));
    zone.add_record(a("www.static.test.", [192, 0, 2, 80]));
    let mut map = DomainMap::new();
    map.insert(name("static.test."), zone);

    let transport = Arc::new(MockTransport::new());
    let recursor = Recursor::builder()
        .config(test_config())
        .transport(transport.clone())
        .domain_map(map)
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("www.static.test."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(outcome.records.len(), 1);
    assert!(outcome.was_out_of_band);
    assert!(transport.queries().is_empty());
    assert_eq!(
        recursor.counters().auth_zone_queries.load(Ordering::Relaxed),
        1
    );

    let outcome = recursor
        .resolve(&mut worker, &name("missing.static.test."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NXDomain);
}

#[tokio::test]
async fn localhost_and_server_id_are_answered_locally() {
    subscribe();
    let now = Instant::now();
    let transport = Arc::new(MockTransport::new());
    let recursor = Recursor::builder()
        .config(test_config())
        .transport(transport.clone())
        .build(now)
        .unwrap();
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("localhost."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(
        outcome.records[0].data().ip_addr(),
        Some("127.0.0.1".parse().unwrap())
    );

    let outcome = recursor
        .resolve(&mut worker, &name("id.server."), RecordType::TXT, DNSClass::CH, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.records[0].dns_class(), DNSClass::CH);

    assert!(transport.queries().is_empty());
}

#[tokio::test]
async fn outgoing_query_budget_aborts_with_servfail() {
    subscribe();
    let now = Instant::now();

    let mut transport = example_com_transport("example.com.", RecordType::A);
    transport.on(
        LEAF_IP,
        "example.com.",
        RecordType::A,
        answer_msg(vec![a("example.com.", [192, 0, 2, 10])]),
    );

    // The walk needs three queries; two are allowed.
    let config = RecursorConfig {
        max_queries_per_query: 2,
        ..test_config()
    };
    let recursor = build(transport, config, now);
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("example.com."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::ServFail);
    assert!(recursor.counters().resource_limits.load(Ordering::Relaxed) >= 1);
}

#[tokio::test]
async fn unreachable_server_falls_back_to_next_candidate() {
    subscribe();
    let now = Instant::now();

    let other_leaf: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));
    let mut transport = MockTransport::new();
    transport.on(
        ROOT_IP,
        "example.com.",
        RecordType::A,
        referral_msg(
            vec![
                ns("example.com.", "ns1.example.com."),
                ns("example.com.", "ns2.example.com."),
            ],
            vec![
                a("ns1.example.com.", [192, 0, 2, 3]),
                a("ns2.example.com.", [192, 0, 2, 7]),
            ],
        ),
    );
    transport.on_status(
        LEAF_IP,
        "example.com.",
        RecordType::A,
        AskStatus::NetworkError,
    );
    let answer = answer_msg(vec![a("example.com.", [192, 0, 2, 10])]);
    transport.on(other_leaf, "example.com.", RecordType::A, answer);

    let recursor = build(transport, test_config(), now);
    let mut worker = recursor.worker_state();

    let outcome = recursor
        .resolve(&mut worker, &name("example.com."), RecordType::A, DNSClass::IN, now)
        .await;
    assert_eq!(outcome.rcode, ResponseCode::NoError);
    assert_eq!(outcome.records.len(), 1);
}
