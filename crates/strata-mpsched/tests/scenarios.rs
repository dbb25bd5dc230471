//! End-to-end scheduling scenarios through the public API.

use std::time::Duration;

use bytes::Bytes;
use quanta::Clock;

use strata_mpsched::scheduler::RateRoundScheduler;
use strata_mpsched::{
    create_scheduler, Connection, Origin, PathId, PathSignal, Scheduler, SchedulerConfig,
    SchedulerKind, SegmentSlot, Subflow,
};

fn path(index: u8) -> PathId {
    PathId::new(index).unwrap()
}

fn attach(sched: &mut dyn Scheduler, conn: &mut Connection, sf: Subflow) {
    sched.init_path(&sf);
    conn.add_subflow(sf).unwrap();
}

fn build(kind: SchedulerKind) -> Box<dyn Scheduler> {
    let (clock, _mock) = Clock::mock();
    create_scheduler(&SchedulerConfig::for_kind(kind), clock)
}

// ─── Single path ─────────────────────────────────────────────────────────────

#[test]
fn single_path_fresh_segment_under_mss() {
    for kind in [
        SchedulerKind::HintBiased,
        SchedulerKind::RateRound,
        SchedulerKind::QuotaBurst,
    ] {
        let mut sched = build(kind);
        let mut conn = Connection::new();
        attach(sched.as_mut(), &mut conn, Subflow::new(path(1)).with_mss(1500));
        conn.push_data(Bytes::from(vec![42u8; 1000]));

        let d = sched.next_segment(&mut conn).expect("dispatch");
        assert_eq!(d.path, path(1), "{kind}");
        assert_eq!(d.origin, Origin::Fresh, "{kind}");
        assert_eq!(d.limit, 1000, "{kind}");
        assert_eq!(d.segment.payload().as_ref(), &[42u8; 1000][..]);
    }
}

// ─── Congested path ──────────────────────────────────────────────────────────

#[test]
fn congested_path_is_avoided_by_hint_and_quota() {
    for kind in [SchedulerKind::HintBiased, SchedulerKind::QuotaBurst] {
        let mut sched = build(kind);
        let mut conn = Connection::new();

        let mut a = Subflow::new(path(1)).with_cwnd(10);
        a.packets_in_flight = 10;
        let mut b = Subflow::new(path(2)).with_cwnd(10);
        b.packets_in_flight = 9;
        attach(sched.as_mut(), &mut conn, a);
        attach(sched.as_mut(), &mut conn, b);
        conn.push_data(Bytes::from(vec![0u8; 500]));

        assert_eq!(
            sched.select_path(&mut conn, Some(SegmentSlot::SendHead), false),
            Some(path(2)),
            "{kind}"
        );
        let d = sched.next_segment(&mut conn).expect("dispatch");
        assert_eq!(d.path, path(2), "{kind}");
    }
}

// ─── Rounds ──────────────────────────────────────────────────────────────────

#[test]
fn round_master_is_slow_path_with_full_allowance() {
    let (clock, _mock) = Clock::mock();
    let mut sched =
        RateRoundScheduler::new(&SchedulerConfig::for_kind(SchedulerKind::RateRound), clock);
    let mut conn = Connection::new();
    let fast = Subflow::new(path(1))
        .with_srtt(Duration::from_millis(10))
        .with_cwnd(12);
    let slow = Subflow::new(path(2))
        .with_srtt(Duration::from_millis(100))
        .with_cwnd(20);
    attach(&mut sched, &mut conn, fast);
    attach(&mut sched, &mut conn, slow);

    // Probe without committing anything: this starts the first round.
    assert_eq!(sched.select_path(&mut conn, None, false), Some(path(1)));

    assert_eq!(sched.master(), Some(path(2)));
    let master = sched.allowance(path(2));
    assert!(master.master);
    assert_eq!(master.remaining, 20);
    // Zero loss: the fast path's allowance is its whole cwnd, minus the
    // probe that was just granted.
    assert_eq!(sched.allowance(path(1)).remaining, 12 - 1);
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

#[test]
fn data_fin_follows_designated_path() {
    for kind in [
        SchedulerKind::HintBiased,
        SchedulerKind::RateRound,
        SchedulerKind::QuotaBurst,
    ] {
        let mut sched = build(kind);
        let mut conn = Connection::new();
        for i in 1..=3 {
            let sf = Subflow::new(path(i)).with_srtt(Duration::from_millis(u64::from(i) * 10));
            attach(sched.as_mut(), &mut conn, sf);
        }
        conn.rcv_shutdown = true;
        conn.data_fin_path = Some(path(2));
        conn.push_data_fin();

        let d = sched.next_segment(&mut conn).expect("dispatch");
        assert_eq!(d.path, path(2), "{kind}");
        assert!(d.segment.is_data_fin());
        assert_eq!(d.limit, 0);
    }
}

// ─── Path failure ────────────────────────────────────────────────────────────

#[test]
fn removed_path_data_is_reinjected_elsewhere() {
    let mut sched = build(SchedulerKind::HintBiased);
    let mut conn = Connection::new();
    attach(sched.as_mut(), &mut conn, Subflow::new(path(1)));
    attach(sched.as_mut(), &mut conn, Subflow::new(path(2)));

    // Only path 2 is hinted, so everything goes there first.
    sched.signal_path(path(1), PathSignal::Preference(0));
    conn.push_data(Bytes::from(vec![1u8; 700]));
    let first = sched.next_segment(&mut conn).unwrap();
    assert_eq!(first.path, path(2));

    conn.remove_subflow(path(2));
    sched.remove_path(path(2));
    conn.push_data(Bytes::from(vec![2u8; 700]));

    let d = sched.next_segment(&mut conn).unwrap();
    assert_eq!(d.origin, Origin::Reinjected);
    assert_eq!(d.path, path(1));
    assert_eq!(d.segment.seq(), 0);

    let d = sched.next_segment(&mut conn).unwrap();
    assert_eq!(d.origin, Origin::Fresh);
    assert_eq!(d.segment.seq(), 700);
}

// ─── Fallback mode ───────────────────────────────────────────────────────────

#[test]
fn infinite_mapping_ignores_reinject_queue() {
    let mut sched = build(SchedulerKind::HintBiased);
    let mut conn = Connection::new();
    attach(sched.as_mut(), &mut conn, Subflow::new(path(1)));
    conn.push_data(Bytes::from(vec![0u8; 100]));
    sched.next_segment(&mut conn).unwrap();
    conn.reinject(0);
    conn.push_data(Bytes::from(vec![0u8; 100]));
    conn.infinite_mapping = true;

    let d = sched.next_segment(&mut conn).unwrap();
    assert_eq!(d.origin, Origin::Fresh);
    assert_eq!(d.segment.seq(), 100);
}

// ─── Back-pressure ───────────────────────────────────────────────────────────

#[test]
fn blocked_writer_triggers_idle_retransmission() {
    let mut sched = build(SchedulerKind::HintBiased);
    let mut conn = Connection::new();
    attach(
        sched.as_mut(),
        &mut conn,
        Subflow::new(path(1)).with_srtt(Duration::from_millis(5)),
    );
    attach(
        sched.as_mut(),
        &mut conn,
        Subflow::new(path(2)).with_srtt(Duration::from_millis(200)),
    );

    // Put the only segment on the slow path.
    sched.signal_path(path(1), PathSignal::Preference(0));
    conn.push_data(Bytes::from(vec![0u8; 1000]));
    assert_eq!(sched.next_segment(&mut conn).unwrap().path, path(2));
    sched.signal_path(path(1), PathSignal::Preference(1));
    sched.signal_path(path(2), PathSignal::Preference(0));

    // Nothing queued and no back-pressure: idle.
    assert!(sched.next_segment(&mut conn).is_none());

    conn.send_buffer.sndbuf = 1000;
    conn.send_buffer.nospace = true;
    let d = sched.next_segment(&mut conn).unwrap();
    assert_eq!(d.origin, Origin::IdleRetransmit);
    assert_eq!(d.path, path(1));
    assert_eq!(d.segment.seq(), 0);
    assert_eq!(sched.stats().idle_retransmits, 1);

    // Both paths now carry it: nothing more to do.
    assert!(sched.next_segment(&mut conn).is_none());
}
