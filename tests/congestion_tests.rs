//! TCP Congestion Control & Loss Recovery Tests
//!
//! Duplicate acks driving fast retransmit (SACK and NewReno), limited and
//! early retransmit, spurious retransmission undo, and the retransmit
//! timeout.


use test_helpers::*;
use tcp_input_rust::components::TCP_MAXRXTSHIFT;
use tcp_input_rust::error::ConnError;
use tcp_input_rust::seq::seq_lt;
use tcp_input_rust::services::TimerId;
use tcp_input_rust::state::{ConnFlags, TcpState};
use tcp_input_rust::tcp_types::{InputAction, TcpSegment};
use tcp_input_rust::{TcpRx, TcpStat, TcpTimers};

const UNA: u32 = ISS + 1;

fn stat(h: &Harness, s: TcpStat) -> u64 {
    h.ctx.stats.get(s)
}

/// `flight` bytes in the network and as much again waiting to be sent.
fn loaded(h: &Harness, mut c: Conn, flight: u32) -> Conn {
    send_data(h, &mut c.tp, flight);
    c.tp.rod.snd_cc += flight;
    c
}

fn with_sack_permitted(mut c: Conn) -> Conn {
    c.tp.conn_mgmt.flags.insert(ConnFlags::SACK_PERMITTED);
    c
}

fn with_timestamps(h: &Harness, mut c: Conn, ts_recent: u32) -> Conn {
    c.tp.conn_mgmt.flags.insert(ConnFlags::REQ_TSTMP | ConnFlags::RCVD_TSTMP);
    c.tp.rod.ts_recent = ts_recent;
    c.tp.rod.ts_recent_age = h.ctx.ticks;
    c
}

fn feed(h: &mut Harness, c: &mut Conn, mut seg: TcpSegment) -> InputAction {
    TcpRx::process_segment(&mut c.tp, &mut h.ctx, &mut seg)
}

/// Retransmissions: transmits that start below `limit`.
fn retransmits(h: &Harness, limit: u32) -> Vec<(u32, u32)> {
    h.out
        .borrow()
        .transmits
        .iter()
        .filter(|t| seq_lt(t.1, limit))
        .map(|t| (t.1, t.2))
        .collect()
}

// ============================================================================
// Test 1: SACK fast retransmit
// ============================================================================

#[test]
fn test_sack_fast_retransmit_resends_only_the_lost_segment() {
    let mut h = Harness::new();
    let mut c = loaded(&h, with_sack_permitted(established(&h)), 10 * MSS);
    let snd_max = c.tp.rod.snd_max;

    // The first segment is lost; the next three arrive one by one.
    for k in 2..=4 {
        let dup = with_sack(ack(IRS + 1, UNA), &[(UNA + MSS, UNA + k * MSS)]);
        assert_eq!(feed(&mut h, &mut c, dup), InputAction::DropSilently);
    }

    assert!(c.tp.in_fast_recovery());
    assert_eq!(c.tp.cong_ctrl.ssthresh, 5 * MSS);
    assert_eq!(c.tp.cong_ctrl.cwnd, 5 * MSS);
    assert_eq!(retransmits(&h, snd_max), vec![(UNA, MSS)]);
    assert_eq!(stat(&h, TcpStat::SndFastRexmt), 1);
    assert_eq!(stat(&h, TcpStat::RcvDupAck), 3);
    // The two dup acks before the threshold sent new data instead.
    assert_eq!(stat(&h, TcpStat::SndLimited), 2);
    assert_eq!(c.tp.rod.snd_max, snd_max + 2 * MSS);
    assert_eq!(c.tp.cong_ctrl.recover, snd_max + 2 * MSS);
    // Restarted by the retransmission.
    assert!(h.armed(TimerId::Rexmt).is_some());
}

#[test]
fn test_sack_recovery_ends_at_recover() {
    let mut h = Harness::new();
    let mut c = loaded(&h, with_sack_permitted(established(&h)), 10 * MSS);
    for k in 2..=4 {
        let dup = with_sack(ack(IRS + 1, UNA), &[(UNA + MSS, UNA + k * MSS)]);
        feed(&mut h, &mut c, dup);
    }
    assert!(c.tp.in_fast_recovery());

    let recover = c.tp.cong_ctrl.recover;
    let action = feed(&mut h, &mut c, ack(IRS + 1, recover));

    assert_eq!(action, InputAction::Consumed);
    assert!(!c.tp.in_fast_recovery());
    assert_eq!(c.tp.rod.snd_una, recover);
    assert!(c.board.borrow().blocks.is_empty());
    assert_eq!(h.armed(TimerId::Rexmt), None);
}

#[test]
fn test_redundant_sack_is_not_a_dupack_signal() {
    let mut h = Harness::new();
    let mut c = loaded(&h, with_sack_permitted(established(&h)), 10 * MSS);

    let first = with_sack(ack(IRS + 1, UNA), &[(UNA + MSS, UNA + 2 * MSS)]);
    feed(&mut h, &mut c, first);
    assert_eq!(c.tp.cong_ctrl.dupacks, 1);

    // Reports nothing new, and carries data: not counted.
    let repeat = with_sack(data(IRS + 1 + 100, UNA, &[1; 10]), &[(UNA + MSS, UNA + 2 * MSS)]);
    feed(&mut h, &mut c, repeat);
    assert_eq!(c.tp.cong_ctrl.dupacks, 0);
    assert!(!c.tp.in_fast_recovery());
}

// ============================================================================
// Test 2: NewReno
// ============================================================================

#[test]
fn test_newreno_fast_retransmit_after_limited_transmit() {
    let mut h = Harness::new();
    let mut c = loaded(&h, established(&h), 10 * MSS);
    let snd_max = c.tp.rod.snd_max;

    feed(&mut h, &mut c, ack(IRS + 1, UNA));
    feed(&mut h, &mut c, ack(IRS + 1, UNA));
    assert_eq!(c.tp.cong_ctrl.snd_limited, 2);
    assert_eq!(
        h.out.borrow().transmits,
        vec![(CONN, snd_max, MSS), (CONN, snd_max + MSS, MSS)]
    );
    assert!(!c.tp.in_fast_recovery());

    feed(&mut h, &mut c, ack(IRS + 1, UNA));
    assert!(c.tp.in_fast_recovery());
    assert_eq!(retransmits(&h, snd_max), vec![(UNA, MSS)]);
    assert_eq!(c.tp.cong_ctrl.ssthresh, 5 * MSS);
    // ssthresh plus the dup acks not already spent on limited transmit.
    assert_eq!(c.tp.cong_ctrl.cwnd, 6 * MSS);

    // Further dup acks inflate the window.
    feed(&mut h, &mut c, ack(IRS + 1, UNA));
    assert_eq!(c.tp.cong_ctrl.cwnd, 7 * MSS);
}

#[test]
fn test_newreno_partial_ack_retransmits_next_hole() {
    let mut h = Harness::new();
    let mut c = loaded(&h, established(&h), 10 * MSS);
    for _ in 0..3 {
        feed(&mut h, &mut c, ack(IRS + 1, UNA));
    }
    assert!(c.tp.in_fast_recovery());
    h.out.borrow_mut().clear();

    let action = feed(&mut h, &mut c, ack(IRS + 1, UNA + MSS));

    assert_eq!(action, InputAction::Consumed);
    assert!(c.tp.in_fast_recovery());
    assert_eq!(h.out.borrow().transmits, vec![(CONN, UNA + MSS, MSS)]);
    assert_eq!(c.tp.cong_ctrl.cwnd, 6 * MSS);
    assert!(h.armed(TimerId::Rexmt).is_some());
}

#[test]
fn test_dupacks_without_outstanding_data_are_ignored() {
    let mut h = Harness::new();
    let mut c = established(&h);

    for _ in 0..4 {
        assert_eq!(feed(&mut h, &mut c, ack(IRS + 1, UNA)), InputAction::Consumed);
    }
    assert_eq!(c.tp.cong_ctrl.dupacks, 0);
    assert!(!c.tp.in_fast_recovery());
    assert!(h.out.borrow().transmits.is_empty());
}

// ============================================================================
// Test 3: Early retransmit
// ============================================================================

#[test]
fn test_early_retransmit_with_small_flight() {
    let mut h = Harness::new();
    let mut c = with_timestamps(&h, established(&h), 100);
    send_data(&h, &mut c.tp, 2 * MSS);
    // No new data can go out.
    h.out.borrow_mut().transmit_limit = Some(0);

    let dup = with_ts(ack(IRS + 1, UNA), 101, 900);
    assert_eq!(feed(&mut h, &mut c, dup), InputAction::DropSilently);

    assert_eq!(stat(&h, TcpStat::SndEarlyRexmt), 1);
    assert_eq!(stat(&h, TcpStat::SndFastRexmt), 1);
    assert!(c.tp.in_fast_recovery());
    assert_eq!(h.out.borrow().transmits.last(), Some(&(CONN, UNA, MSS)));
}

// ============================================================================
// Test 4: Spurious retransmission undo
// ============================================================================

#[test]
fn test_eifel_reverts_spurious_fast_retransmit() {
    let mut h = Harness::new();
    let mut c = loaded(&h, with_timestamps(&h, established(&h), 100), 10 * MSS);
    let (cwnd0, ssthresh0) = (c.tp.cong_ctrl.cwnd, c.tp.cong_ctrl.ssthresh);
    let rexmt_tick = h.ctx.ticks;

    for k in 1..=3 {
        let dup = with_ts(ack(IRS + 1, UNA), 100 + k, rexmt_tick - 100);
        feed(&mut h, &mut c, dup);
    }
    assert!(c.tp.in_fast_recovery());
    assert_eq!(c.tp.cong_ctrl.ssthresh, 5 * MSS);
    h.ctx.tick(5);

    // Echoes a timestamp from before the retransmission: the original
    // segment was not lost after all.
    let late = with_ts(ack(IRS + 1, UNA + MSS), 110, rexmt_tick - 10);
    assert_eq!(feed(&mut h, &mut c, late), InputAction::Consumed);

    assert_eq!(stat(&h, TcpStat::EifelDetected), 1);
    assert_eq!(stat(&h, TcpStat::RexmtBad), 1);
    assert_eq!(c.tp.cong_ctrl.ssthresh, ssthresh0);
    assert!(c.tp.cong_ctrl.cwnd >= cwnd0);
    assert!(!c.tp.in_fast_recovery());
    assert_eq!(c.tp.rod.snd_nxt, c.tp.rod.snd_max);
}

#[test]
fn test_ack_for_the_retransmission_keeps_the_reduction() {
    let mut h = Harness::new();
    let mut c = loaded(&h, with_timestamps(&h, established(&h), 100), 10 * MSS);
    let rexmt_tick = h.ctx.ticks;
    for k in 1..=3 {
        let dup = with_ts(ack(IRS + 1, UNA), 100 + k, rexmt_tick - 100);
        feed(&mut h, &mut c, dup);
    }
    h.ctx.tick(5);

    let ok = with_ts(ack(IRS + 1, UNA + MSS), 110, rexmt_tick + 2);
    feed(&mut h, &mut c, ok);

    assert_eq!(stat(&h, TcpStat::EifelDetected), 0);
    assert_eq!(c.tp.cong_ctrl.ssthresh, 5 * MSS);
    assert!(c.tp.in_fast_recovery());
}

#[test]
fn test_ack_right_after_rto_reverts_without_timestamps() {
    let mut h = Harness::new();
    let mut c = loaded(&h, established(&h), 4 * MSS);
    // srtt 100 ticks: acks within 50 ticks of the RTO are for the original.
    c.tp.rtt.srtt = 100 << 5;
    let (cwnd0, ssthresh0) = (c.tp.cong_ctrl.cwnd, c.tp.cong_ctrl.ssthresh);

    assert!(!TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Rexmt));
    assert_eq!(c.tp.cong_ctrl.cwnd, MSS);
    h.ctx.tick(10);

    feed(&mut h, &mut c, ack(IRS + 1, UNA + MSS));

    assert_eq!(stat(&h, TcpStat::RexmtBad), 1);
    assert_eq!(c.tp.rtt.rxtshift, 0);
    assert_eq!(c.tp.cong_ctrl.ssthresh, ssthresh0);
    assert_eq!(c.tp.cong_ctrl.cwnd, cwnd0 + MSS);
}

// ============================================================================
// Test 5: Acks for data never sent
// ============================================================================

#[test]
fn test_optimistic_ack_collapses_cwnd() {
    let mut h = Harness::new();
    let mut c = loaded(&h, established(&h), 2 * MSS);
    let snd_max = c.tp.rod.snd_max;

    let action = feed(&mut h, &mut c, ack(IRS + 1, snd_max + 10 * MSS));

    assert_eq!(action, InputAction::DropWithAck);
    assert_eq!(c.tp.cong_ctrl.cwnd, MSS);
    assert_eq!(c.tp.rod.snd_una, UNA);
    assert_eq!(stat(&h, TcpStat::RcvAckTooMuch), 1);
}

// ============================================================================
// Test 6: Retransmit timeout
// ============================================================================

#[test]
fn test_rto_collapses_window_and_resends_from_snd_una() {
    let mut h = Harness::new();
    let mut c = loaded(&h, established(&h), 4 * MSS);

    let closed = TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Rexmt);

    assert!(!closed);
    assert_eq!(c.tp.rtt.rxtshift, 1);
    assert_eq!(c.tp.cong_ctrl.cwnd, MSS);
    assert_eq!(c.tp.cong_ctrl.ssthresh, 5 * MSS);
    assert_eq!(c.tp.rod.snd_nxt, UNA);
    assert_eq!(c.tp.cong_ctrl.recover, UNA + 4 * MSS);
    assert!(h.armed(TimerId::Rexmt).is_some());
    assert!(h.out.borrow().outputs.contains(&CONN));
    assert_eq!(stat(&h, TcpStat::RexmtTimeo), 1);
}

#[test]
fn test_rto_gives_up_after_max_backoff() {
    let mut h = Harness::new();
    let mut c = loaded(&h, established(&h), MSS);

    for _ in 0..TCP_MAXRXTSHIFT {
        assert!(!TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Rexmt));
    }
    assert!(TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Rexmt));

    assert_eq!(c.tp.state(), TcpState::Closed);
    assert_eq!(stat(&h, TcpStat::TimeoutDrop), 1);
    assert_eq!(h.out.borrow().resets.len(), 1);
    assert_eq!(c.rcvbuf.lock().error, Some(ConnError::TimedOut));
    assert!(h.timers.borrow().is_empty());
}

// ============================================================================
// Test 7: Slow start byte counting
// ============================================================================

#[test]
fn test_slow_start_counts_two_segments_per_ack() {
    let mut h = Harness::new();
    let mut c = loaded(&h, established(&h), 4 * MSS);
    assert_eq!(c.tp.cong_ctrl.cwnd, 10 * MSS);

    feed(&mut h, &mut c, ack(IRS + 1, UNA + 2 * MSS));
    assert_eq!(c.tp.cong_ctrl.cwnd, 12 * MSS);

    // Resending below snd_max: one segment per ack.
    c.tp.rod.snd_nxt = UNA + 3 * MSS;
    feed(&mut h, &mut c, ack(IRS + 1, UNA + 4 * MSS));
    assert_eq!(c.tp.cong_ctrl.cwnd, 13 * MSS);
    assert_eq!(c.tp.rod.snd_una, UNA + 4 * MSS);
}

// ============================================================================
// Test 8: RTT samples
// ============================================================================

#[test]
fn test_stale_timestamp_echo_is_not_sampled() {
    let mut h = Harness::new();
    let mut c = loaded(&h, with_timestamps(&h, established(&h), 500), 4 * MSS);
    let now = h.ctx.ticks;
    let rxtcur = c.tp.rtt.rxtcur;

    let old = with_ts(ack(IRS + 1, UNA + MSS), 600, now.wrapping_sub(3 << 25));
    feed(&mut h, &mut c, old);
    let older = with_ts(ack(IRS + 1, UNA + 2 * MSS), 600, now.wrapping_sub((1 << 29) - 2));
    feed(&mut h, &mut c, older);

    assert_eq!(c.tp.rod.snd_una, UNA + 2 * MSS);
    assert_eq!(stat(&h, TcpStat::RttUpdated), 0);
    assert_eq!(c.tp.rtt.srtt, 0);
    assert_eq!(c.tp.rtt.rxtcur, rxtcur);

    let fresh = with_ts(ack(IRS + 1, UNA + 3 * MSS), 600, now - 10);
    feed(&mut h, &mut c, fresh);

    assert_eq!(stat(&h, TcpStat::RttUpdated), 1);
    assert_eq!(c.tp.rtt.srtt, 11 << 5);
    assert!(c.tp.rtt.rxtcur <= h.ctx.config.rexmt_max);
}
