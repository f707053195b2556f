//! TCP Control Path Tests
//!
//! Verify the state machine on the input side: handshake completion from
//! SYN_SENT and SYN_RCVD, RST acceptance, FIN processing through the
//! closing states, and the connection timers.


use test_helpers::*;
use tcp_input_rust::error::ConnError;
use tcp_input_rust::options::OptFlags;
use tcp_input_rust::services::TimerId;
use tcp_input_rust::state::{TcpConnectionState, TcpState};
use tcp_input_rust::tcp_types::{InputAction, RstReason, TcpFlags, TcpSegment};
use tcp_input_rust::{TcpConfig, TcpRx, TcpStat, TcpTimers};

const UNA: u32 = ISS + 1;

fn stat(h: &Harness, s: TcpStat) -> u64 {
    h.ctx.stats.get(s)
}

fn feed(h: &mut Harness, tp: &mut TcpConnectionState, mut seg: TcpSegment) -> InputAction {
    TcpRx::process_segment(tp, &mut h.ctx, &mut seg)
}

/// Our SYN is out, nothing received yet.
fn syn_sent(h: &Harness) -> Conn {
    let mut c = new_conn(&h.ctx.config, TcpState::SynSent);
    c.tp.rod.iss = ISS;
    c.tp.rod.snd_una = ISS;
    c.tp.rod.snd_nxt = ISS + 1;
    c.tp.rod.snd_max = ISS + 1;
    h.arm(TimerId::Rexmt, c.tp.rtt.rxtcur);
    c
}

/// The peer's SYN is in and our SYN-ACK is out.
fn syn_rcvd(h: &Harness) -> Conn {
    let mut c = syn_sent(h);
    c.tp.conn_mgmt.state = TcpState::SynRcvd;
    c.tp.rod.irs = IRS;
    c.tp.rod.rcv_nxt = IRS + 1;
    c.tp.rod.rcv_adv = IRS + 1 + RCVBUF as u32;
    c.tp.rod.last_ack_sent = IRS + 1;
    c.tp.flow_ctrl.snd_wl1 = IRS;
    c.tp.flow_ctrl.rcv_wnd = RCVBUF as u32;
    c
}

/// ESTABLISHED with our FIN sent and not yet acked, in `state`.
fn fin_sent(h: &Harness, state: TcpState) -> Conn {
    let mut c = established(h);
    c.tp.conn_mgmt.state = state;
    c.tp.rod.snd_nxt = UNA + 1;
    c.tp.rod.snd_max = UNA + 1;
    h.arm(TimerId::Rexmt, c.tp.rtt.rxtcur);
    c
}

fn fin(seqno: u32, ackno: u32) -> TcpSegment {
    segment(seqno, ackno, TcpFlags::FIN | TcpFlags::ACK, 65535, &[])
}

// ============================================================================
// Test 1: Active open (SYN_SENT)
// ============================================================================

#[test]
fn test_synack_establishes_connection() {
    let mut h = Harness::new();
    let mut c = syn_sent(&h);

    let mut synack = segment(IRS, UNA, TcpFlags::SYN | TcpFlags::ACK, 65535, &[]);
    synack.opts.flags.insert(OptFlags::MSS);
    synack.opts.mss = 1460;
    let action = feed(&mut h, &mut c.tp, synack);

    assert_eq!(action, InputAction::Consumed);
    assert_eq!(c.tp.state(), TcpState::Established);
    assert_eq!(c.tp.rod.irs, IRS);
    assert_eq!(c.tp.rod.rcv_nxt, IRS + 1);
    assert_eq!(c.tp.rod.snd_una, UNA);
    assert_eq!(c.tp.flow_ctrl.snd_wnd, 65535);
    // Capped by our own default segment size.
    assert_eq!(c.tp.maxseg(), 536);
    assert_eq!(stat(&h, TcpStat::Connects), 1);

    assert_eq!(h.armed(TimerId::Rexmt), None);
    assert_eq!(h.armed(TimerId::Keep), Some(h.ctx.config.keep_idle));
    // The handshake's last ack goes out now.
    assert!(h.out.borrow().responded(CONN));
    assert_eq!(c.tp.rod.last_ack_sent, IRS + 1);
}

#[test]
fn test_synack_with_data_delivers_it() {
    let mut h = Harness::new();
    let mut c = syn_sent(&h);

    let synack = segment(IRS, UNA, TcpFlags::SYN | TcpFlags::ACK, 65535, b"hello");
    feed(&mut h, &mut c.tp, synack);

    assert_eq!(c.tp.state(), TcpState::Established);
    assert_eq!(c.tp.rod.rcv_nxt, IRS + 1 + 5);
    assert_eq!(c.rcvbuf.lock().data, b"hello".to_vec());
}

#[test]
fn test_synack_acking_unsent_data_is_reset() {
    let mut h = Harness::new();
    let mut c = syn_sent(&h);

    let bogus = segment(IRS, ISS + 100, TcpFlags::SYN | TcpFlags::ACK, 65535, &[]);
    let action = feed(&mut h, &mut c.tp, bogus);

    assert_eq!(action, InputAction::DropWithReset(RstReason::Unlimited));
    assert_eq!(c.tp.state(), TcpState::SynSent);
}

#[test]
fn test_rst_ack_in_syn_sent_refuses_connection() {
    let mut h = Harness::new();
    let mut c = syn_sent(&h);

    let rst = segment(0, UNA, TcpFlags::RST | TcpFlags::ACK, 0, &[]);
    let action = feed(&mut h, &mut c.tp, rst);

    assert_eq!(action, InputAction::DropSilently);
    assert_eq!(c.tp.state(), TcpState::Closed);
    assert_eq!(c.rcvbuf.lock().error, Some(ConnError::Refused));
    assert!(h.timers.borrow().is_empty());
}

#[test]
fn test_bare_rst_in_syn_sent_is_ignored() {
    let mut h = Harness::new();
    let mut c = syn_sent(&h);

    let rst = segment(0, 0, TcpFlags::RST, 0, &[]);
    assert_eq!(feed(&mut h, &mut c.tp, rst), InputAction::DropSilently);
    assert_eq!(c.tp.state(), TcpState::SynSent);
}

#[test]
fn test_simultaneous_open_enters_syn_rcvd() {
    let mut h = Harness::new();
    let mut c = syn_sent(&h);

    let syn = segment(IRS, 0, TcpFlags::SYN, 65535, &[]);
    let action = feed(&mut h, &mut c.tp, syn);

    assert_eq!(action, InputAction::Consumed);
    assert_eq!(c.tp.state(), TcpState::SynRcvd);
    assert_eq!(c.tp.rod.rcv_nxt, IRS + 1);
    assert_eq!(h.armed(TimerId::Rexmt), None);
    assert_eq!(h.out.borrow().acks_now, vec![CONN]);
}

// ============================================================================
// Test 2: Passive open completion (SYN_RCVD)
// ============================================================================

#[test]
fn test_final_ack_establishes_connection() {
    let mut h = Harness::new();
    let mut c = syn_rcvd(&h);

    let action = feed(&mut h, &mut c.tp, ack(IRS + 1, UNA));

    assert_eq!(action, InputAction::Consumed);
    assert_eq!(c.tp.state(), TcpState::Established);
    assert_eq!(c.tp.rod.snd_una, UNA);
    assert_eq!(stat(&h, TcpStat::Connects), 1);
    assert!(h.armed(TimerId::Keep).is_some());
    assert_eq!(h.armed(TimerId::Rexmt), None);
}

#[test]
fn test_final_ack_after_syn_retransmit_raises_rto() {
    let mut h = Harness::new();
    let mut c = syn_rcvd(&h);
    c.tp.rtt.rxtsyn = 1;
    c.tp.rtt.rxtcur = 200;

    feed(&mut h, &mut c.tp, ack(IRS + 1, UNA));

    assert_eq!(c.tp.rtt.rxtcur, h.ctx.config.rtobase3);
}

#[test]
fn test_bad_ack_in_syn_rcvd_is_reset() {
    let mut h = Harness::new();
    let mut c = syn_rcvd(&h);

    let action = feed(&mut h, &mut c.tp, ack(IRS + 1, ISS + 500));

    assert_eq!(action, InputAction::DropWithReset(RstReason::OpenPort));
    assert_eq!(c.tp.state(), TcpState::SynRcvd);
}

#[test]
fn test_segment_before_irs_is_reset() {
    let mut h = Harness::new();
    let mut c = syn_rcvd(&h);

    let action = feed(&mut h, &mut c.tp, ack(IRS - 10, UNA));

    assert_eq!(action, InputAction::DropWithReset(RstReason::OpenPort));
}

#[test]
fn test_rst_in_syn_rcvd_refuses() {
    let mut h = Harness::new();
    let mut c = syn_rcvd(&h);

    let rst = segment(IRS + 1, 0, TcpFlags::RST, 0, &[]);
    feed(&mut h, &mut c.tp, rst);

    assert_eq!(c.tp.state(), TcpState::Closed);
    assert_eq!(c.rcvbuf.lock().error, Some(ConnError::Refused));
}

// ============================================================================
// Test 3: Reset handling
// ============================================================================

#[test]
fn test_rst_in_window_closes_established_connection() {
    let mut h = Harness::new();
    let mut c = established(&h);
    // Something on the reassembly queue and a few timers running.
    let ooo = data(IRS + 1 + 1000, UNA, &[1; 100]);
    feed(&mut h, &mut c.tp, ooo);
    assert_eq!(h.ctx.reass_segments(), 1);
    send_data(&h, &mut c.tp, MSS);
    h.arm(TimerId::Delack, 100);

    let rst = segment(IRS + 1 + 10, 0, TcpFlags::RST, 0, &[]);
    let action = feed(&mut h, &mut c.tp, rst);

    assert_eq!(action, InputAction::DropSilently);
    assert_eq!(c.tp.state(), TcpState::Closed);
    assert!(c.tp.reass.is_empty());
    assert_eq!(h.ctx.reass_segments(), 0);
    assert!(h.timers.borrow().is_empty());
    assert!(h.out.borrow().cancels.contains(&CONN));
    let buf = c.rcvbuf.lock();
    assert_eq!(buf.error, Some(ConnError::Reset));
    assert!(buf.cant_rcv_more);
    drop(buf);
    assert_eq!(stat(&h, TcpStat::Drops), 1);
}

#[test]
fn test_rst_outside_window_is_ignored() {
    let mut h = Harness::new();
    let mut c = established(&h);

    let rst = segment(IRS + 1 + 2 * RCVBUF as u32, 0, TcpFlags::RST, 0, &[]);
    let action = feed(&mut h, &mut c.tp, rst);

    assert_eq!(action, InputAction::DropSilently);
    assert_eq!(c.tp.state(), TcpState::Established);
    assert_eq!(c.rcvbuf.lock().error, None);
}

#[test]
fn test_rst_in_last_ack_closes_quietly() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::LastAck);

    let rst = segment(IRS + 1, 0, TcpFlags::RST, 0, &[]);
    feed(&mut h, &mut c.tp, rst);

    assert_eq!(c.tp.state(), TcpState::Closed);
    assert_eq!(c.rcvbuf.lock().error, None);
}

#[test]
fn test_rst_in_time_wait_is_ignored() {
    let mut h = Harness::new();
    let mut c = established(&h);
    c.tp.conn_mgmt.state = TcpState::TimeWait;
    c.tp.rod.rcv_nxt = IRS + 2;
    c.tp.rod.last_ack_sent = IRS + 2;
    h.arm(TimerId::TwoMsl, 2 * h.ctx.config.msl);

    let rst = segment(IRS + 2, 0, TcpFlags::RST, 0, &[]);
    let action = feed(&mut h, &mut c.tp, rst);

    assert_eq!(action, InputAction::DropSilently);
    assert_eq!(c.tp.state(), TcpState::TimeWait);
    assert_eq!(h.armed(TimerId::TwoMsl), Some(2 * h.ctx.config.msl));
    assert_eq!(c.rcvbuf.lock().error, None);
    assert_eq!(stat(&h, TcpStat::Drops), 0);
}

#[test]
fn test_syn_in_window_resets_connection() {
    let mut h = Harness::new();
    let mut c = established(&h);

    let syn = segment(IRS + 1, UNA, TcpFlags::SYN | TcpFlags::ACK, 65535, &[]);
    let action = feed(&mut h, &mut c.tp, syn);

    assert_eq!(action, InputAction::DropWithReset(RstReason::Unlimited));
    assert_eq!(c.tp.state(), TcpState::Closed);
    assert_eq!(c.rcvbuf.lock().error, Some(ConnError::Reset));
}

// ============================================================================
// Test 4: Closing states
// ============================================================================

#[test]
fn test_fin_in_established_enters_close_wait() {
    let mut h = Harness::new();
    let mut c = established(&h);

    let seg = segment(IRS + 1, UNA, TcpFlags::ACK | TcpFlags::FIN, 65535, &[4; 20]);
    let action = feed(&mut h, &mut c.tp, seg);

    assert_eq!(action, InputAction::Consumed);
    assert_eq!(c.tp.state(), TcpState::CloseWait);
    assert_eq!(c.tp.rod.rcv_nxt, IRS + 1 + 20 + 1);
    assert_eq!(c.rcvbuf.lock().data.len(), 20);
    assert!(c.rcvbuf.lock().cant_rcv_more);
    // A FIN is acked at once.
    assert!(h.out.borrow().responded(CONN));
    assert_eq!(h.armed(TimerId::Delack), None);
}

#[test]
fn test_fin_in_fin_wait_1_enters_closing() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::FinWait1);

    feed(&mut h, &mut c.tp, fin(IRS + 1, UNA));

    assert_eq!(c.tp.state(), TcpState::Closing);
}

#[test]
fn test_ack_of_fin_in_fin_wait_1_enters_fin_wait_2() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::FinWait1);

    feed(&mut h, &mut c.tp, ack(IRS + 1, UNA + 1));

    assert_eq!(c.tp.state(), TcpState::FinWait2);
    assert_eq!(h.armed(TimerId::Rexmt), None);
    assert_eq!(h.armed(TimerId::TwoMsl), None);
}

#[test]
fn test_fin_wait_2_gets_idle_timer_when_receive_side_is_shut() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::FinWait1);
    c.rcvbuf.lock().cant_rcv_more = true;

    feed(&mut h, &mut c.tp, ack(IRS + 1, UNA + 1));

    assert_eq!(c.tp.state(), TcpState::FinWait2);
    assert_eq!(h.armed(TimerId::TwoMsl), Some(h.ctx.config.max_idle));
}

#[test]
fn test_ack_and_fin_together_in_fin_wait_1_enter_time_wait() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::FinWait1);

    feed(&mut h, &mut c.tp, fin(IRS + 1, UNA + 1));

    assert_eq!(c.tp.state(), TcpState::TimeWait);
    assert_eq!(h.armed(TimerId::TwoMsl), Some(2 * h.ctx.config.msl));
}

#[test]
fn test_fin_in_fin_wait_2_enters_time_wait() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::FinWait2);
    c.tp.rod.snd_una = UNA + 1;
    h.timers.borrow_mut().clear();

    feed(&mut h, &mut c.tp, fin(IRS + 1, UNA + 1));

    assert_eq!(c.tp.state(), TcpState::TimeWait);
    assert_eq!(c.tp.rod.rcv_nxt, IRS + 2);
    assert_eq!(h.armed(TimerId::TwoMsl), Some(2 * h.ctx.config.msl));
    assert_eq!(h.armed(TimerId::Keep), None);
    assert_eq!(h.armed(TimerId::Delack), None);
    assert!(h.out.borrow().responded(CONN));
}

#[test]
fn test_ack_of_fin_in_closing_enters_time_wait() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::Closing);
    c.tp.rod.rcv_nxt = IRS + 2;

    feed(&mut h, &mut c.tp, ack(IRS + 2, UNA + 1));

    assert_eq!(c.tp.state(), TcpState::TimeWait);
    assert_eq!(h.armed(TimerId::Rexmt), None);
}

#[test]
fn test_ack_of_fin_in_last_ack_closes() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::LastAck);
    c.tp.rod.rcv_nxt = IRS + 2;

    let action = feed(&mut h, &mut c.tp, ack(IRS + 2, UNA + 1));

    assert_eq!(action, InputAction::DropSilently);
    assert_eq!(c.tp.state(), TcpState::Closed);
    assert_eq!(c.rcvbuf.lock().error, None);
}

#[test]
fn test_retransmitted_fin_in_time_wait_is_acked() {
    let mut h = Harness::new();
    let mut c = established(&h);
    c.tp.conn_mgmt.state = TcpState::TimeWait;
    c.tp.rod.rcv_nxt = IRS + 2;

    let action = feed(&mut h, &mut c.tp, fin(IRS + 1, UNA));

    assert_eq!(action, InputAction::Consumed);
    assert_eq!(c.tp.state(), TcpState::TimeWait);
    assert_eq!(c.tp.rod.rcv_nxt, IRS + 2);
    assert!(h.out.borrow().responded(CONN));
}

#[test]
fn test_data_after_close_resets() {
    let mut h = Harness::new();
    let mut c = fin_sent(&h, TcpState::FinWait1);
    c.tp.conn_mgmt.no_fd_ref = true;

    let action = feed(&mut h, &mut c.tp, data(IRS + 1, UNA, &[1; 10]));

    assert_eq!(action, InputAction::DropWithReset(RstReason::Unlimited));
    assert_eq!(c.tp.state(), TcpState::Closed);
    assert_eq!(stat(&h, TcpStat::RcvAfterClose), 1);
}

// ============================================================================
// Test 5: Timers
// ============================================================================

#[test]
fn test_delack_timer_sends_owed_ack() {
    let mut h = Harness::new();
    let mut c = established(&h);
    feed(&mut h, &mut c.tp, data(IRS + 1, UNA, &[1; 10]));
    assert!(h.armed(TimerId::Delack).is_some());
    h.timers.borrow_mut().remove(&(CONN, TimerId::Delack));

    assert!(!TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Delack));

    assert_eq!(h.out.borrow().acks_now, vec![CONN]);
    assert_eq!(c.tp.rod.last_ack_sent, IRS + 1 + 10);
    assert_eq!(stat(&h, TcpStat::DelAck), 1);
}

#[test]
fn test_delack_timer_without_owed_ack_does_nothing() {
    let mut h = Harness::new();
    let mut c = established(&h);

    TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Delack);

    assert!(h.out.borrow().acks_now.is_empty());
    assert_eq!(stat(&h, TcpStat::DelAck), 0);
}

#[test]
fn test_keepalive_probes_then_drops() {
    let cfg = TcpConfig { keep_idle: 1000, max_idle: 800, ..TcpConfig::default() };
    let mut h = Harness::with_config(cfg);
    let mut c = established(&h);

    h.ctx.tick(1000);
    assert!(!TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Keep));
    assert_eq!(h.out.borrow().acks_now, vec![CONN]);
    assert_eq!(h.armed(TimerId::Keep), Some(100));

    h.ctx.tick(800);
    assert!(TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Keep));
    assert_eq!(c.tp.state(), TcpState::Closed);
    assert_eq!(stat(&h, TcpStat::KeepDrop), 1);
    assert_eq!(h.out.borrow().resets.len(), 1);
    assert_eq!(c.rcvbuf.lock().error, Some(ConnError::TimedOut));
}

#[test]
fn test_segment_restarts_keepalive_clock() {
    let cfg = TcpConfig { keep_idle: 1000, max_idle: 800, ..TcpConfig::default() };
    let mut h = Harness::with_config(cfg);
    let mut c = established(&h);

    h.ctx.tick(1500);
    feed(&mut h, &mut c.tp, ack(IRS + 1, UNA));
    assert_eq!(c.tp.conn_mgmt.rcvtime, h.ctx.ticks);
    assert_eq!(h.armed(TimerId::Keep), Some(1000));

    h.ctx.tick(1000);
    assert!(!TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Keep));
    assert_eq!(c.tp.state(), TcpState::Established);
}

#[test]
fn test_time_wait_expiry_closes() {
    let mut h = Harness::new();
    let mut c = established(&h);
    c.tp.conn_mgmt.state = TcpState::TimeWait;

    assert!(TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::TwoMsl));
    assert_eq!(c.tp.state(), TcpState::Closed);
    assert!(h.out.borrow().resets.is_empty());
}

#[test]
fn test_fin_wait_2_timer_waits_while_peer_is_recent() {
    let cfg = TcpConfig { max_idle: 800, ..TcpConfig::default() };
    let mut h = Harness::with_config(cfg);
    let mut c = established(&h);
    c.tp.conn_mgmt.state = TcpState::FinWait2;

    h.ctx.tick(300);
    assert!(!TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::TwoMsl));
    assert_eq!(h.armed(TimerId::TwoMsl), Some(100));

    h.ctx.tick(600);
    assert!(TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::TwoMsl));
}

#[test]
fn test_persist_timer_asks_for_output() {
    let mut h = Harness::new();
    let mut c = established(&h);

    TcpTimers::fire(&mut c.tp, &mut h.ctx, TimerId::Persist);

    assert_eq!(h.out.borrow().outputs, vec![CONN]);
}
