use crate::rdp::{defs::RdpStatus, usrreq::RdpStack};
use anyhow::{Context, Result};
use std::time::{Duration, Instant};

// Number of retransmissions before the connection is reset.
pub const RDP_MAXRXTSHIFT: usize = 8;
// Multiplier of the initial timeout per retransmission. Index 0 is unused.
const RDP_BACKOFF: [u32; RDP_MAXRXTSHIFT + 2] = [0, 1, 2, 4, 8, 16, 32, 64, 64, 64];
const RDP_REXMT_MAX: Duration = Duration::from_secs(32);

impl RdpStack {
    pub fn timer_handler(&mut self) {
        self.timer_handler_at(Instant::now());
    }

    pub fn timer_handler_at(&mut self, now: Instant) {
        let statusmap: Vec<(usize, RdpStatus)> = self
            .table
            .descriptors()
            .into_iter()
            .filter_map(|id| self.table.lookup_by_descriptor(id).map(|conn| (id, conn.status)))
            .collect();
        for (socket_id, status) in statusmap {
            let result = match status {
                RdpStatus::SynSent | RdpStatus::SynRcvd | RdpStatus::Open => self
                    .timer_handler_retransmission(socket_id, now)
                    .context(format!("timer_handler_retransmission failed. (state={})", status)),
                RdpStatus::CloseWait => self
                    .timer_handler_close_wait(socket_id, now)
                    .context("timer_handler_close_wait failed. (state=CLOSE-WAIT)"),
                RdpStatus::Listen | RdpStatus::Closed => Ok(()),
            };
            if let Err(e) = result {
                log::error!("Failed to handle RdpTimer. Err: {:?}", e);
            }
        }
    }

    fn timer_handler_retransmission(&mut self, socket_id: usize, now: Instant) -> Result<()> {
        let Some(conn) = self.table.get_mut(socket_id) else {
            anyhow::bail!("Cannot find connection (id={}).", socket_id);
        };
        if !conn.timer.retransmission.active || !conn.timer.retransmission.is_expired(now) {
            return Ok(());
        }
        if conn.timer.retransmission.is_finished() {
            log::debug!(
                "[{}] Gave up retransmitting after {} attempts and resetting the connection.",
                conn.print_log_prefix(socket_id),
                RDP_MAXRXTSHIFT
            );
            if let Err(e) = self.sink.send_rst(conn) {
                log::warn!("[{}] Failed to send RST. Err: {:?}", conn.print_log_prefix(socket_id), e);
            }
            self.table.remove(socket_id);
            return Ok(());
        }
        match self.sink.send_handler(conn) {
            Ok(sent) => log::debug!(
                "[{}] Retransmitted {} segments. shift={} delta={:?}",
                conn.print_log_prefix(socket_id),
                sent,
                conn.timer.retransmission.rexmt_shift,
                conn.timer.retransmission.delta
            ),
            Err(e) => log::warn!(
                "[{}] Failed to retransmit. shift={} Err: {:?}",
                conn.print_log_prefix(socket_id),
                conn.timer.retransmission.rexmt_shift,
                e
            ),
        }
        conn.timer.retransmission.next(now);
        Ok(())
    }

    fn timer_handler_close_wait(&mut self, socket_id: usize, now: Instant) -> Result<()> {
        let Some(conn) = self.table.get_mut(socket_id) else {
            anyhow::bail!("Cannot find connection (id={}).", socket_id);
        };
        if conn.timer.close_wait.active && conn.timer.close_wait.is_expired(now) {
            conn.status = RdpStatus::Closed;
            log::debug!(
                "[{}] CLOSE-WAIT timer expired, connection removed.",
                conn.print_log_prefix(socket_id)
            );
            self.table.remove(socket_id);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RetransmissionTimer {
    pub active: bool,
    pub rexmt_shift: usize,
    pub base: Duration,
    pub delta: Duration,
    pub expire_at: Instant,
}

impl RetransmissionTimer {
    pub fn new() -> Self {
        Self {
            active: false,
            rexmt_shift: 0,
            base: Duration::ZERO,
            delta: Duration::ZERO,
            expire_at: Instant::now(),
        }
    }

    pub fn init(&mut self) {
        self.active = false;
        self.rexmt_shift = 0;
    }

    pub fn fire(&mut self, now: Instant, base: Duration) {
        self.active = true;
        self.rexmt_shift = 0;
        self.base = base;
        self.next(now);
        log::trace!(
            "Retransmission timer is fired. MAX={} initial delta={:?}",
            RDP_MAXRXTSHIFT,
            self.delta
        );
    }

    pub fn next(&mut self, now: Instant) {
        self.rexmt_shift += 1;
        let factor = RDP_BACKOFF[self.rexmt_shift.min(RDP_MAXRXTSHIFT + 1)];
        self.delta = self.base.saturating_mul(factor).min(RDP_REXMT_MAX);
        self.expire_at = now + self.delta;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expire_at
    }

    // rexmt_shift counts the original send, so the last retry ran at RDP_MAXRXTSHIFT + 1.
    pub fn is_finished(&self) -> bool {
        self.rexmt_shift > RDP_MAXRXTSHIFT
    }
}

#[derive(Debug)]
pub struct CloseWaitTimer {
    pub active: bool,
    pub expire_at: Instant, // closewait deadline
}

impl CloseWaitTimer {
    pub fn new() -> Self {
        Self {
            active: false,
            expire_at: Instant::now(),
        }
    }

    pub fn fire(&mut self, now: Instant, duration: Duration) {
        self.active = true;
        self.expire_at = now + duration;
        log::trace!("CLOSE-WAIT timer is fired. interval={:?}", duration);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expire_at
    }
}

#[derive(Debug)]
pub struct RdpTimer {
    pub retransmission: RetransmissionTimer,
    pub close_wait: CloseWaitTimer,
}

impl RdpTimer {
    pub fn new() -> Self {
        Self {
            retransmission: RetransmissionTimer::new(),
            close_wait: CloseWaitTimer::new(),
        }
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotone_and_bounded() {
        let now = Instant::now();
        let mut timer = RetransmissionTimer::new();
        timer.fire(now, Duration::from_millis(500));
        let mut last = timer.delta;
        assert_eq!(last, Duration::from_millis(500));
        let mut retries = 0;
        while !timer.is_finished() {
            timer.next(now);
            assert!(timer.delta >= last);
            assert!(timer.delta <= RDP_REXMT_MAX);
            last = timer.delta;
            retries += 1;
        }
        assert_eq!(retries, RDP_MAXRXTSHIFT);
    }

    #[test]
    fn test_retransmission_expiry() {
        let now = Instant::now();
        let mut timer = RetransmissionTimer::new();
        timer.fire(now, Duration::from_millis(100));
        assert!(!timer.is_expired(now + Duration::from_millis(99)));
        assert!(timer.is_expired(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_close_wait_expiry() {
        let now = Instant::now();
        let mut timer = CloseWaitTimer::new();
        timer.fire(now, Duration::from_secs(10));
        assert!(!timer.is_expired(now + Duration::from_secs(9)));
        assert!(timer.is_expired(now + Duration::from_secs(10)));
    }
}
