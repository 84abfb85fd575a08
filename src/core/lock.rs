//! Purpose: Ping-pong handoff lock over the segment's shared state word.
//! Exports: `Side`, `LockState`, `LockPolicy`, `ChannelLock`.
//! Role: The only synchronization between the two processes sharing a segment.
//! Invariants: `write_unlock` never returns the segment to `Unlocked`; it hands reading to the peer.
//! Invariants: A committed message length is published before the state word changes hands.
//! Invariants: `Freed` is terminal; every lock call observing it fails with `Closed`.
use std::fmt;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use crate::core::error::{Error, ErrorKind};
use crate::core::notify::{self, NotifyError, WaitOutcome, WakeSemaphore};
use crate::core::segment::ControlBlock;

/// Which end of the channel a process is.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Side {
    /// The orchestrator; creates the segment.
    Host,
    /// The DCC-hosted process; attaches to it.
    Plugin,
}

impl Side {
    pub fn counterpart(self) -> Side {
        match self {
            Side::Host => Side::Plugin,
            Side::Plugin => Side::Host,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Host => "host",
            Side::Plugin => "plugin",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockState {
    Unlocked,
    /// The side is writing, or owns the right to write next.
    WriteLocked(Side),
    /// A committed message is waiting for (or being read by) the side.
    ReadLocked(Side),
    /// Left by `read_unlock`: the previous writer may write again, and the
    /// reader may claim the grant to reply.
    WriteGranted(Side),
    Freed,
}

const STATE_UNLOCKED: u32 = 0;
const STATE_WRITE_HOST: u32 = 1;
const STATE_WRITE_PLUGIN: u32 = 2;
const STATE_READ_HOST: u32 = 3;
const STATE_READ_PLUGIN: u32 = 4;
const STATE_GRANT_HOST: u32 = 5;
const STATE_GRANT_PLUGIN: u32 = 6;
const STATE_FREED: u32 = u32::MAX;

impl LockState {
    pub fn encode(self) -> u32 {
        match self {
            LockState::Unlocked => STATE_UNLOCKED,
            LockState::WriteLocked(Side::Host) => STATE_WRITE_HOST,
            LockState::WriteLocked(Side::Plugin) => STATE_WRITE_PLUGIN,
            LockState::ReadLocked(Side::Host) => STATE_READ_HOST,
            LockState::ReadLocked(Side::Plugin) => STATE_READ_PLUGIN,
            LockState::WriteGranted(Side::Host) => STATE_GRANT_HOST,
            LockState::WriteGranted(Side::Plugin) => STATE_GRANT_PLUGIN,
            LockState::Freed => STATE_FREED,
        }
    }

    pub fn decode(raw: u32) -> Result<Self, Error> {
        let state = match raw {
            STATE_UNLOCKED => LockState::Unlocked,
            STATE_WRITE_HOST => LockState::WriteLocked(Side::Host),
            STATE_WRITE_PLUGIN => LockState::WriteLocked(Side::Plugin),
            STATE_READ_HOST => LockState::ReadLocked(Side::Host),
            STATE_READ_PLUGIN => LockState::ReadLocked(Side::Plugin),
            STATE_GRANT_HOST => LockState::WriteGranted(Side::Host),
            STATE_GRANT_PLUGIN => LockState::WriteGranted(Side::Plugin),
            STATE_FREED => LockState::Freed,
            other => {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!("unknown lock state word {other:#x}")));
            }
        };
        Ok(state)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Unlocked => f.write_str("unlocked"),
            LockState::WriteLocked(side) => write!(f, "write-locked({side})"),
            LockState::ReadLocked(side) => write!(f, "read-locked({side})"),
            LockState::WriteGranted(side) => write!(f, "write-granted({side})"),
            LockState::Freed => f.write_str("freed"),
        }
    }
}

/// How a lock call waits for the counterpart.
#[derive(Clone, Copy, Debug)]
pub struct LockPolicy {
    /// `None` blocks until the state allows the transition or the segment is freed.
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Use named semaphores to wake up early when the peer hands over.
    pub notify: bool,
}

impl LockPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_millis(5),
            notify: true,
        }
    }
}

pub struct ChannelLock {
    side: Side,
    policy: LockPolicy,
    names: [String; 2],
    wake_self: Option<WakeSemaphore>,
    wake_peer: Option<WakeSemaphore>,
    /// State word the current write lock was claimed from.
    claimed_from: u32,
}

impl ChannelLock {
    /// Semaphore names are derived from `segment_path`, which must exist.
    pub fn new(side: Side, policy: LockPolicy, segment_path: &Path) -> Self {
        let self_name = notify::wake_semaphore_name(segment_path, side);
        let peer_name = notify::wake_semaphore_name(segment_path, side.counterpart());
        let (wake_self, wake_peer) = if policy.notify {
            (
                notify::open_named(&self_name).ok(),
                notify::open_named(&peer_name).ok(),
            )
        } else {
            (None, None)
        };
        Self {
            side,
            policy,
            names: [self_name, peer_name],
            wake_self,
            wake_peer,
            claimed_from: STATE_UNLOCKED,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    pub fn state(&self, control: &ControlBlock<'_>) -> Result<LockState, Error> {
        LockState::decode(control.state().load(Ordering::Acquire))
    }

    /// Returns `Ok(false)` when the policy timeout expires first.
    pub fn write_lock(&mut self, control: &ControlBlock<'_>) -> Result<bool, Error> {
        let side = self.side;
        let claimed = self.acquire(control, "write", |state| match state {
            LockState::Unlocked | LockState::WriteGranted(_) => Some(true),
            LockState::WriteLocked(owner) if owner == side => Some(false),
            _ => None,
        })?;
        let Some(previous) = claimed else {
            return Ok(false);
        };
        self.claimed_from = previous;
        tracing::debug!(side = %side, "write lock acquired");
        Ok(true)
    }

    /// Gives up a write lock without publishing anything. The state word goes
    /// back to what it was before `write_lock`, so a peer holding a write
    /// grant keeps it.
    pub fn abandon_write(&self, control: &ControlBlock<'_>) -> Result<(), Error> {
        let held = LockState::WriteLocked(self.side).encode();
        if self.claimed_from != held {
            self.transition(control, held, self.claimed_from, "abandon_write")?;
            self.wake_peer();
        } else {
            self.expect_state(control, held, "abandon_write")?;
        }
        tracing::debug!(side = %self.side, "write lock abandoned");
        Ok(())
    }

    /// Publishes `message_len` bytes and hands reading to the peer. Returns the new sequence.
    pub fn write_unlock(&self, control: &ControlBlock<'_>, message_len: u64) -> Result<u64, Error> {
        let held = LockState::WriteLocked(self.side).encode();
        self.expect_state(control, held, "write_unlock")?;
        control.message_len().store(message_len, Ordering::Release);
        let seq = control.seq().fetch_add(1, Ordering::AcqRel) + 1;
        let next = LockState::ReadLocked(self.side.counterpart()).encode();
        self.transition(control, held, next, "write_unlock")?;
        self.wake_peer();
        tracing::debug!(side = %self.side, seq, message_len, "write lock handed to peer");
        Ok(seq)
    }

    pub fn read_lock(&mut self, control: &ControlBlock<'_>) -> Result<bool, Error> {
        let side = self.side;
        let acquired = self
            .acquire(control, "read", |state| match state {
                LockState::ReadLocked(owner) if owner == side => Some(false),
                _ => None,
            })?
            .is_some();
        if acquired {
            tracing::debug!(side = %side, "read lock acquired");
        }
        Ok(acquired)
    }

    pub fn read_unlock(&self, control: &ControlBlock<'_>) -> Result<(), Error> {
        let held = LockState::ReadLocked(self.side).encode();
        let next = LockState::WriteGranted(self.side.counterpart()).encode();
        self.transition(control, held, next, "read_unlock")?;
        self.wake_peer();
        tracing::debug!(side = %self.side, "read lock released");
        Ok(())
    }

    /// Forces the terminal `Freed` state and wakes both sides.
    pub fn free(&self, control: &ControlBlock<'_>) {
        control.state().store(STATE_FREED, Ordering::Release);
        self.wake_peer();
        if let Some(sem) = &self.wake_self {
            let _ = sem.post();
        }
        tracing::debug!(side = %self.side, "channel freed");
    }

    pub(crate) fn unlink_semaphores(&self) {
        for name in &self.names {
            notify::unlink_named(name);
        }
    }

    /// Waits until `admit` accepts the current state and returns the state word
    /// it was admitted from, or `None` on timeout. `Some(true)` from `admit`
    /// means the state must be claimed with a compare-exchange; `Some(false)`
    /// means it is already ours.
    fn acquire(
        &mut self,
        control: &ControlBlock<'_>,
        what: &str,
        admit: impl Fn(LockState) -> Option<bool>,
    ) -> Result<Option<u32>, Error> {
        let deadline = self.policy.timeout.map(|timeout| Instant::now() + timeout);
        let claimed = LockState::WriteLocked(self.side).encode();
        loop {
            let raw = control.state().load(Ordering::Acquire);
            let state = LockState::decode(raw)?;
            if state == LockState::Freed {
                return Err(Error::new(ErrorKind::Closed)
                    .with_message(format!("{what} lock on a freed channel"))
                    .with_hint("The counterpart released the session."));
            }
            match admit(state) {
                Some(false) => return Ok(Some(raw)),
                Some(true) => {
                    if control
                        .state()
                        .compare_exchange(raw, claimed, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return Ok(Some(raw));
                    }
                    continue;
                }
                None => {}
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    tracing::debug!(side = %self.side, %state, "{what} lock timed out");
                    return Ok(None);
                }
            }
            self.wait(wait_interval(deadline, self.policy.poll_interval));
        }
    }

    fn wait(&mut self, wait_for: Duration) {
        if let Some(sem) = &self.wake_self {
            match sem.wait(wait_for) {
                Ok(WaitOutcome::Signaled) | Ok(WaitOutcome::TimedOut) => {}
                Err(NotifyError::Unavailable) => {
                    self.wake_self = None;
                    std::thread::sleep(wait_for);
                }
                Err(NotifyError::Io(err)) => {
                    tracing::debug!(error = %err, "wake semaphore wait failed");
                    std::thread::sleep(wait_for);
                }
            }
        } else {
            std::thread::sleep(wait_for);
        }
    }

    fn wake_peer(&self) {
        if let Some(sem) = &self.wake_peer {
            if let Err(NotifyError::Io(err)) = sem.post() {
                tracing::debug!(error = %err, "wake semaphore post failed");
            }
        }
    }

    fn expect_state(&self, control: &ControlBlock<'_>, held: u32, what: &str) -> Result<(), Error> {
        let raw = control.state().load(Ordering::Acquire);
        if raw == held {
            return Ok(());
        }
        Err(self.not_held(raw, what))
    }

    fn transition(
        &self,
        control: &ControlBlock<'_>,
        held: u32,
        next: u32,
        what: &str,
    ) -> Result<(), Error> {
        control
            .state()
            .compare_exchange(held, next, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|raw| self.not_held(raw, what))
    }

    fn not_held(&self, raw: u32, what: &str) -> Error {
        match LockState::decode(raw) {
            Ok(LockState::Freed) => Error::new(ErrorKind::Closed)
                .with_message(format!("{what} on a freed channel")),
            Ok(state) => Error::new(ErrorKind::Usage)
                .with_message(format!("{what} by {} while {state}", self.side))
                .with_hint("Unlock only after the matching lock call returned true."),
            Err(err) => err,
        }
    }
}

fn wait_interval(deadline: Option<Instant>, poll_interval: Duration) -> Duration {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Duration::from_millis(0);
            }
            (deadline - now).min(poll_interval)
        }
        None => poll_interval,
    }
}

#[cfg(test)]
mod tests {
    use super::{ChannelLock, LockPolicy, LockState, Side};
    use crate::core::error::ErrorKind;
    use crate::core::segment::{SegmentOptions, SharedSegment};
    use std::path::Path;
    use std::time::Duration;

    fn quick_policy() -> LockPolicy {
        LockPolicy {
            timeout: Some(Duration::from_millis(30)),
            poll_interval: Duration::from_millis(1),
            notify: false,
        }
    }

    fn scratch_segment(dir: &Path) -> SharedSegment {
        SharedSegment::create(dir.join("X-Y"), SegmentOptions::new(64 * 1024)).expect("create")
    }

    #[test]
    fn state_word_round_trips_every_state() {
        let states = [
            LockState::Unlocked,
            LockState::WriteLocked(Side::Host),
            LockState::WriteLocked(Side::Plugin),
            LockState::ReadLocked(Side::Host),
            LockState::ReadLocked(Side::Plugin),
            LockState::WriteGranted(Side::Host),
            LockState::WriteGranted(Side::Plugin),
            LockState::Freed,
        ];
        for state in states {
            assert_eq!(LockState::decode(state.encode()).expect("decode"), state);
        }
        let err = LockState::decode(42).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn write_lock_is_repeatable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = scratch_segment(dir.path());
        let control = segment.control();
        let mut host = ChannelLock::new(Side::Host, quick_policy(), segment.path());

        assert!(host.write_lock(&control).expect("lock"));
        assert!(host.write_lock(&control).expect("lock again"));
        assert_eq!(
            host.state(&control).expect("state"),
            LockState::WriteLocked(Side::Host)
        );
    }

    #[test]
    fn writer_waits_for_reader_before_writing_again() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = scratch_segment(dir.path());
        let control = segment.control();
        let mut host = ChannelLock::new(Side::Host, quick_policy(), segment.path());
        let mut plugin = ChannelLock::new(Side::Plugin, quick_policy(), segment.path());

        assert!(host.write_lock(&control).expect("lock"));
        assert_eq!(host.write_unlock(&control, 12).expect("unlock"), 1);
        assert!(!host.write_lock(&control).expect("blocked"));
        assert!(!host.read_lock(&control).expect("not for host"));

        assert!(plugin.read_lock(&control).expect("read"));
        assert_eq!(control.snapshot().message_len, 12);
        plugin.read_unlock(&control).expect("read unlock");

        assert!(host.write_lock(&control).expect("lock after read"));
    }

    #[test]
    fn reader_can_claim_the_grant_to_reply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = scratch_segment(dir.path());
        let control = segment.control();
        let mut host = ChannelLock::new(Side::Host, quick_policy(), segment.path());
        let mut plugin = ChannelLock::new(Side::Plugin, quick_policy(), segment.path());

        assert!(host.write_lock(&control).expect("lock"));
        host.write_unlock(&control, 4).expect("unlock");
        assert!(plugin.read_lock(&control).expect("read"));
        plugin.read_unlock(&control).expect("read unlock");
        assert_eq!(
            plugin.state(&control).expect("state"),
            LockState::WriteGranted(Side::Host)
        );

        assert!(plugin.write_lock(&control).expect("reply"));
        assert!(!host.write_lock(&control).expect("taken"));
        assert!(!host.read_lock(&control).expect("not yet"));
        plugin.write_unlock(&control, 9).expect("unlock reply");
        assert!(host.read_lock(&control).expect("read reply"));
        assert_eq!(control.snapshot().message_len, 9);
        assert_eq!(control.snapshot().seq, 2);
    }

    #[test]
    fn abandoned_write_returns_the_grant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = scratch_segment(dir.path());
        let control = segment.control();
        let mut host = ChannelLock::new(Side::Host, quick_policy(), segment.path());
        let mut plugin = ChannelLock::new(Side::Plugin, quick_policy(), segment.path());

        assert!(host.write_lock(&control).expect("lock"));
        host.write_unlock(&control, 4).expect("unlock");
        assert!(plugin.read_lock(&control).expect("read"));
        plugin.read_unlock(&control).expect("read unlock");

        assert!(plugin.write_lock(&control).expect("claim grant"));
        plugin.abandon_write(&control).expect("abandon");
        assert_eq!(
            plugin.state(&control).expect("state"),
            LockState::WriteGranted(Side::Host)
        );
        assert_eq!(control.snapshot().seq, 1);
        assert!(host.write_lock(&control).expect("host keeps its turn"));

        let err = plugin.abandon_write(&control).expect_err("not held");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn unlock_without_lock_is_a_usage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = scratch_segment(dir.path());
        let control = segment.control();
        let host = ChannelLock::new(Side::Host, quick_policy(), segment.path());

        let err = host.write_unlock(&control, 1).expect_err("not held");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = host.read_unlock(&control).expect_err("not held");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(control.snapshot().message_len, 0);
    }

    #[test]
    fn free_wakes_a_blocked_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = scratch_segment(dir.path());
        let path = segment.path().to_path_buf();

        let waiter = std::thread::spawn(move || {
            let attached = SharedSegment::attach(&path).expect("attach");
            let policy = LockPolicy {
                timeout: None,
                poll_interval: Duration::from_millis(1),
                notify: false,
            };
            let mut plugin = ChannelLock::new(Side::Plugin, policy, attached.path());
            plugin
                .read_lock(&attached.control())
                .expect_err("freed while waiting")
                .kind()
        });

        std::thread::sleep(Duration::from_millis(20));
        let host = ChannelLock::new(Side::Host, quick_policy(), segment.path());
        host.free(&segment.control());

        assert_eq!(waiter.join().expect("join"), ErrorKind::Closed);
        assert_eq!(
            host.state(&segment.control()).expect("state"),
            LockState::Freed
        );
    }

    #[test]
    fn threads_alternate_through_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let segment = scratch_segment(dir.path());
        let path = segment.path().to_path_buf();
        let policy = LockPolicy {
            timeout: Some(Duration::from_secs(5)),
            ..LockPolicy::default()
        };

        let reader = std::thread::spawn(move || {
            let attached = SharedSegment::attach(&path).expect("attach");
            let control = attached.control();
            let mut plugin = ChannelLock::new(Side::Plugin, policy, attached.path());
            let mut seen = Vec::new();
            for _ in 0..5 {
                assert!(plugin.read_lock(&control).expect("read"));
                seen.push(control.snapshot().message_len);
                plugin.read_unlock(&control).expect("read unlock");
            }
            seen
        });

        let control = segment.control();
        let mut host = ChannelLock::new(Side::Host, policy, segment.path());
        for len in 1..=5u64 {
            assert!(host.write_lock(&control).expect("write"));
            host.write_unlock(&control, len).expect("write unlock");
        }

        assert_eq!(reader.join().expect("join"), vec![1, 2, 3, 4, 5]);
        host.unlink_semaphores();
    }
}
