//! Purpose: Session identity and the attached segment, plus lock brackets over it.
//! Exports: `SessionTokens`, `SessionOptions`, `Session`, `SessionInfo`, `WriteBracket`, `ReadBracket`.
//! Role: The handle both processes hold for the lifetime of one exchange.
//! Invariants: Tokens are immutable once the session exists.
//! Invariants: `release` is idempotent; only the creating session deletes the backing file.
//! Invariants: A message becomes visible to the peer only through `WriteBracket::unlock`.
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use getrandom::fill as fill_random;

use crate::core::codec::{Reader, Writer};
use crate::core::error::{Error, ErrorKind};
use crate::core::lock::{ChannelLock, LockPolicy, LockState, Side};
use crate::core::notify;
use crate::core::segment::{ControlBlock, DEFAULT_SEGMENT_SIZE, SegmentOptions, SharedSegment};

pub const DEFAULT_DRAIN: Duration = Duration::from_secs(1);

/// The two correlation tokens naming one session, in orchestrator order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionTokens {
    first: String,
    second: String,
}

impl SessionTokens {
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Result<Self, Error> {
        let first = first.into();
        let second = second.into();
        validate_token(&first)?;
        validate_token(&second)?;
        Ok(Self { first, second })
    }

    /// Two fresh `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}` tokens.
    pub fn generate() -> Result<Self, Error> {
        Self::new(generate_guid()?, generate_guid()?)
    }

    /// Reads the pair that follows `--` on a plugin command line. The
    /// orchestrator passes its own token last, so the pair is swapped back.
    pub fn from_plugin_args<I, S>(args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut trailing = args
            .into_iter()
            .skip_while(|arg| arg.as_ref() != "--")
            .skip(1);
        let plugin_token = trailing.next();
        let host_token = trailing.next();
        match (plugin_token, host_token) {
            (Some(plugin), Some(host)) => Self::new(host.as_ref(), plugin.as_ref()),
            _ => Err(Error::new(ErrorKind::Usage)
                .with_message("missing session tokens")
                .with_hint("Pass two tokens after `--`.")),
        }
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }

    pub fn segment_name(&self) -> String {
        format!("{}-{}", self.first, self.second)
    }

    /// The trailing arguments a plugin process should be launched with.
    pub fn plugin_args(&self) -> [String; 3] {
        ["--".to_string(), self.second.clone(), self.first.clone()]
    }
}

impl fmt::Display for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.first, self.second)
    }
}

fn validate_token(token: &str) -> Result<(), Error> {
    if token.is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("session token is empty"));
    }
    if token.contains(['/', '\\', '\0']) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid session token: {token:?}"))
            .with_hint("Tokens may not contain path separators or NUL."));
    }
    Ok(())
}

fn generate_guid() -> Result<String, Error> {
    let mut bytes = [0u8; 16];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal).with_message(format!("failed to generate token: {err}"))
    })?;
    let hex: String = bytes.iter().map(|byte| format!("{byte:02X}")).collect();
    Ok(format!(
        "{{{}-{}-{}-{}-{}}}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Total file size including the control header; only used by `create`.
    pub segment_size: u64,
    pub lock: LockPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            lock: LockPolicy::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub path: PathBuf,
    pub tokens: SessionTokens,
    pub side: Side,
    pub owner: bool,
    pub file_size: u64,
    pub capacity: u64,
    pub state: LockState,
    pub message_len: u64,
    pub seq: u64,
}

pub struct Session {
    tokens: SessionTokens,
    side: Side,
    path: PathBuf,
    owner: bool,
    segment: Option<SharedSegment>,
    lock: ChannelLock,
}

impl Session {
    /// Creates the segment as the host; the returned session owns the backing file.
    pub fn create(dir: &Path, tokens: SessionTokens, options: SessionOptions) -> Result<Self, Error> {
        let path = dir.join(tokens.segment_name());
        let segment = SharedSegment::create(&path, SegmentOptions::new(options.segment_size))?;
        let lock = ChannelLock::new(Side::Host, options.lock, segment.path());
        tracing::info!(
            path = %path.display(),
            capacity = segment.capacity(),
            "session created"
        );
        Ok(Self {
            tokens,
            side: Side::Host,
            path,
            owner: true,
            segment: Some(segment),
            lock,
        })
    }

    /// Attaches as the plugin. Fails with `Attach` when the host has not created the segment.
    pub fn attach(dir: &Path, tokens: SessionTokens, options: SessionOptions) -> Result<Self, Error> {
        Self::open(dir, tokens, Side::Plugin, options)
    }

    /// Attaches to an existing segment as either side without taking ownership.
    pub fn open(
        dir: &Path,
        tokens: SessionTokens,
        side: Side,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let path = dir.join(tokens.segment_name());
        let segment = SharedSegment::attach(&path)?;
        let lock = ChannelLock::new(side, options.lock, segment.path());
        tracing::info!(path = %path.display(), %side, "session attached");
        Ok(Self {
            tokens,
            side,
            path,
            owner: false,
            segment: Some(segment),
            lock,
        })
    }

    /// Deletes a segment and its wake semaphores. Returns whether the file existed.
    pub fn destroy(dir: &Path, tokens: &SessionTokens) -> Result<bool, Error> {
        let path = dir.join(tokens.segment_name());
        let existed = path.exists();
        let names = [Side::Host, Side::Plugin].map(|side| notify::wake_semaphore_name(&path, side));
        SharedSegment::remove(&path)?;
        for name in &names {
            notify::unlink_named(name);
        }
        Ok(existed)
    }

    pub fn tokens(&self) -> &SessionTokens {
        &self.tokens
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Leaves the backing file in place on release; `destroy` removes it later.
    pub fn disown(&mut self) {
        self.owner = false;
    }

    pub fn is_released(&self) -> bool {
        self.segment.is_none()
    }

    pub fn state(&self) -> Result<LockState, Error> {
        let segment = self.attached()?;
        self.lock.state(&segment.control())
    }

    pub fn info(&self) -> Result<SessionInfo, Error> {
        let segment = self.attached()?;
        let snapshot = segment.control().snapshot();
        Ok(SessionInfo {
            path: self.path.clone(),
            tokens: self.tokens.clone(),
            side: self.side,
            owner: self.owner,
            file_size: segment.header().file_size,
            capacity: segment.header().capacity,
            state: LockState::decode(snapshot.state)?,
            message_len: snapshot.message_len,
            seq: snapshot.seq,
        })
    }

    /// Waits for write access. `None` means the lock policy timed out.
    pub fn write_lock(&mut self) -> Result<Option<WriteBracket<'_>>, Error> {
        let segment = self
            .segment
            .as_mut()
            .ok_or_else(|| released_error(&self.path))?;
        let (control, payload) = segment.split_mut();
        if !self.lock.write_lock(&control)? {
            return Ok(None);
        }
        Ok(Some(WriteBracket {
            lock: &self.lock,
            control,
            writer: Writer::new(payload),
        }))
    }

    /// Waits for a committed message. `None` means the lock policy timed out.
    pub fn read_lock(&mut self) -> Result<Option<ReadBracket<'_>>, Error> {
        let segment = self
            .segment
            .as_ref()
            .ok_or_else(|| released_error(&self.path))?;
        let control = segment.control();
        if !self.lock.read_lock(&control)? {
            return Ok(None);
        }
        let seq = control.snapshot().seq;
        Ok(Some(ReadBracket {
            lock: &self.lock,
            control,
            reader: Reader::new(segment.message()),
            seq,
            unlocked: false,
        }))
    }

    /// Unbracketed write lock for callers that manage their own cursor.
    pub fn acquire_write(&mut self) -> Result<bool, Error> {
        let segment = self
            .segment
            .as_ref()
            .ok_or_else(|| released_error(&self.path))?;
        self.lock.write_lock(&segment.control())
    }

    pub fn commit_write(&mut self, message_len: u64) -> Result<u64, Error> {
        let segment = self.attached()?;
        if message_len > segment.header().capacity {
            return Err(Error::new(ErrorKind::Overflow)
                .with_message("committed length exceeds segment capacity")
                .with_offset(message_len));
        }
        self.lock.write_unlock(&segment.control(), message_len)
    }

    pub fn acquire_read(&mut self) -> Result<bool, Error> {
        let segment = self
            .segment
            .as_ref()
            .ok_or_else(|| released_error(&self.path))?;
        self.lock.read_lock(&segment.control())
    }

    pub fn release_read(&mut self) -> Result<(), Error> {
        let segment = self.attached()?;
        self.lock.read_unlock(&segment.control())
    }

    /// The whole payload area; only meaningful while holding the write lock.
    pub fn payload_mut(&mut self) -> Result<&mut [u8], Error> {
        let segment = self
            .segment
            .as_mut()
            .ok_or_else(|| released_error(&self.path))?;
        Ok(segment.split_mut().1)
    }

    /// The committed message; only meaningful while holding the read lock.
    pub fn message(&self) -> Result<&[u8], Error> {
        Ok(self.attached()?.message())
    }

    /// Unmaps the segment. The creating session also deletes the file and semaphores.
    pub fn release(&mut self) -> Result<(), Error> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        drop(segment);
        if self.owner {
            SharedSegment::remove(&self.path)?;
            self.lock.unlink_semaphores();
        }
        tracing::info!(path = %self.path.display(), side = %self.side, "session released");
        Ok(())
    }

    /// Marks the channel `Freed` so a waiting peer stops, then releases.
    pub fn free(&mut self) -> Result<(), Error> {
        if let Some(segment) = &self.segment {
            self.lock.free(&segment.control());
        }
        self.release()
    }

    /// Lets the peer finish reading the last message before freeing.
    pub fn free_after(&mut self, drain: Duration) -> Result<(), Error> {
        if !self.is_released() {
            std::thread::sleep(drain);
        }
        self.free()
    }

    fn attached(&self) -> Result<&SharedSegment, Error> {
        self.segment
            .as_ref()
            .ok_or_else(|| released_error(&self.path))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "session release failed");
        }
    }
}

fn released_error(path: &Path) -> Error {
    Error::new(ErrorKind::Closed)
        .with_message("session already released")
        .with_path(path)
}

/// Write access to the payload. Dropping without `unlock` or `abandon` keeps
/// the lock and leaves the partial message invisible to the peer.
pub struct WriteBracket<'s> {
    lock: &'s ChannelLock,
    control: ControlBlock<'s>,
    writer: Writer<'s>,
}

impl WriteBracket<'_> {
    /// Commits everything written so far and hands the segment to the peer.
    pub fn unlock(self) -> Result<u64, Error> {
        let len = self.writer.position() as u64;
        let seq = self.lock.write_unlock(&self.control, len)?;
        tracing::debug!(seq, bytes = len, "message committed");
        Ok(seq)
    }

    /// Drops everything written so far and restores the lock state seen before
    /// `write_lock`.
    pub fn abandon(self) -> Result<(), Error> {
        self.lock.abandon_write(&self.control)
    }
}

impl<'s> Deref for WriteBracket<'s> {
    type Target = Writer<'s>;

    fn deref(&self) -> &Self::Target {
        &self.writer
    }
}

impl DerefMut for WriteBracket<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.writer
    }
}

/// Read access to the committed message. Dropping it performs `read_unlock`.
pub struct ReadBracket<'s> {
    lock: &'s ChannelLock,
    control: ControlBlock<'s>,
    reader: Reader<'s>,
    seq: u64,
    unlocked: bool,
}

impl ReadBracket<'_> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn unlock(mut self) -> Result<(), Error> {
        self.unlocked = true;
        self.lock.read_unlock(&self.control)
    }
}

impl<'s> Deref for ReadBracket<'s> {
    type Target = Reader<'s>;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl DerefMut for ReadBracket<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reader
    }
}

impl Drop for ReadBracket<'_> {
    fn drop(&mut self) {
        if self.unlocked {
            return;
        }
        if let Err(err) = self.lock.read_unlock(&self.control) {
            tracing::warn!(error = %err, "read unlock on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionOptions, SessionTokens};
    use crate::core::error::ErrorKind;
    use crate::core::lock::{LockPolicy, LockState, Side};
    use crate::core::segment::{SegmentOptions, SharedSegment};
    use std::time::Duration;

    fn options(size: u64) -> SessionOptions {
        SessionOptions {
            segment_size: size,
            lock: LockPolicy {
                timeout: Some(Duration::from_millis(30)),
                poll_interval: Duration::from_millis(1),
                notify: false,
            },
        }
    }

    fn tokens() -> SessionTokens {
        SessionTokens::new("X", "Y").expect("tokens")
    }

    #[test]
    fn tokens_reject_path_characters() {
        for bad in ["", "a/b", "a\\b", "a\0b"] {
            let err = SessionTokens::new(bad, "Y").expect_err("invalid");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
        assert_eq!(tokens().segment_name(), "X-Y");
    }

    #[test]
    fn generated_tokens_look_like_braced_guids() {
        let tokens = SessionTokens::generate().expect("generate");
        for token in [tokens.first(), tokens.second()] {
            assert_eq!(token.len(), 38);
            assert!(token.starts_with('{') && token.ends_with('}'));
            assert_eq!(token.matches('-').count(), 4);
        }
        assert_ne!(tokens.first(), tokens.second());
    }

    #[test]
    fn plugin_args_swap_back_to_host_order() {
        let tokens = SessionTokens::from_plugin_args(["blender", "-b", "--", "P", "H"])
            .expect("tokens");
        assert_eq!(tokens.segment_name(), "H-P");
        assert_eq!(tokens.plugin_args(), ["--", "P", "H"]);

        let err = SessionTokens::from_plugin_args(["blender", "--", "only"]).expect_err("short");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn attach_requires_an_existing_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = match Session::attach(dir.path(), tokens(), options(4096)) {
            Ok(_) => panic!("attached to nothing"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Attach);
        assert!(!dir.path().join("X-Y").exists());
    }

    #[test]
    fn bracketed_exchange_between_host_and_plugin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut host = Session::create(dir.path(), tokens(), options(64 * 1024)).expect("create");
        let mut plugin = Session::attach(dir.path(), tokens(), options(0)).expect("attach");

        let mut bracket = host.write_lock().expect("lock").expect("acquired");
        bracket.write_value(7i32).expect("value");
        bracket.write_text("hello").expect("text");
        assert_eq!(bracket.unlock().expect("unlock"), 1);

        let mut bracket = plugin.read_lock().expect("lock").expect("acquired");
        assert_eq!(bracket.seq(), 1);
        assert_eq!(bracket.read_value::<i32>().expect("value"), 7);
        assert_eq!(bracket.read_text().expect("text"), "hello");
        assert!(bracket.is_exhausted());
        bracket.unlock().expect("unlock");

        assert_eq!(host.state().expect("state"), LockState::WriteGranted(Side::Host));
    }

    #[test]
    fn overflow_leaves_previous_state_visible() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut host = Session::create(dir.path(), tokens(), options(4096)).expect("create");
        let mut plugin = Session::attach(dir.path(), tokens(), options(0)).expect("attach");

        {
            let mut bracket = host.write_lock().expect("lock").expect("acquired");
            bracket.write_value(1u8).expect("fits");
            let err = bracket.write_array(&[0f32; 2048]).expect_err("too big");
            assert_eq!(err.kind(), ErrorKind::Overflow);
        }

        let info = host.info().expect("info");
        assert_eq!(info.state, LockState::WriteLocked(Side::Host));
        assert_eq!(info.message_len, 0);
        assert_eq!(info.seq, 0);
        assert!(plugin.read_lock().expect("read").is_none());
    }

    #[test]
    fn dropped_read_bracket_still_unlocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut host = Session::create(dir.path(), tokens(), options(4096)).expect("create");
        let mut plugin = Session::attach(dir.path(), tokens(), options(0)).expect("attach");

        let bracket = host.write_lock().expect("lock").expect("acquired");
        bracket.unlock().expect("unlock");
        drop(plugin.read_lock().expect("read").expect("acquired"));

        assert!(host.write_lock().expect("lock").is_some());
    }

    #[test]
    fn release_is_idempotent_and_owner_removes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("X-Y");
        let mut host = Session::create(dir.path(), tokens(), options(4096)).expect("create");
        let mut plugin = Session::attach(dir.path(), tokens(), options(0)).expect("attach");

        plugin.release().expect("release");
        plugin.release().expect("release twice");
        assert!(path.exists());
        let err = plugin.write_lock().err().expect("released");
        assert_eq!(err.kind(), ErrorKind::Closed);

        host.release().expect("release");
        host.release().expect("release twice");
        assert!(!path.exists());
    }

    #[test]
    fn disowned_segment_outlives_its_creator() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut host = Session::create(dir.path(), tokens(), options(4096)).expect("create");
        host.disown();
        drop(host);
        assert!(dir.path().join("X-Y").exists());
        assert!(Session::destroy(dir.path(), &tokens()).expect("destroy"));
    }

    #[test]
    fn free_closes_the_channel_for_the_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut host = Session::create(dir.path(), tokens(), options(4096)).expect("create");
        let mut plugin = Session::attach(dir.path(), tokens(), options(0)).expect("attach");

        plugin.free_after(Duration::from_millis(1)).expect("free");
        assert!(plugin.is_released());
        let err = host.read_lock().err().expect("freed");
        assert_eq!(err.kind(), ErrorKind::Closed);
    }

    #[test]
    fn destroy_reports_whether_segment_existed() {
        let dir = tempfile::tempdir().expect("tempdir");
        SharedSegment::create(dir.path().join("X-Y"), SegmentOptions::new(4096)).expect("create");
        assert!(Session::destroy(dir.path(), &tokens()).expect("destroy"));
        assert!(!Session::destroy(dir.path(), &tokens()).expect("destroy again"));
    }
}
