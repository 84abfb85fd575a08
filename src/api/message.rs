//! Purpose: Typed send/receive helpers that run one message through the lock brackets.
//! Exports: `Received`, `SessionMessageExt`.
//! Role: The message sequencer; every typed exchange goes write-lock, encode, write-unlock.
//! Invariants: A failed encode leaves the write lock held and the previous message in place.
//! Invariants: Receiving always releases the read lock, including on decode errors.
#![allow(clippy::result_large_err)]

use std::time::Instant;

use serde::Serialize;

use crate::api::export::ExportMessage;
use crate::api::geometry::GeometryRegistry;
use crate::api::import::ImportBundle;
use crate::api::params::ParamsMessage;
use crate::core::codec::{Reader, Writer};
use crate::core::error::Error;
use crate::core::session::Session;

/// Outcome of one receive.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum Received<T> {
    Message(T),
    /// The peer committed a zero-length message or an empty JSON text.
    Empty,
    /// The message could not be parsed; the payload is the parse hint.
    Discarded(String),
    TimedOut,
}

impl<T> Received<T> {
    pub fn into_message(self) -> Option<T> {
        match self {
            Received::Message(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Received::TimedOut)
    }
}

/// Typed exchanges on a session. Sends return the committed sequence number,
/// or `None` when the lock policy timed out before write access was granted.
pub trait SessionMessageExt {
    fn send_export(&mut self, message: &ExportMessage) -> Result<Option<u64>, Error>;
    fn recv_export(&mut self, attribute_count: usize) -> Result<Received<ExportMessage>, Error>;
    fn send_import(
        &mut self,
        bundle: &ImportBundle,
        registry: &GeometryRegistry,
    ) -> Result<Option<u64>, Error>;
    fn recv_import(&mut self, registry: &GeometryRegistry) -> Result<Received<ImportBundle>, Error>;
    fn send_params(
        &mut self,
        message: &ParamsMessage,
        registry: &GeometryRegistry,
    ) -> Result<Option<u64>, Error>;
    fn recv_params(&mut self, registry: &GeometryRegistry) -> Result<Received<ParamsMessage>, Error>;
}

impl SessionMessageExt for Session {
    fn send_export(&mut self, message: &ExportMessage) -> Result<Option<u64>, Error> {
        send_with(self, "export", |writer| message.encode(writer))
    }

    fn recv_export(&mut self, attribute_count: usize) -> Result<Received<ExportMessage>, Error> {
        recv_with(self, "export", |reader| {
            ExportMessage::decode(reader, attribute_count).map(Received::Message)
        })
    }

    fn send_import(
        &mut self,
        bundle: &ImportBundle,
        registry: &GeometryRegistry,
    ) -> Result<Option<u64>, Error> {
        send_with(self, "import", |writer| bundle.encode(writer, registry))
    }

    fn recv_import(&mut self, registry: &GeometryRegistry) -> Result<Received<ImportBundle>, Error> {
        recv_with(self, "import", |reader| ImportBundle::decode(reader, registry))
    }

    fn send_params(
        &mut self,
        message: &ParamsMessage,
        registry: &GeometryRegistry,
    ) -> Result<Option<u64>, Error> {
        send_with(self, "params", |writer| message.encode(writer, registry))
    }

    fn recv_params(&mut self, registry: &GeometryRegistry) -> Result<Received<ParamsMessage>, Error> {
        recv_with(self, "params", |reader| {
            ParamsMessage::decode(reader, registry).map(Received::Message)
        })
    }
}

fn send_with<F>(session: &mut Session, kind: &'static str, encode: F) -> Result<Option<u64>, Error>
where
    F: FnOnce(&mut Writer<'_>) -> Result<(), Error>,
{
    let started = Instant::now();
    let Some(mut bracket) = session.write_lock()? else {
        tracing::debug!(kind, "write lock timed out");
        return Ok(None);
    };
    let waited = started.elapsed();
    if let Err(err) = encode(&mut *bracket) {
        bracket.abandon()?;
        return Err(err);
    }
    let bytes = bracket.position();
    let seq = bracket.unlock()?;
    tracing::info!(
        kind,
        seq,
        bytes,
        wait_ms = waited.as_millis() as u64,
        total_ms = started.elapsed().as_millis() as u64,
        "message sent"
    );
    Ok(Some(seq))
}

fn recv_with<T, F>(session: &mut Session, kind: &'static str, decode: F) -> Result<Received<T>, Error>
where
    F: FnOnce(&mut Reader<'_>) -> Result<Received<T>, Error>,
{
    let started = Instant::now();
    let Some(mut bracket) = session.read_lock()? else {
        tracing::debug!(kind, "read lock timed out");
        return Ok(Received::TimedOut);
    };
    let seq = bracket.seq();
    let received = if bracket.is_exhausted() {
        Received::Empty
    } else {
        match decode(&mut *bracket) {
            Ok(received) => received,
            Err(err) => {
                drop(bracket);
                return Err(err.with_seq(seq));
            }
        }
    };
    bracket.unlock()?;

    let outcome = match &received {
        Received::Message(_) => "message",
        Received::Empty => "empty",
        Received::Discarded(_) => "discarded",
        Received::TimedOut => "timed_out",
    };
    tracing::info!(
        kind,
        seq,
        outcome,
        total_ms = started.elapsed().as_millis() as u64,
        "message received"
    );
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::import::{ImportMessage, ImportParam, ParamValue};
    use crate::core::error::ErrorKind;
    use crate::core::lock::{LockPolicy, LockState, Side};
    use crate::core::session::{SessionOptions, SessionTokens};
    use std::time::Duration;

    fn options() -> SessionOptions {
        SessionOptions {
            segment_size: 64 * 1024,
            lock: LockPolicy::with_timeout(Duration::from_millis(200)),
        }
    }

    fn pair(dir: &std::path::Path, name: &str) -> (Session, Session) {
        let tokens = SessionTokens::new(name, "msg").expect("tokens");
        let host = Session::create(dir, tokens.clone(), options()).expect("create");
        let plugin = Session::attach(dir, tokens, options()).expect("attach");
        (host, plugin)
    }

    #[test]
    fn import_then_export_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut host, mut plugin) = pair(dir.path(), "round");
        let registry = GeometryRegistry::default();

        let bundle = ImportBundle::new(ImportMessage {
            frame: 10,
            params: vec![ImportParam::new("Scale", ParamValue::Value { value: 2.5 })],
            ..ImportMessage::default()
        });
        assert_eq!(host.send_import(&bundle, &registry).expect("send"), Some(1));
        let received = plugin.recv_import(&registry).expect("recv");
        assert_eq!(received, Received::Message(bundle));

        let export = ExportMessage::default();
        assert_eq!(plugin.send_export(&export).expect("send"), Some(2));
        assert_eq!(
            host.recv_export(0).expect("recv"),
            Received::Message(export)
        );
        assert_eq!(host.state().expect("state"), LockState::WriteGranted(Side::Plugin));
    }

    #[test]
    fn zero_length_message_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut host, mut plugin) = pair(dir.path(), "empty");
        let bracket = host.write_lock().expect("lock").expect("granted");
        bracket.unlock().expect("unlock");

        let received = plugin
            .recv_import(&GeometryRegistry::default())
            .expect("recv");
        assert_eq!(received, Received::Empty);
        assert_eq!(plugin.state().expect("state"), LockState::WriteGranted(Side::Host));
    }

    #[test]
    fn receive_times_out_without_a_message() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_host, mut plugin) = pair(dir.path(), "idle");
        assert!(plugin.recv_export(0).expect("recv").is_timed_out());
    }

    #[test]
    fn decode_error_still_releases_the_read_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut host, mut plugin) = pair(dir.path(), "corrupt");
        let mut bracket = host.write_lock().expect("lock").expect("granted");
        bracket.write_value(-1i32).expect("count");
        bracket.unlock().expect("unlock");

        let err = plugin.recv_export(0).expect_err("negative count");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(err.seq(), Some(1));
        assert_eq!(plugin.state().expect("state"), LockState::WriteGranted(Side::Host));
    }

    #[test]
    fn overflowing_reply_leaves_the_grant_with_the_peer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut host, mut plugin) = pair(dir.path(), "overflow");
        let registry = GeometryRegistry::default();
        let bundle = ImportBundle::new(ImportMessage::default());
        host.send_import(&bundle, &registry).expect("send");
        assert!(plugin.recv_import(&registry).expect("recv").into_message().is_some());

        let export = ExportMessage {
            meshes: vec![crate::api::export::MeshData {
                positions: vec![[0.0; 3]; 8 * 1024],
                ..Default::default()
            }],
            instances: Vec::new(),
        };
        let err = plugin.send_export(&export).expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::Overflow);
        assert_eq!(plugin.state().expect("state"), LockState::WriteGranted(Side::Host));
        assert_eq!(host.info().expect("info").seq, 1);

        assert_eq!(host.send_import(&bundle, &registry).expect("send again"), Some(2));
    }
}
