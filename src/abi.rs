//! Purpose: C ABI bridge for the DCC-side plugin and native orchestrators.
//! Exports: `am_*` session, lock, frame, and error functions.
//! Role: Stable ABI surface; one opaque handle per attached session.
//! Invariants: Opaque handles; explicit free functions; errors carry `to_exit_code` kinds.
//! Invariants: Frames returned by `am_read` point into the mapping and stay valid until `am_read_unlock`.
//! Notes: Lock calls return 1 when granted, 0 on policy timeout, -1 on error.
#![allow(clippy::result_large_err)]
#![allow(non_camel_case_types)]

use crate::api::{
    Error, ErrorKind, LockPolicy, Reader, Session, SessionOptions, SessionTokens, Side, Writer,
    to_exit_code,
};
use crate::segment_paths::resolve_segment_dir;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::ptr;
use std::time::Duration;

#[repr(C)]
pub struct am_session {
    session: Session,
    write_pos: usize,
    read_pos: usize,
    writing: bool,
    reading: bool,
}

#[repr(C)]
pub struct am_error {
    kind: i32,
    message: *mut c_char,
    hint: *mut c_char,
    path: *mut c_char,
    seq: u64,
    offset: u64,
    has_seq: u8,
    has_offset: u8,
}

/// Creates the segment as the host side. `dir` may be null for the default directory;
/// `segment_size` 0 selects the default; a negative `timeout_ms` blocks forever.
#[unsafe(no_mangle)]
pub extern "C" fn am_init(
    dir: *const c_char,
    first: *const c_char,
    second: *const c_char,
    segment_size: u64,
    timeout_ms: i64,
    out_session: *mut *mut am_session,
    out_err: *mut *mut am_error,
) -> i32 {
    let mut options = session_options(timeout_ms);
    if segment_size > 0 {
        options.segment_size = segment_size;
    }
    open_handle(dir, first, second, Open::Create, options, out_session, out_err)
}

/// Attaches the plugin side. Tokens are given in orchestrator order.
#[unsafe(no_mangle)]
pub extern "C" fn am_attach(
    dir: *const c_char,
    first: *const c_char,
    second: *const c_char,
    timeout_ms: i64,
    out_session: *mut *mut am_session,
    out_err: *mut *mut am_error,
) -> i32 {
    let options = session_options(timeout_ms);
    open_handle(dir, first, second, Open::Attach, options, out_session, out_err)
}

/// Marks the channel freed, releases the mapping, and destroys the handle.
#[unsafe(no_mangle)]
pub extern "C" fn am_free(session: *mut am_session) {
    if session.is_null() {
        return;
    }
    let mut handle = unsafe { Box::from_raw(session) };
    if let Err(err) = handle.session.free() {
        tracing::warn!(error = %err, "am_free failed to release session");
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn am_write_lock(session: *mut am_session, out_err: *mut *mut am_error) -> i32 {
    let handle = match borrow_session(session, out_err) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    match handle.session.acquire_write() {
        Ok(true) => {
            handle.writing = true;
            handle.write_pos = 0;
            1
        }
        Ok(false) => 0,
        Err(err) => fail(out_err, err),
    }
}

/// Commits the frames written since `am_write_lock`; the new sequence is stored in `out_seq`.
#[unsafe(no_mangle)]
pub extern "C" fn am_write_unlock(
    session: *mut am_session,
    out_seq: *mut u64,
    out_err: *mut *mut am_error,
) -> i32 {
    let handle = match borrow_session(session, out_err) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    if !handle.writing {
        return fail(out_err, not_locked("write"));
    }
    match handle.session.commit_write(handle.write_pos as u64) {
        Ok(seq) => {
            handle.writing = false;
            handle.write_pos = 0;
            if !out_seq.is_null() {
                unsafe {
                    *out_seq = seq;
                }
            }
            0
        }
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn am_read_lock(session: *mut am_session, out_err: *mut *mut am_error) -> i32 {
    let handle = match borrow_session(session, out_err) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    match handle.session.acquire_read() {
        Ok(true) => {
            handle.reading = true;
            handle.read_pos = 0;
            1
        }
        Ok(false) => 0,
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn am_read_unlock(session: *mut am_session, out_err: *mut *mut am_error) -> i32 {
    let handle = match borrow_session(session, out_err) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    if !handle.reading {
        return fail(out_err, not_locked("read"));
    }
    handle.reading = false;
    handle.read_pos = 0;
    match handle.session.release_read() {
        Ok(()) => 0,
        Err(err) => fail(out_err, err),
    }
}

/// Appends one length-prefixed frame at the write cursor. Overflow writes nothing.
#[unsafe(no_mangle)]
pub extern "C" fn am_write(
    session: *mut am_session,
    data: *const u8,
    len: u64,
    out_err: *mut *mut am_error,
) -> i32 {
    let handle = match borrow_session(session, out_err) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    if !handle.writing {
        return fail(out_err, not_locked("write"));
    }
    let bytes: &[u8] = if len == 0 {
        &[]
    } else if data.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("data is null"),
        );
    } else {
        unsafe { std::slice::from_raw_parts(data, len as usize) }
    };
    let start = handle.write_pos;
    let payload = match handle.session.payload_mut() {
        Ok(payload) => payload,
        Err(err) => return fail(out_err, err),
    };
    let mut writer = Writer::at(payload, start);
    match writer.write_buffer(bytes) {
        Ok(()) => {
            handle.write_pos = writer.position();
            0
        }
        Err(err) => fail(out_err, err),
    }
}

/// Returns the next frame of the committed message. 1 means a frame was
/// produced, 0 means the message is exhausted.
#[unsafe(no_mangle)]
pub extern "C" fn am_read(
    session: *mut am_session,
    out_data: *mut *const u8,
    out_len: *mut u64,
    out_err: *mut *mut am_error,
) -> i32 {
    let handle = match borrow_session(session, out_err) {
        Ok(handle) => handle,
        Err(code) => return code,
    };
    if out_data.is_null() || out_len.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("out_data and out_len are required"),
        );
    }
    if !handle.reading {
        return fail(out_err, not_locked("read"));
    }
    let message = match handle.session.message() {
        Ok(message) => message,
        Err(err) => return fail(out_err, err),
    };
    let mut reader = Reader::at(message, handle.read_pos);
    if reader.is_exhausted() {
        return 0;
    }
    match reader.read_frame() {
        Ok(frame) => {
            unsafe {
                *out_data = frame.as_ptr();
                *out_len = frame.len() as u64;
            }
            handle.read_pos = reader.position();
            1
        }
        Err(err) => fail(out_err, err),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn am_error_free(err: *mut am_error) {
    if err.is_null() {
        return;
    }
    unsafe {
        let err = Box::from_raw(err);
        for text in [err.message, err.hint, err.path] {
            if !text.is_null() {
                drop(CString::from_raw(text));
            }
        }
    }
}

fn session_options(timeout_ms: i64) -> SessionOptions {
    let lock = if timeout_ms < 0 {
        LockPolicy::default()
    } else {
        LockPolicy::with_timeout(Duration::from_millis(timeout_ms as u64))
    };
    SessionOptions {
        lock,
        ..SessionOptions::default()
    }
}

#[derive(Clone, Copy)]
enum Open {
    /// Host: create the segment and own the backing file.
    Create,
    /// Plugin: attach to a segment the host created.
    Attach,
}

fn open_handle(
    dir: *const c_char,
    first: *const c_char,
    second: *const c_char,
    open: Open,
    options: SessionOptions,
    out_session: *mut *mut am_session,
    out_err: *mut *mut am_error,
) -> i32 {
    if out_session.is_null() {
        return fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("out_session is null"),
        );
    }
    let opened = (|| {
        let dir = match optional_str(dir, "dir")? {
            Some(dir) => PathBuf::from(dir),
            None => resolve_segment_dir(None),
        };
        let tokens = SessionTokens::new(
            required_str(first, "first")?,
            required_str(second, "second")?,
        )?;
        match open {
            Open::Create => Session::create(&dir, tokens, options),
            Open::Attach => Session::open(&dir, tokens, Side::Plugin, options),
        }
    })();
    match opened {
        Ok(session) => {
            let handle = Box::new(am_session {
                session,
                write_pos: 0,
                read_pos: 0,
                writing: false,
                reading: false,
            });
            unsafe {
                *out_session = Box::into_raw(handle);
            }
            0
        }
        Err(err) => fail(out_err, err),
    }
}

fn borrow_session<'a>(
    session: *mut am_session,
    out_err: *mut *mut am_error,
) -> Result<&'a mut am_session, i32> {
    if session.is_null() {
        return Err(fail(
            out_err,
            Error::new(ErrorKind::Usage).with_message("session is null"),
        ));
    }
    unsafe { Ok(&mut *session) }
}

fn optional_str<'a>(input: *const c_char, name: &str) -> Result<Option<&'a str>, Error> {
    if input.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(input) }
        .to_str()
        .map(Some)
        .map_err(|_| Error::new(ErrorKind::Usage).with_message(format!("{name} is not valid UTF-8")))
}

fn required_str<'a>(input: *const c_char, name: &str) -> Result<&'a str, Error> {
    optional_str(input, name)?
        .ok_or_else(|| Error::new(ErrorKind::Usage).with_message(format!("{name} is null")))
}

fn not_locked(what: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("{what} lock is not held by this handle"))
        .with_hint(format!("Call am_{what}_lock first and check that it returned 1."))
}

fn fail(out_err: *mut *mut am_error, err: Error) -> i32 {
    if out_err.is_null() {
        return -1;
    }
    let error = Box::new(am_error {
        kind: to_exit_code(err.kind()),
        message: to_c_string(err.message().unwrap_or("")),
        hint: err.hint().map(to_c_string).unwrap_or(ptr::null_mut()),
        path: err
            .path()
            .map(|path| to_c_string(path.to_string_lossy().as_ref()))
            .unwrap_or(ptr::null_mut()),
        seq: err.seq().unwrap_or(0),
        offset: err.offset().unwrap_or(0),
        has_seq: u8::from(err.seq().is_some()),
        has_offset: u8::from(err.offset().is_some()),
    });
    unsafe {
        *out_err = Box::into_raw(error);
    }
    -1
}

fn to_c_string(input: &str) -> *mut c_char {
    CString::new(input)
        .map(|s| s.into_raw())
        .unwrap_or(ptr::null_mut())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(text: &str) -> CString {
        CString::new(text).expect("cstring")
    }

    fn open(dir: &CString, side: Side) -> *mut am_session {
        let (first, second) = (c("{ABI-H}"), c("{ABI-P}"));
        let mut handle = ptr::null_mut();
        let mut err = ptr::null_mut();
        let rc = match side {
            Side::Host => am_init(
                dir.as_ptr(),
                first.as_ptr(),
                second.as_ptr(),
                64 * 1024,
                200,
                &mut handle,
                &mut err,
            ),
            Side::Plugin => am_attach(
                dir.as_ptr(),
                first.as_ptr(),
                second.as_ptr(),
                200,
                &mut handle,
                &mut err,
            ),
        };
        assert_eq!(rc, 0);
        assert!(err.is_null());
        handle
    }

    #[test]
    fn frames_pass_between_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dir = c(dir.path().to_str().expect("utf8"));
        let host = open(&dir, Side::Host);
        let plugin = open(&dir, Side::Plugin);
        let mut err = ptr::null_mut();

        assert_eq!(am_write_lock(host, &mut err), 1);
        assert_eq!(am_write(host, b"abc".as_ptr(), 3, &mut err), 0);
        assert_eq!(am_write(host, ptr::null(), 0, &mut err), 0);
        let mut seq = 0u64;
        assert_eq!(am_write_unlock(host, &mut seq, &mut err), 0);
        assert_eq!(seq, 1);

        assert_eq!(am_read_lock(plugin, &mut err), 1);
        let mut data = ptr::null();
        let mut len = 0u64;
        assert_eq!(am_read(plugin, &mut data, &mut len, &mut err), 1);
        let frame = unsafe { std::slice::from_raw_parts(data, len as usize) };
        assert_eq!(frame, b"abc");
        assert_eq!(am_read(plugin, &mut data, &mut len, &mut err), 1);
        assert_eq!(len, 0);
        assert_eq!(am_read(plugin, &mut data, &mut len, &mut err), 0);
        assert_eq!(am_read_unlock(plugin, &mut err), 0);
        assert!(err.is_null());

        am_free(plugin);
        am_free(host);
    }

    #[test]
    fn write_without_lock_reports_usage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dir = c(dir.path().to_str().expect("utf8"));
        let host = open(&dir, Side::Host);
        let mut err = ptr::null_mut();

        assert_eq!(am_write(host, b"x".as_ptr(), 1, &mut err), -1);
        assert!(!err.is_null());
        let kind = unsafe { (*err).kind };
        assert_eq!(kind, to_exit_code(ErrorKind::Usage));
        am_error_free(err);
        am_free(host);
    }

    #[test]
    fn init_creates_the_segment_and_free_removes_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = c(temp.path().to_str().expect("utf8"));
        let segment = temp.path().join("{ABI-H}-{ABI-P}");

        let host = open(&dir, Side::Host);
        assert_eq!(
            std::fs::metadata(&segment).expect("segment file").len(),
            64 * 1024
        );
        let info = unsafe { (*host).session.info() }.expect("info");
        assert!(info.owner);
        assert_eq!(info.side, Side::Host);

        let (first, second) = (c("{ABI-H}"), c("{ABI-P}"));
        let mut again = ptr::null_mut();
        let mut err = ptr::null_mut();
        let rc = am_init(
            dir.as_ptr(),
            first.as_ptr(),
            second.as_ptr(),
            0,
            0,
            &mut again,
            &mut err,
        );
        assert_eq!(rc, -1);
        assert!(again.is_null());
        assert_eq!(unsafe { (*err).kind }, to_exit_code(ErrorKind::AlreadyExists));
        am_error_free(err);

        am_free(host);
        assert!(!segment.exists());
    }

    #[test]
    fn attach_before_init_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dir = c(dir.path().to_str().expect("utf8"));
        let (first, second) = (c("{ABI-H}"), c("{ABI-P}"));
        let mut handle = ptr::null_mut();
        let mut err = ptr::null_mut();
        let rc = am_attach(
            dir.as_ptr(),
            first.as_ptr(),
            second.as_ptr(),
            0,
            &mut handle,
            &mut err,
        );
        assert_eq!(rc, -1);
        assert!(handle.is_null());
        assert_eq!(unsafe { (*err).kind }, to_exit_code(ErrorKind::Attach));
        am_error_free(err);
    }
}
