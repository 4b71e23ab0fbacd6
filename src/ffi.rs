//! `extern "C"` boundary.
//!
//! Handles are non-zero `u64`s owned by a per-thread [`Registry`]; `0` means
//! "unset". Functions that can fail return an error handle (`0` on success)
//! or write one through `err_out`. Every handle handed out must be released
//! exactly once with the matching `faml_release_*` function.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr};

use crate::error::Error;
use crate::handle::{
    ErrorHandle, ExprHandle, Handle, Registry, StrHandle, StrListHandle, ValueHandle,
};
use crate::value::{Kind, Scalar};

// The registry is not shared between threads: handles are only valid on the
// thread that created them.
thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::new());
}

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    REGISTRY.with(|r| f(&mut r.borrow_mut()))
}

/// Read a NUL-terminated UTF-8 argument.
unsafe fn read_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str, Error> {
    if ptr.is_null() {
        return Err(Error::Boundary(format!("{} is null", what)));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| Error::Boundary(format!("{} is not valid UTF-8", what)))
}

/// Store a boundary error and return its raw handle.
fn boundary_error(registry: &mut Registry, err: Error) -> u64 {
    registry.insert(err).into_raw()
}

fn null_out() -> Error {
    Error::Boundary("output pointer is null".to_string())
}

/// Run `op` and write its result through `out`. Returns 0 or an error
/// handle. A null `out` is rejected before `op` runs, so nothing it would
/// have allocated is left behind.
unsafe fn write_with<T>(
    registry: &mut Registry,
    out: *mut T,
    op: impl FnOnce(&mut Registry) -> Result<T, ErrorHandle>,
) -> u64 {
    if out.is_null() {
        return boundary_error(registry, null_out());
    }
    match op(registry) {
        Ok(value) => {
            unsafe { *out = value };
            0
        }
        Err(err) => err.into_raw(),
    }
}

fn raw_error(result: Result<(), ErrorHandle>) -> u64 {
    match result {
        Ok(()) => 0,
        Err(err) => err.into_raw(),
    }
}

// ── Expressions ─────────────────────────────────────────────────────

/// Parse `src`. On success writes the expression handle to `expr_out` and
/// returns 1; on failure writes an error handle to `err_out` and returns 0.
///
/// # Safety
/// `src` must be null or a valid NUL-terminated string; the out-pointers
/// must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn faml_expr_from_str(
    src: *const c_char,
    expr_out: *mut u64,
    err_out: *mut u64,
) -> c_int {
    with_registry(|registry| {
        let parse = |registry: &mut Registry| {
            let source = unsafe { read_str(src, "source") }.map_err(|err| registry.insert(err))?;
            registry.parse(source).map(Handle::into_raw)
        };
        unsafe { finish(registry, expr_out, err_out, parse) }
    })
}

/// Run `op` and route its handle or error to the out-pointers. A null
/// `ok_out` is rejected before `op` runs; an error with no `err_out` to
/// receive it is released.
unsafe fn finish(
    registry: &mut Registry,
    ok_out: *mut u64,
    err_out: *mut u64,
    op: impl FnOnce(&mut Registry) -> Result<u64, ErrorHandle>,
) -> c_int {
    let result = if ok_out.is_null() {
        Err(registry.insert(null_out()))
    } else {
        op(registry)
    };
    match result {
        Ok(raw) => {
            unsafe { *ok_out = raw };
            1
        }
        Err(err) if err_out.is_null() => {
            if let Err(stale) = registry.release(err) {
                tracing::warn!(error = %stale, "dropping undeliverable error");
            }
            0
        }
        Err(err) => {
            unsafe { *err_out = err.into_raw() };
            0
        }
    }
}

unsafe fn set_expr(expr: u64, path: *const c_char, value: Scalar) -> u64 {
    with_registry(|registry| match unsafe { read_str(path, "path") } {
        Ok(path) => raw_error(registry.override_expr(ExprHandle::from_raw(expr), path, value)),
        Err(err) => boundary_error(registry, err),
    })
}

/// Override the node at `path` with null. Returns 0 or an error handle.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn faml_expr_set_none(expr: u64, path: *const c_char) -> u64 {
    unsafe { set_expr(expr, path, Scalar::None) }
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn faml_expr_set_bool(expr: u64, path: *const c_char, value: bool) -> u64 {
    unsafe { set_expr(expr, path, Scalar::Bool(value)) }
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn faml_expr_set_int(expr: u64, path: *const c_char, value: i64) -> u64 {
    unsafe { set_expr(expr, path, Scalar::Int(value)) }
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn faml_expr_set_float(expr: u64, path: *const c_char, value: f64) -> u64 {
    unsafe { set_expr(expr, path, Scalar::Float(value)) }
}

/// # Safety
/// `path` and `value` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn faml_expr_set_string(
    expr: u64,
    path: *const c_char,
    value: *const c_char,
) -> u64 {
    let value = match unsafe { read_str(value, "value") } {
        Ok(value) => value.to_string(),
        Err(err) => return with_registry(|registry| boundary_error(registry, err)),
    };
    unsafe { set_expr(expr, path, Scalar::String(value)) }
}

/// Evaluate the subtree at `path` (`""` for the whole tree).
///
/// # Safety
/// Same contract as [`faml_expr_from_str`].
#[no_mangle]
pub unsafe extern "C" fn faml_expr_evaluate(
    expr: u64,
    path: *const c_char,
    val_out: *mut u64,
    err_out: *mut u64,
) -> c_int {
    with_registry(|registry| {
        let evaluate = |registry: &mut Registry| {
            let path = unsafe { read_str(path, "path") }.map_err(|err| registry.insert(err))?;
            registry
                .evaluate(ExprHandle::from_raw(expr), path)
                .map(Handle::into_raw)
        };
        unsafe { finish(registry, val_out, err_out, evaluate) }
    })
}

// ── Value queries ───────────────────────────────────────────────────

/// Run a query against a value and write its result through `out`.
unsafe fn query<T>(
    val: u64,
    path: *const c_char,
    out: *mut T,
    f: impl FnOnce(&mut Registry, ValueHandle, &str) -> Result<T, ErrorHandle>,
) -> u64 {
    with_registry(|registry| {
        let run = |registry: &mut Registry| {
            let path = unsafe { read_str(path, "path") }.map_err(|err| registry.insert(err))?;
            f(registry, ValueHandle::from_raw(val), path)
        };
        unsafe { write_with(registry, out, run) }
    })
}

unsafe fn is_kind(val: u64, path: *const c_char, out: *mut bool, kind: Kind) -> u64 {
    unsafe { query(val, path, out, |r, v, p| r.kind_at(v, p).map(|k| k == kind)) }
}

/// Writes whether the node at `path` is null. A path that does not resolve
/// counts as null.
///
/// # Safety
/// `path` must be null or a valid NUL-terminated string; `out` must be null
/// or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn faml_value_is_none(val: u64, path: *const c_char, out: *mut bool) -> u64 {
    unsafe { query(val, path, out, |r, v, p| r.is_none(v, p)) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_is_bool(val: u64, path: *const c_char, out: *mut bool) -> u64 {
    unsafe { is_kind(val, path, out, Kind::Bool) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_is_int(val: u64, path: *const c_char, out: *mut bool) -> u64 {
    unsafe { is_kind(val, path, out, Kind::Int) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_is_float(val: u64, path: *const c_char, out: *mut bool) -> u64 {
    unsafe { is_kind(val, path, out, Kind::Float) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_is_str(val: u64, path: *const c_char, out: *mut bool) -> u64 {
    unsafe { is_kind(val, path, out, Kind::String) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_is_array(val: u64, path: *const c_char, out: *mut bool) -> u64 {
    unsafe { is_kind(val, path, out, Kind::Array) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_is_map(val: u64, path: *const c_char, out: *mut bool) -> u64 {
    unsafe { is_kind(val, path, out, Kind::Map) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_as_bool(val: u64, path: *const c_char, out: *mut bool) -> u64 {
    unsafe { query(val, path, out, |r, v, p| r.as_bool(v, p)) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_as_int(val: u64, path: *const c_char, out: *mut i64) -> u64 {
    unsafe { query(val, path, out, |r, v, p| r.as_int(v, p)) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_as_float(val: u64, path: *const c_char, out: *mut f64) -> u64 {
    unsafe { query(val, path, out, |r, v, p| r.as_float(v, p)) }
}

/// Writes a string handle; read it with [`faml_str_ptr`] and release it with
/// [`faml_release_str`].
///
/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_as_str(val: u64, path: *const c_char, str_out: *mut u64) -> u64 {
    unsafe { query(val, path, str_out, |r, v, p| r.as_str(v, p).map(Handle::into_raw)) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_array_length(
    val: u64,
    path: *const c_char,
    out: *mut usize,
) -> u64 {
    unsafe { query(val, path, out, |r, v, p| r.array_len(v, p)) }
}

/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_map_length(val: u64, path: *const c_char, out: *mut usize) -> u64 {
    unsafe { query(val, path, out, |r, v, p| r.map_len(v, p)) }
}

/// Writes a string-list handle holding the map's keys in insertion order.
///
/// # Safety
/// See [`faml_value_is_none`].
#[no_mangle]
pub unsafe extern "C" fn faml_value_map_keys(
    val: u64,
    path: *const c_char,
    list_out: *mut u64,
) -> u64 {
    unsafe { query(val, path, list_out, |r, v, p| r.map_keys(v, p).map(Handle::into_raw)) }
}

// ── Value updates ───────────────────────────────────────────────────

unsafe fn set_value(val: u64, path: *const c_char, value: Scalar) -> u64 {
    with_registry(|registry| match unsafe { read_str(path, "path") } {
        Ok(path) => raw_error(registry.set_value(ValueHandle::from_raw(val), path, value)),
        Err(err) => boundary_error(registry, err),
    })
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn faml_value_set_none(val: u64, path: *const c_char) -> u64 {
    unsafe { set_value(val, path, Scalar::None) }
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn faml_value_set_bool(val: u64, path: *const c_char, value: bool) -> u64 {
    unsafe { set_value(val, path, Scalar::Bool(value)) }
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn faml_value_set_int(val: u64, path: *const c_char, value: i64) -> u64 {
    unsafe { set_value(val, path, Scalar::Int(value)) }
}

/// # Safety
/// `path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn faml_value_set_float(val: u64, path: *const c_char, value: f64) -> u64 {
    unsafe { set_value(val, path, Scalar::Float(value)) }
}

/// # Safety
/// `path` and `value` must be null or valid NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn faml_value_set_string(
    val: u64,
    path: *const c_char,
    value: *const c_char,
) -> u64 {
    let value = match unsafe { read_str(value, "value") } {
        Ok(value) => value.to_string(),
        Err(err) => return with_registry(|registry| boundary_error(registry, err)),
    };
    unsafe { set_value(val, path, Scalar::String(value)) }
}

// ── Strings, lists & errors ─────────────────────────────────────────

/// Borrow the bytes of a string handle. The pointer stays valid until the
/// handle is released; null for a dead or foreign handle.
#[no_mangle]
pub extern "C" fn faml_str_ptr(s: u64) -> *const c_char {
    with_registry(|registry| match registry.get(StrHandle::from_raw(s)) {
        Ok(s) => s.as_ptr(),
        Err(err) => {
            tracing::warn!(error = %err, "faml_str_ptr on invalid handle");
            std::ptr::null()
        }
    })
}

/// # Safety
/// `out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn faml_str_list_len(list: u64, out: *mut usize) -> u64 {
    with_registry(|registry| unsafe {
        write_with(registry, out, |r| r.str_list_len(StrListHandle::from_raw(list)))
    })
}

/// Copy item `index` of a string list into a new string handle.
///
/// # Safety
/// `str_out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn faml_str_list_get(list: u64, index: usize, str_out: *mut u64) -> u64 {
    with_registry(|registry| unsafe {
        write_with(registry, str_out, |r| {
            r.str_list_get(StrListHandle::from_raw(list), index)
                .map(Handle::into_raw)
        })
    })
}

/// The numeric error kind (see `ErrorKind::code`), or 0 for an invalid handle.
#[no_mangle]
pub extern "C" fn faml_error_kind(err: u64) -> c_int {
    with_registry(|registry| {
        registry
            .error_kind(ErrorHandle::from_raw(err))
            .map_or(0, |kind| kind.code())
    })
}

/// Writes a string handle with the error's message.
///
/// # Safety
/// `str_out` must be null or valid for writes.
#[no_mangle]
pub unsafe extern "C" fn faml_error_message(err: u64, str_out: *mut u64) -> u64 {
    with_registry(|registry| unsafe {
        write_with(registry, str_out, |r| {
            r.error_message(ErrorHandle::from_raw(err)).map(Handle::into_raw)
        })
    })
}

// ── Release ─────────────────────────────────────────────────────────

/// Objects alive in this thread's registry.
#[cfg(test)]
pub(crate) fn live_handles() -> usize {
    with_registry(|registry| registry.live())
}

fn release<T: crate::handle::Stored>(raw: u64) -> c_int {
    with_registry(|registry| match registry.release(Handle::<T>::from_raw(raw)) {
        Ok(_) => 1,
        Err(err) => {
            tracing::warn!(error = %err, "release rejected");
            0
        }
    })
}

/// Returns 1 if released, 0 if the handle was unknown, of another kind or
/// already released.
#[no_mangle]
pub extern "C" fn faml_release_expr(expr: u64) -> c_int {
    release::<crate::expr::ExprTree>(expr)
}

#[no_mangle]
pub extern "C" fn faml_release_value(val: u64) -> c_int {
    release::<crate::value::Value>(val)
}

#[no_mangle]
pub extern "C" fn faml_release_str(s: u64) -> c_int {
    release::<std::ffi::CString>(s)
}

#[no_mangle]
pub extern "C" fn faml_release_str_list(list: u64) -> c_int {
    release::<Vec<std::ffi::CString>>(list)
}

#[no_mangle]
pub extern "C" fn faml_release_error(err: u64) -> c_int {
    release::<Error>(err)
}
