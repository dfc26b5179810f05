//! Ownership helpers for the vidbridge C ABI.
//!
//! Everything that crosses the C boundary out of Rust is either a
//! `CString` turned into a raw pointer or a boxed slice turned into a
//! `(ptr, len)` pair. The helpers here perform those conversions and their
//! inverses so the ABI layer never hand-rolls them.
//!
//! # Memory Ownership
//!
//! - Functions returning `*mut c_char` or `(*mut T, usize)` transfer
//!   ownership to the caller
//! - The caller hands it back through the matching `free_*` function
//! - NULL pointers are accepted by every `free_*` function as a no-op

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

/// Convert a Rust string to an owned C string pointer.
///
/// Strings containing NUL bytes cannot cross as C strings; `fallback` is
/// returned in their place.
///
/// ```
/// use vidbridge_ffi_common::{cstring_new_or_fallback, free_cstring};
///
/// let ptr = cstring_new_or_fallback("unsupported codec", "unknown error");
/// unsafe { free_cstring(ptr) };
/// ```
#[inline]
pub fn cstring_new_or_fallback(s: &str, fallback: &'static str) -> *mut c_char {
    CString::new(s)
        .or_else(|_| CString::new(fallback))
        .unwrap_or_default()
        .into_raw()
}

/// Free a C string produced by this crate. Null is a no-op.
///
/// # Safety
/// The pointer must have been allocated by `CString::into_raw()` or be null.
#[inline]
pub unsafe fn free_cstring(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

/// Free a boxed value. Null is a no-op.
///
/// # Safety
/// The pointer must have been allocated by `Box::into_raw()` or be null.
#[inline]
pub unsafe fn free_boxed<T>(ptr: *mut T) {
    if !ptr.is_null() {
        unsafe {
            let _ = Box::from_raw(ptr);
        }
    }
}

/// Free a boxed slice handed out by [`vec_into_raw`].
///
/// # Safety
/// `ptr` and `len` must come from the same [`vec_into_raw`] call, or `ptr`
/// must be null.
#[inline]
pub unsafe fn free_boxed_slice<T>(ptr: *mut T, len: usize) {
    if !ptr.is_null() && len > 0 {
        unsafe {
            let _ = Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len));
        }
    }
}

/// Hand a vector to C as a pointer and length.
///
/// Empty vectors become `(null, 0)`.
#[inline]
pub fn vec_into_raw<T>(vec: Vec<T>) -> (*mut T, usize) {
    let len = vec.len();
    if len == 0 {
        (ptr::null_mut(), 0)
    } else {
        (Box::into_raw(vec.into_boxed_slice()) as *mut T, len)
    }
}

/// Borrow a C string as `&str`.
///
/// # Safety
/// The pointer must be null or point to a NUL-terminated string that
/// outlives `'a`.
pub unsafe fn cstr_to_str<'a>(ptr: *const c_char) -> Result<&'a str, &'static str> {
    if ptr.is_null() {
        return Err("null pointer");
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| "invalid UTF-8")
}

/// C result structs with a standard failure shape.
///
/// Implementors describe how to build the struct around an already
/// allocated error message; [`FfiResult::error`] does the string handling.
///
/// ```ignore
/// #[repr(C)]
/// pub struct OutputC {
///     pub success: bool,
///     pub error_msg: *mut c_char,
///     pub data: *mut u8,
///     pub len: usize,
/// }
///
/// impl FfiResult for OutputC {
///     const ERROR_FALLBACK: &'static str = "unknown error";
///
///     fn error_fields(error_msg: *mut c_char) -> Self {
///         Self { success: false, error_msg, data: ptr::null_mut(), len: 0 }
///     }
/// }
///
/// let result = OutputC::error("unsupported codec");
/// ```
pub trait FfiResult: Sized {
    /// Message used when the real one contains NUL bytes.
    const ERROR_FALLBACK: &'static str;

    /// Build the failure struct around `error_msg`, which it now owns.
    fn error_fields(error_msg: *mut c_char) -> Self;

    #[inline]
    fn error(msg: &str) -> Self {
        let error_msg = cstring_new_or_fallback(msg, Self::ERROR_FALLBACK);
        Self::error_fields(error_msg)
    }
}

/// Generate `extern "C" fn $fn_name() -> *const c_char` returning the crate
/// version as a static string.
#[macro_export]
macro_rules! define_version_fn {
    ($fn_name:ident) => {
        #[no_mangle]
        pub extern "C" fn $fn_name() -> *const std::os::raw::c_char {
            concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const std::os::raw::c_char
        }
    };
}

/// Generate a free function for a boxed handle type.
///
/// ```ignore
/// vidbridge_ffi_common::define_handle_free!(vidbridge_free, BridgeHandle);
/// ```
#[macro_export]
macro_rules! define_handle_free {
    ($fn_name:ident, $handle_type:ty) => {
        #[no_mangle]
        #[allow(clippy::not_unsafe_ptr_arg_deref)]
        pub extern "C" fn $fn_name(ptr: *mut $handle_type) {
            unsafe { $crate::free_boxed(ptr) };
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OutputC {
        success: bool,
        error_msg: *mut c_char,
        len: usize,
    }

    impl FfiResult for OutputC {
        const ERROR_FALLBACK: &'static str = "unknown error";

        fn error_fields(error_msg: *mut c_char) -> Self {
            Self {
                success: false,
                error_msg,
                len: 0,
            }
        }
    }

    #[test]
    fn test_cstring_new_or_fallback() {
        let ptr = cstring_new_or_fallback("unsupported codec", "fallback");
        let s = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap();
        assert_eq!(s, "unsupported codec");
        unsafe { free_cstring(ptr) };
    }

    #[test]
    fn test_cstring_with_nul_bytes_uses_fallback() {
        let ptr = cstring_new_or_fallback("bad\0codec", "fallback");
        let s = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap();
        assert_eq!(s, "fallback");
        unsafe { free_cstring(ptr) };
    }

    #[test]
    fn test_free_null_is_safe() {
        unsafe {
            free_cstring(ptr::null_mut());
            free_boxed::<i32>(ptr::null_mut());
            free_boxed_slice::<u8>(ptr::null_mut(), 0);
        }
    }

    #[test]
    fn test_vec_into_raw() {
        let (ptr, len): (*mut u8, usize) = vec_into_raw(Vec::new());
        assert!(ptr.is_null());
        assert_eq!(len, 0);

        let (ptr, len) = vec_into_raw(vec![1u8, 2, 3]);
        assert!(!ptr.is_null());
        assert_eq!(len, 3);
        unsafe { free_boxed_slice(ptr, len) };
    }

    #[test]
    fn test_cstr_to_str() {
        assert_eq!(unsafe { cstr_to_str(ptr::null()) }, Err("null pointer"));

        let s = CString::new("webm").unwrap();
        assert_eq!(unsafe { cstr_to_str(s.as_ptr()) }, Ok("webm"));
    }

    #[test]
    fn test_ffi_result_error() {
        let result = OutputC::error("no result returned");
        assert!(!result.success);
        assert_eq!(result.len, 0);
        let msg = unsafe { CStr::from_ptr(result.error_msg) }.to_str().unwrap();
        assert_eq!(msg, "no result returned");
        unsafe { free_cstring(result.error_msg) };
    }
}
