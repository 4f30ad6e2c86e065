//! Keygate FFI - C bindings for iOS/macOS applications
//!
//! Exposes the KeyManager façade to Swift/Objective-C: generate, query and
//! delete the key pair, export the public key, encrypt to it, and sign or
//! decrypt with a completion callback.

#![allow(clippy::missing_safety_doc)]

use std::ffi::{CStr, CString, c_void};
use std::os::raw::c_char;

#[cfg(all(
    any(target_os = "macos", target_os = "ios"),
    feature = "secure-enclave"
))]
use keygate::SecureEnclaveKeystoreConfig;
#[cfg(not(all(
    any(target_os = "macos", target_os = "ios"),
    feature = "secure-enclave"
)))]
use keygate::SoftwareKeystoreConfig;
use keygate::{ErrorKind, KeyManager, KeyManagerConfig, KeygateError};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

// ==================== Error Handling ====================

thread_local! {
    static LAST_ERROR: std::cell::RefCell<Option<String>> = const { std::cell::RefCell::new(None) };
}

fn set_last_error(err: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = Some(err.to_string());
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

// ==================== Status Enums ====================

/// Status codes returned by keygate FFI functions
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeygateStatus {
    /// Operation completed successfully
    Ok = 0,
    /// Context not initialized or invalid
    NotInitialized = 1,
    /// Key material does not exist
    NotFound = 2,
    /// User declined or failed the presence check
    AuthenticationDenied = 3,
    /// No secure keystore available on this device
    CapabilityUnavailable = 4,
    /// Generic error - check keygate_last_error() for details
    Error = 5,
}

impl From<&KeygateError> for KeygateStatus {
    fn from(err: &KeygateError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => KeygateStatus::NotFound,
            ErrorKind::AuthenticationDenied => KeygateStatus::AuthenticationDenied,
            ErrorKind::CapabilityUnavailable => KeygateStatus::CapabilityUnavailable,
            ErrorKind::Keystore => KeygateStatus::Error,
        }
    }
}

// ==================== Result Structs ====================

/// Owned byte buffer (must be freed with keygate_bytes_free)
#[repr(C)]
pub struct KeygateBytes {
    pub data: *mut u8,
    pub len: usize,
}

impl Default for KeygateBytes {
    fn default() -> Self {
        Self {
            data: std::ptr::null_mut(),
            len: 0,
        }
    }
}

impl KeygateBytes {
    fn from_vec(bytes: Vec<u8>) -> Self {
        let boxed = bytes.into_boxed_slice();
        let len = boxed.len();
        Self {
            data: Box::into_raw(boxed) as *mut u8,
            len,
        }
    }
}

/// Which half of the key pair a handle refers to
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeygateKeyKind {
    Public = 0,
    Private = 1,
}

/// Opaque key handle (must be freed with keygate_key_handle_free)
pub struct KeygateKeyHandle {
    kind: KeygateKeyKind,
    label: String,
}

/// Completion for keygate_sign.
///
/// Called exactly once. On success `status` is Ok and `signature` points at
/// `signature_len` bytes of X9.62 DER; on failure `signature` is NULL and
/// `error` describes the failure. Both pointers are only valid for the
/// duration of the call.
pub type KeygateSignCallback = extern "C" fn(
    user_data: *mut c_void,
    status: KeygateStatus,
    signature: *const u8,
    signature_len: usize,
    error: *const c_char,
);

/// Completion for keygate_decrypt. Same contract as KeygateSignCallback,
/// with `plaintext` in place of the signature.
pub type KeygateDecryptCallback = extern "C" fn(
    user_data: *mut c_void,
    status: KeygateStatus,
    plaintext: *const u8,
    plaintext_len: usize,
    error: *const c_char,
);

// ==================== Context ====================

/// Opaque context for keygate operations
pub struct KeygateContext {
    manager: KeyManager,
    // Declared after manager so the manager's runtime handle is dropped first
    runtime: Runtime,
}

// ==================== Helper Functions ====================

fn to_c_string(s: &str) -> *mut c_char {
    CString::new(s)
        .map(|cs| cs.into_raw())
        .unwrap_or(std::ptr::null_mut())
}

fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string()) }
}

unsafe fn context<'a>(ctx: *const KeygateContext) -> Option<&'a KeygateContext> {
    if ctx.is_null() {
        set_last_error("Context is null");
        return None;
    }
    Some(unsafe { &*ctx })
}

fn report_bool(result: Result<(), KeygateError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            set_last_error(&e.to_string());
            false
        }
    }
}

/// Raw pointer carried to the completion thread; the caller vouches for it.
struct UserData(*mut c_void);

unsafe impl Send for UserData {}

impl UserData {
    fn into_inner(self) -> *mut c_void {
        self.0
    }
}

// ==================== Context Management ====================

/// Initialize a new keygate context
///
/// # Arguments
/// * `namespace` - Key namespace; keys are labelled `<namespace>.private` / `<namespace>.public`
/// * `key_dir` - Directory for software keys (NULL keeps them in memory; ignored for Secure Enclave)
/// * `operation_prompt` - Text for the presence prompt (NULL for the default)
///
/// # Returns
/// Pointer to context, or NULL on error. Check keygate_last_error() for details.
#[unsafe(no_mangle)]
pub extern "C" fn keygate_init(
    namespace: *const c_char,
    key_dir: *const c_char,
    operation_prompt: *const c_char,
) -> *mut KeygateContext {
    clear_last_error();

    let Some(namespace) = from_c_string(namespace) else {
        set_last_error("Invalid key namespace");
        return std::ptr::null_mut();
    };

    let mut config = KeyManagerConfig::for_namespace(&namespace);
    if let Some(prompt) = from_c_string(operation_prompt) {
        config = config.with_prompt(prompt);
    }

    let Ok(runtime) = Runtime::new() else {
        set_last_error("Failed to create async runtime");
        return std::ptr::null_mut();
    };

    #[cfg(all(
        any(target_os = "macos", target_os = "ios"),
        feature = "secure-enclave"
    ))]
    let keystore_config = {
        let _ = key_dir;
        SecureEnclaveKeystoreConfig
    };

    #[cfg(not(all(
        any(target_os = "macos", target_os = "ios"),
        feature = "secure-enclave"
    )))]
    let keystore_config = match from_c_string(key_dir) {
        Some(dir) => SoftwareKeystoreConfig::persistent(std::path::PathBuf::from(dir)),
        None => SoftwareKeystoreConfig::in_memory(),
    };

    let manager = match KeyManager::open(&keystore_config, config) {
        Ok(m) => m.with_runtime(runtime.handle().clone()),
        Err(e) => {
            warn!(namespace = %namespace, error = %e, "Failed to open keystore");
            set_last_error(&format!("Failed to open keystore: {}", e));
            return std::ptr::null_mut();
        }
    };
    debug!(namespace = %namespace, keystore = manager.keystore_name(), "Context initialized");

    Box::into_raw(Box::new(KeygateContext { manager, runtime }))
}

/// Free a keygate context
///
/// # Safety
/// The context pointer must have been returned by keygate_init() and not
/// already freed. Signing requests still in flight may never complete once
/// the context is freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_free(ctx: *mut KeygateContext) {
    if !ctx.is_null() {
        unsafe {
            drop(Box::from_raw(ctx));
        }
    }
}

// ==================== Key Pair Operations ====================

/// Generate the key pair, replacing any existing one
///
/// # Safety
/// `ctx` must be a valid context pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_generate_key_pair(ctx: *mut KeygateContext) -> bool {
    clear_last_error();
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return false;
    };
    report_bool(ctx.manager.try_generate_key_pair())
}

/// Whether the public key exists
///
/// # Safety
/// `ctx` must be a valid context pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_public_key_exists(ctx: *mut KeygateContext) -> bool {
    clear_last_error();
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return false;
    };
    match ctx.manager.try_public_key_exists() {
        Ok(exists) => exists,
        Err(e) => {
            set_last_error(&e.to_string());
            false
        }
    }
}

/// Delete the public key. Succeeds if it was already absent.
///
/// # Safety
/// `ctx` must be a valid context pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_delete_public_key(ctx: *mut KeygateContext) -> bool {
    clear_last_error();
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return false;
    };
    report_bool(ctx.manager.try_delete_public_key())
}

/// Delete the private key. Succeeds if it was already absent.
///
/// # Safety
/// `ctx` must be a valid context pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_delete_private_key(ctx: *mut KeygateContext) -> bool {
    clear_last_error();
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return false;
    };
    report_bool(ctx.manager.try_delete_private_key())
}

// ==================== Handles ====================

fn lookup_handle(
    result: Result<Option<String>, KeygateError>,
    kind: KeygateKeyKind,
) -> *mut KeygateKeyHandle {
    match result {
        Ok(Some(label)) => Box::into_raw(Box::new(KeygateKeyHandle { kind, label })),
        Ok(None) => std::ptr::null_mut(),
        Err(e) => {
            set_last_error(&e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Look up the public key handle
///
/// # Returns
/// Handle, or NULL if no public key exists (or on error; see keygate_last_error())
///
/// # Safety
/// `ctx` must be a valid context pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_lookup_public_key_handle(
    ctx: *mut KeygateContext,
) -> *mut KeygateKeyHandle {
    clear_last_error();
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return std::ptr::null_mut();
    };
    let result = ctx
        .manager
        .try_lookup_public_key_handle()
        .map(|h| h.map(|h| h.label().to_string()));
    lookup_handle(result, KeygateKeyKind::Public)
}

/// Look up the private key handle. The handle cannot be used to read key material.
///
/// Runs the key's presence check and blocks until it resolves; a denied
/// check returns NULL with keygate_last_error() set.
///
/// # Safety
/// `ctx` must be a valid context pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_lookup_private_key_handle(
    ctx: *mut KeygateContext,
) -> *mut KeygateKeyHandle {
    clear_last_error();
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return std::ptr::null_mut();
    };
    let result = ctx
        .manager
        .try_lookup_private_key_handle()
        .map(|h| h.map(|h| h.label().to_string()));
    lookup_handle(result, KeygateKeyKind::Private)
}

/// Which half of the pair the handle refers to
///
/// # Returns
/// Ok with `out` filled, NotInitialized for a NULL handle, Error for a NULL `out`
///
/// # Safety
/// - `handle` must be a valid handle or NULL
/// - `out` must be a valid pointer to a KeygateKeyKind or NULL
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_key_handle_kind(
    handle: *const KeygateKeyHandle,
    out: *mut KeygateKeyKind,
) -> KeygateStatus {
    clear_last_error();
    if handle.is_null() {
        set_last_error("Handle is null");
        return KeygateStatus::NotInitialized;
    }
    if out.is_null() {
        set_last_error("Output pointer is null");
        return KeygateStatus::Error;
    }
    unsafe { *out = (*handle).kind };
    KeygateStatus::Ok
}

/// Keystore label of the handle (owned, must be freed with keygate_free_string)
///
/// # Safety
/// `handle` must be a valid handle or NULL
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_key_handle_label(handle: *const KeygateKeyHandle) -> *mut c_char {
    if handle.is_null() {
        return std::ptr::null_mut();
    }
    to_c_string(unsafe { &(*handle).label })
}

/// Free a key handle
///
/// # Safety
/// The handle must have been returned by a keygate lookup and not already freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_key_handle_free(handle: *mut KeygateKeyHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
    }
}

// ==================== Public Key Export ====================

/// Export the public key as an uncompressed SEC1 point
///
/// # Returns
/// Ok with `out` filled, NotFound if no public key exists, or an error status
///
/// # Safety
/// - `ctx` must be a valid context pointer
/// - `out` must be a valid pointer to a KeygateBytes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_public_key_bits(
    ctx: *mut KeygateContext,
    out: *mut KeygateBytes,
) -> KeygateStatus {
    clear_last_error();
    if out.is_null() {
        set_last_error("Output pointer is null");
        return KeygateStatus::Error;
    }
    let out = unsafe { &mut *out };
    *out = KeygateBytes::default();

    let Some(ctx) = (unsafe { context(ctx) }) else {
        return KeygateStatus::NotInitialized;
    };

    match ctx.manager.try_export_public_key_bytes() {
        Ok(Some(bytes)) => {
            *out = KeygateBytes::from_vec(bytes.into_bytes());
            KeygateStatus::Ok
        }
        Ok(None) => {
            set_last_error("No public key");
            KeygateStatus::NotFound
        }
        Err(e) => {
            set_last_error(&e.to_string());
            KeygateStatus::from(&e)
        }
    }
}

/// Export the public key as a PEM SubjectPublicKeyInfo
///
/// # Returns
/// PEM string (owned, must be freed with keygate_free_string), or NULL
///
/// # Safety
/// `ctx` must be a valid context pointer
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_public_key_pem(ctx: *mut KeygateContext) -> *mut c_char {
    clear_last_error();
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return std::ptr::null_mut();
    };
    match ctx.manager.public_key_pem() {
        Ok(Some(pem)) => to_c_string(&pem),
        Ok(None) => {
            set_last_error("No public key");
            std::ptr::null_mut()
        }
        Err(e) => {
            set_last_error(&e.to_string());
            std::ptr::null_mut()
        }
    }
}

// ==================== Signing ====================

/// Sign data with the private key
///
/// Returns immediately. `callback` is invoked exactly once on a background
/// thread after the presence check resolves.
///
/// # Safety
/// - `ctx` must be a valid context pointer that outlives the callback
/// - `data` must point to `data_len` readable bytes (may be NULL when `data_len` is 0)
/// - `user_data` is passed back untouched and must be safe to use from another thread
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_sign(
    ctx: *mut KeygateContext,
    data: *const u8,
    data_len: usize,
    callback: KeygateSignCallback,
    user_data: *mut c_void,
) {
    clear_last_error();

    let Some(ctx) = (unsafe { context(ctx) }) else {
        fail(callback, user_data, KeygateStatus::NotInitialized, "Context is null");
        return;
    };

    let Some(input) = (unsafe { input_bytes(data, data_len) }) else {
        fail(callback, user_data, KeygateStatus::Error, "Data pointer is null");
        return;
    };

    let user_data = UserData(user_data);
    ctx.manager.sign_with_completion(input, move |result| {
        deliver(callback, user_data.into_inner(), result.map(|s| s.to_der()));
    });
}

unsafe fn input_bytes(data: *const u8, len: usize) -> Option<Vec<u8>> {
    if len == 0 {
        Some(Vec::new())
    } else if data.is_null() {
        set_last_error("Data pointer is null");
        None
    } else {
        Some(unsafe { std::slice::from_raw_parts(data, len) }.to_vec())
    }
}

fn deliver(
    callback: KeygateSignCallback,
    user_data: *mut c_void,
    result: Result<Vec<u8>, KeygateError>,
) {
    match result {
        Ok(bytes) => callback(
            user_data,
            KeygateStatus::Ok,
            bytes.as_ptr(),
            bytes.len(),
            std::ptr::null(),
        ),
        Err(e) => fail(callback, user_data, KeygateStatus::from(&e), &e.to_string()),
    }
}

fn fail(callback: KeygateSignCallback, user_data: *mut c_void, status: KeygateStatus, error: &str) {
    let message = CString::new(error).unwrap_or_default();
    callback(user_data, status, std::ptr::null(), 0, message.as_ptr());
}

// ==================== Encryption ====================

/// ECIES-encrypt data to the public key
///
/// Output is the ephemeral public key, the AES-GCM ciphertext and its tag,
/// the format the Secure Enclave produces and accepts.
///
/// # Returns
/// Ok with `out` filled, NotFound if no public key exists, or an error status
///
/// # Safety
/// - `ctx` must be a valid context pointer
/// - `data` must point to `data_len` readable bytes (may be NULL when `data_len` is 0)
/// - `out` must be a valid pointer to a KeygateBytes
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_encrypt(
    ctx: *mut KeygateContext,
    data: *const u8,
    data_len: usize,
    out: *mut KeygateBytes,
) -> KeygateStatus {
    clear_last_error();
    if out.is_null() {
        set_last_error("Output pointer is null");
        return KeygateStatus::Error;
    }
    let out = unsafe { &mut *out };
    *out = KeygateBytes::default();

    let Some(ctx) = (unsafe { context(ctx) }) else {
        return KeygateStatus::NotInitialized;
    };
    let Some(input) = (unsafe { input_bytes(data, data_len) }) else {
        return KeygateStatus::Error;
    };

    match ctx.manager.encrypt(&input) {
        Ok(ciphertext) => {
            *out = KeygateBytes::from_vec(ciphertext);
            KeygateStatus::Ok
        }
        Err(e) => {
            set_last_error(&e.to_string());
            KeygateStatus::from(&e)
        }
    }
}

/// Decrypt an ECIES message with the private key
///
/// Returns immediately. `callback` is invoked exactly once on a background
/// thread after the presence check resolves.
///
/// # Safety
/// - `ctx` must be a valid context pointer that outlives the callback
/// - `data` must point to `data_len` readable bytes (may be NULL when `data_len` is 0)
/// - `user_data` is passed back untouched and must be safe to use from another thread
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_decrypt(
    ctx: *mut KeygateContext,
    data: *const u8,
    data_len: usize,
    callback: KeygateDecryptCallback,
    user_data: *mut c_void,
) {
    clear_last_error();

    let Some(ctx) = (unsafe { context(ctx) }) else {
        fail(callback, user_data, KeygateStatus::NotInitialized, "Context is null");
        return;
    };

    let Some(input) = (unsafe { input_bytes(data, data_len) }) else {
        fail(callback, user_data, KeygateStatus::Error, "Data pointer is null");
        return;
    };

    let user_data = UserData(user_data);
    ctx.manager.decrypt_with_completion(input, move |result| {
        deliver(callback, user_data.into_inner(), result);
    });
}

// ==================== Memory Management ====================

/// Free a byte buffer returned by keygate functions
///
/// # Safety
/// The buffer must have been filled by a keygate function and not already freed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_bytes_free(bytes: *mut KeygateBytes) {
    if bytes.is_null() {
        return;
    }
    let bytes = unsafe { &mut *bytes };
    if !bytes.data.is_null() {
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                bytes.data, bytes.len,
            )));
        }
    }
    bytes.data = std::ptr::null_mut();
    bytes.len = 0;
}

/// Free a string returned by keygate functions
///
/// # Safety
/// The string must have been returned by a keygate function.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn keygate_free_string(s: *mut c_char) {
    if !s.is_null() {
        unsafe {
            drop(CString::from_raw(s));
        }
    }
}

/// Get the last error message
///
/// # Returns
/// Error string or NULL if no error. String is valid until next keygate call.
/// Do NOT free this string.
#[unsafe(no_mangle)]
pub extern "C" fn keygate_last_error() -> *const c_char {
    thread_local! {
        static ERROR_CSTRING: std::cell::RefCell<Option<CString>> = const { std::cell::RefCell::new(None) };
    }

    LAST_ERROR.with(|e| {
        let error = e.borrow();
        match error.as_ref() {
            Some(s) => ERROR_CSTRING.with(|cs| {
                *cs.borrow_mut() = CString::new(s.as_str()).ok();
                cs.borrow()
                    .as_ref()
                    .map(|c| c.as_ptr())
                    .unwrap_or(std::ptr::null())
            }),
            None => std::ptr::null(),
        }
    })
}

// ==================== Tests ====================
