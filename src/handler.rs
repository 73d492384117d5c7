//! Component A: the handler-plugin registry.
//!
//! A handler is a backend that knows how to execute a SCSI command against
//! some storage (a file, memory, a network target). It is loaded from a
//! shared object on disk and, once loaded, is immutable and shared by every
//! device that selects it — exactly §4.A and the Handler entry in §3's data
//! model.

use std::ffi::{c_char, c_int, c_void, CStr, OsStr};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use log::{debug, warn};

use crate::device::Device;

/// One descriptor slot for scatter/gather I/O, handed to a handler with an
/// already-rewritten absolute address (§4.C).
#[derive(Debug)]
pub struct IoVec {
    pub base: *mut u8,
    pub len: usize,
}

/// A backend that can execute CDBs for any device that selects it.
///
/// This is the safe-Rust shape of the C ABI's `{name, subtype, open, close,
/// submit}` descriptor (§6): `load_all` loads the raw descriptor once and
/// wraps it behind this trait so call sites never see the raw function
/// pointers again.
pub trait Handler: Send + Sync {
    /// Human-readable name, for logging.
    fn name(&self) -> &str;

    /// Routing tag matched against the leading component of a cfgstring.
    fn subtype(&self) -> &str;

    /// Called once, from `add_device`, before the worker thread starts.
    /// May attach private state to `device` for later `submit`/`close` calls.
    fn open(&self, device: &mut Device) -> Result<(), String>;

    /// Called once, from worker cleanup, after the worker stops consuming
    /// the ring.
    fn close(&self, device: &mut Device);

    /// Execute one CDB. `iovec` entries already carry absolute addresses.
    /// Returns `true` on success (`GOOD`); `false` maps to a synthesized
    /// `CHECK CONDITION` (§4.C) — the handler itself never touches
    /// `scsi_status` or `sense_buffer`.
    fn submit(&self, device: &Device, cdb: &[u8], iovec: &mut [IoVec]) -> bool;
}

/// Append-only registry of loaded handlers. Unloading is not supported,
/// matching the process-lifetime `dlopen` handles of the original daemon.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn Handler>>,
    // Kept alive for the process lifetime: dropping a `Library` unmaps the
    // code backing any `Handler` trait object sourced from it.
    _libraries: Vec<Library>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry {
            handlers: Vec::new(),
            _libraries: Vec::new(),
        }
    }

    /// Register a handler that was constructed in-process rather than
    /// `dlopen`ed — used by tests, and by any embedder that wants to ship a
    /// built-in handler without a plugin file on disk.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Load every `handler_*`-named file in `dir`, sorted lexicographically.
    /// A file that fails to `dlopen` or doesn't export a working descriptor
    /// is logged and skipped; this never fails the whole call (§4.A).
    pub fn load_all(&mut self, dir: &Path) -> std::io::Result<usize> {
        let mut names: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_handler_filename(path.file_name()))
            .collect();
        names.sort();

        let mut loaded = 0;
        for path in names {
            match self.load_one(&path) {
                Ok(()) => loaded += 1,
                Err(reason) => warn!("skipping handler plugin {path:?}: {reason}"),
            }
        }
        Ok(loaded)
    }

    fn load_one(&mut self, path: &Path) -> Result<(), String> {
        // SAFETY: plugin loading is inherently trusting of the shared
        // object's initializer code; this is the same trust boundary the
        // original daemon's `dlopen`/`dlsym` pair has.
        let library =
            unsafe { Library::new(path) }.map_err(|e| format!("dlopen failed: {e}"))?;

        let handler = unsafe { load_descriptor(&library) }?;
        debug!(
            "loaded handler {:?} (subtype {:?}) from {path:?}",
            handler.name(),
            handler.subtype()
        );
        self.handlers.push(handler);
        self._libraries.push(library);
        Ok(())
    }

    /// Resolve a handler by cfgstring: the subtype is the substring up to
    /// the first `/` (or the whole string if there is none), matched
    /// case-sensitively against the first handler that registered it.
    pub fn find(&self, cfgstring: &str) -> Option<Arc<dyn Handler>> {
        let subtype = cfgstring.split('/').next().unwrap_or(cfgstring);
        self.handlers
            .iter()
            .find(|h| h.subtype() == subtype)
            .cloned()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_handler_filename(name: Option<&OsStr>) -> bool {
    name.map(|name| name.as_bytes().starts_with(b"handler_"))
        .unwrap_or(false)
}

/// The C ABI (§6): one exported `handler_struct` symbol carrying
/// `{name, subtype, open, close, submit}` as raw function pointers, the
/// same shape the original daemon's `dlsym(handle, "handler_struct")`
/// expects.
#[repr(C)]
struct RawHandlerDescriptor {
    name: *const c_char,
    subtype: *const c_char,
    open: unsafe extern "C" fn(dev: *mut c_void) -> c_int,
    close: unsafe extern "C" fn(dev: *mut c_void),
    submit: unsafe extern "C" fn(
        dev: *mut c_void,
        cdb: *const u8,
        iov: *mut RawIoVec,
        iov_cnt: u32,
    ) -> c_int,
}

#[repr(C)]
struct RawIoVec {
    iov_base: *mut c_void,
    iov_len: usize,
}

/// Safe wrapper around a loaded [`RawHandlerDescriptor`]. Holds the strings
/// already converted to owned `String`s so [`Handler::name`]/`subtype` don't
/// need to re-walk a C string on every call.
struct PluginHandler {
    name: String,
    subtype: String,
    raw: RawHandlerDescriptor,
}

// The descriptor is immutable after load (§4.A) and its function pointers
// are only ever called with `&self` borrows plus an explicit `*mut Device`,
// matching the "one thread per device" calling convention of §5.
unsafe impl Send for PluginHandler {}
unsafe impl Sync for PluginHandler {}

impl Handler for PluginHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn subtype(&self) -> &str {
        &self.subtype
    }

    fn open(&self, device: &mut Device) -> Result<(), String> {
        let ret = unsafe { (self.raw.open)(device as *mut Device as *mut c_void) };
        if ret < 0 {
            Err(format!("handler open() returned {ret}"))
        } else {
            Ok(())
        }
    }

    fn close(&self, device: &mut Device) {
        unsafe { (self.raw.close)(device as *mut Device as *mut c_void) }
    }

    fn submit(&self, device: &Device, cdb: &[u8], iovec: &mut [IoVec]) -> bool {
        let mut raw_iov: Vec<RawIoVec> = iovec
            .iter()
            .map(|v| RawIoVec {
                iov_base: v.base.cast(),
                iov_len: v.len,
            })
            .collect();

        let ret = unsafe {
            (self.raw.submit)(
                device as *const Device as *mut c_void,
                cdb.as_ptr(),
                raw_iov.as_mut_ptr(),
                raw_iov.len() as u32,
            )
        };
        ret == 0
    }
}

/// Pull the `handler_struct` descriptor out of a freshly loaded library.
unsafe fn load_descriptor(library: &Library) -> Result<Arc<dyn Handler>, String> {
    let symbol: libloading::Symbol<*const RawHandlerDescriptor> = library
        .get(b"handler_struct\0")
        .map_err(|e| format!("dlsym(handler_struct) failed: {e}"))?;

    let raw_ptr = *symbol;
    if raw_ptr.is_null() {
        return Err("handler_struct symbol was null".to_string());
    }

    let name = c_str_to_string(raw_ptr, |d| d.name)?;
    let subtype = c_str_to_string(raw_ptr, |d| d.subtype)?;

    Ok(Arc::new(PluginHandler {
        name,
        subtype,
        raw: std::ptr::read(raw_ptr),
    }))
}

unsafe fn c_str_to_string(
    desc: *const RawHandlerDescriptor,
    field: impl Fn(&RawHandlerDescriptor) -> *const c_char,
) -> Result<String, String> {
    let ptr = field(&*desc);
    if ptr.is_null() {
        return Err("handler_struct had a null name/subtype pointer".to_string());
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(str::to_owned)
        .map_err(|e| format!("handler_struct string was not valid UTF-8: {e}"))
}
