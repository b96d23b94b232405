//! Minimal shim over the CloudLinux LVE library.
//!
//! liblve is only present on CloudLinux hosts and is loaded lazily via
//! dlopen, never linked. Three outcomes matter to callers:
//! the library is absent (skip containment silently), it loads and
//! works (enter/exit around the fork), or it loads but cannot be
//! initialized (a fatal setup error).

use std::ffi::{c_int, c_uint, c_void, CStr};
use std::sync::OnceLock;

use crate::error::SpawnError;

type LveEnterFn = unsafe extern "C" fn(*mut c_void, c_uint, *mut c_uint, c_int) -> c_int;
type LveExitFn = unsafe extern "C" fn(*mut c_void, *mut c_uint) -> c_int;
type LveInitFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> *mut c_void;

pub struct Lve {
    instance: *mut c_void,
    enter_fn: LveEnterFn,
    exit_fn: LveExitFn,
}

// The liblve handle is only used under the spawner's coarse lock or in
// the single-threaded child; the library itself imposes no thread
// affinity.
unsafe impl Send for Lve {}
unsafe impl Sync for Lve {}

static INSTANCE: OnceLock<Result<Option<Lve>, String>> = OnceLock::new();

fn probe() -> Result<Option<Lve>, String> {
    let library = unsafe {
        libc::dlopen(
            c"liblve.so.0".as_ptr(),
            libc::RTLD_NOW | libc::RTLD_GLOBAL,
        )
    };
    if library.is_null() {
        // Not a CloudLinux host.
        return Ok(None);
    }

    let resolve = |name: &CStr| -> Result<*mut c_void, String> {
        let sym = unsafe { libc::dlsym(library, name.as_ptr()) };
        if sym.is_null() {
            Err(format!(
                "liblve is present but lacks the {} symbol",
                name.to_string_lossy()
            ))
        } else {
            Ok(sym)
        }
    };

    let init_sym = resolve(c"init_lve")?;
    let enter_sym = resolve(c"lve_enter_flags")?;
    let exit_sym = resolve(c"lve_exit")?;

    let init_fn: LveInitFn = unsafe { std::mem::transmute(init_sym) };
    let instance = unsafe { init_fn(std::ptr::null_mut(), std::ptr::null_mut()) };
    if instance.is_null() {
        return Err("init_lve() failed".to_string());
    }

    Ok(Some(Lve {
        instance,
        enter_fn: unsafe { std::mem::transmute(enter_sym) },
        exit_fn: unsafe { std::mem::transmute(exit_sym) },
    }))
}

impl Lve {
    /// The process-wide LVE handle: `Ok(None)` when liblve is absent,
    /// `Err` when it is present but broken.
    pub fn instance() -> Result<Option<&'static Lve>, String> {
        match INSTANCE.get_or_init(probe) {
            Ok(opt) => Ok(opt.as_ref()),
            Err(msg) => Err(msg.clone()),
        }
    }
}

/// Scope for one LVE containment entry. Exits the container on drop
/// unless `exit` was already called.
pub struct LveScope {
    lve: Option<&'static Lve>,
    cookie: c_uint,
    active: bool,
}

impl LveScope {
    /// A scope that never entered containment.
    pub fn inactive() -> Self {
        LveScope {
            lve: None,
            cookie: 0,
            active: false,
        }
    }

    /// Enters the LVE container for `uid` when containment is
    /// configured (`min_uid` set) and applies to this uid. Absence of
    /// liblve is a silent no-op; an init failure is an error the
    /// caller decides how to treat.
    pub fn enter(uid: u32, min_uid: Option<u32>) -> Result<Self, SpawnError> {
        let inactive = LveScope {
            lve: None,
            cookie: 0,
            active: false,
        };
        let min_uid = match min_uid {
            Some(min_uid) => min_uid,
            None => return Ok(inactive),
        };
        if uid < min_uid {
            return Ok(inactive);
        }
        let lve = match Lve::instance() {
            Ok(Some(lve)) => lve,
            Ok(None) => return Ok(inactive),
            Err(msg) => {
                return Err(SpawnError::Internal(format!(
                    "Failed to initialize LVE library: {msg}"
                )))
            }
        };

        let mut cookie: c_uint = 0;
        let rc = unsafe { (lve.enter_fn)(lve.instance, uid as c_uint, &mut cookie, 0) };
        if rc != 0 {
            return Err(SpawnError::Internal(format!(
                "lve_enter_flags({uid}) failed with code {rc}"
            )));
        }
        log::debug!("Entered LVE container for uid {uid}");
        Ok(LveScope {
            lve: Some(lve),
            cookie,
            active: true,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Keeps the containment in place past this scope. Used by the
    /// subprocess side, which must stay jailed through exec.
    pub fn persist(self) {
        std::mem::forget(self);
    }

    /// Leaves the container. Idempotent.
    pub fn exit(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(lve) = self.lve {
            let rc = unsafe { (lve.exit_fn)(lve.instance, &mut self.cookie) };
            if rc != 0 {
                log::warn!("lve_exit() failed with code {rc}");
            }
        }
    }
}

impl Drop for LveScope {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_containment_is_inactive() {
        let scope = LveScope::enter(1000, None).unwrap();
        assert!(!scope.is_active());
    }

    #[test]
    fn uid_below_minimum_is_not_contained() {
        // Probing may legitimately fail on a CloudLinux host with a
        // broken liblve, but uids below the minimum never reach the
        // library at all.
        let scope = LveScope::enter(10, Some(500)).unwrap();
        assert!(!scope.is_active());
    }

    #[test]
    fn exit_is_idempotent() {
        let mut scope = LveScope::enter(1000, None).unwrap();
        scope.exit();
        scope.exit();
    }
}
