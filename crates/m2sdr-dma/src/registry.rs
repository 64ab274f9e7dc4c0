//! Process-wide device registry.
//!
//! The driver-global state — the device number range, the device class, the
//! set of live minors — lives behind explicit `init`/`teardown` phases
//! rather than ad-hoc singletons. Registration order is: allocate the
//! number range, create the class, mark the driver registered; teardown
//! walks the same steps in reverse. `init` is idempotent so that embedders
//! and library opens can both call it.

use std::sync::Mutex;

use tracing::{debug, info};

use crate::error::{DmaError, DmaResult};

/// Name under which devices register.
const CLASS_NAME: &str = "m2sdr";
/// First minor number handed out.
const FIRST_MINOR: u32 = 0;
/// How many minors the allocated range covers.
const MINOR_COUNT: u32 = 16;

/// A registered device's number within the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceNumber {
    pub minor: u32,
}

struct Registry {
    class: &'static str,
    minors: Vec<Option<String>>,
}

static REGISTRY: Mutex<Option<Registry>> = Mutex::new(None);

/// Brings the registry up: allocate the minor range, then create the class.
/// Calling it again is a no-op.
pub fn init() -> DmaResult<()> {
    let mut guard = REGISTRY.lock().unwrap();
    if guard.is_some() {
        return Ok(());
    }
    // Number range first, class second; a failure between the two would
    // unwind the range. Both steps are infallible in-process, but the order
    // is the contract.
    let minors = vec![None; (MINOR_COUNT - FIRST_MINOR) as usize];
    *guard = Some(Registry {
        class: CLASS_NAME,
        minors,
    });
    info!(class = CLASS_NAME, minors = MINOR_COUNT, "device registry initialized");
    Ok(())
}

/// Tears the registry down in reverse registration order. All devices must
/// have unregistered first.
pub fn teardown() -> DmaResult<()> {
    let mut guard = REGISTRY.lock().unwrap();
    let Some(registry) = guard.as_ref() else {
        return Ok(());
    };
    let live = registry.minors.iter().flatten().count();
    if live != 0 {
        return Err(DmaError::InvalidConfig(format!(
            "teardown with {live} device(s) still registered"
        )));
    }
    // Reverse of init: drop the class, then release the number range.
    *guard = None;
    info!(class = CLASS_NAME, "device registry torn down");
    Ok(())
}

/// Registers a device and returns its number. Fails when the registry is
/// not initialized or the minor range is exhausted.
pub fn register_device(name: &str) -> DmaResult<DeviceNumber> {
    let mut guard = REGISTRY.lock().unwrap();
    let registry = guard
        .as_mut()
        .ok_or_else(|| DmaError::InvalidConfig("device registry not initialized".into()))?;
    let slot = registry
        .minors
        .iter()
        .position(|m| m.is_none())
        .ok_or_else(|| DmaError::OutOfMemory("minor range exhausted".into()))?;
    registry.minors[slot] = Some(name.to_string());
    let number = DeviceNumber {
        minor: FIRST_MINOR + slot as u32,
    };
    debug!(class = registry.class, name, minor = number.minor, "device registered");
    Ok(number)
}

/// Releases a device number. Unknown numbers are ignored.
pub fn unregister_device(number: DeviceNumber) {
    let mut guard = REGISTRY.lock().unwrap();
    if let Some(registry) = guard.as_mut() {
        let slot = (number.minor - FIRST_MINOR) as usize;
        if let Some(entry) = registry.minors.get_mut(slot) {
            if entry.take().is_some() {
                debug!(minor = number.minor, "device unregistered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-global; keep every assertion in one test so
    // parallel test threads cannot race each other's phases.
    #[test]
    fn lifecycle() {
        init().unwrap();
        init().unwrap(); // idempotent

        let a = register_device("m2sdr0").unwrap();
        let b = register_device("m2sdr1").unwrap();
        assert_ne!(a, b);

        // Teardown refuses while devices are live.
        assert!(teardown().is_err());

        unregister_device(a);
        unregister_device(a); // double release is harmless
        unregister_device(b);
        teardown().unwrap();
        teardown().unwrap(); // idempotent

        // Registration without init fails.
        assert!(matches!(
            register_device("m2sdr0"),
            Err(DmaError::InvalidConfig(_))
        ));

        // Freed minors are reused after re-init.
        init().unwrap();
        let c = register_device("m2sdr0").unwrap();
        assert_eq!(c.minor, FIRST_MINOR);
        unregister_device(c);
        teardown().unwrap();
    }
}
