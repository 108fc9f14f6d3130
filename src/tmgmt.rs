use std::cell::RefCell;

use anyhow::{Error, anyhow, bail};
use race_detection::ThreadState;

thread_local! {
    static CURRENT: RefCell<Option<ThreadState>> = const { RefCell::new(None) }
}

/// Installs the detector state of the current OS thread.
///
/// This operation is only allowed **once** per thread, unless the state was
/// taken out again with [`take_current`].
///
/// # Errors
///
/// This function may fail in the following cases:
/// - The thread-local storage can not be accessed.
/// - The current thread already has a state installed.
pub fn set_current(state: ThreadState) -> Result<(), Error> {
    CURRENT.try_with(|current| {
        let mut current = current.try_borrow_mut()?;
        if let Some(installed) = current.as_ref() {
            bail!(
                "Thread T{} is already installed on this thread",
                installed.tid()
            )
        }
        *current = Some(state);
        Ok(())
    })?
}

/// Removes the detector state of the current OS thread.
///
/// # Errors
///
/// Fails if the thread-local storage can not be accessed or no state is
/// installed.
pub fn take_current() -> Result<ThreadState, Error> {
    CURRENT.try_with(|current| {
        current
            .try_borrow_mut()?
            .take()
            .ok_or_else(|| anyhow!("No thread state installed on this thread"))
    })?
}

/// Runs `f` on the detector state of the current OS thread.
///
/// # Errors
///
/// Fails if the thread-local storage can not be accessed, no state is
/// installed, or the state is in use by an enclosing call.
pub fn with_current<R>(f: impl FnOnce(&mut ThreadState) -> R) -> Result<R, Error> {
    CURRENT.try_with(|current| {
        let mut current = current.try_borrow_mut()?;
        match current.as_mut() {
            Some(state) => Ok(f(state)),
            None => bail!("No thread state installed on this thread"),
        }
    })?
}

/// `true` if the current OS thread has a detector state installed.
pub fn is_installed() -> bool {
    CURRENT
        .try_with(|current| current.try_borrow().is_ok_and(|c| c.is_some()))
        .unwrap_or(false)
}
