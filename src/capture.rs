//! Console output capture.
//!
//! Functions write through [`echo!`](crate::echo) (or [`write_line`]). During a
//! call the lines land in that call's [`Capture`] buffer and are returned in the
//! envelope's `stdout`; outside a call they go to the real stdout.

use std::cell::RefCell;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

tokio::task_local! {
    static TASK_CAPTURE: Capture;
}

thread_local! {
    static THREAD_CAPTURE: RefCell<Option<Capture>> = const { RefCell::new(None) };
}

/// Line buffer for one call.
#[derive(Debug, Clone, Default)]
pub struct Capture {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: impl Into<String>) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.into());
    }

    /// Take everything written so far, joined with `\n`.
    pub fn drain(&self) -> String {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let text = lines.join("\n");
        lines.clear();
        text
    }

    pub fn is_empty(&self) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Route writes from `fut` (on whatever thread polls it) into this buffer.
    pub async fn scope<F: Future>(&self, fut: F) -> F::Output {
        TASK_CAPTURE.scope(self.clone(), fut).await
    }

    /// Route writes from `f`, run on the current thread, into this buffer.
    pub fn install<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Reset(Option<Capture>);
        impl Drop for Reset {
            fn drop(&mut self) {
                let previous = self.0.take();
                THREAD_CAPTURE.with(|slot| *slot.borrow_mut() = previous);
            }
        }

        let previous = THREAD_CAPTURE.with(|slot| slot.borrow_mut().replace(self.clone()));
        let _reset = Reset(previous);
        f()
    }

    /// The capture active for the current task or thread, if any.
    pub fn current() -> Option<Capture> {
        TASK_CAPTURE
            .try_with(Capture::clone)
            .ok()
            .or_else(|| THREAD_CAPTURE.with(|slot| slot.borrow().clone()))
    }
}

/// Write one line of function output.
pub fn write_line(line: impl Into<String>) {
    let line = line.into();
    match Capture::current() {
        Some(capture) => capture.push(line),
        None => println!("{}", line),
    }
}

/// `println!` for servable functions: captured into the call's `stdout`.
#[macro_export]
macro_rules! echo {
    () => {
        $crate::capture::write_line(::std::string::String::new())
    };
    ($($arg:tt)*) => {
        $crate::capture::write_line(::std::format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_scope_captures() {
        let capture = Capture::new();
        capture
            .scope(async {
                crate::echo!("hello {}", 1);
                tokio::task::yield_now().await;
                crate::echo!("world");
            })
            .await;
        assert_eq!(capture.drain(), "hello 1\nworld");
        assert!(capture.is_empty());
    }

    #[test]
    fn test_thread_install_captures_and_resets() {
        let capture = Capture::new();
        let value = capture.install(|| {
            write_line("from thread");
            7
        });
        assert_eq!(value, 7);
        assert_eq!(capture.drain(), "from thread");
        assert!(Capture::current().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_scopes_are_isolated() {
        let a = Capture::new();
        let b = Capture::new();
        let fa = a.scope(async {
            crate::echo!("a");
            tokio::task::yield_now().await;
        });
        let fb = b.scope(async {
            crate::echo!("b");
            tokio::task::yield_now().await;
        });
        tokio::join!(fa, fb);
        assert_eq!(a.drain(), "a");
        assert_eq!(b.drain(), "b");
    }
}
